#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]

//! Discovery behaviour under eventual consistency, against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use consul_client::{
    CallError, DiscoveryClient, DiscoveryConfig, DiscoveryError, Endpoint, EndpointCallError,
    InMemoryStore,
};

fn setup() -> (Arc<InMemoryStore>, DiscoveryClient) {
    let store = Arc::new(InMemoryStore::default());
    let discovery = DiscoveryClient::new(store.clone(), DiscoveryConfig::default());
    (store, discovery)
}

#[tokio::test(start_paused = true)]
async fn resolve_reflects_latest_registration() {
    let (_store, discovery) = setup();
    let first = vec![Endpoint::new("10.0.0.1", 1)];
    let second = vec![Endpoint::new("10.0.0.2", 1), Endpoint::new("10.0.0.3", 1)];

    discovery.register("svc", first.clone()).await.unwrap();
    assert_eq!(discovery.resolve("svc").await.unwrap(), first);

    discovery.register("svc", second.clone()).await.unwrap();
    assert_eq!(discovery.resolve("svc").await.unwrap(), second);

    discovery.deregister("svc").await.unwrap();
    assert!(discovery.resolve("svc").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn lagging_deregistration_surfaces_as_race() {
    let (store, discovery) = setup();
    discovery
        .register("svc", vec![Endpoint::new("10.0.0.1", 1)])
        .await
        .unwrap();
    store.set_deregistration_lag(10);
    discovery.deregister("svc").await.unwrap();

    let calls = AtomicU32::new(0);
    let res: Result<(), _> = discovery
        .with_endpoint("svc", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CallError::<()>::Connect("connection refused".to_owned())) }
        })
        .await;

    assert!(matches!(
        res,
        Err(EndpointCallError::Discovery(
            DiscoveryError::DeregistrationRace { .. }
        ))
    ));
    // The ghost endpoint is tried once, then filtered out.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reresolve_moves_to_surviving_endpoint() {
    let (_store, discovery) = setup();
    let dead = Endpoint::new("10.0.0.1", 1);
    let alive = Endpoint::new("10.0.0.2", 1);
    discovery
        .register("svc", vec![dead.clone(), alive.clone()])
        .await
        .unwrap();

    let used = discovery
        .with_endpoint("svc", |ep| {
            let dead = dead.clone();
            async move {
                if ep == dead {
                    Err(CallError::<()>::Connect("refused".to_owned()))
                } else {
                    Ok(ep)
                }
            }
        })
        .await
        .unwrap();
    assert_eq!(used, alive);
}

#[tokio::test(start_paused = true)]
async fn store_outage_is_client_error() {
    let (store, discovery) = setup();
    store.set_unavailable(true);
    let err = discovery.resolve("svc").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Client(e) if e.is_connection_failure()));
}
