#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use common::{FakeRuntime, ScriptedProbe, eventually, harness, harness_with, test_config};
use consul_client::{ClientError, Endpoint, HealthStatus, KvStore};
use consul_devservices::{DevServicesConfig, DevServicesError, LifecycleState, ScopeKey};
use futures::FutureExt;
use tokio::sync::Barrier;

fn seeded_config() -> DevServicesConfig {
    DevServicesConfig {
        seed_data: BTreeMap::from([
            ("svc/config".to_owned(), "v1".to_owned()),
            ("svc/flag".to_owned(), "on".to_owned()),
        ]),
        ..test_config(10)
    }
}

#[tokio::test]
async fn seeded_values_are_visible_to_the_body() {
    let h = harness(seeded_config(), ScriptedProbe::failing(0));

    h.services
        .with_backing_store("seed-roundtrip", |store| async move {
            let config = store.kv().read_key("svc/config").await?.unwrap();
            let flag = store.kv().read_key("svc/flag").await?.unwrap();
            assert_eq!(config.value_str(), Some("v1"));
            assert_eq!(flag.value_str(), Some("on"));
            assert_eq!(store.seed_report().written, 2);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn runtime_config_points_at_the_container() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));

    let (endpoint, cfg_endpoint, generation) = h
        .services
        .with_backing_store("bridge", |store| async move {
            Ok::<_, anyhow::Error>((
                store.endpoint().clone(),
                store.config().endpoint(),
                store.config().generation(),
            ))
        })
        .await
        .unwrap();

    assert_eq!(cfg_endpoint, Some(endpoint));
    assert_eq!(generation, 1);
}

fn explode() {
    panic!("body blew up");
}

#[tokio::test]
async fn panicking_body_still_releases() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));
    let scope = ScopeKey::new("panics");

    let outcome = AssertUnwindSafe(h.services.with_backing_store(&scope, |store| async move {
        store.put("before-panic", "1").await?;
        explode();
        Ok::<_, anyhow::Error>(())
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err(), "panic must propagate to the caller");
    assert_eq!(h.runtime.running_count(), 0);
    assert_eq!(h.services.manager().state(&scope), LifecycleState::Unstarted);
}

#[tokio::test]
async fn dropped_body_is_released_in_background() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        h.services.with_backing_store("dropped", |_store| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, anyhow::Error>(())
        }),
    )
    .await;
    assert!(outcome.is_err());

    for _ in 0..100 {
        if h.runtime.running_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_bodies_share_one_instance() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));
    let barrier = Arc::new(Barrier::new(2));

    let body = |barrier: Arc<Barrier>| {
        move |store: consul_devservices::StoreHandle| async move {
            barrier.wait().await;
            Ok::<_, anyhow::Error>((store.instance().id(), store.namespace().to_owned()))
        }
    };

    let (a, b) = tokio::join!(
        h.services
            .with_backing_store_named("shared", "first", body(barrier.clone())),
        h.services
            .with_backing_store_named("shared", "second", body(barrier.clone())),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.0, b.0, "same instance");
    assert_ne!(a.1, b.1, "separate namespaces");
    assert_eq!(h.runtime.starts(), 1);
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn sequential_bodies_get_fresh_generations() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));

    let first = h
        .services
        .with_backing_store("seq", |s| async move { Ok::<_, anyhow::Error>(s.config().generation()) })
        .await
        .unwrap();
    let second = h
        .services
        .with_backing_store("seq", |s| async move { Ok::<_, anyhow::Error>(s.config().generation()) })
        .await
        .unwrap();

    assert_eq!((first, second), (1, 2));
    assert_eq!(h.runtime.starts(), 2);
}

#[tokio::test]
async fn seed_failure_is_reported_and_scope_released() {
    let h = harness(seeded_config(), ScriptedProbe::failing(0));
    // FakeRuntime hands out ports from 20000 upwards.
    h.connector
        .store_for(&Endpoint::new("127.0.0.1", 20000))
        .inject_write_failure(
            "svc/flag",
            ClientError::WriteRejected {
                key: "svc/flag".to_owned(),
            },
        );

    let err = h
        .services
        .with_backing_store("seed-fails", |_store| async move { Ok::<_, DevServicesError>(()) })
        .await
        .unwrap_err();

    match err {
        DevServicesError::SeedFailure { key, written, .. } => {
            assert_eq!(key, "svc/flag");
            assert_eq!(written, 1);
        }
        other => panic!("expected SeedFailure, got {other}"),
    }
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn provisioning_timeout_surfaces_from_the_facade() {
    let h = harness(test_config(3), ScriptedProbe::never_ready());

    let err = h
        .services
        .with_backing_store("never", |_store| async move { Ok::<_, DevServicesError>(()) })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DevServicesError::ProvisioningTimeout { attempts: 3, .. }
    ));
    assert_eq!(h.probe.calls(), 3);
    assert_eq!(h.runtime.running_count(), 0);
}

#[tokio::test]
async fn discovery_through_the_handle() {
    let h = harness(test_config(10), ScriptedProbe::failing(0));

    h.services
        .with_backing_store("discovery", |store| async move {
            let e1 = Endpoint::new("10.0.0.2", 9000);
            let e2 = Endpoint::new("10.0.0.1", 9000);
            let discovery = store.discovery();

            discovery.register("echo", vec![e1.clone(), e2.clone()]).await?;
            assert_eq!(discovery.resolve("echo").await?, vec![e2.clone(), e1.clone()]);

            discovery
                .set_health("echo", &e1, HealthStatus::Critical)
                .await?;
            assert_eq!(discovery.resolve("echo").await?, vec![e2.clone()]);

            discovery.register("echo", vec![e1.clone()]).await?;
            discovery.set_health("echo", &e1, HealthStatus::Passing).await?;
            assert_eq!(discovery.resolve("echo").await?, vec![e1]);

            discovery.deregister("echo").await?;
            assert!(discovery.resolve("echo").await?.is_empty());
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn timed_out_release_still_removes_the_container() {
    let h = harness_with(
        FakeRuntime::with_stop_delay(Duration::from_millis(200)),
        test_config(10),
        ScriptedProbe::failing(0),
    );

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        h.services
            .with_backing_store_named("slow-stop", "quick-body", |_store| async move {
                Ok::<_, DevServicesError>(())
            }),
    )
    .await;
    assert!(outcome.is_err(), "release should outlive the timeout");

    let runtime = h.runtime.clone();
    assert!(eventually(|| runtime.running_count() == 0).await);
    assert_eq!(h.runtime.stops(), 1);
    assert!(h.services.manager().scopes().is_empty());
}
