#![cfg(feature = "docker")]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use consul_client::KvStore;
use consul_devservices::{DevServices, DevServicesConfig, RuntimeKind};

#[tokio::test]
#[ignore = "requires docker"]
async fn consul_container_roundtrip() {
    let config = DevServicesConfig {
        runtime: RuntimeKind::Docker,
        seed_data: BTreeMap::from([("config/application".to_owned(), "greeting=hi".to_owned())]),
        ..DevServicesConfig::default()
    };
    let services = DevServices::builder(config).build().unwrap();

    services
        .with_backing_store("docker-e2e", |store| async move {
            let seeded = store.kv().read_key("config/application").await?.unwrap();
            assert_eq!(seeded.value_str(), Some("greeting=hi"));

            let endpoint = store.endpoint().clone();
            store.discovery().register("echo", vec![endpoint.clone()]).await?;
            assert_eq!(store.discovery().resolve("echo").await?, vec![endpoint]);
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap();

    let running = services.manager().runtime().running().await.unwrap();
    assert!(running.is_empty());
}
