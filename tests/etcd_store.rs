//! etcd backend tests
//!
//! Ignored by default; run against a live etcd with
//! `METACOORD_TEST_ETCD=localhost:2379 cargo test -- --ignored`.

use metacoord::{
    Error, EventKind, MetadataStore, MetastoreConfig, OverflowPolicy, RemoteMetadataStore,
};
use std::time::Duration;

fn etcd_endpoint() -> String {
    std::env::var("METACOORD_TEST_ETCD").unwrap_or_else(|_| "localhost:2379".to_string())
}

fn unique_root(name: &str) -> String {
    format!(
        "metacoord-test/{}-{}",
        name,
        metacoord::common::timestamp_now_nanos()
    )
}

async fn connect(name: &str, config: &MetastoreConfig) -> RemoteMetadataStore {
    let uri = format!("etcd://{}?endpoints={}", unique_root(name), etcd_endpoint());
    RemoteMetadataStore::connect_with_uri(&uri, config).await.unwrap()
}

#[tokio::test]
#[ignore = "needs a running etcd at METACOORD_TEST_ETCD (default localhost:2379)"]
async fn test_round_trip_and_tombstone() {
    let store = connect("crud", &MetastoreConfig::default()).await;

    store.put("wiki/index.json", b"{\"index_name\":\"wiki\"}").await.unwrap();
    assert_eq!(
        store.get("wiki/index.json").await.unwrap(),
        b"{\"index_name\":\"wiki\"}"
    );
    assert!(store.exists("wiki/index.json").await.unwrap());

    store.delete("wiki/index.json").await.unwrap();
    assert!(matches!(
        store.get("wiki/index.json").await,
        Err(Error::NotFound(_))
    ));
    assert!(!store.exists("wiki/index.json").await.unwrap());

    // deleting an absent key is not an error here
    store.delete("wiki/index.json").await.unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running etcd at METACOORD_TEST_ETCD (default localhost:2379)"]
async fn test_list_sorted_and_relative() {
    let store = connect("list", &MetastoreConfig::default()).await;

    store.put("a/y", b"2").await.unwrap();
    store.put("a/x", b"1").await.unwrap();
    store.put("ab/z", b"3").await.unwrap();

    assert_eq!(store.list("a").await.unwrap(), vec!["x", "y"]);
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running etcd at METACOORD_TEST_ETCD (default localhost:2379)"]
async fn test_watch_delivers_events() {
    let store = connect("watch", &MetastoreConfig::default()).await;
    let mut events = store.take_events().unwrap();
    assert!(store.take_events().is_none());

    store.start().await.unwrap();
    assert!(matches!(store.start().await, Err(Error::Other(_))));
    // let the subscription settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    store.put("wiki/shard0.json", b"{}").await.unwrap();
    store.delete("wiki/shard0.json").await.unwrap();

    let put = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(put.kind, EventKind::Put);
    assert_eq!(put.relative_path(store.root()), Some("wiki/shard0.json"));
    assert_eq!(put.value, b"{}");

    let delete = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delete.kind, EventKind::Delete);
    assert_eq!(delete.path, put.path);

    store.stop().await.unwrap();
    assert!(!store.is_watching().await);
    store.close().await.unwrap();
}

#[tokio::test]
#[ignore = "needs a running etcd at METACOORD_TEST_ETCD (default localhost:2379)"]
async fn test_stop_with_full_channel_then_close() {
    let config = MetastoreConfig {
        event_channel_capacity: 1,
        ..Default::default()
    };
    let store = connect("shutdown", &config).await;

    // receiver is never drained: the watch task ends up blocked on send
    store.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 0..5 {
        store.put(&format!("k{}", i), b"v").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    tokio::time::timeout(Duration::from_secs(3), store.stop())
        .await
        .expect("stop must not block on a full channel")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(3), store.close())
        .await
        .expect("close must not block")
        .unwrap();

    assert!(matches!(store.get("k0").await, Err(Error::Closed)));
}

#[tokio::test]
#[ignore = "needs a running etcd at METACOORD_TEST_ETCD (default localhost:2379)"]
async fn test_drop_newest_policy() {
    let config = MetastoreConfig {
        event_channel_capacity: 1,
        overflow_policy: OverflowPolicy::DropNewest,
        ..Default::default()
    };
    let store = connect("drop", &config).await;
    let mut events = store.take_events().unwrap();

    store.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    for i in 0..4 {
        store.put(&format!("k{}", i), b"v").await.unwrap();
    }

    let first = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(first.path.ends_with("/k0"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.dropped_events() >= 1);
    store.close().await.unwrap();
}
