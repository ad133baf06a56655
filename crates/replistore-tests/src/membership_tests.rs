//! Join, leave and health-sweep eviction as seen by the coordinator.

use std::time::Duration;

use replistore_repl::membership::decode_snapshot;
use replistore_repl::membership::UPDATE_CHANNEL;
use replistore_repl::MembershipBus;

use crate::harness::{eventually, TestCluster};

const EMAIL: &str = "carol@example.com";

#[tokio::test]
async fn test_join_order_assigns_indices() {
    let mut cluster = TestCluster::start("join-order").await.unwrap();
    for node in ["r1", "r2", "r3"] {
        cluster.add_node(node).await.unwrap();
    }

    let registry = cluster.server().unwrap().registry().clone();
    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot["r1"].index, 1);
    assert_eq!(snapshot["r2"].index, 2);
    assert_eq!(snapshot["r3"].index, 3);
    assert_eq!(snapshot["r2"].port, cluster.node("r2").unwrap().port());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leave_removes_member_and_broadcasts() {
    let mut cluster = TestCluster::start("leave").await.unwrap();
    cluster.add_node("r1").await.unwrap();
    cluster.add_node("r2").await.unwrap();
    let mut updates = cluster.bus().subscribe(UPDATE_CHANNEL).await.unwrap();

    cluster.remove_node("r1").await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    let snapshot = decode_snapshot(&message).unwrap();
    assert!(!snapshot.contains_key("r1"));
    assert!(snapshot.contains_key("r2"));
    let alive = cluster.bus().alive_members().await.unwrap();
    assert!(alive.iter().all(|(id, _)| id != "r1"));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_evicted_replica_is_not_routed_to() {
    let mut cluster = TestCluster::start("evict-route").await.unwrap();
    cluster.add_node("r1").await.unwrap();
    cluster.add_node("r2").await.unwrap();

    let client = cluster.client(EMAIL).unwrap();
    let receipt = client.upload_bytes("ledger.csv", "books", b"1,2,3").await.unwrap();

    cluster.crash_node("r1").await.unwrap();
    let mut updates = cluster.bus().subscribe(UPDATE_CHANNEL).await.unwrap();
    let registry = cluster.server().unwrap().registry().clone();
    let report = registry.health_sweep().await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.refreshed, vec!["r2".to_string()]);
    assert_eq!(report.evicted, vec!["r1".to_string()]);

    let snapshot = decode_snapshot(&updates.recv().await.unwrap()).unwrap();
    assert!(!snapshot.contains_key("r1"));
    assert!(registry.member("r1").await.is_none());
    assert!(registry.member("r2").await.is_some());

    // r1 still listed in storages, but only r2 can serve.
    assert_eq!(client.download(&receipt.file_id, None).await.unwrap(), b"1,2,3");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_no_live_holder_fails_download() {
    let mut cluster = TestCluster::start("no-holder").await.unwrap();
    cluster.add_node("r1").await.unwrap();
    let client = cluster.client(EMAIL).unwrap();
    let receipt = client.upload_bytes("a.txt", "", b"a").await.unwrap();

    cluster.crash_node("r1").await.unwrap();
    let registry = cluster.server().unwrap().registry().clone();
    assert_eq!(registry.health_sweep().await.evicted, vec!["r1".to_string()]);
    assert!(registry.is_empty().await);

    assert!(client.download(&receipt.file_id, None).await.is_err());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_eviction_purges_durable_record() {
    let mut cluster = TestCluster::start("evict-purge").await.unwrap();
    cluster.add_node("r1").await.unwrap();
    cluster.add_node("r2").await.unwrap();
    cluster.crash_node("r1").await.unwrap();

    let registry = cluster.server().unwrap().registry().clone();
    assert_eq!(registry.health_sweep().await.evicted, vec!["r1".to_string()]);

    cluster.restart_server().await.unwrap();
    let registry = cluster.server().unwrap().registry().clone();
    assert!(registry.member("r1").await.is_none());
    assert_eq!(registry.member("r2").await.unwrap().index, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_eviction_without_purge_reseeds_member() {
    let mut config = TestCluster::test_server_config();
    config.purge_durable_on_evict = false;
    let mut cluster = TestCluster::start_with("evict-keep", config).await.unwrap();
    cluster.add_node("r1").await.unwrap();
    cluster.add_node("r2").await.unwrap();
    cluster.crash_node("r1").await.unwrap();

    let registry = cluster.server().unwrap().registry().clone();
    assert_eq!(registry.health_sweep().await.evicted, vec!["r1".to_string()]);
    assert!(registry.member("r1").await.is_none());

    cluster.restart_server().await.unwrap();
    let registry = cluster.server().unwrap().registry().clone();
    assert_eq!(registry.member("r1").await.unwrap().index, 1);
    assert_eq!(registry.len().await, 2);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restarted_coordinator_continues_indices() {
    let mut cluster = TestCluster::start("reseed-index").await.unwrap();
    cluster.add_node("r1").await.unwrap();
    cluster.add_node("r2").await.unwrap();

    cluster.restart_server().await.unwrap();
    cluster.add_node("r3").await.unwrap();

    let registry = cluster.server().unwrap().registry().clone();
    let registry = &registry;
    assert!(eventually(Duration::from_secs(5), || async move { registry.len().await == 3 }).await);
    assert_eq!(registry.member("r3").await.unwrap().index, 3);

    cluster.shutdown().await;
}
