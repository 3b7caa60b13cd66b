//! S5 "AddPeer then RemovePeer of self" (spec §8): a single-node cluster
//! adds a second node and replicates to it, then the original node removes
//! itself and shuts down, leaving the new node as sole leader.

mod fixtures;

use std::time::Duration;

use fixtures::apply_set;
use fixtures::test_config;
use fixtures::TestCluster;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_peer_then_remove_self() {
    fixtures::init_tracing();

    let mut cluster = TestCluster::bootstrap(&["n1"], test_config()).await;
    let n1 = cluster.node("n1").raft.clone();

    n1.wait(Duration::from_secs(2)).role(raft::Role::Leader).await.expect("lone node elects itself leader");

    apply_set(&n1, "x", "1").await;

    cluster.add_node("n2").await;
    let n2_id = cluster.node("n2").id.clone();

    n1.add_peer(n2_id.clone(), Duration::from_secs(2)).await.expect("add_peer commits");

    let n2 = cluster.node("n2").raft.clone();
    n2.wait(Duration::from_secs(2))
        .applied_index(n1.status().commit_index)
        .await
        .expect("new peer catches up after being added");

    assert_eq!(cluster.node("n2").fsm.state().await.get("x").map(String::as_str), Some("1"));

    let n1_id = cluster.node("n1").id.clone();
    n1.remove_peer(n1_id, Duration::from_secs(2)).await.expect("remove_peer of self commits");

    n1.wait(Duration::from_secs(2)).role(raft::Role::Shutdown).await.expect("node shuts down after removing itself");

    n2.wait(Duration::from_secs(3)).role(raft::Role::Leader).await.expect("sole remaining node becomes leader");

    let resp = apply_set(&n2, "y", "2").await;
    assert_eq!(resp.previous, None);
    assert_eq!(cluster.node("n2").fsm.state().await.get("y").map(String::as_str), Some("2"));

    cluster.node("n2").raft.shutdown().await;
}
