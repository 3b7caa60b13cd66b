//! S1 "Single-node autocommit" (spec §8).

mod fixtures;

use std::time::Duration;

use fixtures::apply_set;
use fixtures::test_config;
use fixtures::TestCluster;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_node_autocommits() {
    fixtures::init_tracing();

    let cluster = TestCluster::bootstrap(&["n1"], test_config()).await;
    let n1 = cluster.node("n1");

    n1.raft.wait(Duration::from_secs(2)).role(raft::Role::Leader).await.expect("lone node elects itself leader");

    let resp = apply_set(&n1.raft, "x", "1").await;
    assert_eq!(resp.previous, None);

    assert_eq!(n1.fsm.state().await.get("x").map(String::as_str), Some("1"));

    let status = n1.raft.status();
    // index 1 is the leader's initial Noop, index 2 is the "x" = "1" command.
    assert_eq!(status.commit_index, 2);
    assert_eq!(status.last_applied, 2);

    cluster.shutdown_all().await;
}
