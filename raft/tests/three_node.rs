//! S2 "Three-node happy path" (spec §8).

mod fixtures;

use std::time::Duration;

use fixtures::apply_set;
use fixtures::test_config;
use fixtures::TestCluster;
use maplit::hashset;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_and_replicates() {
    fixtures::init_tracing();

    let cluster = TestCluster::bootstrap(&["n1", "n2", "n3"], test_config()).await;

    let leader_name = cluster.find_leader(Duration::from_secs(2)).await.expect("cluster elects a leader");
    let leader = &cluster.node(&leader_name).raft;

    apply_set(leader, "a", "1").await;
    apply_set(leader, "b", "2").await;

    for (name, node) in &cluster.nodes {
        node.raft
            .wait(Duration::from_secs(2))
            .applied_index(3)
            .await
            .unwrap_or_else(|e| panic!("{name} never caught up: {e}"));
        let state = node.fsm.state().await;
        let keys: std::collections::HashSet<&str> = state.keys().map(String::as_str).collect();
        assert_eq!(keys, hashset! {"a", "b"}, "{name} has the wrong key set");
        assert_eq!(state.get("a").map(String::as_str), Some("1"), "{name} missing 'a'");
        assert_eq!(state.get("b").map(String::as_str), Some("2"), "{name} missing 'b'");
    }

    assert_eq!(cluster.node(&leader_name).raft.status().commit_index, 3);

    cluster.shutdown_all().await;
}
