//! S4 "Snapshot catch-up" (spec §8): a follower that falls far enough
//! behind that the leader has already compacted the entries it needs
//! catches up via InstallSnapshot rather than a long AppendEntries replay.

mod fixtures;

use std::time::Duration;

use fixtures::apply_set;
use fixtures::test_config;
use fixtures::TestCluster;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up_via_snapshot() {
    fixtures::init_tracing();

    let cluster = TestCluster::bootstrap(&["n1", "n2", "n3"], test_config()).await;

    let leader_name = cluster.find_leader(Duration::from_secs(2)).await.expect("cluster elects a leader");
    let leader = &cluster.node(&leader_name).raft;

    let laggard_name = ["n1", "n2", "n3"].into_iter().find(|n| **n != leader_name).expect("at least one follower");
    cluster.isolate(laggard_name).await;

    // test_config() sets snapshot_threshold=10, trailing_logs=5: enough
    // writes push the leader's first_index past what the isolated node
    // still needs, forcing InstallSnapshot once it rejoins.
    for i in 0..20 {
        apply_set(leader, &format!("k{i}"), &format!("v{i}")).await;
    }

    leader.snapshot(Duration::from_secs(2)).await.expect("manual snapshot succeeds");

    let leader_node = cluster.node(&leader_name);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if !leader_node.snapshots.list().await.expect("list snapshots").is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("leader never produced a snapshot");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let compacted_first_index = leader_node.log_store.first_index().await.expect("read first_index");

    cluster.heal(laggard_name).await;

    let target_commit = leader.status().commit_index;
    for name in ["n1", "n2", "n3"] {
        cluster
            .node(name)
            .raft
            .wait(Duration::from_secs(3))
            .applied_index(target_commit)
            .await
            .unwrap_or_else(|e| panic!("{name} never caught up: {e}"));
    }

    let leader_state = leader_node.fsm.state().await;
    for name in ["n1", "n2", "n3"] {
        assert_eq!(cluster.node(name).fsm.state().await, leader_state, "{name} diverged from leader state");
    }

    // The laggard's log can't possibly start below where the leader had
    // already compacted to when it rejoined — it must have installed a
    // snapshot instead of replaying entries the leader no longer has.
    let laggard_first_index = cluster.node(laggard_name).log_store.first_index().await.expect("read first_index");
    assert!(
        laggard_first_index.unwrap_or(0) >= compacted_first_index.unwrap_or(0),
        "laggard's log should start no earlier than the leader's compacted tail"
    );

    cluster.shutdown_all().await;
}
