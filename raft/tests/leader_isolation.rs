//! S3 "Leader isolation" (spec §8): partitioning the leader out of a 5-node
//! cluster forces a new election with a higher term; healing the partition
//! converges the old leader back onto the new leader's log.

mod fixtures;

use std::time::Duration;

use fixtures::apply_set;
use fixtures::test_config;
use fixtures::TestCluster;
use pretty_assertions::assert_eq;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn isolated_leader_steps_aside_for_a_higher_term() {
    fixtures::init_tracing();

    let names = ["n1", "n2", "n3", "n4", "n5"];
    let cluster = TestCluster::bootstrap(&names, test_config()).await;

    let l1_name = cluster.find_leader(Duration::from_secs(2)).await.expect("cluster elects an initial leader");
    let l1_term = cluster.node(&l1_name).raft.status().current_term;

    cluster.isolate(&l1_name).await;

    // Within ~2*ElectionTimeout the remaining four should elect a new leader
    // with a strictly higher term.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    let l2_name: String = 'search: loop {
        for name in names.iter().filter(|n| **n != l1_name) {
            let status = cluster.node(name).raft.status();
            if status.role == raft::Role::Leader && status.current_term > l1_term {
                break 'search name.to_string();
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("remaining 4 nodes never elected a higher-term leader");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    cluster.heal(&l1_name).await;

    let l2 = &cluster.node(&l2_name).raft;
    apply_set(l2, "k", "v").await;

    for name in names.iter() {
        cluster
            .node(name)
            .raft
            .wait(Duration::from_secs(3))
            .applied_index(cluster.node(&l2_name).raft.status().commit_index)
            .await
            .unwrap_or_else(|e| panic!("{name} never converged after heal: {e}"));
    }

    for name in names.iter() {
        assert_eq!(cluster.node(name).fsm.state().await.get("k").map(String::as_str), Some("v"), "{name} diverged");
    }

    cluster.node(&l1_name).raft.wait(Duration::from_secs(2)).role(raft::Role::Follower).await.expect("old leader steps down");

    cluster.shutdown_all().await;
}
