//! S6 "Duplicate vote" (spec §8): two identical RequestVote RPCs for the
//! same term/candidate must both be granted — a resend or a racing duplicate
//! delivery must never be scored as a second, conflicting vote.

mod fixtures;

use std::time::Duration;

use fixtures::peer_id;
use fixtures::TestCluster;
use pretty_assertions::assert_eq;
use raft::network::RequestVoteRequest;
use raft::network::Transport;
use raft::Config;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_vote_request_is_idempotent() {
    fixtures::init_tracing();

    // A long follower timeout so n1 stays a Follower for the life of the
    // test instead of timing out and electing itself.
    let config = Config::builder()
        .heartbeat_timeout(Duration::from_secs(30))
        .election_timeout(Duration::from_secs(30))
        .commit_timeout(Duration::from_millis(10))
        .build()
        .expect("config is valid");

    let cluster = TestCluster::bootstrap(&["n1"], config).await;
    let n1 = cluster.node("n1");

    let candidate_id = peer_id("ghost-candidate");
    let candidate_transport = cluster.router.register(candidate_id.clone()).await;

    let req = RequestVoteRequest { term: 5, candidate: candidate_id.clone(), last_log_index: 0, last_log_term: 0 };

    let first = candidate_transport.request_vote(&n1.id, req.clone()).await.expect("first vote request delivered");
    assert!(first.granted, "first vote request for a fresh term should be granted");

    let second = candidate_transport.request_vote(&n1.id, req).await.expect("second vote request delivered");
    assert!(second.granted, "a duplicate vote request for the same term/candidate must still be granted");
    assert_eq!(first.term, second.term);

    cluster.shutdown_all().await;
}
