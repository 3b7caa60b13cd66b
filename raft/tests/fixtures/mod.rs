//! Test-support module (ported from the teacher crate's `tests/fixtures/
//! mod.rs`): tracing init, a small in-process cluster builder on top of
//! `raft-memstore`'s `Router`, and a couple of `Command`-encoding helpers.
//! Exercises the scenarios of spec §8 from the outside, through the public
//! `Raft<MemTypeConfig>` API only.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use bytes::Bytes;
use raft::Config;
use raft::PeerId;
use raft::PeerStore;
use raft::Raft;
use raft_memstore::Command;
use raft_memstore::MemFsm;
use raft_memstore::MemLogStore;
use raft_memstore::MemPeerStore;
use raft_memstore::MemSnapshotStore;
use raft_memstore::MemStableStore;
use raft_memstore::MemTypeConfig;
use raft_memstore::Response;
use raft_memstore::Router;

static TRACING: Once = Once::new();

/// Initialize a `tracing` subscriber once per test binary, controlled by
/// `RUST_LOG` the same way the teacher crate's fixtures do.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A spawned node plus the storage handles a test needs direct access to
/// (the FSM, for state assertions; the log store, for compaction
/// assertions) alongside the public `Raft` handle every client uses.
pub struct TestNode {
    pub id: PeerId,
    pub raft: Raft<MemTypeConfig>,
    pub fsm: Arc<MemFsm>,
    pub log_store: Arc<MemLogStore>,
    pub snapshots: Arc<MemSnapshotStore>,
}

/// A small in-process cluster wired up over a shared `Router`.
pub struct TestCluster {
    pub router: Arc<Router>,
    pub nodes: HashMap<String, TestNode>,
    config: Config,
}

pub fn peer_id(name: &str) -> PeerId {
    Bytes::copy_from_slice(name.as_bytes())
}

/// A config tuned for fast, deterministic tests: short timeouts, tight
/// snapshotting, so scenarios that need an election or a compaction don't
/// have to wait on the library's production-sized defaults.
pub fn test_config() -> Config {
    Config::builder()
        .heartbeat_timeout(Duration::from_millis(40))
        .election_timeout(Duration::from_millis(40))
        .commit_timeout(Duration::from_millis(10))
        .max_append_entries(64)
        .snapshot_interval(Duration::from_secs(3600))
        .snapshot_threshold(10)
        .trailing_logs(5)
        .shutdown_on_remove(true)
        .build()
        .expect("test config is valid")
}

impl TestCluster {
    /// Spawn a cluster where every node in `names` already knows about every
    /// other node at bootstrap (S1/S2/S3/S4/S6). Use [`TestCluster::add_node`]
    /// to grow a cluster at runtime instead (S5).
    pub async fn bootstrap(names: &[&str], config: Config) -> Self {
        let router = Router::new();
        let all: Vec<PeerId> = names.iter().map(|n| peer_id(n)).collect();
        let mut nodes = HashMap::new();
        for name in names {
            let id = peer_id(name);
            let initial_peers: Vec<PeerId> = all.iter().filter(|p| **p != id).cloned().collect();
            let node = Self::spawn_node(&router, id, initial_peers, config.clone()).await;
            nodes.insert(name.to_string(), node);
        }
        Self { router, nodes, config }
    }

    /// Spawn a single node with no peers, for cluster growth via `add_peer`
    /// at runtime (S5 "AddPeer then RemovePeer of self").
    pub async fn add_node(&mut self, name: &str) {
        let id = peer_id(name);
        let node = Self::spawn_node(&self.router, id, Vec::new(), self.config.clone()).await;
        self.nodes.insert(name.to_string(), node);
    }

    async fn spawn_node(router: &Arc<Router>, id: PeerId, initial_peers: Vec<PeerId>, config: Config) -> TestNode {
        let transport = Arc::new(router.register(id.clone()).await);
        let log_store = Arc::new(MemLogStore::default());
        let stable = Arc::new(MemStableStore::default());
        let snapshots = Arc::new(MemSnapshotStore::default());
        let peer_store = Arc::new(MemPeerStore::default());
        peer_store.set_peers(initial_peers).await.expect("seed initial peers");
        let fsm = Arc::new(MemFsm::default());

        let raft = Raft::<MemTypeConfig>::new(
            id.clone(),
            config,
            log_store.clone(),
            stable,
            snapshots.clone(),
            transport,
            fsm.clone(),
            peer_store,
        )
        .await
        .expect("raft node bootstraps");

        TestNode { id, raft, fsm, log_store, snapshots }
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes.get(name).unwrap_or_else(|| panic!("no such test node: {name}"))
    }

    /// Poll every node's status until one of them reports itself as leader,
    /// or `timeout` elapses.
    pub async fn find_leader(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for (name, node) in &self.nodes {
                if node.raft.state() == raft::Role::Leader {
                    return Some(name.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn isolate(&self, name: &str) {
        self.router.isolate(&self.node(name).id).await;
    }

    pub async fn heal(&self, name: &str) {
        self.router.heal(&self.node(name).id).await;
    }

    pub async fn shutdown_all(&self) {
        for node in self.nodes.values() {
            node.raft.shutdown().await;
        }
    }
}

/// Encode a `set key = value` command the way a real client would.
pub fn encode_set(key: &str, value: &str) -> Bytes {
    let cmd = Command { key: key.to_string(), value: value.to_string() };
    Bytes::from(serde_json::to_vec(&cmd).expect("command encodes"))
}

/// Apply a `set key = value` command against `raft`, returning the FSM's
/// response (the key's previous value, if any).
pub async fn apply_set(raft: &Raft<MemTypeConfig>, key: &str, value: &str) -> Response {
    raft.apply(encode_set(key, value), Duration::from_secs(2)).await.expect("apply succeeds")
}
