//! The minimal state-watch surface backing `Raft::leader()`/`Raft::state()`
//! (§6) and the `wait_for_*` test helpers (§2 of SPEC_FULL.md).
//!
//! This is deliberately not a metrics system: no counters, no histograms, no
//! export format. It is the same role/commit/apply state a caller could
//! otherwise only assemble by racing individual `Leader()`/`State()` calls,
//! published on a `watch` channel so the role loop does not need to field a
//! poll for every observer.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::log::PeerId;

/// The node's role in the Raft protocol (§3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

/// A point-in-time snapshot of a node's volatile state, published whenever
/// it changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeStatus {
    pub id: PeerId,
    pub role: Role,
    pub current_term: u64,
    pub current_leader: Option<PeerId>,
    pub last_log_index: u64,
    pub commit_index: u64,
    pub last_applied: u64,
}

/// A handle for polling a node's status channel until some condition holds,
/// or a timeout elapses. Used by tests to await election outcomes, commit
/// advancement, and role transitions without sleeping a fixed amount.
pub struct Wait {
    pub(crate) timeout: Duration,
    pub(crate) rx: watch::Receiver<NodeStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for condition")]
    Timeout(Duration),
    #[error("status channel closed")]
    Closed,
}

impl Wait {
    /// Wait until `current_leader` equals `want`.
    pub async fn current_leader(&mut self, want: Option<PeerId>) -> Result<NodeStatus, WaitError> {
        self.poll(|s| s.current_leader == want).await
    }

    /// Wait until `role` equals `want`.
    pub async fn role(&mut self, want: Role) -> Result<NodeStatus, WaitError> {
        self.poll(|s| s.role == want).await
    }

    /// Wait until `commit_index` is at least `want`.
    pub async fn commit_index(&mut self, want: u64) -> Result<NodeStatus, WaitError> {
        self.poll(|s| s.commit_index >= want).await
    }

    /// Wait until `last_applied` is at least `want`.
    pub async fn applied_index(&mut self, want: u64) -> Result<NodeStatus, WaitError> {
        self.poll(|s| s.last_applied >= want).await
    }

    async fn poll(&mut self, mut pred: impl FnMut(&NodeStatus) -> bool) -> Result<NodeStatus, WaitError> {
        let fut = async {
            loop {
                {
                    let cur = self.rx.borrow();
                    if pred(&cur) {
                        return Ok(cur.clone());
                    }
                }
                self.rx.changed().await.map_err(|_| WaitError::Closed)?;
            }
        };
        match timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(WaitError::Timeout(self.timeout)),
        }
    }
}
