//! The durable state facade (§4.1) and the volatile Raft state registers
//! (§4.2).

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::RaftError;
use crate::log::LogId;
use crate::log::PeerId;
use crate::status::Role;
use crate::storage::StableStore;
use crate::storage::KEY_CURRENT_TERM;
use crate::storage::KEY_LAST_VOTE_CAND;
use crate::storage::KEY_LAST_VOTE_TERM;

/// Cached + persisted `currentTerm`, and the last-vote persistence
/// operations, centralized here so that every code path which observes a
/// higher term routes through [`DurableState::set_current_term`] (§9:
/// "durable-vs-cached term").
pub struct DurableState<S: StableStore> {
    stable: Arc<S>,
    current_term: AtomicU64,
}

impl<S: StableStore> DurableState<S> {
    /// Read `currentTerm` from stable storage (default 0 if not present —
    /// not-found is not an error) and construct the cached facade.
    pub async fn load(stable: Arc<S>) -> Result<Self, RaftError> {
        let term = stable.get_u64(KEY_CURRENT_TERM).await.map_err(RaftError::fatal)?.unwrap_or(0);
        Ok(Self {
            stable,
            current_term: AtomicU64::new(term),
        })
    }

    pub fn current_term(&self) -> u64 {
        self.current_term.load(Ordering::SeqCst)
    }

    /// Persist `term` first, then update the cached register. A persistence
    /// failure is fatal: a stale in-memory term after a failed persist
    /// would let this node participate in an election or grant a vote it
    /// should not.
    pub async fn set_current_term(&self, term: u64) -> Result<(), RaftError> {
        self.stable.set_u64(KEY_CURRENT_TERM, term).await.map_err(RaftError::fatal)?;
        self.current_term.store(term, Ordering::SeqCst);
        Ok(())
    }

    /// Persist a vote for `candidate` in `term`: writes last-vote-term then
    /// last-vote-candidate, in that order, so that a crash between the two
    /// writes is observed as "no vote recorded for this term" rather than a
    /// vote for the wrong candidate.
    pub async fn persist_vote(&self, term: u64, candidate: &PeerId) -> Result<(), RaftError> {
        self.stable.set_u64(KEY_LAST_VOTE_TERM, term).await.map_err(RaftError::fatal)?;
        self.stable.set(KEY_LAST_VOTE_CAND, candidate.to_vec()).await.map_err(RaftError::fatal)?;
        Ok(())
    }

    /// The last recorded vote, if any: `(term, candidate)`.
    pub async fn last_vote(&self) -> Result<Option<(u64, PeerId)>, RaftError> {
        let term = self.stable.get_u64(KEY_LAST_VOTE_TERM).await.map_err(RaftError::fatal)?;
        let cand = self.stable.get(KEY_LAST_VOTE_CAND).await.map_err(RaftError::fatal)?;
        match (term, cand) {
            (Some(t), Some(c)) => Ok(Some((t, bytes::Bytes::from(c)))),
            _ => Ok(None),
        }
    }
}

/// The volatile raft state registers (§4.2): role, commit/apply progress and
/// the most recent log/snapshot coordinates. All read via atomics from
/// anywhere; each field is written from at most one task (the role loop
/// owns `role`/`commit_index`/`last_log_*`, the apply pipeline owns
/// `last_applied`, the snapshot manager owns `last_snapshot_*`).
pub struct RaftRegisters {
    role: AtomicU8,
    commit_index: AtomicU64,
    last_applied: AtomicU64,
    last_log_index: AtomicU64,
    last_log_term: AtomicU64,
    last_snapshot_index: AtomicU64,
    last_snapshot_term: AtomicU64,
    /// Decoded address of the peer this node currently believes is leader.
    current_leader: RwLock<Option<PeerId>>,
}

fn role_to_u8(r: Role) -> u8 {
    match r {
        Role::Follower => 0,
        Role::Candidate => 1,
        Role::Leader => 2,
        Role::Shutdown => 3,
    }
}

fn u8_to_role(v: u8) -> Role {
    match v {
        0 => Role::Follower,
        1 => Role::Candidate,
        2 => Role::Leader,
        _ => Role::Shutdown,
    }
}

impl RaftRegisters {
    pub fn new() -> Self {
        Self {
            role: AtomicU8::new(role_to_u8(Role::Follower)),
            commit_index: AtomicU64::new(0),
            last_applied: AtomicU64::new(0),
            last_log_index: AtomicU64::new(0),
            last_log_term: AtomicU64::new(0),
            last_snapshot_index: AtomicU64::new(0),
            last_snapshot_term: AtomicU64::new(0),
            current_leader: RwLock::new(None),
        }
    }

    pub fn role(&self) -> Role {
        u8_to_role(self.role.load(Ordering::SeqCst))
    }

    pub fn set_role(&self, role: Role) {
        self.role.store(role_to_u8(role), Ordering::SeqCst);
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::SeqCst)
    }

    pub fn set_commit_index(&self, index: u64) {
        self.commit_index.store(index, Ordering::SeqCst);
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::SeqCst)
    }

    pub fn set_last_applied(&self, index: u64) {
        self.last_applied.store(index, Ordering::SeqCst);
    }

    /// Returns `(lastLogIndex, lastLogTerm)` consistently. Callers requiring
    /// a true atomic snapshot of both fields together must not interleave
    /// writes to them on the same routine (§4.2) — in this crate only the
    /// role loop ever writes these, so that invariant holds by construction.
    pub fn last_entry(&self) -> LogId {
        LogId::new(self.last_log_index.load(Ordering::SeqCst), self.last_log_term.load(Ordering::SeqCst))
    }

    pub fn set_last_entry(&self, id: LogId) {
        self.last_log_index.store(id.index, Ordering::SeqCst);
        self.last_log_term.store(id.term, Ordering::SeqCst);
    }

    pub fn last_snapshot(&self) -> LogId {
        LogId::new(self.last_snapshot_index.load(Ordering::SeqCst), self.last_snapshot_term.load(Ordering::SeqCst))
    }

    pub fn set_last_snapshot(&self, id: LogId) {
        self.last_snapshot_index.store(id.index, Ordering::SeqCst);
        self.last_snapshot_term.store(id.term, Ordering::SeqCst);
    }

    pub async fn current_leader(&self) -> Option<PeerId> {
        self.current_leader.read().await.clone()
    }

    pub async fn set_current_leader(&self, leader: Option<PeerId>) {
        *self.current_leader.write().await = leader;
    }
}

impl Default for RaftRegisters {
    fn default() -> Self {
        Self::new()
    }
}
