//! Error categories for the Raft core (§7).
//!
//! Precondition errors (`NotLeader`, `KnownPeer`, `UnknownPeer`,
//! `EnqueueTimeout`) and the leadership/lifecycle errors (`LeadershipLost`,
//! `ShuttingDown`) are all represented in [`RaftError`] so that every
//! client-facing future can be resolved with exactly one error type. The
//! more specific client error enums below wrap `RaftError` and add the
//! precondition variants relevant to that particular call, mirroring how
//! the teacher crate layers `ChangeConfigError`/`ClientWriteError` over a
//! shared `RaftError`.

use thiserror::Error;

pub type RaftResult<T> = Result<T, RaftError>;

/// Errors common to every client-facing operation.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The request was submitted to a node which is not the current leader.
    #[error("node is not the leader")]
    NotLeader,

    /// The role-loop intake channel was still full when the caller's
    /// timeout elapsed.
    #[error("timed out waiting to enqueue request")]
    EnqueueTimeout,

    /// The leader stepped down before the request's log entry committed.
    #[error("leadership was lost before the request committed")]
    LeadershipLost,

    /// The node is shutting down or has already shut down.
    #[error("raft node is shutting down")]
    ShuttingDown,

    /// A durable-write failure (current term/vote persistence) or a
    /// `LogStore::get_log` failure during apply. Both are fatal: the node
    /// halts rather than risk violating safety by continuing on stale or
    /// missing durable state.
    #[error("fatal storage error: {0}")]
    Fatal(#[source] anyhow::Error),

    /// A transport-level failure talking to a peer. Never fatal; logged and
    /// treated as an ungranted vote or a failed replication attempt,
    /// retried on the next cycle.
    #[error("transport error: {0}")]
    Network(#[source] anyhow::Error),
}

impl RaftError {
    pub fn fatal(err: impl Into<anyhow::Error>) -> Self {
        RaftError::Fatal(err.into())
    }

    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        RaftError::Network(err.into())
    }
}

/// Errors returned from [`crate::raft::Raft::apply`].
#[derive(Debug, Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors returned from [`crate::raft::Raft::add_peer`] /
/// [`crate::raft::Raft::remove_peer`].
#[derive(Debug, Error)]
pub enum ChangeMembershipError {
    /// `AddPeer` targeted a peer which is the node itself or already a
    /// cluster member.
    #[error("peer is already a member of the cluster")]
    KnownPeer,

    /// `RemovePeer` targeted a peer which is not a cluster member.
    #[error("peer is not a member of the cluster")]
    UnknownPeer,

    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Errors returned from [`crate::raft::Raft::snapshot`].
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Raft(#[from] RaftError),
}
