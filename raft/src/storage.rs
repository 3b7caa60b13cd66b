//! The storage-side collaborator contracts (§6): durable log storage,
//! durable term/vote metadata, snapshot storage, the application state
//! machine, and persistence of the current peer set.
//!
//! None of these traits are implemented by this crate — `raft-memstore`
//! provides in-memory implementations for tests and local experimentation;
//! a production deployment supplies its own (e.g. backed by an embedded
//! KV store).

use std::ops::RangeInclusive;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;

use crate::log::LogEntry;
use crate::log::LogId;
use crate::log::PeerId;

/// Durable, monotonically indexed log storage.
///
/// Implementations must tolerate concurrent reads; writes are serialized by
/// contract through the role loop (§5) — `raft` never calls `store_log`/
/// `store_logs`/`delete_range` from more than one task at a time.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// The index of the first entry still present in the store, or `None`
    /// if the store is empty (including "empty because everything before
    /// the current snapshot was compacted away").
    async fn first_index(&self) -> Result<Option<u64>>;

    /// The index of the last entry present in the store, or `None` if the
    /// store is empty.
    async fn last_index(&self) -> Result<Option<u64>>;

    /// Fetch a single entry by index.
    async fn get_log(&self, index: u64) -> Result<Option<LogEntry>>;

    /// Durably append a single entry.
    async fn store_log(&self, entry: &LogEntry) -> Result<()>;

    /// Durably append a batch of entries, in order.
    async fn store_logs(&self, entries: &[LogEntry]) -> Result<()>;

    /// Delete all entries with `lo <= index <= hi`.
    async fn delete_range(&self, range: RangeInclusive<u64>) -> Result<()>;
}

/// Durable key→bytes and key→uint64 storage for term/vote metadata (§3, §6).
///
/// "Not found" is reported as `Ok(None)`, not an error — callers treat
/// absence as the zero value (term 0, no vote) rather than a storage
/// failure.
#[async_trait]
pub trait StableStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;
    async fn get_u64(&self, key: &str) -> Result<Option<u64>>;
    async fn set_u64(&self, key: &str, value: u64) -> Result<()>;
}

pub const KEY_CURRENT_TERM: &str = "CurrentTerm";
pub const KEY_LAST_VOTE_TERM: &str = "LastVoteTerm";
pub const KEY_LAST_VOTE_CAND: &str = "LastVoteCand";

/// Metadata describing an immutable snapshot (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: u64,
    pub term: u64,
    pub peers: Vec<PeerId>,
    pub size: u64,
}

impl SnapshotMeta {
    pub fn log_id(&self) -> LogId {
        LogId::new(self.index, self.term)
    }
}

/// A writable handle to a snapshot under construction.
///
/// Exactly one of `close`/`cancel` is called to end the sink's lifecycle;
/// `raft` never writes to a sink after calling either.
#[async_trait]
pub trait SnapshotSink: AsyncWrite + Send + Sync + Unpin {
    /// Identifier of the snapshot being written, stable once `create` has
    /// returned.
    fn id(&self) -> &str;

    /// Finalize the snapshot, making it visible to future `list`/`open`
    /// calls.
    async fn close(self: Box<Self>) -> Result<()>;

    /// Abort the snapshot; no trace of it should be visible afterwards.
    async fn cancel(self: Box<Self>) -> Result<()>;
}

/// A readable handle to an existing, immutable snapshot.
pub trait SnapshotSource: AsyncRead + Send + Sync + Unpin {}
impl<T: AsyncRead + Send + Sync + Unpin> SnapshotSource for T {}

/// Create/list/open immutable snapshots (§6).
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    type Sink: SnapshotSink;
    type Source: SnapshotSource;

    /// Begin writing a new snapshot at `(index, term)` covering the given
    /// peer set.
    async fn create(&self, index: u64, term: u64, peers: Vec<PeerId>) -> Result<Self::Sink>;

    /// List known snapshots, newest first.
    async fn list(&self) -> Result<Vec<SnapshotMeta>>;

    /// Open a previously closed snapshot for reading.
    async fn open(&self, id: &str) -> Result<(SnapshotMeta, Self::Source)>;
}

/// The caller-supplied finite state machine (§6).
///
/// `apply`/`snapshot`/`restore` are invoked from a single apply-pipeline
/// task; the FSM is never invoked concurrently with itself (§5).
#[async_trait]
pub trait Fsm: Send + Sync + 'static {
    /// The application-defined response to a committed command.
    type Response: Send + 'static;
    /// A snapshot of FSM state ready to be persisted.
    type Snapshot: FsmSnapshot;

    /// Apply a single committed command to the state machine.
    async fn apply(&self, data: &[u8]) -> Result<Self::Response>;

    /// Produce a snapshot of the current state machine state.
    async fn snapshot(&self) -> Result<Self::Snapshot>;

    /// Restore state machine state from a previously captured/received
    /// snapshot.
    async fn restore(&self, source: &mut (dyn AsyncRead + Send + Unpin)) -> Result<()>;
}

/// A point-in-time FSM snapshot, capable of serializing itself into a sink.
#[async_trait]
pub trait FsmSnapshot: Send + Sync + 'static {
    async fn persist(&self, sink: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;

    /// Release any resources (e.g. an MVCC read handle) held by this
    /// snapshot. Called once persistence has finished, successfully or not.
    fn release(&self) {}
}

/// Durable persistence of the current peer set, excluding self (§3, §6).
#[async_trait]
pub trait PeerStore: Send + Sync + 'static {
    async fn peers(&self) -> Result<Vec<PeerId>>;
    async fn set_peers(&self, peers: Vec<PeerId>) -> Result<()>;
}
