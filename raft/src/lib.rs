//! A durable, replicated-log Raft consensus core.
//!
//! This crate implements the hard part of Raft: the role state machine
//! (Follower/Candidate/Leader), AppendEntries/RequestVote/InstallSnapshot
//! processing, leader-side replication with quorum commitment, log
//! persistence and compaction, and single-peer-at-a-time membership change.
//! It does not implement storage, transport or application state —
//! those are supplied by the six collaborator traits in [`storage`] and
//! [`network`], bundled together by [`RaftTypeConfig`].
//!
//! See the [`raft`] module for the public, cloneable handle applications use
//! to drive a running node.

pub mod config;
pub mod core;
pub mod error;
pub mod inflight;
pub mod log;
pub mod network;
pub mod raft;
pub mod replication;
pub mod state;
pub mod status;
pub mod storage;

pub use crate::config::Config;
pub use crate::config::ConfigError;
pub use crate::error::ChangeMembershipError;
pub use crate::error::ClientWriteError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::error::SnapshotError;
pub use crate::log::decode_peer_set;
pub use crate::log::encode_peer_set;
pub use crate::log::EntryKind;
pub use crate::log::LogEntry;
pub use crate::log::LogId;
pub use crate::log::PeerId;
pub use crate::network::AppendEntriesRequest;
pub use crate::network::AppendEntriesResponse;
pub use crate::network::InstallSnapshotRequest;
pub use crate::network::InstallSnapshotResponse;
pub use crate::network::RequestVoteRequest;
pub use crate::network::RequestVoteResponse;
pub use crate::network::Transport;
pub use crate::raft::Raft;
pub use crate::status::NodeStatus;
pub use crate::status::Role;
pub use crate::status::Wait;
pub use crate::storage::Fsm;
pub use crate::storage::LogStore;
pub use crate::storage::PeerStore;
pub use crate::storage::SnapshotSink;
pub use crate::storage::SnapshotSource;
pub use crate::storage::SnapshotStore;
pub use crate::storage::StableStore;

/// A bundle of the six external collaborator types a concrete Raft
/// deployment is built from.
///
/// Every type in this crate that needs to talk to storage, the network or
/// the state machine is generic over a single `C: RaftTypeConfig` rather
/// than over each collaborator individually — this keeps the signatures of
/// `RaftCore`, `Raft`, the replicator and the RPC handlers from ballooning
/// into a six-parameter generic soup, while still keeping the six contracts
/// of section 6 distinct traits.
pub trait RaftTypeConfig: Send + Sync + 'static {
    /// Durable, monotonically indexed log storage.
    type Log: LogStore;
    /// Durable key/bytes and key/uint64 storage for term/vote metadata.
    type Stable: StableStore;
    /// Immutable snapshot creation, listing and opening.
    type Snapshots: SnapshotStore;
    /// Typed RPC transport to peers, and the inbound RPC stream.
    type Net: Transport;
    /// The caller-supplied finite state machine.
    type Machine: Fsm;
    /// Durable persistence of the current peer set.
    type Peers: PeerStore;
}
