//! The log entry data model (§3) and the canonical peer-set encoding used
//! for `AddPeer`/`RemovePeer` entry payloads.

use std::fmt;

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

/// An opaque, transport-encoded peer address. Raft never interprets the
/// bytes itself — only `Transport::encode_peer`/`decode_peer` and the
/// application's network layer know how to turn this into something
/// dialable.
pub type PeerId = Bytes;

/// A (term, index) pair identifying a log entry or the point a snapshot was
/// taken at. `(0, 0)` denotes "no entry yet".
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

impl LogId {
    pub const ZERO: LogId = LogId { index: 0, term: 0 };

    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

/// What kind of change a log entry represents.
///
/// `AddPeer`/`RemovePeer` entries carry the canonically encoded post-change
/// peer set as their payload (§3); `Noop` entries (dispatched once by every
/// new leader per §4.5/§8) carry no payload and exist only to flush the log
/// through the new term.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntryKind {
    Command,
    Noop,
    AddPeer,
    RemovePeer,
}

/// A single durable log record.
///
/// `(index, term)` uniquely identifies an entry; two logs agreeing at
/// `(index, term)` agree on all prior entries (Log Matching, §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub kind: EntryKind,
    pub data: Bytes,
}

impl LogEntry {
    pub fn log_id(&self) -> LogId {
        LogId::new(self.index, self.term)
    }
}

/// Canonically encode an ordered peer set for storage in an
/// `AddPeer`/`RemovePeer` entry's `data` field, or for persistence via
/// `PeerStore`.
///
/// Order is preserved byte-for-byte on the round trip (`decode_peer_set`
/// returns the peers in the order they were encoded) — callers that need a
/// stable membership ordering (e.g. for deterministic replay across nodes)
/// must sort before encoding if that matters to them; this function does
/// not impose an ordering of its own.
pub fn encode_peer_set(peers: &[PeerId]) -> Bytes {
    let as_vecs: Vec<Vec<u8>> = peers.iter().map(|p| p.to_vec()).collect();
    Bytes::from(serde_json::to_vec(&as_vecs).expect("peer set is always serializable"))
}

/// The inverse of [`encode_peer_set`].
pub fn decode_peer_set(data: &[u8]) -> Result<Vec<PeerId>> {
    let as_vecs: Vec<Vec<u8>> = serde_json::from_slice(data).context("decoding peer set")?;
    Ok(as_vecs.into_iter().map(Bytes::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_set_round_trips_preserving_order() {
        let peers: Vec<PeerId> = vec![Bytes::from_static(b"c"), Bytes::from_static(b"a"), Bytes::from_static(b"b")];
        let encoded = encode_peer_set(&peers);
        let decoded = decode_peer_set(&encoded).unwrap();
        assert_eq!(peers, decoded);
    }

    #[test]
    fn empty_peer_set_round_trips() {
        let encoded = encode_peer_set(&[]);
        let decoded = decode_peer_set(&encoded).unwrap();
        assert!(decoded.is_empty());
    }
}
