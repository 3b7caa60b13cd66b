//! In-memory implementations of the `raft` crate's storage and transport
//! collaborator contracts, used for tests and local experimentation. None of
//! this is durable — a process restart loses everything, same tradeoff the
//! teacher crate's own `memstore` makes for its `RaftStorage` impl.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::ops::RangeInclusive;
use std::pin::Pin;
use std::sync::Mutex as StdMutex;
use std::task::Context;
use std::task::Poll;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use raft::log::LogEntry;
use raft::log::PeerId;
use raft::storage::LogStore;
use raft::storage::PeerStore;
use raft::storage::StableStore;
use tokio::io::AsyncRead;
use tokio::io::ReadBuf;
use tokio::sync::RwLock;

mod fsm;
mod router;
mod snapshot;

pub use fsm::Command;
pub use fsm::MemFsm;
pub use fsm::MemFsmSnapshot;
pub use fsm::Response;
pub use router::MemTransport;
pub use router::Router;
pub use snapshot::MemSnapshotStore;

/// The six in-memory collaborators bundled into a single [`raft::RaftTypeConfig`],
/// so tests can write `Raft::<MemTypeConfig>::new(...)` instead of naming each
/// collaborator type individually.
pub struct MemTypeConfig;

impl raft::RaftTypeConfig for MemTypeConfig {
    type Log = MemLogStore;
    type Stable = MemStableStore;
    type Snapshots = MemSnapshotStore;
    type Net = MemTransport;
    type Machine = MemFsm;
    type Peers = MemPeerStore;
}

/// A growable in-memory byte buffer doubling as both a `SnapshotSink`'s write
/// target and a plain `AsyncRead` source, so a snapshot never has to touch
/// disk to round-trip through `persist`/`restore` or across the wire.
pub(crate) struct ByteBuf {
    data: Vec<u8>,
    pos: usize,
}

impl ByteBuf {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl AsyncRead for ByteBuf {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.data[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

/// Durable, monotonically indexed log storage backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemLogStore {
    log: RwLock<BTreeMap<u64, LogEntry>>,
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn first_index(&self) -> Result<Option<u64>> {
        Ok(self.log.read().await.keys().next().copied())
    }

    async fn last_index(&self) -> Result<Option<u64>> {
        Ok(self.log.read().await.keys().next_back().copied())
    }

    async fn get_log(&self, index: u64) -> Result<Option<LogEntry>> {
        Ok(self.log.read().await.get(&index).cloned())
    }

    async fn store_log(&self, entry: &LogEntry) -> Result<()> {
        self.log.write().await.insert(entry.index, entry.clone());
        Ok(())
    }

    async fn store_logs(&self, entries: &[LogEntry]) -> Result<()> {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.index, entry.clone());
        }
        Ok(())
    }

    async fn delete_range(&self, range: RangeInclusive<u64>) -> Result<()> {
        let mut log = self.log.write().await;
        let keys: Vec<u64> = log.range(range).map(|(k, _)| *k).collect();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }
}

/// Durable key/bytes and key/uint64 term-and-vote storage. "Not found" is
/// represented as a missing map entry, matching `StableStore`'s contract
/// that absence is not an error.
#[derive(Default)]
pub struct MemStableStore {
    bytes: StdMutex<HashMap<String, Vec<u8>>>,
    nums: StdMutex<HashMap<String, u64>>,
}

#[async_trait]
impl StableStore for MemStableStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.bytes.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.bytes.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.nums.lock().unwrap().get(key).copied())
    }

    async fn set_u64(&self, key: &str, value: u64) -> Result<()> {
        self.nums.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// Durable persistence of the current peer set, excluding self.
#[derive(Default)]
pub struct MemPeerStore {
    peers: StdMutex<Vec<PeerId>>,
}

#[async_trait]
impl PeerStore for MemPeerStore {
    async fn peers(&self) -> Result<Vec<PeerId>> {
        Ok(self.peers.lock().unwrap().clone())
    }

    async fn set_peers(&self, peers: Vec<PeerId>) -> Result<()> {
        *self.peers.lock().unwrap() = peers;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use maplit::hashset;
    use raft::EntryKind;
    use raft::LogEntry;

    use super::*;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, kind: EntryKind::Command, data: Bytes::new() }
    }

    #[tokio::test]
    async fn log_store_tracks_first_and_last_index() {
        let store = MemLogStore::default();
        assert_eq!(store.first_index().await.unwrap(), None);
        assert_eq!(store.last_index().await.unwrap(), None);

        store.store_logs(&[entry(1, 1), entry(2, 1), entry(3, 2)]).await.unwrap();
        assert_eq!(store.first_index().await.unwrap(), Some(1));
        assert_eq!(store.last_index().await.unwrap(), Some(3));
        assert_eq!(store.get_log(2).await.unwrap().map(|e| e.term), Some(1));
    }

    #[tokio::test]
    async fn delete_range_is_inclusive_on_both_ends() {
        let store = MemLogStore::default();
        store.store_logs(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)]).await.unwrap();

        store.delete_range(2..=3).await.unwrap();

        assert!(store.get_log(2).await.unwrap().is_none());
        assert!(store.get_log(3).await.unwrap().is_none());
        assert!(store.get_log(1).await.unwrap().is_some());
        assert!(store.get_log(4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stable_store_reports_absence_as_none_not_error() {
        let store = MemStableStore::default();
        assert_eq!(store.get_u64("CurrentTerm").await.unwrap(), None);
        assert_eq!(store.get("LastVoteCand").await.unwrap(), None);

        store.set_u64("CurrentTerm", 7).await.unwrap();
        assert_eq!(store.get_u64("CurrentTerm").await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn peer_store_round_trips_the_set_it_was_given() {
        let store = MemPeerStore::default();
        let peers = vec![Bytes::from_static(b"n2"), Bytes::from_static(b"n3")];
        store.set_peers(peers.clone()).await.unwrap();

        let read_back: std::collections::HashSet<PeerId> = store.peers().await.unwrap().into_iter().collect();
        assert_eq!(read_back, hashset! {Bytes::from_static(b"n2"), Bytes::from_static(b"n3")});
        let _ = peers;
    }
}
