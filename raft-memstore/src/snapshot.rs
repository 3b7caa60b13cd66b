//! An in-memory `SnapshotStore`: snapshots live only in a `Vec` behind a
//! mutex, same non-durable tradeoff as the rest of this crate.

use std::io;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::task::Context;
use std::task::Poll;

use anyhow::Result;
use async_trait::async_trait;
use raft::log::PeerId;
use raft::storage::SnapshotMeta;
use raft::storage::SnapshotSink;
use raft::storage::SnapshotStore;
use tokio::io::AsyncWrite;

use crate::ByteBuf;

struct Inner {
    seq: AtomicU64,
    snapshots: StdMutex<Vec<(SnapshotMeta, Arc<Vec<u8>>)>>,
}

/// In-memory immutable snapshot storage, newest-first on `list`.
#[derive(Default)]
pub struct MemSnapshotStore {
    inner: Arc<Inner>,
}

impl Default for Inner {
    fn default() -> Self {
        Self { seq: AtomicU64::new(0), snapshots: StdMutex::new(Vec::new()) }
    }
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    type Sink = MemSnapshotSink;
    type Source = ByteBuf;

    async fn create(&self, index: u64, term: u64, peers: Vec<PeerId>) -> Result<Self::Sink> {
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);
        Ok(MemSnapshotSink {
            id: format!("snap-{seq:020}"),
            index,
            term,
            peers,
            data: Vec::new(),
            store: self.inner.clone(),
        })
    }

    async fn list(&self) -> Result<Vec<SnapshotMeta>> {
        let mut metas: Vec<SnapshotMeta> = self.inner.snapshots.lock().unwrap().iter().map(|(m, _)| m.clone()).collect();
        metas.sort_by(|a, b| b.index.cmp(&a.index));
        Ok(metas)
    }

    async fn open(&self, id: &str) -> Result<(SnapshotMeta, Self::Source)> {
        let snapshots = self.inner.snapshots.lock().unwrap();
        let (meta, data) = snapshots
            .iter()
            .find(|(m, _)| m.id == id)
            .ok_or_else(|| anyhow::anyhow!("no such snapshot: {id}"))?;
        Ok((meta.clone(), ByteBuf::new((**data).clone())))
    }
}

/// A snapshot under construction: bytes accumulate in `data` until `close`
/// finalizes the metadata and makes it visible to `list`/`open`.
pub struct MemSnapshotSink {
    id: String,
    index: u64,
    term: u64,
    peers: Vec<PeerId>,
    data: Vec<u8>,
    store: Arc<Inner>,
}

impl AsyncWrite for MemSnapshotSink {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl SnapshotSink for MemSnapshotSink {
    fn id(&self) -> &str {
        &self.id
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let meta = SnapshotMeta {
            id: self.id.clone(),
            index: self.index,
            term: self.term,
            peers: self.peers.clone(),
            size: self.data.len() as u64,
        };
        self.store.snapshots.lock().unwrap().push((meta, Arc::new(self.data)));
        Ok(())
    }

    async fn cancel(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
