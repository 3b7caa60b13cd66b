//! An in-process `Transport` built on `tokio::mpsc`/`oneshot`, used to wire
//! up multi-node test clusters without touching a real network (§0 of
//! SPEC_FULL.md).
//!
//! [`Router`] is the shared switchboard: every node registers once and gets
//! back a [`MemTransport`] to hand to `Raft::new`. Calling [`Router::isolate`]
//! on a peer makes every RPC to or from it fail, simulating the network
//! partition of scenario S3.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use raft::log::PeerId;
use raft::network::AppendEntriesRequest;
use raft::network::AppendEntriesResponse;
use raft::network::InboundRpc;
use raft::network::InstallSnapshotRequest;
use raft::network::InstallSnapshotResponse;
use raft::network::RequestVoteRequest;
use raft::network::RequestVoteResponse;
use raft::network::Transport;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::ByteBuf;

/// The shared switchboard a test cluster's [`MemTransport`]s route through.
pub struct Router {
    nodes: RwLock<HashMap<PeerId, mpsc::Sender<InboundRpc>>>,
    isolated: RwLock<HashSet<PeerId>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { nodes: RwLock::new(HashMap::new()), isolated: RwLock::new(HashSet::new()) })
    }

    /// Register a node, returning the `Transport` to construct it with.
    /// Must be called exactly once per node, before any peer dials it.
    pub async fn register(self: &Arc<Self>, id: PeerId) -> MemTransport {
        let (tx, rx) = mpsc::channel(256);
        self.nodes.write().await.insert(id.clone(), tx);
        MemTransport { id, router: self.clone(), rx: StdMutex::new(Some(rx)) }
    }

    /// Drop a node from the switchboard; RPCs addressed to it subsequently
    /// fail as "unknown peer" rather than hanging.
    pub async fn unregister(&self, id: &PeerId) {
        self.nodes.write().await.remove(id);
    }

    /// Make every RPC to or from `id` fail, simulating a network partition.
    pub async fn isolate(&self, id: &PeerId) {
        self.isolated.write().await.insert(id.clone());
    }

    /// Undo a prior [`Router::isolate`].
    pub async fn heal(&self, id: &PeerId) {
        self.isolated.write().await.remove(id);
    }

    async fn deliver(&self, from: &PeerId, to: &PeerId, rpc: InboundRpc) -> Result<()> {
        {
            let isolated = self.isolated.read().await;
            if isolated.contains(from) || isolated.contains(to) {
                anyhow::bail!("network partition: {to:?} unreachable from {from:?}");
            }
        }
        let tx = {
            let nodes = self.nodes.read().await;
            nodes.get(to).cloned().ok_or_else(|| anyhow::anyhow!("unknown peer {to:?}"))?
        };
        tx.send(rpc).await.map_err(|_| anyhow::anyhow!("peer {to:?} is gone"))
    }
}

/// The `Transport` implementation handed to each test node's `Raft::new`.
pub struct MemTransport {
    id: PeerId,
    router: Arc<Router>,
    rx: StdMutex<Option<mpsc::Receiver<InboundRpc>>>,
}

#[async_trait]
impl Transport for MemTransport {
    fn local_addr(&self) -> PeerId {
        self.id.clone()
    }

    fn consumer(&self) -> Box<dyn Stream<Item = InboundRpc> + Send + Unpin> {
        let rx = self.rx.lock().unwrap().take().expect("consumer() called more than once");
        Box::new(ReceiverStream::new(rx))
    }

    async fn append_entries(&self, peer: &PeerId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        let (tx, rx) = oneshot::channel();
        self.router.deliver(&self.id, peer, InboundRpc::AppendEntries { req, tx }).await?;
        rx.await.context("peer dropped append_entries response")?
    }

    async fn request_vote(&self, peer: &PeerId, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        let (tx, rx) = oneshot::channel();
        self.router.deliver(&self.id, peer, InboundRpc::RequestVote { req, tx }).await?;
        rx.await.context("peer dropped request_vote response")?
    }

    async fn install_snapshot(
        &self,
        peer: &PeerId,
        req: InstallSnapshotRequest,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<InstallSnapshotResponse> {
        let mut buf = Vec::with_capacity(req.size as usize);
        reader.read_to_end(&mut buf).await.context("buffering snapshot bytes for in-process transport")?;
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(ByteBuf::new(buf));
        let (tx, rx) = oneshot::channel();
        self.router.deliver(&self.id, peer, InboundRpc::InstallSnapshot { req, reader: boxed, tx }).await?;
        rx.await.context("peer dropped install_snapshot response")?
    }
}
