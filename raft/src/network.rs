//! Wire payloads (§6) and the `Transport` collaborator contract.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio_stream::Stream;

use crate::log::LogEntry;
use crate::log::PeerId;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader: PeerId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit_index: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub last_log: u64,
    pub success: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub peers: Vec<PeerId>,
    pub granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader: PeerId,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub peers: Vec<PeerId>,
    pub size: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
}

/// An inbound RPC delivered by the transport, paired with a response
/// channel. The role loop is the sole consumer of this stream.
pub enum InboundRpc {
    AppendEntries {
        req: AppendEntriesRequest,
        tx: tokio::sync::oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    RequestVote {
        req: RequestVoteRequest,
        tx: tokio::sync::oneshot::Sender<Result<RequestVoteResponse>>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        /// The snapshot byte stream, exactly `req.size` bytes long. Framed
        /// separately from `req` per §6 so that large snapshots do not have
        /// to be buffered in memory by the transport before dispatch.
        reader: Box<dyn AsyncRead + Send + Unpin>,
        tx: tokio::sync::oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
}

/// Sends typed RPCs to peers, exposes a consumer stream of inbound RPCs,
/// and encodes/decodes peer addresses (§6).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// This node's own address, in its encoded form.
    fn local_addr(&self) -> PeerId;

    /// The stream of RPCs addressed to this node. Consumed exactly once, by
    /// the role loop.
    fn consumer(&self) -> Box<dyn Stream<Item = InboundRpc> + Send + Unpin>;

    async fn append_entries(&self, peer: &PeerId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    async fn request_vote(&self, peer: &PeerId, req: RequestVoteRequest) -> Result<RequestVoteResponse>;

    /// Send an InstallSnapshot RPC, streaming exactly `req.size` bytes from
    /// `reader` to the peer.
    async fn install_snapshot(
        &self,
        peer: &PeerId,
        req: InstallSnapshotRequest,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<InstallSnapshotResponse>;

    fn encode_peer(&self, addr: &str) -> PeerId {
        Bytes::copy_from_slice(addr.as_bytes())
    }

    fn decode_peer(&self, peer: &PeerId) -> Result<String> {
        Ok(String::from_utf8_lossy(peer).into_owned())
    }
}
