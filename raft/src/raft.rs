//! The public, cloneable handle applications use to drive a running node
//! (§6 "Client API").
//!
//! `Raft<C>` is a thin facade over the channels [`crate::core::spawn`]
//! returns — every method here enqueues a [`RaftMsg`] and awaits exactly one
//! reply, using [`tokio::time::timeout`] to turn a stuck intake channel into
//! [`RaftError::EnqueueTimeout`] rather than hanging a caller forever.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::config::Config;
use crate::core::RaftMsg;
use crate::core::Spawned;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::error::SnapshotError;
use crate::inflight::ClientOutcome;
use crate::log::PeerId;
use crate::status::NodeStatus;
use crate::status::Role;
use crate::status::Wait;
use crate::storage::Fsm;
use crate::RaftTypeConfig;

/// A cloneable handle to a running Raft node's background tasks.
///
/// Cloning is cheap (an `Arc` bump) and every clone talks to the same node;
/// dropping the last clone does not stop the node — call [`Raft::shutdown`]
/// explicitly.
pub struct Raft<C: RaftTypeConfig>(Arc<Spawned<C>>);

impl<C: RaftTypeConfig> Clone for Raft<C> {
    fn clone(&self) -> Self {
        Raft(self.0.clone())
    }
}

impl<C: RaftTypeConfig> Raft<C> {
    /// Bootstrap and spawn a node's background tasks (§4.9).
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        id: PeerId,
        config: Config,
        log_store: Arc<C::Log>,
        stable_store: Arc<C::Stable>,
        snapshots: Arc<C::Snapshots>,
        transport: Arc<C::Net>,
        fsm: Arc<C::Machine>,
        peer_store: Arc<C::Peers>,
    ) -> RaftResult<Self> {
        let spawned = crate::core::spawn::<C>(id, config, log_store, stable_store, snapshots, transport, fsm, peer_store)
            .await?;
        Ok(Raft(Arc::new(spawned)))
    }

    /// Propose a command for replication, resolving once it has committed
    /// and been applied to the state machine (§4.7).
    pub async fn apply(
        &self,
        data: Bytes,
        enqueue_timeout: Duration,
    ) -> Result<<C::Machine as Fsm>::Response, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Apply { data, tx }, enqueue_timeout).await?;
        match rx.await.map_err(|_| RaftError::ShuttingDown)?? {
            ClientOutcome::Applied(resp) => Ok(resp),
            ClientOutcome::Done => unreachable!("Apply entries always resolve with ClientOutcome::Applied"),
        }
    }

    /// Add a peer to the cluster, resolving once the membership change has
    /// committed (§4.7 "Adding a peer").
    pub async fn add_peer(&self, peer: PeerId, enqueue_timeout: Duration) -> Result<(), ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_membership(RaftMsg::AddPeer { peer, tx }, enqueue_timeout).await?;
        rx.await.map_err(|_| ChangeMembershipError::Raft(RaftError::ShuttingDown))?
    }

    /// Remove a peer from the cluster (which may be this node itself),
    /// resolving once the membership change has committed (§4.7 "Removing a
    /// peer").
    pub async fn remove_peer(&self, peer: PeerId, enqueue_timeout: Duration) -> Result<(), ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue_membership(RaftMsg::RemovePeer { peer, tx }, enqueue_timeout).await?;
        rx.await.map_err(|_| ChangeMembershipError::Raft(RaftError::ShuttingDown))?
    }

    /// Request an out-of-band snapshot (§4.8), regardless of the node's
    /// current role.
    pub async fn snapshot(&self, enqueue_timeout: Duration) -> Result<(), SnapshotError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(RaftMsg::Snapshot { tx }, enqueue_timeout).await?;
        rx.await.map_err(|_| RaftError::ShuttingDown)??;
        Ok(())
    }

    /// The peer this node currently believes is leader, if any.
    pub fn leader(&self) -> Option<PeerId> {
        self.0.status_rx.borrow().current_leader.clone()
    }

    /// This node's current role.
    pub fn state(&self) -> Role {
        self.0.status_rx.borrow().role
    }

    /// A full point-in-time snapshot of this node's volatile state.
    pub fn status(&self) -> NodeStatus {
        self.0.status_rx.borrow().clone()
    }

    /// A handle for awaiting a condition on this node's status (election
    /// outcome, commit advancement, role transition) without polling.
    pub fn wait(&self, timeout: Duration) -> Wait {
        Wait { timeout, rx: self.0.status_rx.clone() }
    }

    /// Signal every background task to stop and wait for them to exit.
    /// Idempotent: a second call observes no running tasks and returns
    /// immediately.
    pub async fn shutdown(&self) {
        let _ = self.0.shutdown_tx.send(());
        let handles = mem::take(&mut *self.0.join_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn enqueue(&self, msg: RaftMsg<C>, enqueue_timeout: Duration) -> Result<(), RaftError> {
        timeout(enqueue_timeout, self.0.tx_api.send(msg)).await.map_err(|_| RaftError::EnqueueTimeout)?.map_err(|_| RaftError::ShuttingDown)
    }

    async fn enqueue_membership(&self, msg: RaftMsg<C>, enqueue_timeout: Duration) -> Result<(), ChangeMembershipError> {
        self.enqueue(msg, enqueue_timeout).await.map_err(ChangeMembershipError::Raft)
    }
}
