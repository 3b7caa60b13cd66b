//! The snapshot manager (§4.8): takes a snapshot either on a periodic,
//! randomized tick once the log has grown past `snapshot_threshold`, or on
//! demand when a caller requests one through [`crate::raft::Raft::snapshot`].
//!
//! Snapshot capture itself goes through [`super::apply::FsmJob::Snapshot`] —
//! this task never touches the state machine directly, so it never races
//! with the apply pipeline's `Command` dispatches or an in-flight
//! InstallSnapshot restore (§5).

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::config::random_timeout;
use crate::config::Config;
use crate::core::apply::FsmJob;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::LogId;
use crate::log::PeerId;
use crate::state::RaftRegisters;
use crate::storage::Fsm;
use crate::storage::FsmSnapshot;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::RaftTypeConfig;

pub(crate) struct SnapshotManager<C: RaftTypeConfig> {
    pub config: Arc<Config>,
    pub log_store: Arc<C::Log>,
    pub snapshots: Arc<C::Snapshots>,
    pub peers: Arc<tokio::sync::RwLock<Vec<PeerId>>>,
    pub self_id: PeerId,
    pub registers: Arc<RaftRegisters>,
    pub fsm_tx: mpsc::Sender<FsmJob<C>>,
    pub snapshot_req_rx: mpsc::Receiver<oneshot::Sender<RaftResult<()>>>,
    pub shutdown: broadcast::Receiver<()>,
}

impl<C: RaftTypeConfig> SnapshotManager<C> {
    pub(crate) async fn run(mut self) {
        loop {
            let tick = random_timeout(self.config.snapshot_interval);
            tokio::select! {
                _ = self.shutdown.recv() => return,
                req = self.snapshot_req_rx.recv() => {
                    match req {
                        Some(tx) => {
                            let result = self.take_snapshot().await.map_err(RaftError::fatal);
                            let _ = tx.send(result);
                        }
                        None => return,
                    }
                }
                _ = tokio::time::sleep(tick) => {
                    if self.should_snapshot().await {
                        if let Err(err) = self.take_snapshot().await {
                            tracing::warn!(%err, "periodic snapshot failed");
                        }
                    }
                }
            }
        }
    }

    async fn should_snapshot(&self) -> bool {
        let first = match self.log_store.first_index().await {
            Ok(Some(v)) => v,
            Ok(None) => return false,
            Err(err) => {
                tracing::warn!(%err, "snapshot manager: could not read first log index");
                return false;
            }
        };
        let last = self.registers.last_entry().index;
        last.saturating_sub(first) >= self.config.snapshot_threshold
    }

    /// The term associated with `lastApplied`, consulted before falling back
    /// to a log read — `lastApplied` usually coincides with either the last
    /// log entry or the last snapshot, neither of which needs a log lookup.
    async fn term_for_applied(&self, applied: u64) -> anyhow::Result<u64> {
        let last_entry = self.registers.last_entry();
        if applied == last_entry.index {
            return Ok(last_entry.term);
        }
        let last_snapshot = self.registers.last_snapshot();
        if applied == last_snapshot.index {
            return Ok(last_snapshot.term);
        }
        match self.log_store.get_log(applied).await? {
            Some(entry) => Ok(entry.term),
            None => Ok(last_snapshot.term),
        }
    }

    async fn take_snapshot(&self) -> anyhow::Result<()> {
        let applied = self.registers.last_applied();
        if applied == 0 {
            return Ok(());
        }
        let term = self.term_for_applied(applied).await?;

        let (tx, rx) = oneshot::channel();
        if self.fsm_tx.send(FsmJob::Snapshot(tx)).await.is_err() {
            anyhow::bail!("fsm worker gone");
        }
        let fsm_snapshot = rx.await.map_err(|_| anyhow::anyhow!("fsm worker gone"))??;

        let mut full_peers: Vec<PeerId> = self.peers.read().await.clone();
        full_peers.push(self.self_id.clone());

        let sink = self.snapshots.create(applied, term, full_peers).await?;
        let mut sink = Box::new(sink);
        let persist_result = fsm_snapshot.persist(&mut *sink).await;
        fsm_snapshot.release();

        match persist_result {
            Ok(()) => sink.close().await?,
            Err(err) => {
                let _ = sink.cancel().await;
                return Err(err);
            }
        }

        self.registers.set_last_snapshot(LogId::new(applied, term));
        super::compact_logs(&*self.log_store, &self.registers, self.config.trailing_logs, applied).await?;
        Ok(())
    }
}
