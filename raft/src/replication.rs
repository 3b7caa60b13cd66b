//! The per-peer follower replicator (§4.4).
//!
//! Rather than sharing leader state, a replicator receives only the
//! [`Inflight`] handle and its own private state (§9 "Per-peer replication
//! as message-passing"); commit progress flows back solely by calling
//! `Inflight::commit` whenever this peer's `matchIndex` advances. A higher
//! term observed in a response is reported to the role loop over
//! `core_tx` rather than acted on locally — only the role loop may adopt a
//! new term (§9 "durable-vs-cached term").

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::interval;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::inflight::Inflight;
use crate::log::LogId;
use crate::log::PeerId;
use crate::network::AppendEntriesRequest;
use crate::network::InstallSnapshotRequest;
use crate::network::Transport;
use crate::state::RaftRegisters;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;

/// Events a replicator reports back to the role loop. The role loop is the
/// only task allowed to act on a higher term (step down, adopt the term);
/// the replicator just observes and reports.
pub enum ReplicaEvent {
    HigherTerm { term: u64 },
}

enum StopSignal {
    /// Exit without sending anything further.
    Immediate,
    /// Replicate up to and including `index` (so the target learns of its
    /// own removal), then exit.
    After { index: u64 },
}

/// The public handle to a spawned replicator.
pub struct Replicator {
    pub peer: PeerId,
    trigger_tx: mpsc::Sender<()>,
    stop_tx: std::sync::Mutex<Option<oneshot::Sender<StopSignal>>>,
    match_index: Arc<AtomicU64>,
}

impl Replicator {
    /// Non-blocking, coalescing wake-up: many concurrent calls collapse
    /// into at most one pending notification (§9).
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Tell the replicator to keep going until `index` has been replicated,
    /// then exit — used so a departing peer learns of its own removal.
    pub fn stop_after(&self, index: u64) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(StopSignal::After { index });
        }
    }

    /// Tell the replicator to exit immediately.
    pub fn stop_now(&self) {
        // Dropping the sender without sending is observed by the
        // replicator as a closed channel, i.e. immediate stop.
        self.stop_tx.lock().unwrap().take();
    }

    pub fn match_index(&self) -> u64 {
        self.match_index.load(Ordering::SeqCst)
    }
}

/// Spawn a replicator driving AppendEntries/InstallSnapshot towards `peer`.
#[allow(clippy::too_many_arguments)]
pub fn spawn<L, SS, T, R>(
    id: PeerId,
    peer: PeerId,
    term: u64,
    config: Arc<Config>,
    leader_last_log: LogId,
    log_store: Arc<L>,
    snapshot_store: Arc<SS>,
    transport: Arc<T>,
    registers: Arc<RaftRegisters>,
    inflight: Arc<Inflight<R>>,
    core_tx: mpsc::UnboundedSender<(PeerId, ReplicaEvent)>,
) -> Replicator
where
    L: LogStore,
    SS: SnapshotStore,
    T: Transport,
    R: Send + 'static,
{
    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = oneshot::channel();
    let match_index = Arc::new(AtomicU64::new(0));

    let task = ReplicatorTask {
        id,
        peer: peer.clone(),
        term,
        next_index: leader_last_log.index + 1,
        match_index: match_index.clone(),
        config,
        leader_last_log,
        log_store,
        snapshot_store,
        transport,
        registers,
        inflight,
        core_tx,
        trigger_rx,
        stop_rx: Some(stop_rx),
        stop_at: None,
    };

    tokio::spawn(task.run().instrument(tracing::debug_span!("replicator", peer = ?peer)));

    Replicator {
        peer,
        trigger_tx,
        stop_tx: std::sync::Mutex::new(Some(stop_tx)),
        match_index,
    }
}

struct ReplicatorTask<L, SS, T, R> {
    id: PeerId,
    peer: PeerId,
    term: u64,
    next_index: u64,
    match_index: Arc<AtomicU64>,
    config: Arc<Config>,
    leader_last_log: LogId,
    log_store: Arc<L>,
    snapshot_store: Arc<SS>,
    transport: Arc<T>,
    registers: Arc<RaftRegisters>,
    inflight: Arc<Inflight<R>>,
    core_tx: mpsc::UnboundedSender<(PeerId, ReplicaEvent)>,
    trigger_rx: mpsc::Receiver<()>,
    stop_rx: Option<oneshot::Receiver<StopSignal>>,
    stop_at: Option<u64>,
}

impl<L, SS, T, R> ReplicatorTask<L, SS, T, R>
where
    L: LogStore,
    SS: SnapshotStore,
    T: Transport,
    R: Send + 'static,
{
    async fn run(mut self) {
        let mut ticker = interval(self.config.commit_timeout);
        ticker.tick().await; // first tick fires immediately; consume it.

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.trigger_rx.recv() => {}
                res = async { self.stop_rx.as_mut().unwrap().await }, if self.stop_rx.is_some() && self.stop_at.is_none() => {
                    self.stop_rx = None;
                    match res {
                        Ok(StopSignal::Immediate) | Err(_) => return,
                        Ok(StopSignal::After { index }) => {
                            if self.match_index.load(Ordering::SeqCst) >= index {
                                return;
                            }
                            self.stop_at = Some(index);
                        }
                    }
                }
            }

            if !self.cycle().await {
                return;
            }

            if let Some(stop_at) = self.stop_at {
                if self.match_index.load(Ordering::SeqCst) >= stop_at {
                    return;
                }
            }
        }
    }

    /// One AppendEntries (or InstallSnapshot fallback) cycle. Returns
    /// `false` if the replicator should exit (a higher term was observed).
    async fn cycle(&mut self) -> bool {
        let first_index = match self.log_store.first_index().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(peer = ?self.peer, %err, "replicator: log store read failed");
                return true;
            }
        };

        let prev_log_index = self.next_index.saturating_sub(1);
        let needs_snapshot = first_index.map(|fi| prev_log_index < fi).unwrap_or(false) && prev_log_index > 0;

        if needs_snapshot {
            return self.install_snapshot().await;
        }

        self.append_entries(prev_log_index).await
    }

    async fn append_entries(&mut self, prev_log_index: u64) -> bool {
        let prev_log_term = match self.prev_log_term(prev_log_index).await {
            Ok(t) => t,
            Err(err) => {
                tracing::warn!(peer = ?self.peer, %err, "replicator: could not resolve prev log term");
                return true;
            }
        };

        let max = self.config.max_append_entries;
        let last_log_index = self.registers.last_entry().index;
        let mut entries = Vec::new();
        let mut idx = self.next_index;
        while idx <= last_log_index && entries.len() < max {
            match self.log_store.get_log(idx).await {
                Ok(Some(e)) => entries.push(e),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(peer = ?self.peer, %err, "replicator: log read failed");
                    return true;
                }
            }
            idx += 1;
        }

        let req = AppendEntriesRequest {
            term: self.term,
            leader: self.id.clone(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit_index: self.registers.commit_index(),
        };
        let sent_last_index = req.entries.last().map(|e| e.index).unwrap_or(prev_log_index);

        match self.transport.append_entries(&self.peer, req).await {
            Ok(resp) => {
                if resp.term > self.term {
                    let _ = self.core_tx.send((self.peer.clone(), ReplicaEvent::HigherTerm { term: resp.term }));
                    return false;
                }
                if resp.success {
                    self.next_index = sent_last_index + 1;
                    let matched = self.next_index - 1;
                    self.match_index.store(matched, Ordering::SeqCst);
                    self.inflight.commit(matched, self.peer.clone()).await;
                } else {
                    self.next_index = self.next_index.saturating_sub(1).max(1);
                }
            }
            Err(err) => {
                tracing::debug!(peer = ?self.peer, %err, "replicator: append_entries failed, retrying");
            }
        }
        true
    }

    async fn prev_log_term(&self, prev_log_index: u64) -> anyhow::Result<u64> {
        if prev_log_index == 0 {
            return Ok(0);
        }
        if prev_log_index == self.leader_last_log.index {
            return Ok(self.leader_last_log.term);
        }
        let snap = self.registers.last_snapshot();
        if prev_log_index == snap.index {
            return Ok(snap.term);
        }
        match self.log_store.get_log(prev_log_index).await? {
            Some(e) => Ok(e.term),
            None => Ok(0),
        }
    }

    /// Switch to snapshot-install mode: open the latest snapshot and stream
    /// it to the peer. On success, advance `nextIndex`/`matchIndex` past it.
    async fn install_snapshot(&mut self) -> bool {
        let snapshots = match self.snapshot_store.list().await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(peer = ?self.peer, %err, "replicator: could not list snapshots");
                return true;
            }
        };
        let meta = match snapshots.into_iter().next() {
            Some(m) => m,
            None => {
                tracing::warn!(peer = ?self.peer, "replicator: needs snapshot install but none exists");
                return true;
            }
        };
        let (meta, mut source) = match self.snapshot_store.open(&meta.id).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(peer = ?self.peer, %err, "replicator: could not open snapshot");
                return true;
            }
        };

        let req = InstallSnapshotRequest {
            term: self.term,
            leader: self.id.clone(),
            last_log_index: meta.index,
            last_log_term: meta.term,
            peers: meta.peers.clone(),
            size: meta.size,
        };

        match self.transport.install_snapshot(&self.peer, req, &mut source).await {
            Ok(resp) => {
                if resp.term > self.term {
                    let _ = self.core_tx.send((self.peer.clone(), ReplicaEvent::HigherTerm { term: resp.term }));
                    return false;
                }
                if resp.success {
                    self.next_index = meta.index + 1;
                    self.match_index.store(meta.index, Ordering::SeqCst);
                    self.inflight.commit(meta.index, self.peer.clone()).await;
                }
            }
            Err(err) => {
                tracing::debug!(peer = ?self.peer, %err, "replicator: install_snapshot failed, retrying");
            }
        }
        true
    }
}
