//! The apply pipeline (§4.7) and the FSM worker it dispatches `Command`
//! entries to.
//!
//! Two tasks, not one: [`ApplyPipeline`] reads committed log entries in
//! order and advances `lastApplied` immediately on dispatch — for
//! `Noop`/`AddPeer`/`RemovePeer` that's also when their future resolves, but
//! for `Command` entries resolving the future is deferred to whichever
//! `FsmJob` the entry becomes. [`FsmWorker`] is the only task that ever
//! touches the state machine (apply, snapshot, or restore), so those three
//! operations are strictly serialized relative to each other (§5).

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::core::MembershipEvent;
use crate::core::Resp;
use crate::error::RaftError;
use crate::inflight::ClientOutcome;
use crate::inflight::ClientResponder;
use crate::log::EntryKind;
use crate::log::LogEntry;
use crate::log::PeerId;
use crate::storage::Fsm;
use crate::storage::LogStore;
use crate::storage::PeerStore;
use crate::RaftTypeConfig;

/// What the apply pipeline forwards to the role loop after processing a log
/// entry it cannot act on itself (§5, §9 "Apply pipeline").
pub(crate) enum ApplySignal {
    /// This node removed itself and `shutdown_on_remove` is `false`: give up
    /// leadership (if held) but keep running.
    StepDown,
    /// This node removed itself and `shutdown_on_remove` is `true`, or the
    /// log became unreadable: stop the role loop entirely.
    Shutdown,
}

/// A batch of newly-committed log indices to apply, optionally carrying the
/// response channel of the entry that triggered this batch (only set by the
/// leader loop; Followers apply with no originating future, per §4.6).
pub(crate) enum ApplyJob<C: RaftTypeConfig> {
    Logs { upto: u64, originating: Option<OriginatingResponder<Resp<C>>> },
}

pub(crate) struct OriginatingResponder<R> {
    pub index: u64,
    pub responder: Option<ClientResponder<R>>,
}

pub(crate) struct CommandJob<C: RaftTypeConfig> {
    pub entry: LogEntry,
    pub responder: Option<ClientResponder<Resp<C>>>,
}

/// Work routed to the sole task allowed to touch the state machine.
pub(crate) enum FsmJob<C: RaftTypeConfig> {
    Apply(CommandJob<C>),
    Snapshot(oneshot::Sender<anyhow::Result<<C::Machine as Fsm>::Snapshot>>),
    Restore {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        tx: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Owns the only `Arc<C::Machine>` that is ever called — apply, snapshot,
/// and restore are requests queued on one channel, so the state machine
/// never sees concurrent calls.
pub(crate) struct FsmWorker<C: RaftTypeConfig> {
    pub fsm: Arc<C::Machine>,
    pub rx: mpsc::Receiver<FsmJob<C>>,
}

impl<C: RaftTypeConfig> FsmWorker<C> {
    pub(crate) async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            match job {
                FsmJob::Apply(CommandJob { entry, responder }) => match self.fsm.apply(&entry.data).await {
                    Ok(resp) => {
                        if let Some(tx) = responder {
                            let _ = tx.send(Ok(ClientOutcome::Applied(resp)));
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, index = entry.index, "fsm apply returned an error");
                        if let Some(tx) = responder {
                            let _ = tx.send(Err(RaftError::network(err)));
                        }
                    }
                },
                FsmJob::Snapshot(tx) => {
                    let _ = tx.send(self.fsm.snapshot().await);
                }
                FsmJob::Restore { mut reader, tx } => {
                    let _ = tx.send(self.fsm.restore(&mut *reader).await);
                }
            }
        }
    }
}

/// Processes committed log entries in strict index order (§4.7
/// processLogs/processLog). Owns `lastApplied` and the externally-visible
/// peer set.
pub(crate) struct ApplyPipeline<C: RaftTypeConfig> {
    pub log_store: Arc<C::Log>,
    pub peer_store: Arc<C::Peers>,
    pub registers: Arc<crate::state::RaftRegisters>,
    pub peers: Arc<RwLock<Vec<PeerId>>>,
    pub self_id: PeerId,
    pub config: Arc<Config>,
    pub rx: mpsc::Receiver<ApplyJob<C>>,
    pub fsm_tx: mpsc::Sender<FsmJob<C>>,
    pub membership_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<MembershipEvent>>>>,
    pub signal_tx: mpsc::UnboundedSender<ApplySignal>,
    pub shutdown: broadcast::Receiver<()>,
}

impl<C: RaftTypeConfig> ApplyPipeline<C> {
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => return,
                job = self.rx.recv() => {
                    match job {
                        Some(ApplyJob::Logs { upto, originating }) => self.process_logs(upto, originating).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn process_logs(&mut self, upto: u64, mut originating: Option<OriginatingResponder<Resp<C>>>) {
        let lo = self.registers.last_applied();
        if upto <= lo {
            return;
        }
        for idx in (lo + 1)..=upto {
            let responder = match &originating {
                Some(o) if o.index == idx => originating.take().and_then(|o| o.responder),
                _ => None,
            };

            let entry = match self.log_store.get_log(idx).await {
                Ok(Some(e)) => e,
                Ok(None) => {
                    tracing::error!(index = idx, "fatal: committed entry missing from log store");
                    let _ = self.signal_tx.send(ApplySignal::Shutdown);
                    if let Some(tx) = responder {
                        let _ = tx.send(Err(RaftError::fatal(anyhow::anyhow!("missing log entry {idx}"))));
                    }
                    return;
                }
                Err(err) => {
                    tracing::error!(%err, index = idx, "fatal: log read failed during apply");
                    let _ = self.signal_tx.send(ApplySignal::Shutdown);
                    if let Some(tx) = responder {
                        let _ = tx.send(Err(RaftError::fatal(err)));
                    }
                    return;
                }
            };

            self.process_log(entry, responder).await;
            self.registers.set_last_applied(idx);
        }
    }

    async fn process_log(&mut self, entry: LogEntry, responder: Option<ClientResponder<Resp<C>>>) {
        match entry.kind {
            EntryKind::Command => {
                let _ = self.fsm_tx.send(FsmJob::Apply(CommandJob { entry, responder })).await;
            }
            EntryKind::Noop => {
                if let Some(tx) = responder {
                    let _ = tx.send(Ok(ClientOutcome::Done));
                }
            }
            EntryKind::AddPeer => {
                let full_set = match crate::log::decode_peer_set(&entry.data) {
                    Ok(v) => v,
                    Err(err) => {
                        self.fatal_decode_error(err, responder).await;
                        return;
                    }
                };
                let new_peers: Vec<PeerId> = full_set.into_iter().filter(|p| p != &self.self_id).collect();
                let (added, _removed) = self.swap_peers(new_peers.clone()).await;
                if let Err(err) = self.peer_store.set_peers(new_peers).await {
                    tracing::warn!(%err, "AddPeer: could not persist peer set");
                }
                self.notify_membership(added.into_iter().map(MembershipEvent::Added));
                if let Some(tx) = responder {
                    let _ = tx.send(Ok(ClientOutcome::Done));
                }
            }
            EntryKind::RemovePeer => {
                let full_set = match crate::log::decode_peer_set(&entry.data) {
                    Ok(v) => v,
                    Err(err) => {
                        self.fatal_decode_error(err, responder).await;
                        return;
                    }
                };
                let self_removed = !full_set.contains(&self.self_id);
                let new_peers: Vec<PeerId> =
                    if self_removed { Vec::new() } else { full_set.into_iter().filter(|p| p != &self.self_id).collect() };
                let index = entry.index;
                let (_added, removed) = self.swap_peers(new_peers.clone()).await;
                if let Err(err) = self.peer_store.set_peers(new_peers).await {
                    tracing::warn!(%err, "RemovePeer: could not persist peer set");
                }
                self.notify_membership(removed.into_iter().map(|peer| MembershipEvent::Removed { peer, index }));

                if self_removed {
                    let signal = if self.config.shutdown_on_remove { ApplySignal::Shutdown } else { ApplySignal::StepDown };
                    let _ = self.signal_tx.send(signal);
                }
                if let Some(tx) = responder {
                    let _ = tx.send(Ok(ClientOutcome::Done));
                }
            }
        }
    }

    async fn fatal_decode_error(&self, err: anyhow::Error, responder: Option<ClientResponder<Resp<C>>>) {
        tracing::error!(%err, "fatal: could not decode membership-change payload");
        let _ = self.signal_tx.send(ApplySignal::Shutdown);
        if let Some(tx) = responder {
            let _ = tx.send(Err(RaftError::fatal(err)));
        }
    }

    fn notify_membership(&self, events: impl Iterator<Item = MembershipEvent>) {
        let guard = self.membership_tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            for event in events {
                let _ = tx.send(event);
            }
        }
    }

    /// Replace the externally-visible peer set and report which peers were
    /// newly added/removed relative to the previous set.
    async fn swap_peers(&self, new_peers: Vec<PeerId>) -> (Vec<PeerId>, Vec<PeerId>) {
        let mut guard = self.peers.write().await;
        let before_set: HashSet<PeerId> = guard.iter().cloned().collect();
        let after_set: HashSet<PeerId> = new_peers.iter().cloned().collect();
        let added: Vec<PeerId> = new_peers.iter().cloned().filter(|p| !before_set.contains(p)).collect();
        let removed: Vec<PeerId> = guard.iter().cloned().filter(|p| !after_set.contains(p)).collect();
        *guard = new_peers;
        (added, removed)
    }
}
