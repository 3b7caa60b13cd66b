//! The role loop (§4.5) and bootstrap/recovery (§4.9).
//!
//! [`RaftCore`] owns the one thing only the role loop may touch: the
//! decision of which role to run next, plus (while Leader) the replicator
//! map and inflight tracker. Everything else — FSM invocation, `lastApplied`,
//! snapshot capture — lives in the sibling [`apply`] and [`snapshot`] tasks,
//! reached only through channels.

mod apply;
mod rpc;
mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use bytes::Bytes;
use futures::stream::FuturesUnordered;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::RwLock;
use tokio_stream::StreamExt;
use tracing_futures::Instrument;

use crate::config::random_timeout;
use crate::config::Config;
use crate::error::ChangeMembershipError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::inflight::ClientOutcome;
use crate::inflight::ClientResponder;
use crate::inflight::Committed;
use crate::inflight::ExcludeNodeQuorum;
use crate::inflight::Inflight;
use crate::inflight::MajorityQuorum;
use crate::inflight::QuorumPolicy;
use crate::log::EntryKind;
use crate::log::LogEntry;
use crate::log::LogId;
use crate::log::PeerId;
use crate::network::InboundRpc;
use crate::network::RequestVoteRequest;
use crate::network::Transport;
use crate::replication::ReplicaEvent;
use crate::replication::Replicator;
use crate::state::DurableState;
use crate::state::RaftRegisters;
use crate::status::NodeStatus;
use crate::status::Role;
use crate::storage::Fsm;
use crate::storage::LogStore;
use crate::storage::PeerStore;
use crate::storage::SnapshotStore;
use crate::storage::StableStore;
use crate::RaftTypeConfig;

pub(crate) use apply::ApplyJob;
pub(crate) use apply::ApplySignal;
pub(crate) use apply::OriginatingResponder;

/// The FSM's response type for a given [`RaftTypeConfig`], spelled out once.
pub(crate) type Resp<C> = <<C as RaftTypeConfig>::Machine as Fsm>::Response;

/// Messages the client-facing [`crate::raft::Raft`] handle sends into the
/// role loop (§6 "Client API").
pub(crate) enum RaftMsg<C: RaftTypeConfig> {
    Apply {
        data: Bytes,
        tx: ClientResponder<Resp<C>>,
    },
    AddPeer {
        peer: PeerId,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
    },
    RemovePeer {
        peer: PeerId,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
    },
    Snapshot {
        tx: oneshot::Sender<RaftResult<()>>,
    },
}

/// What the apply pipeline tells an active Leader loop about a membership
/// change, so it can start/stop the affected replicator (§4.7).
pub(crate) enum MembershipEvent {
    Added(PeerId),
    Removed { peer: PeerId, index: u64 },
}

/// Everything a running node's background tasks leave behind for
/// [`crate::raft::Raft`] to hold onto.
pub(crate) struct Spawned<C: RaftTypeConfig> {
    pub tx_api: mpsc::Sender<RaftMsg<C>>,
    pub status_rx: watch::Receiver<NodeStatus>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub join_handles: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The role-loop state: durable facade, volatile registers, and handles onto
/// every collaborator and sibling task. Exclusively owned by the task
/// running [`RaftCore::run`] — nothing else ever calls its methods.
pub(crate) struct RaftCore<C: RaftTypeConfig> {
    id: PeerId,
    config: Arc<Config>,
    log_store: Arc<C::Log>,
    stable: DurableState<C::Stable>,
    snapshots: Arc<C::Snapshots>,
    transport: Arc<C::Net>,
    peer_store: Arc<C::Peers>,
    registers: Arc<RaftRegisters>,
    peers: Arc<RwLock<Vec<PeerId>>>,
    status_tx: Arc<watch::Sender<NodeStatus>>,
    apply_tx: mpsc::Sender<ApplyJob<C>>,
    fsm_tx: mpsc::Sender<apply::FsmJob<C>>,
    snapshot_req_tx: mpsc::Sender<oneshot::Sender<RaftResult<()>>>,
    apply_signal_rx: mpsc::UnboundedReceiver<ApplySignal>,
    membership_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<MembershipEvent>>>>,
    rpc_stream: Box<dyn tokio_stream::Stream<Item = InboundRpc> + Send + Unpin>,
    rx_api: mpsc::Receiver<RaftMsg<C>>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Bootstrap a node (§4.9) and spawn its four long-running tasks: the role
/// loop, the apply pipeline, the FSM worker, and the snapshot manager.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn spawn<C: RaftTypeConfig>(
    id: PeerId,
    config: Config,
    log_store: Arc<C::Log>,
    stable_store: Arc<C::Stable>,
    snapshots: Arc<C::Snapshots>,
    transport: Arc<C::Net>,
    fsm: Arc<C::Machine>,
    peer_store: Arc<C::Peers>,
) -> RaftResult<Spawned<C>> {
    let config = Arc::new(config);
    let stable = DurableState::load(stable_store).await?;
    let registers = Arc::new(RaftRegisters::new());

    let last_log_index = log_store.last_index().await.map_err(RaftError::fatal)?.unwrap_or(0);
    let last_log_term = if last_log_index == 0 {
        0
    } else {
        log_store.get_log(last_log_index).await.map_err(RaftError::fatal)?.map(|e| e.term).unwrap_or(0)
    };
    registers.set_last_entry(LogId::new(last_log_index, last_log_term));

    let initial_peers: Vec<PeerId> =
        peer_store.peers().await.map_err(RaftError::fatal)?.into_iter().filter(|p| p != &id).collect();
    let peers = Arc::new(RwLock::new(initial_peers));

    restore_latest_snapshot(&id, &*snapshots, &*fsm, &*peer_store, &registers, &peers).await?;

    let (status_tx, status_rx) = watch::channel(NodeStatus {
        id: id.clone(),
        role: Role::Follower,
        current_term: stable.current_term(),
        current_leader: None,
        last_log_index: registers.last_entry().index,
        commit_index: registers.commit_index(),
        last_applied: registers.last_applied(),
    });
    let status_tx = Arc::new(status_tx);

    let (shutdown_tx, _) = broadcast::channel(1);
    let (tx_api, rx_api) = mpsc::channel(64);
    let (apply_tx, apply_rx) = mpsc::channel(1024);
    let (fsm_tx, fsm_rx) = mpsc::channel(256);
    let (apply_signal_tx, apply_signal_rx) = mpsc::unbounded_channel();
    let (snapshot_req_tx, snapshot_req_rx) = mpsc::channel(8);
    let membership_tx: Arc<StdMutex<Option<mpsc::UnboundedSender<MembershipEvent>>>> = Arc::new(StdMutex::new(None));

    let rpc_stream = transport.consumer();

    let core = RaftCore::<C> {
        id: id.clone(),
        config: config.clone(),
        log_store: log_store.clone(),
        stable,
        snapshots: snapshots.clone(),
        transport: transport.clone(),
        peer_store: peer_store.clone(),
        registers: registers.clone(),
        peers: peers.clone(),
        status_tx: status_tx.clone(),
        apply_tx: apply_tx.clone(),
        fsm_tx: fsm_tx.clone(),
        snapshot_req_tx,
        apply_signal_rx,
        membership_tx: membership_tx.clone(),
        rpc_stream,
        rx_api,
        shutdown_tx: shutdown_tx.clone(),
    };

    let fsm_worker = apply::FsmWorker::<C> { fsm, rx: fsm_rx };

    let apply_pipeline = apply::ApplyPipeline::<C> {
        log_store: log_store.clone(),
        peer_store: peer_store.clone(),
        registers: registers.clone(),
        peers: peers.clone(),
        self_id: id.clone(),
        config: config.clone(),
        rx: apply_rx,
        fsm_tx: fsm_tx.clone(),
        membership_tx: membership_tx.clone(),
        signal_tx: apply_signal_tx,
        shutdown: shutdown_tx.subscribe(),
    };

    let snapshot_mgr = snapshot::SnapshotManager::<C> {
        config: config.clone(),
        log_store: log_store.clone(),
        snapshots: snapshots.clone(),
        peers: peers.clone(),
        self_id: id.clone(),
        registers: registers.clone(),
        fsm_tx,
        snapshot_req_rx,
        shutdown: shutdown_tx.subscribe(),
    };

    let mut join_handles = Vec::new();
    join_handles.push(tokio::spawn(fsm_worker.run().instrument(tracing::debug_span!("fsm-worker", id = ?id))));
    join_handles
        .push(tokio::spawn(apply_pipeline.run().instrument(tracing::debug_span!("apply-pipeline", id = ?id))));
    join_handles
        .push(tokio::spawn(snapshot_mgr.run().instrument(tracing::debug_span!("snapshot-manager", id = ?id))));
    join_handles.push(tokio::spawn(core.run().instrument(tracing::info_span!("role-loop", id = ?id))));

    Ok(Spawned {
        tx_api,
        status_rx,
        shutdown_tx,
        join_handles: StdMutex::new(join_handles),
    })
}

/// Restore the newest usable snapshot, if any exist (§4.9). Fails startup if
/// snapshots exist but none could be restored.
async fn restore_latest_snapshot<SS, F, P>(
    id: &PeerId,
    snapshots: &SS,
    fsm: &F,
    peer_store: &P,
    registers: &RaftRegisters,
    peers: &RwLock<Vec<PeerId>>,
) -> RaftResult<()>
where
    SS: SnapshotStore,
    F: Fsm,
    P: PeerStore,
{
    let snap_list = snapshots.list().await.map_err(RaftError::fatal)?;
    if snap_list.is_empty() {
        return Ok(());
    }

    for meta in &snap_list {
        let (meta, mut source) = match snapshots.open(&meta.id).await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(%err, snapshot = %meta.id, "bootstrap: could not open snapshot, trying older one");
                continue;
            }
        };
        match fsm.restore(&mut source).await {
            Ok(()) => {
                registers.set_last_applied(meta.index);
                registers.set_last_snapshot(meta.log_id());
                if meta.index > registers.last_entry().index {
                    registers.set_last_entry(meta.log_id());
                }
                let restored_peers: Vec<PeerId> = meta.peers.iter().cloned().filter(|p| p != id).collect();
                *peers.write().await = restored_peers.clone();
                peer_store.set_peers(restored_peers).await.map_err(RaftError::fatal)?;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(%err, snapshot = %meta.id, "bootstrap: snapshot restore failed, trying older one");
            }
        }
    }

    Err(RaftError::fatal(anyhow::anyhow!("snapshots present but none could be restored")))
}

/// Delete log entries made redundant by a snapshot at `snap_index`, retaining
/// `trailing_logs` entries past it (§4.8 compactLogs). Shared by the
/// InstallSnapshot handler and the snapshot manager.
pub(crate) async fn compact_logs<L: LogStore>(
    log_store: &L,
    registers: &RaftRegisters,
    trailing_logs: u64,
    snap_index: u64,
) -> anyhow::Result<()> {
    if snap_index == 0 {
        return Ok(());
    }
    let min_log = match log_store.first_index().await? {
        Some(v) => v,
        None => return Ok(()),
    };
    let cap = registers.last_entry().index.saturating_sub(trailing_logs);
    let max_log = (snap_index - 1).min(cap);
    if max_log >= min_log {
        log_store.delete_range(min_log..=max_log).await?;
    }
    Ok(())
}

impl<C: RaftTypeConfig> RaftCore<C> {
    pub(crate) async fn run(mut self) {
        self.publish_status().await;
        loop {
            let role = self.registers.role();
            let next = match role {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
                Role::Shutdown => break,
            };
            self.registers.set_role(next);
            self.publish_status().await;
            if next == Role::Shutdown {
                break;
            }
        }
        tracing::info!("role loop exiting");
    }

    async fn run_follower(&mut self) -> Role {
        tracing::info!("becoming follower");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            let timeout = random_timeout(self.config.heartbeat_timeout);
            tokio::select! {
                _ = shutdown_rx.recv() => return Role::Shutdown,
                maybe_rpc = self.rpc_stream.next() => {
                    match maybe_rpc {
                        Some(rpc) => {
                            if let Some(next) = self.handle_inbound(rpc).await {
                                return next;
                            }
                        }
                        None => return Role::Shutdown,
                    }
                }
                maybe_msg = self.rx_api.recv() => {
                    match maybe_msg {
                        Some(msg) => self.reject_non_leader(msg).await,
                        None => return Role::Shutdown,
                    }
                }
                sig = self.apply_signal_rx.recv() => {
                    if let Some(ApplySignal::Shutdown) = sig {
                        return Role::Shutdown;
                    }
                }
                _ = tokio::time::sleep(timeout) => {
                    tracing::info!("heartbeat timeout elapsed, becoming candidate");
                    self.registers.set_current_leader(None).await;
                    return Role::Candidate;
                }
            }
        }
    }

    async fn run_candidate(&mut self) -> Role {
        tracing::info!("becoming candidate");
        self.registers.set_current_leader(None).await;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let new_term = self.stable.current_term() + 1;
            if let Err(err) = self.stable.set_current_term(new_term).await {
                tracing::error!(%err, "fatal: could not persist new term");
                return Role::Shutdown;
            }
            if let Err(err) = self.stable.persist_vote(new_term, &self.id).await {
                tracing::error!(%err, "fatal: could not persist self vote");
                return Role::Shutdown;
            }
            self.publish_status().await;

            let peers = self.peers.read().await.clone();
            let n = peers.len() + 1;
            let needed = n / 2 + 1;
            let mut granted = 1usize;
            if granted >= needed {
                return Role::Leader;
            }

            let last_entry = self.registers.last_entry();
            let mut pending_votes: FuturesUnordered<_> = peers
                .iter()
                .cloned()
                .map(|peer| {
                    let transport = self.transport.clone();
                    let req = RequestVoteRequest {
                        term: new_term,
                        candidate: self.id.clone(),
                        last_log_index: last_entry.index,
                        last_log_term: last_entry.term,
                    };
                    async move { transport.request_vote(&peer, req).await }
                })
                .collect();

            let deadline = tokio::time::sleep(random_timeout(self.config.election_timeout));
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return Role::Shutdown,
                    maybe_rpc = self.rpc_stream.next() => {
                        match maybe_rpc {
                            Some(rpc) => {
                                if let Some(next) = self.handle_inbound(rpc).await {
                                    return next;
                                }
                            }
                            None => return Role::Shutdown,
                        }
                    }
                    maybe_msg = self.rx_api.recv() => {
                        match maybe_msg {
                            Some(msg) => self.reject_non_leader(msg).await,
                            None => return Role::Shutdown,
                        }
                    }
                    sig = self.apply_signal_rx.recv() => {
                        if let Some(ApplySignal::Shutdown) = sig {
                            return Role::Shutdown;
                        }
                    }
                    vote = pending_votes.next(), if !pending_votes.is_empty() => {
                        match vote {
                            Some(Ok(resp)) => {
                                if resp.term > new_term {
                                    if let Err(err) = self.stable.set_current_term(resp.term).await {
                                        tracing::error!(%err, "fatal: could not persist observed term");
                                        return Role::Shutdown;
                                    }
                                    return Role::Follower;
                                }
                                if resp.granted {
                                    granted += 1;
                                    if granted >= needed {
                                        return Role::Leader;
                                    }
                                }
                            }
                            Some(Err(err)) => {
                                tracing::debug!(%err, "request_vote failed");
                            }
                            None => {}
                        }
                    }
                    _ = &mut deadline => break,
                }
            }
            tracing::info!("election timed out without a majority, starting a new term");
        }
    }

    async fn run_leader(&mut self) -> Role {
        tracing::info!("becoming leader");
        self.registers.set_current_leader(Some(self.id.clone())).await;
        self.publish_status().await;

        let term = self.stable.current_term();
        let (inflight, mut commit_rx) = Inflight::<Resp<C>>::new(256);
        let inflight = Arc::new(inflight);

        let (core_tx, mut core_rx) = mpsc::unbounded_channel::<(PeerId, ReplicaEvent)>();
        let mut replicators: HashMap<PeerId, Replicator> = HashMap::new();
        for peer in self.peers.read().await.iter().cloned() {
            let r = self.spawn_replicator(peer.clone(), term, inflight.clone(), core_tx.clone());
            replicators.insert(peer, r);
        }

        let (membership_tx, mut membership_rx) = mpsc::unbounded_channel::<MembershipEvent>();
        *self.membership_tx.lock().unwrap() = Some(membership_tx);

        if let Err(next) = self.dispatch_entry(EntryKind::Noop, Bytes::new(), None, &inflight, &replicators).await {
            self.leader_teardown(&inflight, &replicators);
            return next;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let next_role = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break Role::Shutdown,
                maybe_rpc = self.rpc_stream.next() => {
                    match maybe_rpc {
                        Some(rpc) => {
                            if let Some(next) = self.handle_inbound(rpc).await {
                                break next;
                            }
                        }
                        None => break Role::Shutdown,
                    }
                }
                event = core_rx.recv() => {
                    if let Some((_peer, ReplicaEvent::HigherTerm { term: new_term })) = event {
                        if let Err(err) = self.stable.set_current_term(new_term).await {
                            tracing::error!(%err, "fatal: could not persist observed term");
                            break Role::Shutdown;
                        }
                        break Role::Follower;
                    }
                }
                committed = commit_rx.recv() => {
                    if let Some(c) = committed {
                        self.on_committed(c).await;
                    }
                }
                mevent = membership_rx.recv() => {
                    match mevent {
                        Some(MembershipEvent::Added(peer)) => {
                            if !replicators.contains_key(&peer) {
                                let r = self.spawn_replicator(peer.clone(), term, inflight.clone(), core_tx.clone());
                                r.trigger();
                                replicators.insert(peer, r);
                            }
                        }
                        Some(MembershipEvent::Removed { peer, index }) => {
                            if let Some(r) = replicators.remove(&peer) {
                                r.stop_after(index);
                            }
                        }
                        None => {}
                    }
                }
                maybe_msg = self.rx_api.recv() => {
                    match maybe_msg {
                        Some(msg) => {
                            if let Some(next) =
                                self.handle_leader_msg(msg, &inflight, &replicators).await
                            {
                                break next;
                            }
                        }
                        None => break Role::Shutdown,
                    }
                }
                sig = self.apply_signal_rx.recv() => {
                    match sig {
                        Some(ApplySignal::Shutdown) => break Role::Shutdown,
                        Some(ApplySignal::StepDown) => break Role::Follower,
                        None => {}
                    }
                }
            }
        };

        self.leader_teardown(&inflight, &replicators);
        next_role
    }

    /// Process one inbound RPC, returning `Some(next role)` if this forces a
    /// role transition (new term observed, or role was not Follower and must
    /// step down to process it).
    async fn handle_inbound(&mut self, rpc: InboundRpc) -> Option<Role> {
        match rpc {
            InboundRpc::AppendEntries { req, tx } => {
                let (resp, transition) = self.on_append_entries(req).await;
                let _ = tx.send(Ok(resp));
                transition
            }
            InboundRpc::RequestVote { req, tx } => {
                let (resp, transition) = self.on_request_vote(req).await;
                let _ = tx.send(Ok(resp));
                transition
            }
            InboundRpc::InstallSnapshot { req, reader, tx } => {
                let (resp, transition) = self.on_install_snapshot(req, reader).await;
                let _ = tx.send(Ok(resp));
                transition
            }
        }
    }

    async fn reject_non_leader(&mut self, msg: RaftMsg<C>) {
        match msg {
            RaftMsg::Apply { tx, .. } => {
                let _ = tx.send(Err(RaftError::NotLeader));
            }
            RaftMsg::AddPeer { tx, .. } | RaftMsg::RemovePeer { tx, .. } => {
                let _ = tx.send(Err(ChangeMembershipError::Raft(RaftError::NotLeader)));
            }
            RaftMsg::Snapshot { tx } => {
                let _ = self.snapshot_req_tx.send(tx).await;
            }
        }
    }

    async fn handle_leader_msg(
        &mut self,
        msg: RaftMsg<C>,
        inflight: &Arc<Inflight<Resp<C>>>,
        replicators: &HashMap<PeerId, Replicator>,
    ) -> Option<Role> {
        match msg {
            RaftMsg::Apply { data, tx } => {
                self.dispatch_entry(EntryKind::Command, data, Some(tx), inflight, replicators).await.err()
            }
            RaftMsg::AddPeer { peer, tx } => self.handle_add_peer(peer, tx, inflight, replicators).await,
            RaftMsg::RemovePeer { peer, tx } => self.handle_remove_peer(peer, tx, inflight, replicators).await,
            RaftMsg::Snapshot { tx } => {
                let _ = self.snapshot_req_tx.send(tx).await;
                None
            }
        }
    }

    async fn handle_add_peer(
        &mut self,
        peer: PeerId,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
        inflight: &Arc<Inflight<Resp<C>>>,
        replicators: &HashMap<PeerId, Replicator>,
    ) -> Option<Role> {
        let current = self.peers.read().await.clone();
        if peer == self.id || current.contains(&peer) {
            let _ = tx.send(Err(ChangeMembershipError::KnownPeer));
            return None;
        }
        let mut full_new = current;
        full_new.push(self.id.clone());
        full_new.push(peer);
        let data = crate::log::encode_peer_set(&full_new);

        let (internal_tx, internal_rx) = oneshot::channel();
        match self.dispatch_entry(EntryKind::AddPeer, data, Some(internal_tx), inflight, replicators).await {
            Ok(()) => {
                forward_membership_result(internal_rx, tx);
                None
            }
            Err(next) => {
                let _ = tx.send(Err(ChangeMembershipError::Raft(RaftError::LeadershipLost)));
                Some(next)
            }
        }
    }

    async fn handle_remove_peer(
        &mut self,
        peer: PeerId,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
        inflight: &Arc<Inflight<Resp<C>>>,
        replicators: &HashMap<PeerId, Replicator>,
    ) -> Option<Role> {
        let current = self.peers.read().await.clone();
        if peer != self.id && !current.contains(&peer) {
            let _ = tx.send(Err(ChangeMembershipError::UnknownPeer));
            return None;
        }
        let mut full_new: Vec<PeerId> = current.iter().filter(|p| **p != peer).cloned().collect();
        if peer != self.id {
            full_new.push(self.id.clone());
        }
        let data = crate::log::encode_peer_set(&full_new);
        // Cluster size for this entry's quorum is fixed at proposal time
        // (§4.3): `current` is the peer set this RemovePeer was evaluated
        // against, not whatever the peer set drifts to while it's inflight.
        let cluster_n = current.len() + 1;
        let policy: Box<dyn QuorumPolicy> = Box::new(ExcludeNodeQuorum::new(cluster_n, peer));

        let (internal_tx, internal_rx) = oneshot::channel();
        match self
            .dispatch_entry_with_policy(EntryKind::RemovePeer, data, Some(internal_tx), inflight, policy, replicators)
            .await
        {
            Ok(()) => {
                forward_membership_result(internal_rx, tx);
                None
            }
            Err(next) => {
                let _ = tx.send(Err(ChangeMembershipError::Raft(RaftError::LeadershipLost)));
                Some(next)
            }
        }
    }

    /// Build a [`MajorityQuorum`] sized to the cluster *as of this proposal*
    /// (§4.3: "N is the cluster size ... at the moment of proposal") and
    /// dispatch. Must read `self.peers` fresh for every call rather than
    /// reuse a count cached at leader entry — the peer set can grow or
    /// shrink mid-leadership as `AddPeer`/`RemovePeer` entries commit.
    async fn dispatch_entry(
        &mut self,
        kind: EntryKind,
        data: Bytes,
        responder: Option<ClientResponder<Resp<C>>>,
        inflight: &Arc<Inflight<Resp<C>>>,
        replicators: &HashMap<PeerId, Replicator>,
    ) -> Result<(), Role> {
        let cluster_n = self.peers.read().await.len() + 1;
        let policy: Box<dyn QuorumPolicy> = Box::new(MajorityQuorum::new(cluster_n));
        self.dispatch_entry_with_policy(kind, data, responder, inflight, policy, replicators).await
    }

    /// Assign an index, durably store an entry, register it with the
    /// inflight tracker, count the leader's own vote, and wake every
    /// replicator (§4.5 "Dispatching a log"). On a durable-write failure the
    /// leader cannot safely continue and steps down to Follower.
    async fn dispatch_entry_with_policy(
        &mut self,
        kind: EntryKind,
        data: Bytes,
        responder: Option<ClientResponder<Resp<C>>>,
        inflight: &Arc<Inflight<Resp<C>>>,
        policy: Box<dyn QuorumPolicy>,
        replicators: &HashMap<PeerId, Replicator>,
    ) -> Result<(), Role> {
        let term = self.stable.current_term();
        let index = self.registers.last_entry().index + 1;
        let entry = LogEntry { index, term, kind, data };

        if let Err(err) = self.log_store.store_log(&entry).await {
            tracing::error!(%err, index, "leader: could not durably store entry, stepping down");
            if let Some(tx) = responder {
                let _ = tx.send(Err(RaftError::LeadershipLost));
            }
            return Err(Role::Follower);
        }
        self.registers.set_last_entry(entry.log_id());
        inflight.start(index, policy, responder);
        inflight.commit(index, self.id.clone()).await;
        self.publish_status().await;
        for r in replicators.values() {
            r.trigger();
        }
        Ok(())
    }

    async fn on_committed(&mut self, c: Committed<Resp<C>>) {
        self.registers.set_commit_index(c.index.max(self.registers.commit_index()));
        self.publish_status().await;
        let originating = Some(OriginatingResponder { index: c.index, responder: c.responder });
        if self.apply_tx.send(ApplyJob::Logs { upto: c.index, originating }).await.is_err() {
            tracing::error!("apply pipeline gone while leader");
        }
    }

    fn spawn_replicator(
        &self,
        peer: PeerId,
        term: u64,
        inflight: Arc<Inflight<Resp<C>>>,
        core_tx: mpsc::UnboundedSender<(PeerId, ReplicaEvent)>,
    ) -> Replicator {
        crate::replication::spawn(
            self.id.clone(),
            peer,
            term,
            self.config.clone(),
            self.registers.last_entry(),
            self.log_store.clone(),
            self.snapshots.clone(),
            self.transport.clone(),
            self.registers.clone(),
            inflight,
            core_tx,
        )
    }

    fn leader_teardown(&self, inflight: &Arc<Inflight<Resp<C>>>, replicators: &HashMap<PeerId, Replicator>) {
        for r in replicators.values() {
            r.stop_now();
        }
        inflight.cancel(|| RaftError::LeadershipLost);
        *self.membership_tx.lock().unwrap() = None;
    }

    async fn compact_logs(&self, snap_index: u64) -> anyhow::Result<()> {
        compact_logs(&*self.log_store, &self.registers, self.config.trailing_logs, snap_index).await
    }

    async fn publish_status(&self) {
        let current_leader = self.registers.current_leader().await;
        let status = NodeStatus {
            id: self.id.clone(),
            role: self.registers.role(),
            current_term: self.stable.current_term(),
            current_leader,
            last_log_index: self.registers.last_entry().index,
            commit_index: self.registers.commit_index(),
            last_applied: self.registers.last_applied(),
        };
        let _ = self.status_tx.send(status);
    }
}

/// Translate the inflight-tracker's outcome into the richer error type
/// `AddPeer`/`RemovePeer` callers see, mirroring how the teacher crate splits
/// a client-facing response channel from the role loop's internal one.
fn forward_membership_result<R: Send + 'static>(
    internal_rx: oneshot::Receiver<RaftResult<ClientOutcome<R>>>,
    tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
) {
    tokio::spawn(async move {
        let result = match internal_rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ChangeMembershipError::Raft(e)),
            Err(_) => Err(ChangeMembershipError::Raft(RaftError::ShuttingDown)),
        };
        let _ = tx.send(result);
    });
}
