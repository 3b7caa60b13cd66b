//! Inbound RPC handlers (§4.6). These are plain methods on [`RaftCore`]
//! called from whichever role sub-loop is currently running — the
//! dispatching rules (reject-stale-term, adopt-higher-term, step-down when
//! not Follower) are identical regardless of the caller's current role.

use tokio::io::AsyncRead;

use super::RaftCore;
use crate::log::PeerId;
use crate::network::AppendEntriesRequest;
use crate::network::AppendEntriesResponse;
use crate::network::InstallSnapshotRequest;
use crate::network::InstallSnapshotResponse;
use crate::network::RequestVoteRequest;
use crate::network::RequestVoteResponse;
use crate::status::Role;
use crate::storage::LogStore;
use crate::storage::SnapshotStore;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// The term/log coordinate a peer's durable state is at, at `index`,
    /// consulting the log tail and last snapshot before falling back to a
    /// log-store read (§4.6).
    async fn term_at(&self, index: u64) -> anyhow::Result<Option<u64>> {
        let last = self.registers.last_entry();
        if index == last.index {
            return Ok(Some(last.term));
        }
        let snap = self.registers.last_snapshot();
        if index == snap.index {
            return Ok(Some(snap.term));
        }
        Ok(self.log_store.get_log(index).await?.map(|e| e.term))
    }

    pub(crate) async fn on_append_entries(
        &mut self,
        req: AppendEntriesRequest,
    ) -> (AppendEntriesResponse, Option<Role>) {
        let current_term = self.stable.current_term();
        if req.term < current_term {
            return (
                AppendEntriesResponse { term: current_term, last_log: self.registers.last_entry().index, success: false },
                None,
            );
        }

        let mut transition = None;
        if req.term > current_term {
            if let Err(err) = self.stable.set_current_term(req.term).await {
                tracing::error!(%err, "fatal: could not persist observed term");
                return (
                    AppendEntriesResponse { term: current_term, last_log: self.registers.last_entry().index, success: false },
                    Some(Role::Shutdown),
                );
            }
            transition = Some(Role::Follower);
        } else if self.registers.role() != Role::Follower {
            transition = Some(Role::Follower);
        }
        let term = self.stable.current_term();
        self.registers.set_current_leader(Some(req.leader.clone())).await;

        if req.prev_log_index > 0 {
            match self.term_at(req.prev_log_index).await {
                Ok(Some(t)) if t == req.prev_log_term => {}
                Ok(_) => {
                    return (
                        AppendEntriesResponse { term, last_log: self.registers.last_entry().index, success: false },
                        transition,
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "append_entries: could not resolve prev log term");
                    return (
                        AppendEntriesResponse { term, last_log: self.registers.last_entry().index, success: false },
                        transition,
                    );
                }
            }
        }

        let mut last_entry = self.registers.last_entry();
        for entry in &req.entries {
            if entry.index <= last_entry.index {
                if let Err(err) = self.log_store.delete_range(entry.index..=last_entry.index).await {
                    tracing::warn!(%err, "append_entries: could not truncate conflicting tail");
                    return (
                        AppendEntriesResponse { term, last_log: last_entry.index, success: false },
                        transition,
                    );
                }
            }
            if let Err(err) = self.log_store.store_log(entry).await {
                tracing::warn!(%err, "append_entries: could not store entry");
                return (
                    AppendEntriesResponse { term, last_log: last_entry.index, success: false },
                    transition,
                );
            }
            last_entry = entry.log_id();
            self.registers.set_last_entry(last_entry);
        }

        if req.leader_commit_index > self.registers.commit_index() {
            let upto = req.leader_commit_index.min(last_entry.index);
            self.registers.set_commit_index(upto);
            let _ = self.apply_tx.send(super::ApplyJob::Logs { upto, originating: None }).await;
        }
        self.publish_status().await;

        (AppendEntriesResponse { term, last_log: last_entry.index, success: true }, transition)
    }

    pub(crate) async fn on_request_vote(&mut self, req: RequestVoteRequest) -> (RequestVoteResponse, Option<Role>) {
        let current_term = self.stable.current_term();
        let peers_snapshot = self.peers.read().await.clone();

        if req.term < current_term {
            return (RequestVoteResponse { term: current_term, peers: peers_snapshot, granted: false }, None);
        }

        let mut transition = None;
        if req.term > current_term {
            if let Err(err) = self.stable.set_current_term(req.term).await {
                tracing::error!(%err, "fatal: could not persist observed term");
                return (
                    RequestVoteResponse { term: current_term, peers: peers_snapshot, granted: false },
                    Some(Role::Shutdown),
                );
            }
            transition = Some(Role::Follower);
        }
        let term = self.stable.current_term();

        let last_vote = match self.stable.last_vote().await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(%err, "fatal: could not read persisted vote");
                return (RequestVoteResponse { term, peers: peers_snapshot, granted: false }, Some(Role::Shutdown));
            }
        };

        if let Some((vote_term, candidate)) = &last_vote {
            if *vote_term == req.term {
                let granted = *candidate == req.candidate;
                return (RequestVoteResponse { term, peers: peers_snapshot, granted }, transition);
            }
        }

        let last_entry = self.registers.last_entry();
        let candidate_up_to_date = req.last_log_term > last_entry.term
            || (req.last_log_term == last_entry.term && req.last_log_index >= last_entry.index);
        if !candidate_up_to_date {
            return (RequestVoteResponse { term, peers: peers_snapshot, granted: false }, transition);
        }

        if let Err(err) = self.stable.persist_vote(req.term, &req.candidate).await {
            tracing::error!(%err, "fatal: could not persist vote");
            return (RequestVoteResponse { term, peers: peers_snapshot, granted: false }, Some(Role::Shutdown));
        }

        (RequestVoteResponse { term, peers: peers_snapshot, granted: true }, transition)
    }

    pub(crate) async fn on_install_snapshot(
        &mut self,
        req: InstallSnapshotRequest,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> (InstallSnapshotResponse, Option<Role>) {
        let current_term = self.stable.current_term();
        if req.term < current_term {
            return (InstallSnapshotResponse { term: current_term, success: false }, None);
        }

        let mut transition = None;
        if req.term > current_term {
            if let Err(err) = self.stable.set_current_term(req.term).await {
                tracing::error!(%err, "fatal: could not persist observed term");
                return (InstallSnapshotResponse { term: current_term, success: false }, Some(Role::Shutdown));
            }
            transition = Some(Role::Follower);
        } else if self.registers.role() != Role::Follower {
            transition = Some(Role::Follower);
        }
        let term = self.stable.current_term();
        self.registers.set_current_leader(Some(req.leader.clone())).await;

        let sink = match self.snapshots.create(req.last_log_index, req.last_log_term, req.peers.clone()).await {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(%err, "install_snapshot: could not create sink");
                return (InstallSnapshotResponse { term, success: false }, transition);
            }
        };
        let mut sink = Box::new(sink);

        let copied = match tokio::io::copy(&mut reader, &mut *sink).await {
            Ok(n) => n,
            Err(err) => {
                tracing::warn!(%err, "install_snapshot: stream copy failed");
                let _ = sink.cancel().await;
                return (InstallSnapshotResponse { term, success: false }, transition);
            }
        };
        if copied != req.size {
            tracing::warn!(copied, expected = req.size, "install_snapshot: short read, aborting");
            let _ = sink.cancel().await;
            return (InstallSnapshotResponse { term, success: false }, transition);
        }

        let snapshot_id = sink.id().to_string();
        if let Err(err) = sink.close().await {
            tracing::warn!(%err, "install_snapshot: could not finalize sink");
            return (InstallSnapshotResponse { term, success: false }, transition);
        }

        let (meta, source) = match self.snapshots.open(&snapshot_id).await {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(%err, "fatal: just-closed snapshot could not be reopened");
                return (InstallSnapshotResponse { term, success: false }, Some(Role::Shutdown));
            }
        };

        let (restore_tx, restore_rx) = tokio::sync::oneshot::channel();
        let boxed_source: Box<dyn AsyncRead + Send + Unpin> = Box::new(source);
        if self.fsm_tx.send(super::apply::FsmJob::Restore { reader: boxed_source, tx: restore_tx }).await.is_err() {
            return (InstallSnapshotResponse { term, success: false }, Some(Role::Shutdown));
        }
        match restore_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(%err, "install_snapshot: FSM restore failed");
                return (InstallSnapshotResponse { term, success: false }, transition);
            }
            Err(_) => return (InstallSnapshotResponse { term, success: false }, Some(Role::Shutdown)),
        }

        self.registers.set_last_applied(meta.index);
        self.registers.set_last_snapshot(meta.log_id());
        if meta.index > self.registers.last_entry().index {
            self.registers.set_last_entry(meta.log_id());
        }
        if self.registers.commit_index() < meta.index {
            self.registers.set_commit_index(meta.index);
        }

        let restored_peers: Vec<PeerId> = meta.peers.iter().cloned().filter(|p| p != &self.id).collect();
        *self.peers.write().await = restored_peers.clone();
        if let Err(err) = self.peer_store.set_peers(restored_peers).await {
            tracing::warn!(%err, "install_snapshot: could not persist peer set");
        }

        if let Err(err) = self.compact_logs(meta.index).await {
            tracing::warn!(%err, "install_snapshot: log compaction failed (non-fatal)");
        }

        self.publish_status().await;
        (InstallSnapshotResponse { term, success: true }, transition)
    }
}
