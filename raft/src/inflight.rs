//! The inflight tracker and quorum policies (§4.3).
//!
//! The tracker owns every leader-proposed log entry awaiting commit. Each
//! entry is registered with a [`QuorumPolicy`] that decides, as durable
//! appends are reported in, whether that entry has reached quorum. Once an
//! entry commits it is emitted on the tracker's commit channel in ascending
//! index order and removed — callers (the leader loop) never see an entry
//! commit out of order, even when several entries cross quorum in the same
//! `commit` call.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::error::RaftResult;
use crate::log::PeerId;

/// A per-entry rule mapping a set of durable-appenders to commit/undecided
/// (§3 GLOSSARY).
pub trait QuorumPolicy: Send + Sync + 'static {
    /// Whether `voter`'s durable append counts towards this entry's quorum.
    fn counts(&self, voter: &PeerId) -> bool;

    /// The number of counted voters required to commit.
    fn needed(&self) -> usize;
}

/// Committed once `floor(n/2) + 1` distinct voters have voted, where `n` is
/// the cluster size (peers + self) at the moment of proposal.
pub struct MajorityQuorum {
    n: usize,
}

impl MajorityQuorum {
    pub fn new(n: usize) -> Self {
        Self { n }
    }
}

impl QuorumPolicy for MajorityQuorum {
    fn counts(&self, _voter: &PeerId) -> bool {
        true
    }

    fn needed(&self) -> usize {
        self.n / 2 + 1
    }
}

/// Identical to [`MajorityQuorum`] except the named node's vote never
/// counts — used for `RemovePeer` so the leader does not rely on the
/// departing node to reach quorum.
pub struct ExcludeNodeQuorum {
    n: usize,
    excluded: PeerId,
}

impl ExcludeNodeQuorum {
    pub fn new(n: usize, excluded: PeerId) -> Self {
        Self { n, excluded }
    }
}

impl QuorumPolicy for ExcludeNodeQuorum {
    fn counts(&self, voter: &PeerId) -> bool {
        voter != &self.excluded
    }

    fn needed(&self) -> usize {
        self.n / 2 + 1
    }
}

/// What a client-facing future resolves with once its entry is processed by
/// the apply pipeline (§4.7, §4.9 "Futures").
pub enum ClientOutcome<R> {
    /// The entry was a `Command`; carries the FSM's response.
    Applied(R),
    /// The entry was `Noop`/`AddPeer`/`RemovePeer`; no FSM response exists.
    Done,
}

/// The response channel attached to a leader-proposed entry, answered
/// exactly once: by the applier for `Command` entries, by the apply
/// pipeline directly for everything else, or by [`Inflight::cancel`] on
/// leader step-down.
pub type ClientResponder<R> = oneshot::Sender<RaftResult<ClientOutcome<R>>>;

struct PendingEntry<R> {
    policy: Box<dyn QuorumPolicy>,
    voters: HashSet<PeerId>,
    responder: Option<ClientResponder<R>>,
}

/// An entry which has just reached quorum, ready for the apply pipeline.
pub struct Committed<R> {
    pub index: u64,
    pub responder: Option<ClientResponder<R>>,
}

/// Tracks outstanding leader-proposed entries and emits a stream of commit
/// events. See module docs.
pub struct Inflight<R> {
    pending: Mutex<BTreeMap<u64, PendingEntry<R>>>,
    commit_tx: mpsc::Sender<Committed<R>>,
}

impl<R: Send + 'static> Inflight<R> {
    /// Construct a tracker and its paired commit-event receiver, consumed
    /// by the leader loop.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Committed<R>>) {
        let (commit_tx, commit_rx) = mpsc::channel(capacity);
        (
            Self {
                pending: Mutex::new(BTreeMap::new()),
                commit_tx,
            },
            commit_rx,
        )
    }

    /// Register a leader-proposed entry with its quorum policy.
    pub fn start(&self, index: u64, policy: Box<dyn QuorumPolicy>, responder: Option<ClientResponder<R>>) {
        self.pending.lock().unwrap().insert(
            index,
            PendingEntry {
                policy,
                voters: HashSet::new(),
                responder,
            },
        );
    }

    /// Record that `voter` has durably appended everything up to and
    /// including `index`. Every registered entry at or below `index` not yet
    /// committed gains `voter`'s vote (if its policy counts it); entries are
    /// then emitted on the commit channel only as a contiguous prefix
    /// starting at the lowest still-pending index — an entry whose quorum
    /// is satisfied cannot commit ahead of a lower, not-yet-satisfied entry
    /// (commitIndex must stay monotonic and gap-free, §5/§8 properties
    /// #5-#6). This matters once quorum policies diverge per entry: e.g. a
    /// `RemovePeer`'s `ExcludeNodeQuorum` may lag a later `Command`'s
    /// `MajorityQuorum` that the departing peer's vote does count towards.
    pub async fn commit(&self, index: u64, voter: PeerId) {
        let mut newly_committed = Vec::new();
        {
            let mut pending = self.pending.lock().unwrap();
            let ready: Vec<u64> = pending.range(..=index).map(|(k, _)| *k).collect();
            for idx in ready {
                let entry = pending.get_mut(&idx).expect("just matched by range");
                if entry.policy.counts(&voter) {
                    entry.voters.insert(voter.clone());
                }
            }
            loop {
                let lowest = match pending.keys().next().copied() {
                    Some(k) if k <= index => k,
                    _ => break,
                };
                let satisfied = {
                    let entry = pending.get(&lowest).expect("just looked up");
                    entry.voters.len() >= entry.policy.needed()
                };
                if !satisfied {
                    break;
                }
                let entry = pending.remove(&lowest).expect("just looked up");
                newly_committed.push(Committed {
                    index: lowest,
                    responder: entry.responder,
                });
            }
        }
        for committed in newly_committed {
            // commitCh is capacity-bounded; a full channel here means the
            // leader loop is behind, which is the correct place to exert
            // backpressure on replication.
            let _ = self.commit_tx.send(committed).await;
        }
    }

    /// Fail every outstanding future with an error built by `make_err`,
    /// called once per future so each gets its own `RaftError` value.
    pub fn cancel(&self, mut make_err: impl FnMut() -> RaftError) {
        let drained = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_, entry) in drained {
            if let Some(tx) = entry.responder {
                let _ = tx.send(Err(make_err()));
            }
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: &[u8]) -> PeerId {
        bytes::Bytes::copy_from_slice(b)
    }

    #[tokio::test]
    async fn majority_quorum_commits_at_floor_n2_plus_1() {
        let (tracker, mut rx) = Inflight::<()>::new(8);
        tracker.start(1, Box::new(MajorityQuorum::new(3)), None);

        tracker.commit(1, peer(b"self")).await;
        assert!(rx.try_recv().is_err(), "one vote of three must not commit");

        tracker.commit(1, peer(b"peer-a")).await;
        let committed = rx.try_recv().expect("two of three votes commits");
        assert_eq!(committed.index, 1);
        assert_eq!(tracker.pending_len(), 0);
    }

    #[tokio::test]
    async fn duplicate_voter_does_not_double_count() {
        let (tracker, mut rx) = Inflight::<()>::new(8);
        tracker.start(1, Box::new(MajorityQuorum::new(3)), None);

        tracker.commit(1, peer(b"self")).await;
        tracker.commit(1, peer(b"self")).await;
        tracker.commit(1, peer(b"self")).await;
        assert!(rx.try_recv().is_err(), "same voter repeated must not reach quorum alone");
    }

    #[tokio::test]
    async fn exclude_node_quorum_ignores_named_voter() {
        let (tracker, mut rx) = Inflight::<()>::new(8);
        let departing = peer(b"departing");
        tracker.start(1, Box::new(ExcludeNodeQuorum::new(3, departing.clone())), None);

        tracker.commit(1, departing).await;
        assert!(rx.try_recv().is_err(), "excluded voter's ack must not count");

        tracker.commit(1, peer(b"self")).await;
        tracker.commit(1, peer(b"peer-a")).await;
        assert!(rx.try_recv().is_ok(), "two non-excluded voters reach majority of 3");
    }

    #[tokio::test]
    async fn commits_emit_in_ascending_index_order() {
        let (tracker, mut rx) = Inflight::<()>::new(8);
        tracker.start(1, Box::new(MajorityQuorum::new(1)), None);
        tracker.start(2, Box::new(MajorityQuorum::new(1)), None);
        tracker.start(3, Box::new(MajorityQuorum::new(1)), None);

        // A single voter ack covering index 3 satisfies all three at once.
        tracker.commit(3, peer(b"self")).await;

        assert_eq!(rx.try_recv().unwrap().index, 1);
        assert_eq!(rx.try_recv().unwrap().index, 2);
        assert_eq!(rx.try_recv().unwrap().index, 3);
    }

    #[tokio::test]
    async fn cancel_fails_every_outstanding_future() {
        let (tracker, _rx) = Inflight::<()>::new(8);
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        tracker.start(1, Box::new(MajorityQuorum::new(3)), Some(tx1));
        tracker.start(2, Box::new(MajorityQuorum::new(3)), Some(tx2));

        tracker.cancel(|| RaftError::LeadershipLost);

        assert!(matches!(rx1.await.unwrap(), Err(RaftError::LeadershipLost)));
        assert!(matches!(rx2.await.unwrap(), Err(RaftError::LeadershipLost)));
        assert_eq!(tracker.pending_len(), 0);
    }
}
