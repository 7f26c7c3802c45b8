//! Transaction request tracking.
//!
//! The [`TxRequestTracker`] keeps one [`Announcement`] per (hash, peer) pair
//! and moves each announcement through a small state machine:
//!
//! * `CandidateDelayed`: announced, but its request time is in the future.
//! * `CandidateReady`: past its request time, but another announcement for
//!   the same hash is currently a better choice.
//! * `CandidateBest`: the single announcement that would be requested next
//!   for its hash. Only exists while no request for the hash is in flight.
//! * `Requested`: a request was sent to the announcing peer and has not yet
//!   been answered or expired.
//! * `Completed`: the outcome for this peer is known (response, NOTFOUND,
//!   expiry). Kept so a re-announcement from the same peer stays a no-op,
//!   until nothing for the hash remains worth trying.
//!
//! For every hash at most one announcement is `CandidateBest` or `Requested`,
//! never both. Selection within a hash prefers the preference class and then
//! the salted [`PriorityComputer`] order; ties across hashes are returned to
//! the caller in announcement order.
//!
//! Time only moves when the caller passes `now` into [`get_requestable`]:
//! the sweep at the start of that call promotes candidates past their
//! request time and expires requests past their expiry. Mutating calls never
//! consult a clock.
//!
//! [`get_requestable`]: TxRequestTracker::get_requestable

use std::collections::{BTreeSet, HashMap};

use tracing::trace;

use txrelay_types::{GenTxid, PeerId, TxHash};

use crate::priority::{Priority, PriorityComputer};
use crate::time::LocalTime;

const HASH_MIN: TxHash = TxHash::from_bytes([0x00; 32]);
const HASH_MAX: TxHash = TxHash::from_bytes([0xff; 32]);

/// State of a single announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Request time not yet reached.
    CandidateDelayed,
    /// Eligible, but not the selected announcement for its hash.
    CandidateReady,
    /// The selected announcement for its hash.
    CandidateBest,
    /// A request is in flight to the announcing peer.
    Requested,
    /// Outcome known; kept for bookkeeping.
    Completed,
}

impl State {
    /// Position of the state within a hash's slice of the per-hash index.
    /// Ready candidates sort between the delayed ones and the selected one,
    /// so the best ready candidate is the first entry of its range, and a
    /// hash is exhausted when its first entry is completed.
    fn rank(&self) -> u8 {
        match self {
            State::CandidateDelayed => 0,
            State::CandidateReady => 1,
            State::CandidateBest => 2,
            State::Requested => 3,
            State::Completed => 4,
        }
    }

    /// Whether this announcement is the one in play for its hash.
    fn is_selected(&self) -> bool {
        matches!(self, State::CandidateBest | State::Requested)
    }

    /// Whether this announcement is waiting on a timer (request time or
    /// expiry) and therefore lives in the time index.
    fn is_waiting(&self) -> bool {
        matches!(self, State::CandidateDelayed | State::Requested)
    }
}

/// A single peer's claim to have a transaction.
#[derive(Debug, Clone, Copy)]
struct Announcement {
    /// The announced transaction id, including its hash interpretation.
    gtxid: GenTxid,
    /// The announcing peer.
    peer: PeerId,
    /// Whether the announcement came from a preferred connection.
    preferred: bool,
    /// Request time while a candidate, expiry while requested.
    time: LocalTime,
    /// Insertion counter value, for first-announced-first-served ordering.
    sequence: u64,
    /// Selection order within the hash; see [`PriorityComputer`].
    priority: Priority,
    state: State,
}

/// Per-peer announcement counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PeerInfo {
    /// Announcements for this peer in any state.
    total: usize,
    /// Announcements in the `Requested` state.
    requested: usize,
    /// Announcements in the `Completed` state.
    completed: usize,
}

/// Tracks transaction announcements and schedules requests.
///
/// The tracker performs no I/O, owns no clock and spawns nothing; the caller
/// serializes all calls and passes the current time into
/// [`get_requestable`](TxRequestTracker::get_requestable). Misuse (responses
/// for unknown announcements, requests for entries that are not selected)
/// is silently ignored.
#[derive(Debug)]
pub struct TxRequestTracker {
    computer: PriorityComputer,
    /// Next insertion counter value.
    sequence: u64,
    /// All announcements, keyed by hash and announcing peer.
    announcements: HashMap<(TxHash, PeerId), Announcement>,
    /// (peer, selected, hash). The flag makes one peer's selected
    /// announcements a contiguous range, so a query touches no more entries
    /// than it returns.
    by_peer: BTreeSet<(PeerId, bool, TxHash)>,
    /// (hash, state rank, priority, peer). One hash's announcements form a
    /// contiguous range ordered by state, then selection order.
    by_txhash: BTreeSet<(TxHash, u8, Priority, PeerId)>,
    /// (time, hash, peer). Holds exactly the announcements waiting on a
    /// timer: delayed candidates keyed by request time, in-flight requests
    /// keyed by expiry.
    by_time: BTreeSet<(LocalTime, TxHash, PeerId)>,
    peerinfo: HashMap<PeerId, PeerInfo>,
}

impl TxRequestTracker {
    /// Create a new tracker, salting its priority order from `rng`.
    pub fn new(mut rng: fastrand::Rng) -> Self {
        Self {
            computer: PriorityComputer::new(&mut rng),
            sequence: 0,
            announcements: HashMap::new(),
            by_peer: BTreeSet::new(),
            by_txhash: BTreeSet::new(),
            by_time: BTreeSet::new(),
            peerinfo: HashMap::new(),
        }
    }

    /// The priority this tracker assigns to an announcement of `txhash` by
    /// `peer`. Exposed so callers can predict the selection order.
    pub fn compute_priority(&self, txhash: &TxHash, peer: PeerId, preferred: bool) -> Priority {
        self.computer.compute(txhash, peer, preferred)
    }

    /// Number of announcements tracked in total.
    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    /// Whether the tracker is empty.
    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }

    /// Number of announcements for the given peer, in any state.
    pub fn count(&self, peer: PeerId) -> usize {
        self.peerinfo.get(&peer).map_or(0, |info| info.total)
    }

    /// Number of announcements for the given peer still eligible for a
    /// request (delayed, ready or selected).
    pub fn count_candidates(&self, peer: PeerId) -> usize {
        self.peerinfo
            .get(&peer)
            .map_or(0, |info| info.total - info.requested - info.completed)
    }

    /// Number of requests in flight to the given peer.
    pub fn count_in_flight(&self, peer: PeerId) -> usize {
        self.peerinfo.get(&peer).map_or(0, |info| info.requested)
    }

    /// Register an announcement of `gtxid` by `peer`, requestable no earlier
    /// than `reqtime`. A repeated announcement for the same (hash, peer)
    /// pair is ignored, whatever state the existing one is in.
    pub fn received_inv(
        &mut self,
        peer: PeerId,
        gtxid: GenTxid,
        preferred: bool,
        reqtime: LocalTime,
    ) {
        let key = (gtxid.txhash, peer);
        if self.announcements.contains_key(&key) {
            return;
        }
        let sequence = self.sequence;
        self.sequence += 1;

        let ann = Announcement {
            gtxid,
            peer,
            preferred,
            time: reqtime,
            sequence,
            priority: self.computer.compute(&gtxid.txhash, peer, preferred),
            state: State::CandidateDelayed,
        };
        self.index_insert(&ann);
        self.announcements.insert(key, ann);
        self.peerinfo.entry(peer).or_default().total += 1;
    }

    /// Record that a request for `txhash` was sent to `peer`, expiring at
    /// `expiry`. A no-op unless the (hash, peer) announcement is currently
    /// the selected candidate; the caller is allowed to be out of date.
    pub fn requested_tx(&mut self, peer: PeerId, txhash: TxHash, expiry: LocalTime) {
        match self.announcements.get(&(txhash, peer)) {
            Some(ann) if ann.state == State::CandidateBest => {
                self.transition((txhash, peer), State::Requested, Some(expiry));
            }
            _ => {}
        }
    }

    /// Record a response from `peer` for `txhash`. Positive responses and
    /// NOTFOUND are treated alike: this peer is done with the hash, and a
    /// sibling announcement (if any) becomes eligible.
    pub fn received_response(&mut self, peer: PeerId, txhash: TxHash) {
        self.make_completed(txhash, peer);
    }

    /// Remove every announcement made by `peer`.
    pub fn disconnected_peer(&mut self, peer: PeerId) {
        let hashes: Vec<TxHash> = self
            .by_peer
            .range((peer, false, HASH_MIN)..=(peer, true, HASH_MAX))
            .map(|&(_, _, txhash)| txhash)
            .collect();

        for txhash in hashes {
            let Some(ann) = self.announcements.get(&(txhash, peer)).copied() else {
                continue;
            };
            let was_selected = ann.state.is_selected();
            self.erase(txhash, peer);

            if self.all_completed(txhash) {
                self.erase_txhash(txhash);
            } else if was_selected {
                self.reselect(txhash);
            }
        }
    }

    /// Remove every announcement for `txhash`, across all peers. Called when
    /// the transaction was obtained another way or is no longer wanted.
    pub fn forget_txhash(&mut self, txhash: TxHash) {
        self.erase_txhash(txhash);
    }

    /// Advance time to `now` and return the announcements by `peer` that
    /// should be requested, in announcement order.
    ///
    /// Beyond the time-driven transitions this is a pure query; the caller
    /// is expected to follow up with
    /// [`requested_tx`](TxRequestTracker::requested_tx) for the entries it
    /// acts on. `now` values must not decrease across calls.
    pub fn get_requestable(&mut self, peer: PeerId, now: LocalTime) -> Vec<GenTxid> {
        self.set_time_point(now);

        let mut selected: Vec<(u64, GenTxid)> = self
            .by_peer
            .range((peer, true, HASH_MIN)..=(peer, true, HASH_MAX))
            .filter_map(|&(_, _, txhash)| self.announcements.get(&(txhash, peer)))
            .map(|ann| (ann.sequence, ann.gtxid))
            .collect();
        selected.sort_unstable_by_key(|&(sequence, _)| sequence);
        selected.into_iter().map(|(_, gtxid)| gtxid).collect()
    }

    // Time.

    /// Apply every transition due at or before `now`: delayed candidates
    /// past their request time become ready (and possibly selected), and
    /// in-flight requests past their expiry are given up on.
    fn set_time_point(&mut self, now: LocalTime) {
        while let Some(&(time, txhash, peer)) = self.by_time.first() {
            if time > now {
                break;
            }
            let Some(ann) = self.announcements.get(&(txhash, peer)).copied() else {
                break;
            };
            match ann.state {
                State::CandidateDelayed => self.promote_candidate_ready(txhash, peer, ann.priority),
                State::Requested => {
                    trace!(
                        target: "txrequest",
                        "Request for {} to peer {} expired", ann.gtxid, peer,
                    );
                    self.make_completed(txhash, peer);
                }
                // Only waiting announcements are kept in the time index.
                _ => break,
            }
        }
    }

    // State transitions.

    /// Turn a delayed candidate into a ready one, and select it for its hash
    /// if nothing is in flight and it beats the current selection.
    fn promote_candidate_ready(&mut self, txhash: TxHash, peer: PeerId, priority: Priority) {
        self.transition((txhash, peer), State::CandidateReady, None);

        match self.selected(txhash) {
            None => {
                self.transition((txhash, peer), State::CandidateBest, None);
            }
            Some((rank, best_priority, best_peer)) if rank == State::CandidateBest.rank() => {
                if priority < best_priority {
                    self.transition((txhash, best_peer), State::CandidateReady, None);
                    self.transition((txhash, peer), State::CandidateBest, None);
                }
            }
            // A request is in flight; the new candidate stays ready.
            Some(_) => {}
        }
    }

    /// Mark the (hash, peer) announcement completed. Promotes a sibling if
    /// the completed one was selected, and drops the hash entirely once no
    /// announcement for it could still deliver.
    fn make_completed(&mut self, txhash: TxHash, peer: PeerId) {
        let Some(ann) = self.announcements.get(&(txhash, peer)).copied() else {
            return;
        };
        if ann.state == State::Completed {
            return;
        }
        if self.is_only_non_completed(txhash, peer) {
            // The last announcement that could still deliver this hash; no
            // point remembering any of them.
            self.erase_txhash(txhash);
            return;
        }
        let was_selected = ann.state.is_selected();
        self.transition((txhash, peer), State::Completed, None);
        if was_selected {
            self.reselect(txhash);
        }
    }

    /// Promote the best ready candidate for `txhash`, if any. Must only be
    /// called while no announcement for the hash is selected.
    fn reselect(&mut self, txhash: TxHash) {
        debug_assert!(self.selected(txhash).is_none());

        let ready = self
            .by_txhash
            .range(
                (txhash, State::CandidateReady.rank(), 0, 0)
                    ..(txhash, State::CandidateBest.rank(), 0, 0),
            )
            .next()
            .copied();
        if let Some((_, _, _, peer)) = ready {
            self.transition((txhash, peer), State::CandidateBest, None);
        }
    }

    /// Move an announcement to a new state (and, for requests, a new expiry),
    /// keeping the indexes and per-peer counts in step.
    fn transition(&mut self, key: (TxHash, PeerId), state: State, time: Option<LocalTime>) {
        let Some(mut ann) = self.announcements.get(&key).copied() else {
            return;
        };
        let previous = ann.state;
        self.index_remove(&ann);
        ann.state = state;
        if let Some(time) = time {
            ann.time = time;
        }
        self.index_insert(&ann);
        self.announcements.insert(key, ann);

        let info = self.peerinfo.entry(ann.peer).or_default();
        if previous == State::Requested {
            info.requested -= 1;
        }
        match state {
            State::Requested => info.requested += 1,
            State::Completed => info.completed += 1,
            _ => {}
        }
    }

    // Queries over the per-hash index.

    /// The announcement currently in play for `txhash`: the selected
    /// candidate or the in-flight request, if either exists.
    fn selected(&self, txhash: TxHash) -> Option<(u8, Priority, PeerId)> {
        self.by_txhash
            .range(
                (txhash, State::CandidateBest.rank(), 0, 0)
                    ..=(txhash, State::Requested.rank(), u64::MAX, u64::MAX),
            )
            .next()
            .map(|&(_, rank, priority, peer)| (rank, priority, peer))
    }

    /// Whether the (hash, peer) announcement is the only one for its hash
    /// that is not already completed.
    fn is_only_non_completed(&self, txhash: TxHash, peer: PeerId) -> bool {
        self.by_txhash
            .range((txhash, 0, 0, 0)..(txhash, State::Completed.rank(), 0, 0))
            .all(|&(_, _, _, other)| other == peer)
    }

    /// Whether every remaining announcement for `txhash` is completed.
    /// Trivially true for a hash with no announcements.
    fn all_completed(&self, txhash: TxHash) -> bool {
        self.by_txhash
            .range((txhash, 0, 0, 0)..(txhash, State::Completed.rank(), 0, 0))
            .next()
            .is_none()
    }

    // Removal.

    /// Remove every announcement for `txhash`.
    fn erase_txhash(&mut self, txhash: TxHash) {
        let peers: Vec<PeerId> = self
            .by_txhash
            .range((txhash, 0, 0, 0)..=(txhash, u8::MAX, u64::MAX, u64::MAX))
            .map(|&(_, _, _, peer)| peer)
            .collect();
        for peer in peers {
            self.erase(txhash, peer);
        }
    }

    /// Remove a single announcement, with no per-hash fixups.
    fn erase(&mut self, txhash: TxHash, peer: PeerId) {
        if let Some(ann) = self.announcements.remove(&(txhash, peer)) {
            self.index_remove(&ann);

            let info = self.peerinfo.entry(peer).or_default();
            info.total -= 1;
            match ann.state {
                State::Requested => info.requested -= 1,
                State::Completed => info.completed -= 1,
                _ => {}
            }
            if info.total == 0 {
                self.peerinfo.remove(&peer);
            }
        }
    }

    // Index maintenance.

    fn index_insert(&mut self, ann: &Announcement) {
        let txhash = ann.gtxid.txhash;
        self.by_peer.insert((ann.peer, ann.state == State::CandidateBest, txhash));
        self.by_txhash.insert((txhash, ann.state.rank(), ann.priority, ann.peer));
        if ann.state.is_waiting() {
            self.by_time.insert((ann.time, txhash, ann.peer));
        }
    }

    fn index_remove(&mut self, ann: &Announcement) {
        let txhash = ann.gtxid.txhash;
        self.by_peer.remove(&(ann.peer, ann.state == State::CandidateBest, txhash));
        self.by_txhash.remove(&(txhash, ann.state.rank(), ann.priority, ann.peer));
        if ann.state.is_waiting() {
            self.by_time.remove(&(ann.time, txhash, ann.peer));
        }
    }

    // Consistency checking. Test and debugging surface; every check is a
    // plain assert so corruption fails loudly wherever it is called from.

    /// Verify all internal invariants by recomputation.
    pub fn sanity_check(&self) {
        let mut peers: HashMap<PeerId, PeerInfo> = HashMap::new();
        let mut buckets: HashMap<TxHash, Vec<&Announcement>> = HashMap::new();
        let mut waiting = 0usize;

        for ((txhash, peer), ann) in &self.announcements {
            assert_eq!(*txhash, ann.gtxid.txhash);
            assert_eq!(*peer, ann.peer);
            assert_eq!(
                ann.priority,
                self.computer.compute(txhash, ann.peer, ann.preferred),
                "stored priority diverges from the computer",
            );

            let info = peers.entry(ann.peer).or_default();
            info.total += 1;
            match ann.state {
                State::Requested => info.requested += 1,
                State::Completed => info.completed += 1,
                _ => {}
            }

            assert!(
                self.by_peer.contains(&(ann.peer, ann.state == State::CandidateBest, *txhash)),
                "announcement missing from the peer index",
            );
            assert!(
                self.by_txhash.contains(&(*txhash, ann.state.rank(), ann.priority, ann.peer)),
                "announcement missing from the hash index",
            );
            if ann.state.is_waiting() {
                assert!(
                    self.by_time.contains(&(ann.time, *txhash, ann.peer)),
                    "waiting announcement missing from the time index",
                );
                waiting += 1;
            }

            buckets.entry(*txhash).or_default().push(ann);
        }

        assert_eq!(self.by_peer.len(), self.announcements.len());
        assert_eq!(self.by_txhash.len(), self.announcements.len());
        assert_eq!(self.by_time.len(), waiting);
        let counted: HashMap<PeerId, PeerInfo> =
            self.peerinfo.iter().map(|(peer, info)| (*peer, *info)).collect();
        assert_eq!(peers, counted);

        for (txhash, anns) in &buckets {
            let completed = anns.iter().filter(|a| a.state == State::Completed).count();
            let requested = anns.iter().filter(|a| a.state == State::Requested).count();
            let best: Vec<_> = anns.iter().filter(|a| a.state == State::CandidateBest).collect();
            let ready: Vec<_> = anns.iter().filter(|a| a.state == State::CandidateReady).collect();

            assert!(completed < anns.len(), "nothing left to try for {}", txhash);
            assert!(requested <= 1, "multiple requests in flight for {}", txhash);
            assert!(best.len() <= 1, "multiple selected candidates for {}", txhash);
            assert!(
                requested + best.len() <= 1,
                "selected candidate alongside an in-flight request for {}",
                txhash,
            );
            if let [best] = best[..] {
                for other in &ready {
                    assert!(
                        other.priority >= best.priority,
                        "a better candidate than the selected one exists for {}",
                        txhash,
                    );
                }
            }
            if !ready.is_empty() {
                assert_eq!(
                    requested + best.len(),
                    1,
                    "ready candidates with nothing selected for {}",
                    txhash,
                );
            }
        }
    }

    /// Verify that no time-driven transition due at `now` is still pending.
    /// Only meaningful right after a call to
    /// [`get_requestable`](TxRequestTracker::get_requestable) with the same
    /// `now`.
    pub fn post_get_requestable_sanity_check(&self, now: LocalTime) {
        for ann in self.announcements.values() {
            if ann.state == State::CandidateDelayed {
                assert!(ann.time > now, "overdue delayed candidate for {}", ann.gtxid);
            }
            if ann.state == State::Requested {
                assert!(ann.time > now, "overdue request for {}", ann.gtxid);
            }
        }
    }
}
