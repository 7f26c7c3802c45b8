//! Transaction manager.
//! Takes care of fetching announced transactions.
//!
//! Peers advertise transactions with `inv` messages; the manager records
//! every announcement with the [`TxRequestTracker`] and, on each tick, sends
//! a `getdata` to whichever peer the tracker selected for each transaction.
//! Announcements from untrusted classes of peers are delayed before they
//! become requestable, so a preferred peer that announces the same
//! transaction slightly later still gets asked first.

use std::collections::HashMap;

use tracing::debug;

use txrelay_request::{Clock, LocalDuration, LocalTime, TxRequestTracker};
use txrelay_types::messages::{Inventory, NetworkMessage};
use txrelay_types::{GenTxid, PeerId, TxHash};

use super::output::{SetTimer, Wire};

/// How long a sent request may go unanswered before it is given up on and
/// the transaction is fetched from another announcer.
pub const REQUEST_TIMEOUT: LocalDuration = LocalDuration::from_mins(1);

/// How long to wait before requesting an announcement from a non-preferred
/// peer, giving preferred peers a head start.
pub const NONPREF_PEER_DELAY: LocalDuration = LocalDuration::from_secs(2);

/// How long to wait before requesting a plain-txid announcement while peers
/// that relay by witness id are connected.
pub const TXID_DELAY: LocalDuration = LocalDuration::from_secs(2);

/// How long to wait before requesting anything further from a peer that
/// already has [`MAX_PEER_REQUESTS_IN_FLIGHT`] requests in flight.
pub const OVERLOADED_PEER_DELAY: LocalDuration = LocalDuration::from_secs(2);

/// Maximum number of requests in flight to a single peer before its new
/// announcements are delayed.
pub const MAX_PEER_REQUESTS_IN_FLIGHT: usize = 100;

/// Maximum number of announcements tracked per peer; anything beyond this
/// is dropped.
pub const MAX_PEER_ANNOUNCEMENTS: usize = 5000;

/// Time between request scheduling ticks.
pub const TICK_INTERVAL: LocalDuration = LocalDuration::from_secs(1);

/// An event emitted by the transaction manager.
#[derive(Debug, Clone)]
pub enum Event {
    /// A transaction was requested from a peer.
    Requested {
        /// The requested transaction id.
        gtxid: GenTxid,
        /// The peer the request was sent to.
        peer: PeerId,
    },
}

impl std::fmt::Display for Event {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Requested { gtxid, peer } => {
                write!(fmt, "Transaction {} was requested from peer {}", gtxid, peer)
            }
        }
    }
}

/// Transaction manager peer.
#[derive(Debug)]
pub struct Peer {
    /// Whether this peer's announcements are served before others'.
    /// Typically set for outbound and whitelisted connections.
    pub preferred: bool,
    /// Whether this peer relays transactions by witness id.
    pub wtxidrelay: bool,
}

/// Transaction manager state.
#[derive(Debug)]
pub struct TxManager<U, C> {
    /// Peer map.
    peers: HashMap<PeerId, Peer>,
    /// Announcement bookkeeping and request scheduling.
    txrequest: TxRequestTracker,
    /// Number of connected peers that relay by witness id.
    wtxid_peers: usize,

    last_tick: Option<LocalTime>,
    clock: C,
    upstream: U,
}

impl<U: Wire<Event> + SetTimer, C: Clock> TxManager<U, C> {
    /// Create a new transaction manager.
    pub fn new(rng: fastrand::Rng, clock: C, upstream: U) -> Self {
        Self {
            peers: HashMap::new(),
            txrequest: TxRequestTracker::new(rng),
            wtxid_peers: 0,
            last_tick: None,
            clock,
            upstream,
        }
    }

    /// The underlying request tracker.
    pub fn requests(&self) -> &TxRequestTracker {
        &self.txrequest
    }

    /// Called when a peer is negotiated.
    pub fn peer_negotiated(&mut self, id: PeerId, preferred: bool, wtxidrelay: bool) {
        if wtxidrelay {
            self.wtxid_peers += 1;
        }
        self.schedule_tick();
        self.peers.insert(id, Peer { preferred, wtxidrelay });
    }

    /// Called when a peer disconnected.
    pub fn peer_disconnected(&mut self, id: &PeerId) {
        if let Some(peer) = self.peers.remove(id) {
            if peer.wtxidrelay {
                self.wtxid_peers -= 1;
            }
        }
        self.txrequest.disconnected_peer(*id);
    }

    /// Called with a decoded message from a peer.
    pub fn received_message(&mut self, id: PeerId, message: NetworkMessage) {
        match message {
            NetworkMessage::Inv(invs) => self.received_inv(id, &invs),
            NetworkMessage::NotFound(invs) => self.received_notfound(id, &invs),
            NetworkMessage::GetData(_) => {
                // Serving our own transactions is not this manager's job.
                debug!(target: "p2p", "Ignoring getdata from {}", id);
            }
        }
    }

    /// Called when an `inv` is received from a peer.
    pub fn received_inv(&mut self, id: PeerId, invs: &[Inventory]) {
        let Some(&Peer { preferred, .. }) = self.peers.get(&id) else {
            return;
        };
        let now = self.clock.local_time();

        for inv in invs {
            let gtxid = GenTxid::from(*inv);

            if self.txrequest.count(id) >= MAX_PEER_ANNOUNCEMENTS {
                debug!(
                    target: "p2p",
                    "Dropping announcement of {} from peer {} with too many announcements",
                    gtxid, id,
                );
                continue;
            }
            let mut delay = LocalDuration::default();
            if !preferred {
                delay = delay + NONPREF_PEER_DELAY;
            }
            if !gtxid.wtxid && self.wtxid_peers > 0 {
                delay = delay + TXID_DELAY;
            }
            if self.txrequest.count_in_flight(id) >= MAX_PEER_REQUESTS_IN_FLIGHT {
                delay = delay + OVERLOADED_PEER_DELAY;
            }
            self.txrequest.received_inv(id, gtxid, preferred, now + delay);
        }
        self.schedule_tick();
    }

    /// Called when a `notfound` is received from a peer. The transaction
    /// becomes requestable from its other announcers right away.
    pub fn received_notfound(&mut self, id: PeerId, invs: &[Inventory]) {
        for inv in invs {
            self.txrequest.received_response(id, inv.txhash());
        }
        self.schedule_tick();
    }

    /// Called when a peer delivered the body of a requested transaction.
    pub fn received_tx(&mut self, id: PeerId, txhash: TxHash) {
        self.txrequest.received_response(id, txhash);
    }

    /// Called when a transaction no longer needs fetching, because it was
    /// accepted locally or is permanently invalid.
    pub fn transaction_imported(&mut self, txhash: TxHash) {
        self.txrequest.forget_txhash(txhash);
    }

    /// Called when we receive a tick.
    pub fn received_tick(&mut self) {
        let now = self.clock.local_time();

        // Rate-limit how much we run this function.
        if now - self.last_tick.unwrap_or_default() >= TICK_INTERVAL {
            self.last_tick = Some(now);
        } else {
            return;
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            let requestable = self.txrequest.get_requestable(id, now);
            if requestable.is_empty() {
                continue;
            }
            let mut invs = Vec::with_capacity(requestable.len());
            for gtxid in requestable {
                self.txrequest.requested_tx(id, gtxid.txhash, now + REQUEST_TIMEOUT);
                self.upstream.event(Event::Requested { gtxid, peer: id });
                invs.push(Inventory::from(gtxid));
            }
            debug!(target: "p2p", "Requesting {} transaction(s) from {}", invs.len(), id);
            self.upstream.getdata(id, invs);
        }
        self.upstream.set_timer(TICK_INTERVAL);
    }

    fn schedule_tick(&mut self) {
        self.last_tick = None; // Disable rate-limiting for the next tick.
        self.upstream.set_timer(TICK_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fsm::event::Event as FsmEvent;
    use crate::fsm::output::{Io, Outbox};
    use txrelay_request::RefClock;
    use txrelay_types::TxHash;

    fn hash(byte: u8) -> TxHash {
        TxHash::from_bytes([byte; 32])
    }

    fn setup() -> (TxManager<Outbox, RefClock<LocalTime>>, Outbox, RefClock<LocalTime>) {
        let upstream = Outbox::new();
        let clock = RefClock::from(LocalTime::from_secs(100));
        let mgr = TxManager::new(fastrand::Rng::with_seed(5), clock.clone(), upstream.clone());
        (mgr, upstream, clock)
    }

    fn elapse(clock: &RefClock<LocalTime>, duration: LocalDuration) {
        clock.lock().unwrap().elapse(duration);
    }

    fn messages(upstream: &mut Outbox) -> Vec<(PeerId, NetworkMessage)> {
        upstream
            .by_ref()
            .filter_map(|io| match io {
                Io::Write(addr, msg) => Some((addr, msg)),
                _ => None,
            })
            .collect()
    }

    fn events(upstream: &mut Outbox) -> Vec<Event> {
        upstream
            .by_ref()
            .filter_map(|io| match io {
                Io::Event(FsmEvent::TxManager(event)) => Some(event),
                _ => None,
            })
            .collect()
    }

    fn getdata(upstream: &mut Outbox) -> Vec<(PeerId, Vec<Inventory>)> {
        messages(upstream)
            .into_iter()
            .filter_map(|(addr, msg)| match msg {
                NetworkMessage::GetData(invs) => Some((addr, invs)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn preferred_announcement_is_requested_immediately() {
        let (mut mgr, mut upstream, _clock) = setup();
        let inv = Inventory::WTx(hash(1));

        mgr.peer_negotiated(1, true, true);
        mgr.received_message(1, NetworkMessage::Inv(vec![inv]));
        mgr.received_tick();

        assert_eq!(getdata(&mut upstream), vec![(1, vec![inv])]);
        assert_eq!(mgr.requests().count_in_flight(1), 1);
    }

    #[test]
    fn request_event_is_emitted() {
        let (mut mgr, mut upstream, _clock) = setup();
        let inv = Inventory::WTx(hash(2));

        mgr.peer_negotiated(1, true, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_tick();

        let requested = events(&mut upstream);
        assert_eq!(requested.len(), 1);
        match &requested[0] {
            Event::Requested { gtxid, peer } => {
                assert_eq!(*gtxid, GenTxid::from(inv));
                assert_eq!(*peer, 1);
            }
        }
    }

    #[test]
    fn nonpreferred_announcements_are_delayed() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::WTx(hash(3));

        mgr.peer_negotiated(1, false, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_tick();
        assert_eq!(getdata(&mut upstream), vec![]);

        elapse(&clock, NONPREF_PEER_DELAY);
        mgr.received_tick();
        assert_eq!(getdata(&mut upstream), vec![(1, vec![inv])]);
    }

    #[test]
    fn txid_announcements_wait_for_witness_relays() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::Tx(hash(4));

        // A witness-capable peer is connected, so a plain-txid announcement
        // is held back even though its announcer is preferred.
        mgr.peer_negotiated(1, true, true);
        mgr.peer_negotiated(2, true, false);
        mgr.received_inv(2, &[inv]);
        mgr.received_tick();
        assert_eq!(getdata(&mut upstream), vec![]);

        elapse(&clock, TXID_DELAY);
        mgr.received_tick();
        assert_eq!(getdata(&mut upstream), vec![(2, vec![inv])]);
    }

    #[test]
    fn notfound_triggers_failover() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::WTx(hash(5));

        mgr.peer_negotiated(1, true, true);
        mgr.peer_negotiated(2, true, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_inv(2, &[inv]);
        mgr.received_tick();

        // Exactly one of the two peers is asked first.
        let first = getdata(&mut upstream);
        assert_eq!(first.len(), 1, "expected a single getdata, got {:?}", first);
        let first_peer = first[0].0;

        mgr.received_message(first_peer, NetworkMessage::NotFound(vec![inv]));
        elapse(&clock, TICK_INTERVAL);
        mgr.received_tick();

        let other = if first_peer == 1 { 2 } else { 1 };
        assert_eq!(getdata(&mut upstream), vec![(other, vec![inv])]);
    }

    #[test]
    fn disconnect_releases_announcements() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::WTx(hash(6));

        mgr.peer_negotiated(1, true, true);
        mgr.peer_negotiated(2, true, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_inv(2, &[inv]);
        mgr.received_tick();

        let first = getdata(&mut upstream);
        assert_eq!(first.len(), 1, "expected a single getdata, got {:?}", first);
        let first_peer = first[0].0;

        mgr.peer_disconnected(&first_peer);
        assert_eq!(mgr.requests().count(first_peer), 0);

        elapse(&clock, TICK_INTERVAL);
        mgr.received_tick();

        let other = if first_peer == 1 { 2 } else { 1 };
        assert_eq!(getdata(&mut upstream), vec![(other, vec![inv])]);
    }

    #[test]
    fn delivered_transaction_is_not_requested_again() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::WTx(hash(7));

        mgr.peer_negotiated(1, true, true);
        mgr.peer_negotiated(2, true, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_inv(2, &[inv]);
        mgr.received_tick();

        let first = getdata(&mut upstream);
        assert_eq!(first.len(), 1, "expected a single getdata, got {:?}", first);
        let first_peer = first[0].0;

        mgr.received_tx(first_peer, hash(7));
        mgr.transaction_imported(hash(7));
        assert!(mgr.requests().is_empty());

        elapse(&clock, TICK_INTERVAL);
        mgr.received_tick();
        assert_eq!(getdata(&mut upstream), vec![]);
    }

    #[test]
    fn expired_request_moves_to_the_other_announcer() {
        let (mut mgr, mut upstream, clock) = setup();
        let inv = Inventory::WTx(hash(8));

        mgr.peer_negotiated(1, true, true);
        mgr.peer_negotiated(2, true, true);
        mgr.received_inv(1, &[inv]);
        mgr.received_inv(2, &[inv]);
        mgr.received_tick();

        let first = getdata(&mut upstream);
        assert_eq!(first.len(), 1, "expected a single getdata, got {:?}", first);
        let first_peer = first[0].0;

        elapse(&clock, REQUEST_TIMEOUT);
        mgr.received_tick();

        let other = if first_peer == 1 { 2 } else { 1 };
        assert_eq!(getdata(&mut upstream), vec![(other, vec![inv])]);
        assert_eq!(mgr.requests().count_in_flight(first_peer), 0);
    }

    #[test]
    fn announcements_beyond_the_cap_are_dropped() {
        let (mut mgr, _upstream, _clock) = setup();

        mgr.peer_negotiated(1, true, true);
        for i in 0..MAX_PEER_ANNOUNCEMENTS as u64 + 10 {
            let mut bytes = [0u8; 32];
            bytes[..8].copy_from_slice(&i.to_le_bytes());
            mgr.received_inv(1, &[Inventory::WTx(TxHash::from_bytes(bytes))]);
        }
        assert_eq!(mgr.requests().count(1), MAX_PEER_ANNOUNCEMENTS);
    }

    #[test]
    fn overloaded_peer_announcements_are_delayed() {
        let (mut mgr, mut upstream, clock) = setup();

        mgr.peer_negotiated(1, true, true);
        let invs: Vec<Inventory> = (0..MAX_PEER_REQUESTS_IN_FLIGHT as u64)
            .map(|i| {
                let mut bytes = [0u8; 32];
                bytes[..8].copy_from_slice(&i.to_le_bytes());
                Inventory::WTx(TxHash::from_bytes(bytes))
            })
            .collect();
        mgr.received_inv(1, &invs);
        mgr.received_tick();
        assert_eq!(mgr.requests().count_in_flight(1), MAX_PEER_REQUESTS_IN_FLIGHT);
        getdata(&mut upstream);

        // The peer is saturated, so the next announcement is held back.
        let extra = Inventory::WTx(hash(9));
        mgr.received_inv(1, &[extra]);
        elapse(&clock, TICK_INTERVAL);
        mgr.received_tick();
        let sent: Vec<_> = getdata(&mut upstream).into_iter().flat_map(|(_, invs)| invs).collect();
        assert!(!sent.contains(&extra));

        elapse(&clock, OVERLOADED_PEER_DELAY);
        mgr.received_tick();
        let sent: Vec<_> = getdata(&mut upstream).into_iter().flat_map(|(_, invs)| invs).collect();
        assert!(sent.contains(&extra));
    }

    #[test]
    fn announcements_from_unknown_peers_are_ignored() {
        let (mut mgr, mut upstream, _clock) = setup();

        mgr.received_inv(9, &[Inventory::WTx(hash(10))]);
        mgr.received_tick();

        assert!(mgr.requests().is_empty());
        assert_eq!(getdata(&mut upstream), vec![]);
    }
}
