//! Protocol output capabilities.
//!
//! See [`Outbox`] type.
//!
//! The transaction manager is given an upstream with specific capabilities,
//! eg. sending messages and setting timers, to communicate with the network
//! layer that drives it.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use txrelay_request::LocalDuration;
use txrelay_types::messages::{Inventory, NetworkMessage};
use txrelay_types::PeerId;

use super::event::Event;

/// Output of a state transition of the protocol state machine.
#[derive(Debug, Clone)]
pub enum Io<E> {
    /// There is a message ready to be sent to a peer.
    Write(PeerId, NetworkMessage),
    /// Ask for a wakeup in a specified amount of time.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(E),
}

/// The ability to set a timer.
pub trait SetTimer {
    /// Ask to be woken up in a predefined amount of time.
    fn set_timer(&self, duration: LocalDuration) -> &Self;
}

/// Transaction relay wire capabilities.
pub trait Wire<E> {
    /// Emit an event.
    fn event(&self, event: E);

    /// Send a `getdata` message to a peer.
    fn getdata(&mut self, addr: PeerId, inventories: Vec<Inventory>);
}

/// Holds protocol outputs and pending I/O.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    /// Output queue.
    outbound: Arc<Mutex<VecDeque<Io<Event>>>>,
}

impl Iterator for Outbox {
    type Item = Io<Event>;

    /// Get the next item in the outbound queue.
    fn next(&mut self) -> Option<Io<Event>> {
        self.outbound.lock().unwrap().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an output to the queue.
    pub fn push(&self, output: Io<Event>) {
        self.outbound.lock().unwrap().push_back(output);
    }

    /// Push a message to the queue.
    pub fn message(&mut self, addr: PeerId, payload: NetworkMessage) -> &Self {
        debug!(target: "p2p", "Sending {} to {}", payload.cmd(), addr);

        self.push(Io::Write(addr, payload));
        self
    }
}

impl SetTimer for Outbox {
    fn set_timer(&self, duration: LocalDuration) -> &Self {
        self.push(Io::SetTimer(duration));
        self
    }
}

impl<E: Into<Event> + fmt::Display> Wire<E> for Outbox {
    fn event(&self, event: E) {
        debug!(target: "p2p", "{}", &event);
        self.push(Io::Event(event.into()));
    }

    fn getdata(&mut self, addr: PeerId, inventories: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(inventories));
    }
}
