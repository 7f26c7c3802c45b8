//! State machine events.

use std::fmt;

use super::txmgr;

/// An event emitted by the protocol state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// An event from the transaction manager.
    TxManager(txmgr::Event),
}

impl From<txmgr::Event> for Event {
    fn from(event: txmgr::Event) -> Self {
        Self::TxManager(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::TxManager(event) => write!(fmt, "{}", event),
        }
    }
}
