//! Types shared across the transaction relay crates.

pub use gtxid::{GenTxid, TxHash};

pub mod messages;

mod gtxid;

/// Peer identifier assigned by the connection layer.
///
/// Identifiers are unique between a peer's connect and disconnect; an
/// identifier may be handed out again once the disconnect has been processed
/// everywhere, in which case it refers to a fresh peer.
pub type PeerId = u64;
