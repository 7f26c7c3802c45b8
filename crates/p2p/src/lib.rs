//! Peer-to-peer transaction fetching.
//!
//! Connection management, framing and transport live outside this crate;
//! what remains is the protocol logic that turns decoded `inv`, `notfound`
//! and transaction deliveries into `getdata` requests, one in-flight request
//! per transaction at a time.

pub use fsm::txmgr::TxManager;
pub use fsm::Event;

pub mod fsm;
