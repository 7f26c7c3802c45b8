//! Scheduling of transaction requests across announcing peers.
//!
//! On a gossip network many peers advertise the same transaction at roughly
//! the same time. Requesting it from all of them wastes bandwidth, while
//! requesting it from one peer and waiting forever stalls the download when
//! that peer is slow, unresponsive or malicious. The [`TxRequestTracker`]
//! keeps one announcement per (peer, hash) pair and decides, for each hash,
//! which single peer should be asked next and when, with failover to the
//! remaining announcers on expiry, disconnect or a negative response.
//!
//! The tracker never performs I/O and owns no clock; the caller passes the
//! current time into every query and serializes all calls.

pub use priority::{Priority, PriorityComputer};
pub use time::{Clock, LocalDuration, LocalTime, RefClock};
pub use tracker::TxRequestTracker;

pub mod priority;
pub mod time;
pub mod tracker;
