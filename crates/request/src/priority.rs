//! Announcement priorities.
//!
//! When several peers announce the same transaction, the order in which they
//! are tried must be unpredictable to an attacker (so no peer can reliably
//! position itself first) yet stable within a tracker instance (so the
//! selection does not flap between queries). Both properties come from a
//! keyed `siphash24` over the hash and the announcing peer, salted with two
//! per-instance keys.

use bitcoin_hashes::siphash24::Hash;

use txrelay_types::{PeerId, TxHash};

/// Priority of an announcement. Lower values are served first. The top bit
/// carries the preference class, so every preferred announcement orders
/// before every non-preferred one for the same hash.
pub type Priority = u64;

/// Computes announcement priorities, salted per instance.
#[derive(Debug, Clone)]
pub struct PriorityComputer {
    key1: u64,
    key2: u64,
}

impl PriorityComputer {
    /// Create a computer with random keys.
    pub fn new(rng: &mut fastrand::Rng) -> Self {
        Self { key1: rng.u64(..), key2: rng.u64(..) }
    }

    /// Create a computer with the given keys.
    pub const fn with_keys(key1: u64, key2: u64) -> Self {
        Self { key1, key2 }
    }

    /// The priority of an announcement of `txhash` by `peer`.
    pub fn compute(&self, txhash: &TxHash, peer: PeerId, preferred: bool) -> Priority {
        let mut data = [0u8; 40];
        data[..32].copy_from_slice(txhash.as_bytes());
        data[32..].copy_from_slice(&peer.to_le_bytes());

        let low_bits = Hash::hash_with_keys(self.key1, self.key2, &data).as_u64() >> 1;
        low_bits | u64::from(!preferred) << 63
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferred_always_orders_first() {
        let computer = PriorityComputer::with_keys(11, 17);
        for seed in 0..64u8 {
            let txhash = TxHash::from_bytes([seed; 32]);
            for peer in 0..8 {
                let preferred = computer.compute(&txhash, peer, true);
                for other in 0..8 {
                    assert!(preferred < computer.compute(&txhash, other, false));
                }
            }
        }
    }

    #[test]
    fn stable_within_an_instance() {
        let computer = PriorityComputer::with_keys(1, 2);
        let txhash = TxHash::from_bytes([42; 32]);
        assert_eq!(
            computer.compute(&txhash, 7, true),
            computer.compute(&txhash, 7, true),
        );
    }

    #[test]
    fn salt_changes_the_order() {
        let txhash = TxHash::from_bytes([5; 32]);
        let a = PriorityComputer::with_keys(1, 2).compute(&txhash, 3, true);
        let b = PriorityComputer::with_keys(3, 4).compute(&txhash, 3, true);
        assert_ne!(a, b);
    }

    #[test]
    fn peers_are_spread_out() {
        let computer = PriorityComputer::new(&mut fastrand::Rng::with_seed(99));
        let txhash = TxHash::from_bytes([1; 32]);
        let mut priorities: Vec<Priority> =
            (0..100).map(|peer| computer.compute(&txhash, peer, false)).collect();
        priorities.sort_unstable();
        priorities.dedup();
        assert_eq!(priorities.len(), 100);
    }
}
