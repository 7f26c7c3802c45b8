//! Transaction identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A 32-byte transaction hash.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Construct a hash from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw hash bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for TxHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for TxHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A transaction hash together with the interpretation it uses.
///
/// The same 32 bytes can identify a transaction either by its plain id or by
/// its witness-inclusive id; a relay request must carry the interpretation so
/// the remote knows which index to serve from. Announcements for the same
/// hash with different interpretations may coexist on the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenTxid {
    /// Whether `txhash` is the witness-inclusive variant of the identifier.
    pub wtxid: bool,
    /// The hash itself.
    pub txhash: TxHash,
}

impl GenTxid {
    /// An identifier using the plain transaction id.
    pub const fn txid(txhash: TxHash) -> Self {
        Self { wtxid: false, txhash }
    }

    /// An identifier using the witness transaction id.
    pub const fn wtxid(txhash: TxHash) -> Self {
        Self { wtxid: true, txhash }
    }
}

impl fmt::Display for GenTxid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wtxid {
            write!(f, "wtx {}", self.txhash)
        } else {
            write!(f, "tx {}", self.txhash)
        }
    }
}
