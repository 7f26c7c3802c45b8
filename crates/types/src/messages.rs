//! Messages exchanged on the transaction relay wire.
//!
//! Framing and transport live outside this repository; these are the decoded
//! payloads the protocol state machine consumes and produces.

use serde::{Deserialize, Serialize};

use crate::{GenTxid, TxHash};

/// An entry of an `inv`, `getdata` or `notfound` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Inventory {
    /// A transaction, referred to by its plain id.
    Tx(TxHash),
    /// A transaction, referred to by its witness id.
    WTx(TxHash),
}

impl Inventory {
    /// The hash this entry refers to, regardless of interpretation.
    pub fn txhash(&self) -> TxHash {
        match self {
            Inventory::Tx(txhash) | Inventory::WTx(txhash) => *txhash,
        }
    }
}

impl From<GenTxid> for Inventory {
    fn from(gtxid: GenTxid) -> Self {
        if gtxid.wtxid {
            Inventory::WTx(gtxid.txhash)
        } else {
            Inventory::Tx(gtxid.txhash)
        }
    }
}

impl From<Inventory> for GenTxid {
    fn from(inv: Inventory) -> Self {
        match inv {
            Inventory::Tx(txhash) => GenTxid::txid(txhash),
            Inventory::WTx(txhash) => GenTxid::wtxid(txhash),
        }
    }
}

/// Transaction relay message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkMessage {
    /// INV method. Announces transactions available from the sender.
    Inv(Vec<Inventory>),

    /// GETDATA method. Requests transactions from the receiver.
    GetData(Vec<Inventory>),

    /// NOTFOUND method. Tells the receiver a requested transaction cannot be
    /// served.
    NotFound(Vec<Inventory>),
}

impl NetworkMessage {
    pub fn cmd(&self) -> &'static str {
        match self {
            NetworkMessage::Inv(_) => "inv",
            NetworkMessage::GetData(_) => "getdata",
            NetworkMessage::NotFound(_) => "notfound",
        }
    }
}
