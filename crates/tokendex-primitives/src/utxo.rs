use bitcoin::{OutPoint, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::net::Network;
use crate::token::{TokenAmount, TokenMeta};

/// Token data attached to an unspent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoTokenData {
    pub meta: TokenMeta,
    pub amount: TokenAmount,
}

/// An unspent transaction output known to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    /// Confirmed height, or -1 while the creating transaction is unconfirmed.
    pub block_height: i32,
    pub is_coinbase: bool,
    pub value: i64,
    pub output_script: ScriptBuf,
    pub token: Option<UtxoTokenData>,
    pub network: Network,
}

/// Classification of an outpoint, computed on demand for validation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtxoState {
    /// Confirmed height of the referenced transaction, if any.
    pub height: Option<i32>,
    pub variant: UtxoStateVariant,
}

/// Discriminants are part of the client-facing encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum UtxoStateVariant {
    Unspent = 0,
    Spent = 1,
    /// The referenced txid is not known to the index.
    NoSuchTx = 2,
    /// The txid is known but the output index is out of range.
    NoSuchOutput = 3,
}
