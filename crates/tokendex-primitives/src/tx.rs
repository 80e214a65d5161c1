use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::block::BlockMetadata;
use crate::net::Network;
use crate::token::{TokenAmount, TokenBurn, TokenTxData};

/// Ordinal of a confirmed transaction, assigned in connection order.
///
/// Because blocks are connected sequentially and transactions are numbered in
/// canonical in-block order, sorting by `TxNum` yields the history ordering:
/// ascending confirmed height, canonical order within a block.
pub type TxNum = u64;

/// Where a transaction currently sits in its lifecycle.
///
/// A transaction moves `Mempool -> Confirmed` when a block containing it
/// connects, and back to `Mempool` (or out of the index entirely) when that
/// block is disconnected during a reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Mempool,
    Confirmed(BlockMetadata),
}

impl TxStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TxStatus::Confirmed(_))
    }

    pub fn block(&self) -> Option<&BlockMetadata> {
        match self {
            TxStatus::Mempool => None,
            TxStatus::Confirmed(block) => Some(block),
        }
    }
}

/// An input, denormalized with data of the output it spends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTxInput {
    pub prev_out: OutPoint,
    pub input_script: ScriptBuf,
    /// Script of the spent output; `None` only for coinbase inputs.
    pub output_script: Option<ScriptBuf>,
    /// Value of the spent output in satoshis; 0 for coinbase inputs.
    pub value: i64,
    pub sequence: u32,
    pub token: Option<TokenAmount>,
    pub token_burn: Option<TokenBurn>,
}

/// An output, with the index-maintained spent-by back-reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTxOutput {
    pub value: i64,
    pub output_script: ScriptBuf,
    pub token: Option<TokenAmount>,
    /// Input that spends this output; `None` while unspent.
    pub spent_by: Option<OutPoint>,
}

/// A transaction as served by the index: consensus fields plus everything
/// derived while indexing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTx {
    pub txid: Txid,
    pub version: i32,
    pub inputs: Vec<RichTxInput>,
    pub outputs: Vec<RichTxOutput>,
    pub lock_time: u32,
    pub token: Option<TokenTxData>,
    pub token_error_msg: Option<String>,
    pub status: TxStatus,
    pub time_first_seen: i64,
    pub network: Network,
}

impl RichTx {
    /// Timestamp used for ordering unconfirmed transactions.
    pub fn timestamp(&self) -> i64 {
        match &self.status {
            TxStatus::Mempool => self.time_first_seen,
            TxStatus::Confirmed(block) => block.timestamp,
        }
    }
}
