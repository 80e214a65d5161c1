use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// Header data and aggregate statistics of a connected block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: i32,
    pub n_bits: u32,
    pub timestamp: i64,
    pub block_size: u64,
    pub num_txs: u64,
    pub num_inputs: u64,
    pub num_outputs: u64,
    pub sum_input_sats: i64,
    pub sum_coinbase_output_sats: i64,
    pub sum_normal_output_sats: i64,
    pub sum_burned_sats: i64,
}

/// Position of a confirmed transaction in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub hash: BlockHash,
    pub height: i32,
    pub timestamp: i64,
}
