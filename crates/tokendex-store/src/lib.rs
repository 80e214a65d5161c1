//! Persistent chain state for the tokendex indexer.
//!
//! Everything durable lives in one RocksDB instance with named column
//! families; every mutation of chain state is a single atomic `WriteBatch`.
//! Unconfirmed state (the mempool) is kept in memory and rebuilt from node
//! events on restart.
//!
//! The [`ChainStore`] is the only mutation surface. Its writers assume a
//! single caller (the chain synchronizer); its readers are safe under
//! concurrent use.

mod blocks;
mod db;
mod history;
mod keys;
mod mempool;
mod spends;
mod store;
mod tokens;
mod txs;
mod undo;
mod utxos;

pub use self::db::{Db, RetryPolicy};
pub use self::mempool::MempoolTx;
pub use self::store::{
    AppliedBlock, ChainStore, DemotedTx, HashOrHeight, MempoolAdded, MempoolRemoved, PreparedBlock,
    RemovedBlock, StoredBlock, TxEvent,
};
pub use self::undo::BlockUndo;

use bitcoin::{BlockHash, OutPoint, Txid};

/// Chain state store error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Column family {0} doesn't exist")]
    NoSuchColumnFamily(&'static str),

    /// The block does not extend the current tip; the caller must reorg
    /// first.
    #[error("Block {got} does not extend current tip {tip}")]
    Conflict { got: BlockHash, tip: BlockHash },

    /// The block is already part of the indexed chain.
    #[error("Block {0} already indexed")]
    AlreadyIndexed(BlockHash),

    /// Only the current tip can be removed.
    #[error("Block {got} is not the current tip {tip}")]
    NotTip { got: BlockHash, tip: BlockHash },

    #[error("No block to remove: index is empty")]
    EmptyChain,

    /// A mempool transaction whose inputs do not resolve; the transaction is
    /// dropped, not indexed.
    #[error("Mempool tx {txid} rejected: missing input {missing}")]
    Rejected { txid: Txid, missing: OutPoint },

    #[error("UTXO not found: {0}")]
    UtxoNotFound(OutPoint),

    #[error("Undo data not found for height {0}")]
    UndoNotFound(i32),

    #[error("Inconsistent index: {0}")]
    Inconsistent(String),

    #[error("Token validation failed: {0}")]
    TokenBatch(#[from] tokendex_slp::BatchError),
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
