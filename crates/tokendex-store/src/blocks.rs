//! Block tables: header/stats by height, height by hash.

use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokendex_primitives::{BlockInfo, TxNum};

use crate::db::Db;
use crate::keys::{hash_key, height_key};
use crate::Result;

pub const CF_BLOCK_BY_HEIGHT: &str = "block_by_height";
pub const CF_BLOCK_HEIGHT_BY_HASH: &str = "block_height_by_hash";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbBlock {
    pub info: BlockInfo,
    /// Ordinal of the block's first transaction; the block's txs occupy
    /// `first_tx_num..first_tx_num + info.num_txs`.
    pub first_tx_num: TxNum,
}

pub fn put_block(db: &Db, batch: &mut WriteBatch, block: &DbBlock) -> Result<()> {
    batch.put_cf(
        db.cf(CF_BLOCK_BY_HEIGHT)?,
        height_key(block.info.height),
        bincode::serialize(block)?,
    );
    batch.put_cf(
        db.cf(CF_BLOCK_HEIGHT_BY_HASH)?,
        hash_key(&block.info.hash),
        height_key(block.info.height),
    );
    Ok(())
}

pub fn delete_block(db: &Db, batch: &mut WriteBatch, block: &DbBlock) -> Result<()> {
    batch.delete_cf(db.cf(CF_BLOCK_BY_HEIGHT)?, height_key(block.info.height));
    batch.delete_cf(db.cf(CF_BLOCK_HEIGHT_BY_HASH)?, hash_key(&block.info.hash));
    Ok(())
}

pub fn block_by_height(db: &Db, height: i32) -> Result<Option<DbBlock>> {
    match db.get(db.cf(CF_BLOCK_BY_HEIGHT)?, height_key(height))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn height_by_hash(db: &Db, hash: &BlockHash) -> Result<Option<i32>> {
    match db.get(db.cf(CF_BLOCK_HEIGHT_BY_HASH)?, hash_key(hash))? {
        Some(bytes) => Ok(crate::keys::height_from_key(&bytes)),
        None => Ok(None),
    }
}

pub fn block_by_hash(db: &Db, hash: &BlockHash) -> Result<Option<DbBlock>> {
    match height_by_hash(db, hash)? {
        Some(height) => block_by_height(db, height),
        None => Ok(None),
    }
}

/// Sentinel hash of the empty chain's "tip".
pub fn genesis_prev_hash() -> BlockHash {
    BlockHash::all_zeros()
}
