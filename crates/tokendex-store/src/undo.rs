//! Block undo data for chain reorganizations.
//!
//! When a block is applied we save the UTXOs it spent and the outpoints and
//! tokens it created; reverting the block replays this record backwards.
//! Everything else the revert needs (transaction records, index entries) is
//! still in the database at revert time and is derived from the block's own
//! transactions.

use bitcoin::OutPoint;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokendex_primitives::TokenId;

use crate::db::Db;
use crate::keys::height_key;
use crate::utxos::DbUtxo;
use crate::{Error, Result};

pub const CF_UNDO: &str = "undo";

/// Undo data for a single block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    /// UTXOs spent by this block, restored when reverting.
    pub spent_utxos: Vec<(OutPoint, DbUtxo)>,
    /// Outpoints created by this block, removed when reverting. Outputs
    /// both created and spent within the block never reach the UTXO set and
    /// are not listed.
    pub created_outpoints: Vec<OutPoint>,
    /// Tokens whose GENESIS confirmed in this block.
    pub created_tokens: Vec<TokenId>,
}

impl BlockUndo {
    pub fn record_spend(&mut self, outpoint: OutPoint, utxo: DbUtxo) {
        self.spent_utxos.push((outpoint, utxo));
    }

    pub fn record_create(&mut self, outpoint: OutPoint) {
        self.created_outpoints.push(outpoint);
    }

    pub fn record_token(&mut self, token_id: TokenId) {
        self.created_tokens.push(token_id);
    }
}

pub fn put_undo(db: &Db, batch: &mut WriteBatch, height: i32, undo: &BlockUndo) -> Result<()> {
    batch.put_cf(db.cf(CF_UNDO)?, height_key(height), bincode::serialize(undo)?);
    Ok(())
}

pub fn delete_undo(db: &Db, batch: &mut WriteBatch, height: i32) -> Result<()> {
    batch.delete_cf(db.cf(CF_UNDO)?, height_key(height));
    Ok(())
}

pub fn get_undo(db: &Db, height: i32) -> Result<BlockUndo> {
    match db.get(db.cf(CF_UNDO)?, height_key(height))? {
        Some(bytes) => Ok(bincode::deserialize(&bytes)?),
        None => Err(Error::UndoNotFound(height)),
    }
}
