//! Spent-by back-references.
//!
//! Maps a spent outpoint to the input that consumed it. Kept as an index
//! table rather than embedded pointers so transaction and UTXO records never
//! reference each other directly.

use bitcoin::{OutPoint, Txid};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::keys::outpoint_key;
use crate::Result;

pub const CF_SPEND_BY_OUTPOINT: &str = "spend_by_outpoint";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbSpend {
    pub txid: Txid,
    pub input_idx: u32,
    pub height: i32,
}

impl DbSpend {
    /// The spending input as an outpoint-shaped reference.
    pub fn spent_by(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.input_idx,
        }
    }
}

pub fn put_spend(
    db: &Db,
    batch: &mut WriteBatch,
    outpoint: &OutPoint,
    spend: &DbSpend,
) -> Result<()> {
    batch.put_cf(
        db.cf(CF_SPEND_BY_OUTPOINT)?,
        outpoint_key(outpoint),
        bincode::serialize(spend)?,
    );
    Ok(())
}

pub fn delete_spend(db: &Db, batch: &mut WriteBatch, outpoint: &OutPoint) -> Result<()> {
    batch.delete_cf(db.cf(CF_SPEND_BY_OUTPOINT)?, outpoint_key(outpoint));
    Ok(())
}

pub fn get_spend(db: &Db, outpoint: &OutPoint) -> Result<Option<DbSpend>> {
    match db.get(db.cf(CF_SPEND_BY_OUTPOINT)?, outpoint_key(outpoint))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}
