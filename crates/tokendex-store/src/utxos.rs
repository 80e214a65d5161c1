//! UTXO set tables.
//!
//! `utxo_by_outpoint` is the authoritative set; `script_utxos` is a
//! key-only index from script fingerprint to outpoint, resolved against the
//! authoritative table on read.

use bitcoin::OutPoint;
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokendex_primitives::{ScriptPayload, UtxoTokenData};

use crate::db::Db;
use crate::keys::{outpoint_from_key, outpoint_key, script_key, script_prefix};
use crate::{Error, Result};

pub const CF_UTXO_BY_OUTPOINT: &str = "utxo_by_outpoint";
pub const CF_SCRIPT_UTXOS: &str = "script_utxos";

/// A stored unspent output. Only confirmed outputs are persisted; mempool
/// outputs live in the in-memory mempool delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbUtxo {
    pub script: Vec<u8>,
    pub value: i64,
    pub block_height: i32,
    pub is_coinbase: bool,
    pub token: Option<UtxoTokenData>,
}

impl DbUtxo {
    pub fn script_payload(&self) -> Option<ScriptPayload> {
        ScriptPayload::from_script(bitcoin::Script::from_bytes(&self.script))
    }
}

pub fn put_utxo(db: &Db, batch: &mut WriteBatch, outpoint: &OutPoint, utxo: &DbUtxo) -> Result<()> {
    let key = outpoint_key(outpoint);
    batch.put_cf(db.cf(CF_UTXO_BY_OUTPOINT)?, key, bincode::serialize(utxo)?);
    if let Some(script) = utxo.script_payload() {
        batch.put_cf(db.cf(CF_SCRIPT_UTXOS)?, script_key(&script, &key), []);
    }
    Ok(())
}

pub fn delete_utxo(
    db: &Db,
    batch: &mut WriteBatch,
    outpoint: &OutPoint,
    utxo: &DbUtxo,
) -> Result<()> {
    let key = outpoint_key(outpoint);
    batch.delete_cf(db.cf(CF_UTXO_BY_OUTPOINT)?, key);
    if let Some(script) = utxo.script_payload() {
        batch.delete_cf(db.cf(CF_SCRIPT_UTXOS)?, script_key(&script, &key));
    }
    Ok(())
}

pub fn get_utxo(db: &Db, outpoint: &OutPoint) -> Result<Option<DbUtxo>> {
    match db.get(db.cf(CF_UTXO_BY_OUTPOINT)?, outpoint_key(outpoint))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

/// All confirmed unspent outpoints paying to `script`, in key order.
pub fn outpoints_for_script(db: &Db, script: &ScriptPayload) -> Result<Vec<OutPoint>> {
    let prefix = script_prefix(script);
    let cf = db.cf(CF_SCRIPT_UTXOS)?;
    let mut outpoints = Vec::new();
    for entry in db.iter_prefix(cf, &prefix) {
        let (key, _) = entry?;
        let outpoint = outpoint_from_key(&key[prefix.len()..])
            .ok_or_else(|| Error::Inconsistent(format!("Bad script_utxos key: {}", hex::encode(&key))))?;
        outpoints.push(outpoint);
    }
    Ok(outpoints)
}
