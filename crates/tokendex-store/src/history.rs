//! Script history index.
//!
//! One key-only entry per `(script, tx_num)`. Because tx nums are assigned
//! in connection order and keyed big-endian, a prefix scan yields a script's
//! confirmed history already in the canonical order: ascending height, then
//! in-block order.

use rocksdb::WriteBatch;
use tokendex_primitives::{ScriptPayload, TxNum};

use crate::db::Db;
use crate::keys::{script_key, script_prefix, tx_num_key, tx_num_from_key};
use crate::{Error, Result};

pub const CF_SCRIPT_HISTORY: &str = "script_history";

pub fn add_entry(
    db: &Db,
    batch: &mut WriteBatch,
    script: &ScriptPayload,
    tx_num: TxNum,
) -> Result<()> {
    batch.put_cf(
        db.cf(CF_SCRIPT_HISTORY)?,
        script_key(script, &tx_num_key(tx_num)),
        [],
    );
    Ok(())
}

pub fn remove_entry(
    db: &Db,
    batch: &mut WriteBatch,
    script: &ScriptPayload,
    tx_num: TxNum,
) -> Result<()> {
    batch.delete_cf(
        db.cf(CF_SCRIPT_HISTORY)?,
        script_key(script, &tx_num_key(tx_num)),
    );
    Ok(())
}

/// All confirmed tx nums for `script`, ascending.
pub fn tx_nums_for_script(db: &Db, script: &ScriptPayload) -> Result<Vec<TxNum>> {
    let prefix = script_prefix(script);
    let cf = db.cf(CF_SCRIPT_HISTORY)?;
    let mut tx_nums = Vec::new();
    for entry in db.iter_prefix(cf, &prefix) {
        let (key, _) = entry?;
        let tx_num = tx_num_from_key(&key[prefix.len()..]).ok_or_else(|| {
            Error::Inconsistent(format!("Bad script_history key: {}", hex::encode(&key)))
        })?;
        tx_nums.push(tx_num);
    }
    Ok(tx_nums)
}
