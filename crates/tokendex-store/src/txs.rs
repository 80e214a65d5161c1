//! Transaction tables.
//!
//! Confirmed transactions are stored denormalized: every input carries the
//! script and value of the output it spends, resolved at indexing time, so
//! serving a transaction never needs to chase its parents.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokendex_primitives::TxNum;

use crate::db::Db;
use crate::keys::tx_num_key;
use crate::Result;

pub const CF_TX_BY_NUM: &str = "tx_by_num";
pub const CF_TX_NUM_BY_TXID: &str = "tx_num_by_txid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTxInput {
    pub prev_out: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
    /// Script of the spent output; `None` for the coinbase input.
    pub spent_script: Option<Vec<u8>>,
    /// Value of the spent output; 0 for the coinbase input.
    pub spent_value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTxOutput {
    pub value: i64,
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTx {
    pub txid: Txid,
    pub version: i32,
    pub inputs: Vec<DbTxInput>,
    pub outputs: Vec<DbTxOutput>,
    pub lock_time: u32,
    pub block_height: i32,
    pub is_coinbase: bool,
    pub time_first_seen: i64,
}

impl DbTx {
    /// Rebuild the consensus transaction. Round-trips the txid: all hashed
    /// fields are preserved verbatim.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: Version(self.version),
            lock_time: LockTime::from_consensus(self.lock_time),
            input: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.prev_out,
                    script_sig: ScriptBuf::from_bytes(input.script.clone()),
                    sequence: Sequence(input.sequence),
                    witness: Witness::new(),
                })
                .collect(),
            output: self
                .outputs
                .iter()
                .map(|output| TxOut {
                    value: Amount::from_sat(output.value as u64),
                    script_pubkey: ScriptBuf::from_bytes(output.script.clone()),
                })
                .collect(),
        }
    }
}

pub fn put_tx(db: &Db, batch: &mut WriteBatch, tx_num: TxNum, tx: &DbTx) -> Result<()> {
    batch.put_cf(db.cf(CF_TX_BY_NUM)?, tx_num_key(tx_num), bincode::serialize(tx)?);
    batch.put_cf(
        db.cf(CF_TX_NUM_BY_TXID)?,
        tx.txid.to_byte_array(),
        tx_num_key(tx_num),
    );
    Ok(())
}

pub fn delete_tx(db: &Db, batch: &mut WriteBatch, tx_num: TxNum, txid: &Txid) -> Result<()> {
    batch.delete_cf(db.cf(CF_TX_BY_NUM)?, tx_num_key(tx_num));
    batch.delete_cf(db.cf(CF_TX_NUM_BY_TXID)?, txid.to_byte_array());
    Ok(())
}

pub fn tx_by_num(db: &Db, tx_num: TxNum) -> Result<Option<DbTx>> {
    match db.get(db.cf(CF_TX_BY_NUM)?, tx_num_key(tx_num))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn tx_num_by_txid(db: &Db, txid: &Txid) -> Result<Option<TxNum>> {
    match db.get(db.cf(CF_TX_NUM_BY_TXID)?, txid.to_byte_array())? {
        Some(bytes) => Ok(crate::keys::tx_num_from_key(&bytes)),
        None => Ok(None),
    }
}

pub fn tx_by_txid(db: &Db, txid: &Txid) -> Result<Option<(TxNum, DbTx)>> {
    match tx_num_by_txid(db, txid)? {
        Some(tx_num) => Ok(tx_by_num(db, tx_num)?.map(|tx| (tx_num, tx))),
        None => Ok(None),
    }
}
