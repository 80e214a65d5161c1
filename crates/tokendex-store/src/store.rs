//! The chain state store.
//!
//! [`ChainStore`] owns the database and the in-memory mempool. Mutations
//! (`put_block`, `remove_block`, mempool add/remove) are designed for a
//! single caller, the chain synchronizer, and commit each change as one
//! atomic batch; reads are safe under concurrent use and always observe a
//! fully applied prefix of the event sequence.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use bitcoin::{Block, BlockHash, OutPoint, Script, ScriptBuf, Transaction, Txid};
use parking_lot::RwLock;
use rocksdb::WriteBatch;
use tokendex_primitives::{
    BlockInfo, BlockMetadata, GenesisInfo, Network, RichTx, RichTxInput, RichTxOutput,
    ScriptPayload, TokenId, TokenMeta, TxNum, TxStatus, Utxo, UtxoState, UtxoStateVariant,
    UtxoTokenData,
};
use tokendex_slp::{BatchTokenTx, ParsedTokenTx, ParsedTxType, validate_batch};

use crate::blocks::{self, DbBlock};
use crate::db::{Db, RetryPolicy};
use crate::mempool::{Mempool, MempoolTx, ResolvedCoin};
use crate::spends::{self, DbSpend};
use crate::tokens::{self, DbTokenMeta, DbTokenVerdict};
use crate::txs::{self, DbTx, DbTxInput, DbTxOutput};
use crate::undo::{self, BlockUndo};
use crate::utxos::{self, DbUtxo};
use crate::{Error, Result, history};

pub const CF_META: &str = "meta";

const META_TIP_HEIGHT: &[u8] = b"tip_height";
const META_NEXT_TX_NUM: &[u8] = b"next_tx_num";

/// Lookup key for block queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrHeight {
    Hash(BlockHash),
    Height(i32),
}

/// A block as served to clients: header/stats plus its txids in block order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub info: BlockInfo,
    pub txids: Vec<Txid>,
}

/// A state change affecting one transaction, with the scripts it touched.
/// Consumed by the subscription fan-out.
#[derive(Debug, Clone)]
pub struct TxEvent {
    pub txid: Txid,
    pub scripts: Vec<ScriptPayload>,
}

/// Result of connecting a block.
#[derive(Debug)]
pub struct AppliedBlock {
    pub hash: BlockHash,
    pub height: i32,
    /// The block's transactions, in block order.
    pub confirmed: Vec<TxEvent>,
    /// Mempool transactions evicted because the block confirmed a
    /// conflicting spend, including their dependents.
    pub evicted: Vec<TxEvent>,
}

/// A transaction pushed back out of the chain by a reorg.
#[derive(Debug)]
pub struct DemotedTx {
    pub txid: Txid,
    pub tx: Transaction,
    pub time_first_seen: i64,
    pub scripts: Vec<ScriptPayload>,
}

/// Result of disconnecting the tip block.
#[derive(Debug)]
pub struct RemovedBlock {
    pub hash: BlockHash,
    pub height: i32,
    /// Non-coinbase transactions of the removed block, in block order. The
    /// caller decides which ones re-enter the mempool.
    pub demoted: Vec<DemotedTx>,
    /// The coinbase cannot survive a reorg; its scripts still need a
    /// notification.
    pub coinbase: Option<TxEvent>,
}

#[derive(Debug)]
pub struct MempoolAdded {
    pub txid: Txid,
    pub scripts: Vec<ScriptPayload>,
}

#[derive(Debug)]
pub struct MempoolRemoved {
    pub txid: Txid,
    pub scripts: Vec<ScriptPayload>,
}

/// How an input was resolved while preparing a block.
#[derive(Debug, Clone)]
enum ResolvedInput {
    Coinbase,
    /// Spends a confirmed UTXO; carries the full record for the undo data.
    FromDb { outpoint: OutPoint, utxo: DbUtxo },
    /// Spends an output created earlier in the same block.
    InBlock {
        outpoint: OutPoint,
        script: Vec<u8>,
        value: i64,
    },
}

impl ResolvedInput {
    fn spent_script(&self) -> Option<&[u8]> {
        match self {
            ResolvedInput::Coinbase => None,
            ResolvedInput::FromDb { utxo, .. } => Some(&utxo.script),
            ResolvedInput::InBlock { script, .. } => Some(script),
        }
    }

    fn spent_value(&self) -> i64 {
        match self {
            ResolvedInput::Coinbase => 0,
            ResolvedInput::FromDb { utxo, .. } => utxo.value,
            ResolvedInput::InBlock { value, .. } => *value,
        }
    }
}

#[derive(Debug)]
struct PreparedTx {
    txid: Txid,
    tx_num: TxNum,
    tx: Transaction,
    is_coinbase: bool,
    time_first_seen: i64,
    inputs: Vec<ResolvedInput>,
    /// Outputs that survive the block (not spent in-block, not OP_RETURN).
    created: Vec<u32>,
    verdict: Option<DbTokenVerdict>,
    genesis: Option<(TokenId, DbTokenMeta)>,
    scripts: Vec<ScriptPayload>,
}

/// A block with inputs resolved, statistics computed and token verdicts
/// attached, ready to be committed atomically.
#[derive(Debug)]
pub struct PreparedBlock {
    db_block: DbBlock,
    txs: Vec<PreparedTx>,
}

impl PreparedBlock {
    pub fn info(&self) -> &BlockInfo {
        &self.db_block.info
    }
}

/// Durable chain state plus the in-memory mempool.
pub struct ChainStore {
    db: Db,
    mempool: RwLock<Mempool>,
    network: Network,
    retry: RetryPolicy,
}

impl ChainStore {
    pub fn open(path: &Path, network: Network) -> Result<Self> {
        Self::open_with_retry(path, network, RetryPolicy::default())
    }

    pub fn open_with_retry(path: &Path, network: Network, retry: RetryPolicy) -> Result<Self> {
        let db = Db::open(path)?;
        let store = ChainStore {
            db,
            mempool: RwLock::new(Mempool::new()),
            network,
            retry,
        };
        if let Some(tip) = store.tip()? {
            tracing::info!(height = tip.height, hash = %tip.hash, "Opened chain store");
        } else {
            tracing::info!("Opened empty chain store");
        }
        Ok(store)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Header/stats of the current tip, if any block is indexed.
    pub fn tip(&self) -> Result<Option<BlockInfo>> {
        let cf = self.db.cf(CF_META)?;
        let Some(bytes) = self.db.get(cf, META_TIP_HEIGHT)? else {
            return Ok(None);
        };
        let height = crate::keys::height_from_key(&bytes)
            .ok_or_else(|| Error::Inconsistent("Bad tip height record".into()))?;
        let block = blocks::block_by_height(&self.db, height)?
            .ok_or_else(|| Error::Inconsistent(format!("Tip block {height} missing")))?;
        Ok(Some(block.info))
    }

    fn next_tx_num(&self) -> Result<TxNum> {
        let cf = self.db.cf(CF_META)?;
        match self.db.get(cf, META_NEXT_TX_NUM)? {
            Some(bytes) => crate::keys::tx_num_from_key(&bytes)
                .ok_or_else(|| Error::Inconsistent("Bad next_tx_num record".into())),
            None => Ok(0),
        }
    }

    // ========== Block connection ==========

    /// Resolve, validate and aggregate a block against current state.
    ///
    /// Fails with [`Error::Conflict`] if the block does not extend the tip
    /// and with [`Error::AlreadyIndexed`] if it is already part of the
    /// chain; no state is modified either way.
    pub fn prepare_block(&self, block: &Block) -> Result<PreparedBlock> {
        let hash = block.block_hash();
        if blocks::height_by_hash(&self.db, &hash)?.is_some() {
            return Err(Error::AlreadyIndexed(hash));
        }
        let tip = self.tip()?;
        let height = match &tip {
            Some(tip) => {
                if block.header.prev_blockhash != tip.hash {
                    return Err(Error::Conflict {
                        got: hash,
                        tip: tip.hash,
                    });
                }
                tip.height + 1
            }
            None => 0,
        };
        let first_tx_num = self.next_tx_num()?;
        let txids = block
            .txdata
            .iter()
            .map(|tx| tx.compute_txid())
            .collect::<Vec<_>>();

        // Outputs created in this block; canonical ordering does not imply
        // topological ordering, so collect them all before resolving inputs.
        let mut tx_num_by_txid = HashMap::new();
        let mut in_block = HashMap::new();
        for (tx_idx, tx) in block.txdata.iter().enumerate() {
            tx_num_by_txid.insert(txids[tx_idx], first_tx_num + tx_idx as TxNum);
            for (vout, output) in tx.output.iter().enumerate() {
                in_block.insert(
                    OutPoint {
                        txid: txids[tx_idx],
                        vout: vout as u32,
                    },
                    (
                        output.script_pubkey.to_bytes(),
                        output.value.to_sat() as i64,
                    ),
                );
            }
        }

        let mut consumed_in_block = HashSet::new();
        let mut resolved = Vec::with_capacity(block.txdata.len());
        for tx in &block.txdata {
            let mut inputs = Vec::with_capacity(tx.input.len());
            for input in &tx.input {
                let prev_out = input.previous_output;
                if prev_out.is_null() {
                    inputs.push(ResolvedInput::Coinbase);
                } else if let Some((script, value)) = in_block.get(&prev_out) {
                    consumed_in_block.insert(prev_out);
                    inputs.push(ResolvedInput::InBlock {
                        outpoint: prev_out,
                        script: script.clone(),
                        value: *value,
                    });
                } else if let Some(utxo) = utxos::get_utxo(&self.db, &prev_out)? {
                    inputs.push(ResolvedInput::FromDb {
                        outpoint: prev_out,
                        utxo,
                    });
                } else {
                    return Err(Error::UtxoNotFound(prev_out));
                }
            }
            resolved.push(inputs);
        }

        let verdicts = self.validate_block_tokens(block, &txids, &tx_num_by_txid, first_tx_num)?;

        // Aggregate statistics and assemble per-tx records.
        let mut num_inputs = 0u64;
        let mut num_outputs = 0u64;
        let mut sum_input_sats = 0i64;
        let mut sum_coinbase_output_sats = 0i64;
        let mut sum_normal_output_sats = 0i64;
        let mut sum_burned_sats = 0i64;
        let mempool = self.mempool.read();
        let mut prepared_txs = Vec::with_capacity(block.txdata.len());
        for (tx_idx, tx) in block.txdata.iter().enumerate() {
            let txid = txids[tx_idx];
            let tx_num = first_tx_num + tx_idx as TxNum;
            let is_coinbase = tx.is_coinbase();
            let inputs = resolved[tx_idx].clone();
            num_inputs += tx.input.len() as u64;
            num_outputs += tx.output.len() as u64;
            if !is_coinbase {
                sum_input_sats += inputs.iter().map(ResolvedInput::spent_value).sum::<i64>();
            }
            let mut created = Vec::new();
            for (vout, output) in tx.output.iter().enumerate() {
                let value = output.value.to_sat() as i64;
                if is_coinbase {
                    sum_coinbase_output_sats += value;
                } else {
                    sum_normal_output_sats += value;
                }
                if output.script_pubkey.is_op_return() {
                    sum_burned_sats += value;
                    continue;
                }
                let outpoint = OutPoint {
                    txid,
                    vout: vout as u32,
                };
                if !consumed_in_block.contains(&outpoint) {
                    created.push(vout as u32);
                }
            }
            let (verdict, genesis) = verdicts.get(&tx_num).cloned().unwrap_or((None, None));
            let time_first_seen = mempool
                .get(&txid)
                .map(|entry| entry.time_first_seen)
                .unwrap_or(block.header.time as i64);
            let scripts = touched_scripts(tx, &inputs);
            prepared_txs.push(PreparedTx {
                txid,
                tx_num,
                tx: tx.clone(),
                is_coinbase,
                time_first_seen,
                inputs,
                created,
                verdict,
                genesis,
                scripts,
            });
        }
        drop(mempool);

        let info = BlockInfo {
            hash,
            prev_hash: block.header.prev_blockhash,
            height,
            n_bits: block.header.bits.to_consensus(),
            timestamp: block.header.time as i64,
            block_size: block.total_size() as u64,
            num_txs: block.txdata.len() as u64,
            num_inputs,
            num_outputs,
            sum_input_sats,
            sum_coinbase_output_sats,
            sum_normal_output_sats,
            sum_burned_sats,
        };
        Ok(PreparedBlock {
            db_block: DbBlock {
                info,
                first_tx_num,
            },
            txs: prepared_txs,
        })
    }

    /// Token-validate all of a block's declarations in dependency order.
    #[allow(clippy::type_complexity)]
    fn validate_block_tokens(
        &self,
        block: &Block,
        txids: &[Txid],
        tx_num_by_txid: &HashMap<Txid, TxNum>,
        first_tx_num: TxNum,
    ) -> Result<HashMap<TxNum, (Option<DbTokenVerdict>, Option<(TokenId, DbTokenMeta)>)>> {
        let mut verdicts = HashMap::new();
        let mut batch_txs = HashMap::new();
        let mut genesis_infos: HashMap<TxNum, GenesisInfo> = HashMap::new();
        let mut known_outputs = HashMap::new();
        for (tx_idx, tx) in block.txdata.iter().enumerate() {
            let tx_num = first_tx_num + tx_idx as TxNum;
            let parsed = match tokendex_slp::parse_tx(txids[tx_idx], tx) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(err) => {
                    verdicts.insert(
                        tx_num,
                        (
                            Some(DbTokenVerdict::Invalid {
                                burns: vec![None; tx.input.len()],
                                error: err.to_string(),
                            }),
                            None,
                        ),
                    );
                    continue;
                }
            };
            if let ParsedTxType::Genesis(info) = &parsed.tx_type {
                genesis_infos.insert(tx_num, info.clone());
            }
            let mut input_tx_nums = Vec::with_capacity(tx.input.len());
            for input in &tx.input {
                let prev_out = input.previous_output;
                if prev_out.is_null() {
                    input_tx_nums.push(None);
                    continue;
                }
                if let Some(&num) = tx_num_by_txid.get(&prev_out.txid) {
                    input_tx_nums.push(Some(num));
                    continue;
                }
                let num = txs::tx_num_by_txid(&self.db, &prev_out.txid)?;
                if let Some(num) = num {
                    let spent = tokens::get_verdict(&self.db, num)?
                        .and_then(|verdict| verdict.spent_token(prev_out.vout));
                    known_outputs.insert((num, prev_out.vout), spent);
                }
                input_tx_nums.push(num);
            }
            batch_txs.insert(
                tx_num,
                BatchTokenTx {
                    tx,
                    parsed,
                    input_tx_nums,
                },
            );
        }
        if batch_txs.is_empty() {
            return Ok(verdicts);
        }
        let (valid, invalid) = validate_batch(batch_txs, known_outputs)?;
        for (tx_num, data) in valid {
            let genesis = genesis_infos.remove(&tx_num).map(|info| {
                (
                    data.token_id,
                    DbTokenMeta {
                        token_type: data.token_type,
                        group_token_id: data.group_token_id,
                        genesis_info: info,
                    },
                )
            });
            verdicts.insert(tx_num, (Some(DbTokenVerdict::Valid(data)), genesis));
        }
        for (tx_num, invalid_tx) in invalid {
            verdicts.insert(
                tx_num,
                (
                    Some(DbTokenVerdict::Invalid {
                        burns: invalid_tx.burns,
                        error: invalid_tx.error,
                    }),
                    None,
                ),
            );
        }
        Ok(verdicts)
    }

    /// Commit a prepared block atomically and update the mempool.
    pub fn put_block(&self, prepared: PreparedBlock) -> Result<AppliedBlock> {
        let hash = prepared.db_block.info.hash;
        let height = prepared.db_block.info.height;
        // Single writer, but re-check against the committed tip anyway.
        if blocks::height_by_hash(&self.db, &hash)?.is_some() {
            return Err(Error::AlreadyIndexed(hash));
        }
        match self.tip()? {
            Some(tip) if prepared.db_block.info.prev_hash != tip.hash => {
                return Err(Error::Conflict {
                    got: hash,
                    tip: tip.hash,
                });
            }
            None if height != 0 => {
                return Err(Error::Conflict {
                    got: hash,
                    tip: blocks::genesis_prev_hash(),
                });
            }
            _ => {}
        }

        self.db.write_with_retry(&self.retry, || {
            let mut batch = WriteBatch::default();
            let db = &self.db;
            blocks::put_block(db, &mut batch, &prepared.db_block)?;
            let mut block_undo = BlockUndo::default();
            for ptx in &prepared.txs {
                let db_tx = build_db_tx(ptx, height);
                txs::put_tx(db, &mut batch, ptx.tx_num, &db_tx)?;
                for script in &ptx.scripts {
                    history::add_entry(db, &mut batch, script, ptx.tx_num)?;
                }
                for (vin, input) in ptx.inputs.iter().enumerate() {
                    let outpoint = match input {
                        ResolvedInput::Coinbase => continue,
                        ResolvedInput::FromDb { outpoint, utxo } => {
                            utxos::delete_utxo(db, &mut batch, outpoint, utxo)?;
                            block_undo.record_spend(*outpoint, utxo.clone());
                            *outpoint
                        }
                        ResolvedInput::InBlock { outpoint, .. } => *outpoint,
                    };
                    spends::put_spend(
                        db,
                        &mut batch,
                        &outpoint,
                        &DbSpend {
                            txid: ptx.txid,
                            input_idx: vin as u32,
                            height,
                        },
                    )?;
                }
                for &vout in &ptx.created {
                    let output = &ptx.tx.output[vout as usize];
                    let outpoint = OutPoint {
                        txid: ptx.txid,
                        vout,
                    };
                    let token = ptx.verdict.as_ref().and_then(|verdict| {
                        let data = verdict.data()?;
                        let amount = *data.output_tokens.get(vout as usize)?;
                        (!amount.is_empty()).then(|| UtxoTokenData {
                            meta: data.meta(),
                            amount,
                        })
                    });
                    let utxo = DbUtxo {
                        script: output.script_pubkey.to_bytes(),
                        value: output.value.to_sat() as i64,
                        block_height: height,
                        is_coinbase: ptx.is_coinbase,
                        token,
                    };
                    utxos::put_utxo(db, &mut batch, &outpoint, &utxo)?;
                    block_undo.record_create(outpoint);
                }
                if let Some(verdict) = &ptx.verdict {
                    tokens::put_verdict(db, &mut batch, ptx.tx_num, verdict)?;
                }
                if let Some((token_id, meta)) = &ptx.genesis {
                    tokens::put_token_meta(db, &mut batch, token_id, meta)?;
                    block_undo.record_token(*token_id);
                }
            }
            undo::put_undo(db, &mut batch, height, &block_undo)?;
            let cf_meta = db.cf(CF_META)?;
            batch.put_cf(cf_meta, META_TIP_HEIGHT, crate::keys::height_key(height));
            let next_tx_num = prepared.db_block.first_tx_num + prepared.txs.len() as TxNum;
            batch.put_cf(cf_meta, META_NEXT_TX_NUM, crate::keys::tx_num_key(next_tx_num));
            Ok(batch)
        })?;

        // The block is durable; reconcile the mempool and report events.
        let mut mempool = self.mempool.write();
        let mut confirmed = Vec::with_capacity(prepared.txs.len());
        for ptx in &prepared.txs {
            mempool.remove(&ptx.txid);
            confirmed.push(TxEvent {
                txid: ptx.txid,
                scripts: ptx.scripts.clone(),
            });
        }
        let mut evicted = Vec::new();
        for ptx in &prepared.txs {
            if ptx.is_coinbase {
                continue;
            }
            for input in &ptx.tx.input {
                let Some(spender) = mempool.spender_of(&input.previous_output) else {
                    continue;
                };
                // A mempool tx spends an outpoint this block consumed: the
                // conflicting tx and its dependents are no longer valid.
                let mut queue = vec![spender.txid];
                while let Some(conflict_txid) = queue.pop() {
                    let Some(entry) = mempool.remove(&conflict_txid) else {
                        continue;
                    };
                    queue.extend(mempool.children_of(&conflict_txid, entry.tx.output.len()));
                    tracing::debug!(txid = %conflict_txid, "Evicted conflicting mempool tx");
                    evicted.push(TxEvent {
                        txid: conflict_txid,
                        scripts: entry.scripts,
                    });
                }
            }
        }
        drop(mempool);

        tracing::info!(
            %hash,
            height,
            num_txs = prepared.txs.len(),
            "Connected block"
        );
        Ok(AppliedBlock {
            hash,
            height,
            confirmed,
            evicted,
        })
    }

    // ========== Block disconnection ==========

    /// Atomically disconnect the tip block, restoring the previous state.
    ///
    /// Only used during reorgs. The removed block's transactions are
    /// returned so the caller can requeue the still-valid ones as mempool
    /// transactions.
    pub fn remove_block(&self, hash: &BlockHash) -> Result<RemovedBlock> {
        let tip = self.tip()?.ok_or(Error::EmptyChain)?;
        if tip.hash != *hash {
            return Err(Error::NotTip {
                got: *hash,
                tip: tip.hash,
            });
        }
        let db_block = blocks::block_by_height(&self.db, tip.height)?
            .ok_or_else(|| Error::Inconsistent(format!("Tip block {} missing", tip.height)))?;
        let height = db_block.info.height;
        let block_undo = undo::get_undo(&self.db, height)?;
        let first_tx_num = db_block.first_tx_num;
        let mut block_txs = Vec::with_capacity(db_block.info.num_txs as usize);
        for tx_num in first_tx_num..first_tx_num + db_block.info.num_txs {
            let db_tx = txs::tx_by_num(&self.db, tx_num)?
                .ok_or_else(|| Error::Inconsistent(format!("Tx {tx_num} missing")))?;
            block_txs.push((tx_num, db_tx));
        }

        self.db.write_with_retry(&self.retry, || {
            let mut batch = WriteBatch::default();
            let db = &self.db;
            blocks::delete_block(db, &mut batch, &db_block)?;
            for (tx_num, db_tx) in &block_txs {
                txs::delete_tx(db, &mut batch, *tx_num, &db_tx.txid)?;
                for script in db_tx_scripts(db_tx) {
                    history::remove_entry(db, &mut batch, &script, *tx_num)?;
                }
                for input in &db_tx.inputs {
                    if !input.prev_out.is_null() {
                        spends::delete_spend(db, &mut batch, &input.prev_out)?;
                    }
                }
                tokens::delete_verdict(db, &mut batch, *tx_num)?;
            }
            for outpoint in &block_undo.created_outpoints {
                if let Some(utxo) = utxos::get_utxo(db, outpoint)? {
                    utxos::delete_utxo(db, &mut batch, outpoint, &utxo)?;
                }
            }
            for (outpoint, utxo) in &block_undo.spent_utxos {
                utxos::put_utxo(db, &mut batch, outpoint, utxo)?;
            }
            for token_id in &block_undo.created_tokens {
                tokens::delete_token_meta(db, &mut batch, token_id)?;
            }
            undo::delete_undo(db, &mut batch, height)?;
            let cf_meta = db.cf(CF_META)?;
            if height > 0 {
                batch.put_cf(cf_meta, META_TIP_HEIGHT, crate::keys::height_key(height - 1));
            } else {
                batch.delete_cf(cf_meta, META_TIP_HEIGHT);
            }
            batch.put_cf(cf_meta, META_NEXT_TX_NUM, crate::keys::tx_num_key(first_tx_num));
            Ok(batch)
        })?;

        let demoted = block_txs
            .iter()
            .filter(|(_, db_tx)| !db_tx.is_coinbase)
            .map(|(_, db_tx)| DemotedTx {
                txid: db_tx.txid,
                tx: db_tx.to_transaction(),
                time_first_seen: db_tx.time_first_seen,
                scripts: db_tx_scripts(db_tx),
            })
            .collect();
        let coinbase = block_txs
            .iter()
            .find(|(_, db_tx)| db_tx.is_coinbase)
            .map(|(_, db_tx)| TxEvent {
                txid: db_tx.txid,
                scripts: db_tx_scripts(db_tx),
            });
        tracing::info!(%hash, height, "Disconnected block");
        Ok(RemovedBlock {
            hash: *hash,
            height,
            demoted,
            coinbase,
        })
    }

    // ========== Mempool ==========

    /// Accept an unconfirmed transaction.
    ///
    /// Inputs must resolve against the confirmed UTXO set and the mempool
    /// (chained unconfirmed spends are permitted). Returns `Ok(None)` if the
    /// transaction is already known; fails with [`Error::Rejected`] if an
    /// input is missing or already spent by another mempool transaction.
    pub fn add_mempool_tx(
        &self,
        tx: Transaction,
        time_first_seen: i64,
    ) -> Result<Option<MempoolAdded>> {
        let txid = tx.compute_txid();
        let mut mempool = self.mempool.write();
        if mempool.contains(&txid) || txs::tx_num_by_txid(&self.db, &txid)?.is_some() {
            return Ok(None);
        }
        let mut resolved_inputs = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let prev_out = input.previous_output;
            if mempool.is_spent(&prev_out) {
                return Err(Error::Rejected {
                    txid,
                    missing: prev_out,
                });
            }
            if let Some(output) = mempool.output(&prev_out) {
                resolved_inputs.push(ResolvedCoin {
                    script: output.script_pubkey.to_bytes(),
                    value: output.value.to_sat() as i64,
                });
            } else if let Some(utxo) = utxos::get_utxo(&self.db, &prev_out)? {
                resolved_inputs.push(ResolvedCoin {
                    script: utxo.script,
                    value: utxo.value,
                });
            } else {
                return Err(Error::Rejected {
                    txid,
                    missing: prev_out,
                });
            }
        }
        let verdict = self.validate_mempool_tokens(&tx, txid, &mempool)?;
        let scripts = {
            let mut scripts = Vec::new();
            for output in &tx.output {
                push_script(&mut scripts, ScriptPayload::from_script(&output.script_pubkey));
            }
            for coin in &resolved_inputs {
                push_script(
                    &mut scripts,
                    ScriptPayload::from_script(Script::from_bytes(&coin.script)),
                );
            }
            scripts
        };
        mempool.insert(MempoolTx {
            tx,
            txid,
            time_first_seen,
            resolved_inputs,
            verdict,
            scripts: scripts.clone(),
        });
        tracing::debug!(%txid, "Added mempool tx");
        Ok(Some(MempoolAdded { txid, scripts }))
    }

    fn validate_mempool_tokens(
        &self,
        tx: &Transaction,
        txid: Txid,
        mempool: &Mempool,
    ) -> Result<Option<DbTokenVerdict>> {
        let parsed: ParsedTokenTx = match tokendex_slp::parse_tx(txid, tx) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(None),
            Err(err) => {
                return Ok(Some(DbTokenVerdict::Invalid {
                    burns: vec![None; tx.input.len()],
                    error: err.to_string(),
                }));
            }
        };
        let mut spent_tokens = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let prev_out = input.previous_output;
            let spent = if let Some(entry) = mempool.get(&prev_out.txid) {
                entry
                    .verdict
                    .as_ref()
                    .and_then(|verdict| verdict.spent_token(prev_out.vout))
            } else if let Some(tx_num) = txs::tx_num_by_txid(&self.db, &prev_out.txid)? {
                tokens::get_verdict(&self.db, tx_num)?
                    .and_then(|verdict| verdict.spent_token(prev_out.vout))
            } else {
                None
            };
            spent_tokens.push(spent);
        }
        Ok(Some(match tokendex_slp::validate(&parsed, &spent_tokens) {
            Ok(data) => DbTokenVerdict::Valid(data),
            Err(err) => DbTokenVerdict::Invalid {
                burns: tokendex_slp::burn_all(&spent_tokens),
                error: err.to_string(),
            },
        }))
    }

    /// Evict an unconfirmed transaction. Unknown txids are a no-op.
    pub fn remove_mempool_tx(&self, txid: &Txid) -> Result<Option<MempoolRemoved>> {
        let mut mempool = self.mempool.write();
        Ok(mempool.remove(txid).map(|entry| {
            tracing::debug!(%txid, "Removed mempool tx");
            MempoolRemoved {
                txid: *txid,
                scripts: entry.scripts,
            }
        }))
    }

    /// Number of unconfirmed transactions.
    pub fn mempool_len(&self) -> usize {
        self.mempool.read().len()
    }

    // ========== Reads ==========

    pub fn get_tx(&self, txid: &Txid) -> Result<Option<RichTx>> {
        let mempool = self.mempool.read();
        if let Some(entry) = mempool.get(txid) {
            return Ok(Some(self.rich_tx_from_mempool(entry, &mempool)));
        }
        match txs::tx_by_txid(&self.db, txid)? {
            Some((tx_num, db_tx)) => Ok(Some(self.rich_tx_from_db(tx_num, &db_tx, &mempool)?)),
            None => Ok(None),
        }
    }

    pub fn get_block(&self, key: HashOrHeight) -> Result<Option<StoredBlock>> {
        let db_block = match key {
            HashOrHeight::Hash(hash) => blocks::block_by_hash(&self.db, &hash)?,
            HashOrHeight::Height(height) => blocks::block_by_height(&self.db, height)?,
        };
        let Some(db_block) = db_block else {
            return Ok(None);
        };
        let mut txids = Vec::with_capacity(db_block.info.num_txs as usize);
        for tx_num in db_block.first_tx_num..db_block.first_tx_num + db_block.info.num_txs {
            let db_tx = txs::tx_by_num(&self.db, tx_num)?
                .ok_or_else(|| Error::Inconsistent(format!("Tx {tx_num} missing")))?;
            txids.push(db_tx.txid);
        }
        Ok(Some(StoredBlock {
            info: db_block.info,
            txids,
        }))
    }

    /// Header/stats for all blocks in `[start, end]`, ascending; heights
    /// beyond the tip are simply absent.
    pub fn get_blocks_range(&self, start: i32, end: i32) -> Result<Vec<BlockInfo>> {
        let mut infos = Vec::new();
        let mut height = start.max(0);
        while height <= end {
            match blocks::block_by_height(&self.db, height)? {
                Some(db_block) => infos.push(db_block.info),
                None => break,
            }
            height += 1;
        }
        Ok(infos)
    }

    /// All UTXOs paying to `script`: confirmed ones not spent by the
    /// mempool, then mempool-created ones.
    pub fn get_utxos_for_script(&self, script: &ScriptPayload) -> Result<Vec<Utxo>> {
        let mempool = self.mempool.read();
        let mut result = Vec::new();
        for outpoint in utxos::outpoints_for_script(&self.db, script)? {
            if mempool.is_spent(&outpoint) {
                continue;
            }
            let utxo = utxos::get_utxo(&self.db, &outpoint)?.ok_or_else(|| {
                Error::Inconsistent(format!("Indexed UTXO {outpoint} missing"))
            })?;
            result.push(Utxo {
                outpoint,
                block_height: utxo.block_height,
                is_coinbase: utxo.is_coinbase,
                value: utxo.value,
                output_script: ScriptBuf::from_bytes(utxo.script),
                token: utxo.token,
                network: self.network,
            });
        }
        for outpoint in mempool.utxos_for_script(script) {
            let entry = mempool.get(&outpoint.txid).ok_or_else(|| {
                Error::Inconsistent(format!("Mempool UTXO {outpoint} missing"))
            })?;
            let output = &entry.tx.output[outpoint.vout as usize];
            let token = entry.verdict.as_ref().and_then(|verdict| {
                let data = verdict.data()?;
                let amount = verdict.output_token(outpoint.vout)?;
                Some(UtxoTokenData {
                    meta: data.meta(),
                    amount,
                })
            });
            result.push(Utxo {
                outpoint,
                block_height: -1,
                is_coinbase: false,
                value: output.value.to_sat() as i64,
                output_script: output.script_pubkey.clone(),
                token,
                network: self.network,
            });
        }
        Ok(result)
    }

    /// One page of a script's history in the canonical total order:
    /// confirmed transactions ascending by chain position, then unconfirmed
    /// ones in arrival order. Returns the page and the total page count.
    pub fn get_history_page(
        &self,
        script: &ScriptPayload,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<RichTx>, usize)> {
        if page_size == 0 {
            return Ok((Vec::new(), 0));
        }
        let mempool = self.mempool.read();
        let confirmed = history::tx_nums_for_script(&self.db, script)?;
        let unconfirmed = mempool.txids_for_script(script);
        let total = confirmed.len() + unconfirmed.len();
        let num_pages = total.div_ceil(page_size);
        let start = page.saturating_mul(page_size);
        let mut page_txs = Vec::new();
        for idx in start..(start + page_size).min(total) {
            if idx < confirmed.len() {
                let tx_num = confirmed[idx];
                let db_tx = txs::tx_by_num(&self.db, tx_num)?
                    .ok_or_else(|| Error::Inconsistent(format!("Tx {tx_num} missing")))?;
                page_txs.push(self.rich_tx_from_db(tx_num, &db_tx, &mempool)?);
            } else {
                let txid = unconfirmed[idx - confirmed.len()];
                let entry = mempool.get(&txid).ok_or_else(|| {
                    Error::Inconsistent(format!("Mempool tx {txid} missing"))
                })?;
                page_txs.push(self.rich_tx_from_mempool(entry, &mempool));
            }
        }
        Ok((page_txs, num_pages))
    }

    /// Classify an outpoint for validation queries. Never fails on unknown
    /// or malformed references; those are verdicts, not errors.
    pub fn utxo_state(&self, outpoint: &OutPoint) -> Result<UtxoState> {
        let mempool = self.mempool.read();
        if let Some(entry) = mempool.get(&outpoint.txid) {
            if outpoint.vout as usize >= entry.tx.output.len() {
                return Ok(UtxoState {
                    height: None,
                    variant: UtxoStateVariant::NoSuchOutput,
                });
            }
            let variant = if mempool.is_spent(outpoint) {
                UtxoStateVariant::Spent
            } else {
                UtxoStateVariant::Unspent
            };
            return Ok(UtxoState {
                height: None,
                variant,
            });
        }
        let Some((_, db_tx)) = txs::tx_by_txid(&self.db, &outpoint.txid)? else {
            return Ok(UtxoState {
                height: None,
                variant: UtxoStateVariant::NoSuchTx,
            });
        };
        let height = Some(db_tx.block_height);
        if outpoint.vout as usize >= db_tx.outputs.len() {
            return Ok(UtxoState {
                height,
                variant: UtxoStateVariant::NoSuchOutput,
            });
        }
        let spent =
            spends::get_spend(&self.db, outpoint)?.is_some() || mempool.is_spent(outpoint);
        Ok(UtxoState {
            height,
            variant: if spent {
                UtxoStateVariant::Spent
            } else {
                UtxoStateVariant::Unspent
            },
        })
    }

    /// Metadata of a token by id, if its GENESIS is indexed.
    pub fn token_meta(&self, token_id: &TokenId) -> Result<Option<(TokenMeta, GenesisInfo)>> {
        Ok(tokens::get_token_meta(&self.db, token_id)?
            .map(|meta| (meta.token_meta(*token_id), meta.genesis_info)))
    }

    // ========== RichTx assembly ==========

    fn rich_tx_from_db(
        &self,
        tx_num: TxNum,
        db_tx: &DbTx,
        mempool: &Mempool,
    ) -> Result<RichTx> {
        let verdict = tokens::get_verdict(&self.db, tx_num)?;
        let block = blocks::block_by_height(&self.db, db_tx.block_height)?.ok_or_else(|| {
            Error::Inconsistent(format!("Block {} missing", db_tx.block_height))
        })?;
        let data = verdict.as_ref().and_then(DbTokenVerdict::data);
        let burns = verdict.as_ref().map(|verdict| match verdict {
            DbTokenVerdict::Valid(data) => &data.burns,
            DbTokenVerdict::Invalid { burns, .. } => burns,
        });
        let inputs = db_tx
            .inputs
            .iter()
            .enumerate()
            .map(|(vin, input)| RichTxInput {
                prev_out: input.prev_out,
                input_script: ScriptBuf::from_bytes(input.script.clone()),
                output_script: input
                    .spent_script
                    .as_ref()
                    .map(|script| ScriptBuf::from_bytes(script.clone())),
                value: input.spent_value,
                sequence: input.sequence,
                token: data
                    .and_then(|data| data.input_tokens.get(vin).copied())
                    .filter(|token| !token.is_empty()),
                token_burn: burns.and_then(|burns| burns.get(vin).cloned().flatten()),
            })
            .collect();
        let mut outputs = Vec::with_capacity(db_tx.outputs.len());
        for (vout, output) in db_tx.outputs.iter().enumerate() {
            let outpoint = OutPoint {
                txid: db_tx.txid,
                vout: vout as u32,
            };
            let spent_by = match spends::get_spend(&self.db, &outpoint)? {
                Some(spend) => Some(spend.spent_by()),
                None => mempool.spender_of(&outpoint),
            };
            outputs.push(RichTxOutput {
                value: output.value,
                output_script: ScriptBuf::from_bytes(output.script.clone()),
                token: verdict
                    .as_ref()
                    .and_then(|verdict| verdict.output_token(vout as u32)),
                spent_by,
            });
        }
        Ok(RichTx {
            txid: db_tx.txid,
            version: db_tx.version,
            inputs,
            outputs,
            lock_time: db_tx.lock_time,
            token: data.cloned(),
            token_error_msg: verdict
                .as_ref()
                .and_then(|verdict| verdict.error().map(String::from)),
            status: TxStatus::Confirmed(BlockMetadata {
                hash: block.info.hash,
                height: block.info.height,
                timestamp: block.info.timestamp,
            }),
            time_first_seen: db_tx.time_first_seen,
            network: self.network,
        })
    }

    fn rich_tx_from_mempool(&self, entry: &MempoolTx, mempool: &Mempool) -> RichTx {
        let data = entry.verdict.as_ref().and_then(DbTokenVerdict::data);
        let burns = entry.verdict.as_ref().map(|verdict| match verdict {
            DbTokenVerdict::Valid(data) => &data.burns,
            DbTokenVerdict::Invalid { burns, .. } => burns,
        });
        let inputs = entry
            .tx
            .input
            .iter()
            .zip(&entry.resolved_inputs)
            .enumerate()
            .map(|(vin, (input, coin))| RichTxInput {
                prev_out: input.previous_output,
                input_script: ScriptBuf::from_bytes(input.script_sig.to_bytes()),
                output_script: Some(ScriptBuf::from_bytes(coin.script.clone())),
                value: coin.value,
                sequence: input.sequence.0,
                token: data
                    .and_then(|data| data.input_tokens.get(vin).copied())
                    .filter(|token| !token.is_empty()),
                token_burn: burns.and_then(|burns| burns.get(vin).cloned().flatten()),
            })
            .collect();
        let outputs = entry
            .tx
            .output
            .iter()
            .enumerate()
            .map(|(vout, output)| RichTxOutput {
                value: output.value.to_sat() as i64,
                output_script: output.script_pubkey.clone(),
                token: entry
                    .verdict
                    .as_ref()
                    .and_then(|verdict| verdict.output_token(vout as u32)),
                spent_by: mempool.spender_of(&OutPoint {
                    txid: entry.txid,
                    vout: vout as u32,
                }),
            })
            .collect();
        RichTx {
            txid: entry.txid,
            version: entry.tx.version.0,
            inputs,
            outputs,
            lock_time: entry.tx.lock_time.to_consensus_u32(),
            token: data.cloned(),
            token_error_msg: entry
                .verdict
                .as_ref()
                .and_then(|verdict| verdict.error().map(String::from)),
            status: TxStatus::Mempool,
            time_first_seen: entry.time_first_seen,
            network: self.network,
        }
    }
}

fn build_db_tx(ptx: &PreparedTx, height: i32) -> DbTx {
    DbTx {
        txid: ptx.txid,
        version: ptx.tx.version.0,
        inputs: ptx
            .tx
            .input
            .iter()
            .zip(&ptx.inputs)
            .map(|(input, resolved)| DbTxInput {
                prev_out: input.previous_output,
                script: input.script_sig.to_bytes(),
                sequence: input.sequence.0,
                spent_script: resolved.spent_script().map(<[u8]>::to_vec),
                spent_value: resolved.spent_value(),
            })
            .collect(),
        outputs: ptx
            .tx
            .output
            .iter()
            .map(|output| DbTxOutput {
                value: output.value.to_sat() as i64,
                script: output.script_pubkey.to_bytes(),
            })
            .collect(),
        lock_time: ptx.tx.lock_time.to_consensus_u32(),
        block_height: height,
        is_coinbase: ptx.is_coinbase,
        time_first_seen: ptx.time_first_seen,
    }
}

/// Scripts touched by a transaction's outputs and resolved inputs,
/// deduplicated, in first-touch order.
fn touched_scripts(tx: &Transaction, inputs: &[ResolvedInput]) -> Vec<ScriptPayload> {
    let mut scripts = Vec::new();
    for output in &tx.output {
        push_script(&mut scripts, ScriptPayload::from_script(&output.script_pubkey));
    }
    for input in inputs {
        let payload = input
            .spent_script()
            .and_then(|script| ScriptPayload::from_script(Script::from_bytes(script)));
        push_script(&mut scripts, payload);
    }
    scripts
}

fn push_script(scripts: &mut Vec<ScriptPayload>, payload: Option<ScriptPayload>) {
    if let Some(payload) = payload {
        if !scripts.contains(&payload) {
            scripts.push(payload);
        }
    }
}

fn db_tx_scripts(db_tx: &DbTx) -> Vec<ScriptPayload> {
    let mut scripts = Vec::new();
    for output in &db_tx.outputs {
        push_script(
            &mut scripts,
            ScriptPayload::from_script(Script::from_bytes(&output.script)),
        );
    }
    for input in &db_tx.inputs {
        let payload = input
            .spent_script
            .as_ref()
            .and_then(|script| ScriptPayload::from_script(Script::from_bytes(script)));
        push_script(&mut scripts, payload);
    }
    scripts
}
