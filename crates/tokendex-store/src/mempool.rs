//! In-memory mempool state.
//!
//! Holds every accepted unconfirmed transaction together with its resolved
//! inputs and token verdict, plus the derived views the queries need: a
//! per-script arrival-ordered history index, the set of outpoints spent by
//! mempool transactions, and the mempool-created unspent outputs per script.
//!
//! Chained unconfirmed spends are permitted: a transaction may spend outputs
//! of other mempool transactions.

use std::collections::{BTreeSet, HashMap};

use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use indexmap::IndexSet;
use tokendex_primitives::ScriptPayload;

use crate::tokens::DbTokenVerdict;

/// Script and value of the output an input spends, resolved at acceptance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCoin {
    pub script: Vec<u8>,
    pub value: i64,
}

/// An unconfirmed transaction with everything derived at acceptance time.
#[derive(Debug, Clone)]
pub struct MempoolTx {
    pub tx: Transaction,
    pub txid: Txid,
    pub time_first_seen: i64,
    /// Index-aligned with `tx.input`.
    pub resolved_inputs: Vec<ResolvedCoin>,
    pub verdict: Option<DbTokenVerdict>,
    /// Scripts touched by inputs and outputs, deduplicated.
    pub scripts: Vec<ScriptPayload>,
}

#[derive(Debug, Default)]
pub struct Mempool {
    txs: HashMap<Txid, MempoolTx>,
    /// Script key -> txids in arrival order.
    by_script: HashMap<Vec<u8>, IndexSet<Txid>>,
    /// Spent outpoint -> spending input (txid, input index).
    spends: HashMap<OutPoint, OutPoint>,
    /// Script key -> unspent outpoints created by mempool txs.
    script_utxos: HashMap<Vec<u8>, BTreeSet<OutPoint>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txid: &Txid) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Txid) -> Option<&MempoolTx> {
        self.txs.get(txid)
    }

    /// Output of a mempool transaction, for resolving chained spends.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.txs
            .get(&outpoint.txid)?
            .tx
            .output
            .get(outpoint.vout as usize)
    }

    /// The input spending `outpoint`, if any mempool tx consumes it.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<OutPoint> {
        self.spends.get(outpoint).copied()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spends.contains_key(outpoint)
    }

    /// Txids touching `script`, in arrival order.
    pub fn txids_for_script(&self, script: &ScriptPayload) -> Vec<Txid> {
        self.by_script
            .get(&script.to_key_bytes())
            .map(|txids| txids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Unspent mempool-created outpoints paying to `script`.
    pub fn utxos_for_script(&self, script: &ScriptPayload) -> Vec<OutPoint> {
        self.script_utxos
            .get(&script.to_key_bytes())
            .map(|outpoints| outpoints.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Mempool txs spending outputs of `txid`.
    pub fn children_of(&self, txid: &Txid, num_outputs: usize) -> Vec<Txid> {
        let mut children = Vec::new();
        for vout in 0..num_outputs as u32 {
            if let Some(spender) = self.spends.get(&OutPoint { txid: *txid, vout }) {
                children.push(spender.txid);
            }
        }
        children.dedup();
        children
    }

    pub fn insert(&mut self, entry: MempoolTx) {
        let txid = entry.txid;
        for script in &entry.scripts {
            self.by_script
                .entry(script.to_key_bytes())
                .or_default()
                .insert(txid);
        }
        for (vin, input) in entry.tx.input.iter().enumerate() {
            let prev_out = input.previous_output;
            self.spends.insert(
                prev_out,
                OutPoint {
                    txid,
                    vout: vin as u32,
                },
            );
            // A chained spend consumes a mempool-created output.
            if let Some(parent) = self.txs.get(&prev_out.txid) {
                if let Some(output) = parent.tx.output.get(prev_out.vout as usize) {
                    if let Some(script) = ScriptPayload::from_script(&output.script_pubkey) {
                        if let Some(outpoints) = self.script_utxos.get_mut(&script.to_key_bytes()) {
                            outpoints.remove(&prev_out);
                        }
                    }
                }
            }
        }
        for (vout, output) in entry.tx.output.iter().enumerate() {
            let outpoint = OutPoint {
                txid,
                vout: vout as u32,
            };
            // A reorged-out parent can be requeued after a child that
            // already spends it.
            if self.spends.contains_key(&outpoint) {
                continue;
            }
            let Some(script) = ScriptPayload::from_script(&output.script_pubkey) else {
                continue;
            };
            self.script_utxos
                .entry(script.to_key_bytes())
                .or_default()
                .insert(outpoint);
        }
        self.txs.insert(txid, entry);
    }

    /// Remove a transaction, restoring any still-present parent outputs to
    /// the unspent view. Used both for confirmation and eviction.
    pub fn remove(&mut self, txid: &Txid) -> Option<MempoolTx> {
        let entry = self.txs.remove(txid)?;
        for script in &entry.scripts {
            let key = script.to_key_bytes();
            if let Some(txids) = self.by_script.get_mut(&key) {
                txids.shift_remove(txid);
                if txids.is_empty() {
                    self.by_script.remove(&key);
                }
            }
        }
        for (vout, output) in entry.tx.output.iter().enumerate() {
            let Some(script) = ScriptPayload::from_script(&output.script_pubkey) else {
                continue;
            };
            let key = script.to_key_bytes();
            if let Some(outpoints) = self.script_utxos.get_mut(&key) {
                outpoints.remove(&OutPoint {
                    txid: *txid,
                    vout: vout as u32,
                });
                if outpoints.is_empty() {
                    self.script_utxos.remove(&key);
                }
            }
        }
        for input in &entry.tx.input {
            let prev_out = input.previous_output;
            self.spends.remove(&prev_out);
            // If the parent is still unconfirmed, its output is unspent
            // again.
            if let Some(parent) = self.txs.get(&prev_out.txid) {
                if let Some(output) = parent.tx.output.get(prev_out.vout as usize) {
                    if let Some(script) = ScriptPayload::from_script(&output.script_pubkey) {
                        self.script_utxos
                            .entry(script.to_key_bytes())
                            .or_default()
                            .insert(prev_out);
                    }
                }
            }
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, Sequence, TxIn, Witness};

    fn p2pkh_script(byte: u8) -> ScriptBuf {
        ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::from_byte_array([byte; 20]))
    }

    fn entry(prev_outs: &[OutPoint], script_byte: u8) -> MempoolTx {
        let tx = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: prev_outs
                .iter()
                .map(|&prev_out| TxIn {
                    previous_output: prev_out,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: p2pkh_script(script_byte),
            }],
        };
        let txid = tx.compute_txid();
        let scripts = vec![ScriptPayload::from_script(&p2pkh_script(script_byte)).unwrap()];
        MempoolTx {
            tx,
            txid,
            time_first_seen: 0,
            resolved_inputs: vec![
                ResolvedCoin {
                    script: vec![],
                    value: 0,
                };
                prev_outs.len()
            ],
            verdict: None,
            scripts,
        }
    }

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint {
            txid: Txid::from_byte_array([byte; 32]),
            vout,
        }
    }

    #[test]
    fn test_insert_and_remove_roundtrip() {
        let mut mempool = Mempool::new();
        let parent = entry(&[outpoint(1, 0)], 0xaa);
        let parent_txid = parent.txid;
        let script = parent.scripts[0].clone();
        mempool.insert(parent);

        assert!(mempool.contains(&parent_txid));
        assert!(mempool.is_spent(&outpoint(1, 0)));
        assert_eq!(mempool.txids_for_script(&script), vec![parent_txid]);
        assert_eq!(
            mempool.utxos_for_script(&script),
            vec![OutPoint {
                txid: parent_txid,
                vout: 0,
            }]
        );

        mempool.remove(&parent_txid).unwrap();
        assert!(mempool.is_empty());
        assert!(!mempool.is_spent(&outpoint(1, 0)));
        assert!(mempool.txids_for_script(&script).is_empty());
        assert!(mempool.utxos_for_script(&script).is_empty());
    }

    #[test]
    fn test_chained_spend_consumes_parent_output() {
        let mut mempool = Mempool::new();
        let parent = entry(&[outpoint(1, 0)], 0xaa);
        let parent_txid = parent.txid;
        let parent_script = parent.scripts[0].clone();
        mempool.insert(parent);

        let parent_out = OutPoint {
            txid: parent_txid,
            vout: 0,
        };
        let child = entry(&[parent_out], 0xbb);
        let child_txid = child.txid;
        mempool.insert(child);

        // The parent's output is spent in-mempool.
        assert!(mempool.utxos_for_script(&parent_script).is_empty());
        assert_eq!(
            mempool.spender_of(&parent_out),
            Some(OutPoint {
                txid: child_txid,
                vout: 0,
            })
        );
        assert_eq!(mempool.children_of(&parent_txid, 1), vec![child_txid]);

        // Evicting the child restores the parent's output.
        mempool.remove(&child_txid).unwrap();
        assert_eq!(mempool.utxos_for_script(&parent_script), vec![parent_out]);
    }

    #[test]
    fn test_arrival_order_is_preserved() {
        let mut mempool = Mempool::new();
        let first = entry(&[outpoint(1, 0)], 0xaa);
        let second = entry(&[outpoint(2, 0)], 0xaa);
        let script = first.scripts[0].clone();
        let (first_txid, second_txid) = (first.txid, second.txid);
        mempool.insert(first);
        mempool.insert(second);
        assert_eq!(
            mempool.txids_for_script(&script),
            vec![first_txid, second_txid]
        );
    }
}
