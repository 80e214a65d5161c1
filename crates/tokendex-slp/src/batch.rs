//! Block-level validation.
//!
//! Transactions within one block may spend each other's outputs, so their
//! verdicts depend on each other. The batch validator repeatedly processes
//! every transaction whose inputs' token states are all known, publishing its
//! output tokens for the rest of the batch, until no transaction is left. A
//! round that makes no progress means the remaining transactions reference
//! each other in a cycle, which cannot occur in a valid block.

use std::collections::{BTreeSet, HashMap, HashSet};

use bitcoin::Transaction;
use thiserror::Error;
use tokendex_primitives::{TokenBurn, TokenTxData, TxNum};

use crate::validate::burn_all;
use crate::{ParsedTokenTx, SpentToken, validate};

/// A token transaction queued for batch validation.
pub struct BatchTokenTx<'a> {
    pub tx: &'a Transaction,
    pub parsed: ParsedTokenTx,
    /// Ordinal of each input's spent transaction; `None` for inputs the
    /// index has no transaction for (coinbase).
    pub input_tx_nums: Vec<Option<TxNum>>,
}

/// Verdict for a transaction whose declaration failed validation.
///
/// The transaction is still indexed; everything it consumed is burned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTokenTx {
    pub burns: Vec<Option<TokenBurn>>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("Batch contains txs forming a cycle: {0:?}")]
    FoundTxCircle(BTreeSet<TxNum>),
}

/// Validate a batch of token transactions in dependency order.
///
/// `known_outputs` maps `(tx_num, vout)` of already-validated outputs to
/// their token state (`None` = no token value); it is extended with the
/// batch's own outputs as they validate. Outpoints that are neither in
/// `known_outputs` nor produced by the batch are assumed token-free.
pub fn validate_batch(
    mut txs: HashMap<TxNum, BatchTokenTx<'_>>,
    mut known_outputs: HashMap<(TxNum, u32), Option<SpentToken>>,
) -> Result<(HashMap<TxNum, TokenTxData>, HashMap<TxNum, InvalidTokenTx>), BatchError> {
    let mut valid = HashMap::new();
    let mut invalid = HashMap::new();
    let batch_tx_nums = txs.keys().copied().collect::<HashSet<_>>();
    loop {
        let mut deferred = HashMap::new();
        let mut made_progress = false;
        'tx_loop: for (tx_num, batch_tx) in txs {
            for (input, &input_tx_num) in batch_tx.tx.input.iter().zip(&batch_tx.input_tx_nums) {
                let Some(input_tx_num) = input_tx_num else {
                    continue;
                };
                let outpoint = (input_tx_num, input.previous_output.vout);
                if !known_outputs.contains_key(&outpoint) && batch_tx_nums.contains(&input_tx_num)
                {
                    // Spends a batch sibling that has not validated yet.
                    deferred.insert(tx_num, batch_tx);
                    continue 'tx_loop;
                }
            }
            made_progress = true;
            let spent_tokens = batch_tx
                .tx
                .input
                .iter()
                .zip(&batch_tx.input_tx_nums)
                .map(|(input, &input_tx_num)| {
                    let outpoint = (input_tx_num?, input.previous_output.vout);
                    known_outputs.get(&outpoint).cloned().flatten()
                })
                .collect::<Vec<_>>();
            match validate(&batch_tx.parsed, &spent_tokens) {
                Ok(data) => {
                    for (vout, &token) in data.output_tokens.iter().enumerate() {
                        let spent = (!token.is_empty()).then(|| SpentToken {
                            token_id: data.token_id,
                            token_type: data.token_type,
                            token,
                            group_token_id: data.group_token_id,
                        });
                        known_outputs.insert((tx_num, vout as u32), spent);
                    }
                    valid.insert(tx_num, data);
                }
                Err(err) => {
                    for vout in 0..batch_tx.tx.output.len() {
                        known_outputs.insert((tx_num, vout as u32), None);
                    }
                    invalid.insert(
                        tx_num,
                        InvalidTokenTx {
                            burns: burn_all(&spent_tokens),
                            error: err.to_string(),
                        },
                    );
                }
            }
        }
        if deferred.is_empty() {
            return Ok((valid, invalid));
        }
        if !made_progress {
            return Err(BatchError::FoundTxCircle(deferred.into_keys().collect()));
        }
        txs = deferred;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Txid, Witness};
    use tokendex_primitives::{GenesisInfo, TokenAmount, TokenId, TokenType};

    use crate::ParsedTxType;

    fn make_tx(prev_vouts: &[u32], num_outputs: usize) -> Transaction {
        Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: prev_vouts
                .iter()
                .map(|&vout| TxIn {
                    previous_output: OutPoint {
                        txid: Txid::all_zeros(),
                        vout,
                    },
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![
                TxOut {
                    value: Amount::from_sat(546),
                    script_pubkey: ScriptBuf::new(),
                };
                num_outputs
            ],
        }
    }

    fn genesis_decl(token_id: TokenId, quantity: u64) -> ParsedTokenTx {
        ParsedTokenTx {
            token_type: TokenType::Fungible,
            tx_type: ParsedTxType::Genesis(GenesisInfo::default()),
            token_id,
            output_tokens: vec![TokenAmount::EMPTY, TokenAmount::amount(quantity)],
        }
    }

    fn send_decl(token_id: TokenId, amounts: &[u64]) -> ParsedTokenTx {
        let mut output_tokens = vec![TokenAmount::EMPTY];
        output_tokens.extend(amounts.iter().map(|&amount| TokenAmount::amount(amount)));
        ParsedTokenTx {
            token_type: TokenType::Fungible,
            tx_type: ParsedTxType::Send,
            token_id,
            output_tokens,
        }
    }

    #[test]
    fn test_batch_orders_genesis_before_send() {
        let token_id = TokenId::from_bytes([10; 32]);
        let genesis_tx = make_tx(&[0], 2);
        let send_tx = make_tx(&[1], 2);
        // HashMap iteration order varies; repeat to cover both directions.
        for _ in 0..20 {
            let txs = HashMap::from([
                (
                    2,
                    BatchTokenTx {
                        tx: &genesis_tx,
                        parsed: genesis_decl(token_id, 10),
                        input_tx_nums: vec![Some(1)],
                    },
                ),
                (
                    3,
                    BatchTokenTx {
                        tx: &send_tx,
                        parsed: send_decl(token_id, &[10]),
                        input_tx_nums: vec![Some(2)],
                    },
                ),
            ]);
            let (valid, invalid) = validate_batch(txs, HashMap::new()).unwrap();
            assert!(invalid.is_empty());
            assert_eq!(valid.len(), 2);
            assert_eq!(valid[&3].input_tokens, vec![TokenAmount::amount(10)]);
            assert_eq!(valid[&3].burns, vec![None]);
        }
    }

    #[test]
    fn test_batch_detects_cycle() {
        let token_id = TokenId::from_bytes([10; 32]);
        let tx_a = make_tx(&[1], 2);
        let tx_b = make_tx(&[1], 2);
        for _ in 0..20 {
            let txs = HashMap::from([
                (
                    1,
                    BatchTokenTx {
                        tx: &tx_a,
                        parsed: send_decl(token_id, &[1]),
                        input_tx_nums: vec![Some(2)],
                    },
                ),
                (
                    2,
                    BatchTokenTx {
                        tx: &tx_b,
                        parsed: send_decl(token_id, &[1]),
                        input_tx_nums: vec![Some(1)],
                    },
                ),
            ]);
            assert_eq!(
                validate_batch(txs, HashMap::new()),
                Err(BatchError::FoundTxCircle(BTreeSet::from([1, 2])))
            );
        }
    }

    #[test]
    fn test_batch_overspend_invalidates_downstream() {
        let token_id = TokenId::from_bytes([10; 32]);
        let genesis_tx = make_tx(&[0], 2);
        let overspend_tx = make_tx(&[1], 2);
        let downstream_tx = make_tx(&[1], 2);
        for _ in 0..20 {
            let txs = HashMap::from([
                (
                    5,
                    BatchTokenTx {
                        tx: &genesis_tx,
                        parsed: genesis_decl(token_id, 3),
                        input_tx_nums: vec![Some(1)],
                    },
                ),
                (
                    6,
                    BatchTokenTx {
                        tx: &overspend_tx,
                        parsed: send_decl(token_id, &[4]),
                        input_tx_nums: vec![Some(5)],
                    },
                ),
                (
                    7,
                    BatchTokenTx {
                        tx: &downstream_tx,
                        parsed: send_decl(token_id, &[1]),
                        input_tx_nums: vec![Some(6)],
                    },
                ),
            ]);
            let (valid, invalid) = validate_batch(txs, HashMap::new()).unwrap();
            assert_eq!(valid.len(), 1);
            assert!(valid.contains_key(&5));
            // The overspend burns its input; the downstream spend then has no
            // token input at all.
            assert_eq!(
                invalid[&6].burns,
                vec![Some(TokenBurn {
                    token: TokenAmount::amount(3),
                    token_id,
                })]
            );
            assert_eq!(invalid[&7].burns, vec![None]);
        }
    }

    #[test]
    fn test_batch_uses_known_outputs() {
        let token_id = TokenId::from_bytes([10; 32]);
        let send_tx = make_tx(&[1], 2);
        let known = HashMap::from([(
            (4, 1),
            Some(SpentToken {
                token_id,
                token_type: TokenType::Fungible,
                token: TokenAmount::amount(6),
                group_token_id: None,
            }),
        )]);
        let txs = HashMap::from([(
            9,
            BatchTokenTx {
                tx: &send_tx,
                parsed: send_decl(token_id, &[6]),
                input_tx_nums: vec![Some(4)],
            },
        )]);
        let (valid, invalid) = validate_batch(txs, known).unwrap();
        assert!(invalid.is_empty());
        assert_eq!(valid[&9].input_tokens, vec![TokenAmount::amount(6)]);
    }
}
