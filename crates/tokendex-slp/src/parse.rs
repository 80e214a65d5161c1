//! Decoding of token declarations.
//!
//! A token transaction declares itself in an OP_RETURN script at output 0:
//! the LOKAD id `"SLP\0"`, a token-type byte, a tx-type string and the
//! type-specific fields, every field a plain push. Non-token transactions
//! (no such OP_RETURN) parse to `None`; transactions that carry the LOKAD id
//! but violate the format produce a [`ParseError`], which the indexer records
//! as the transaction's token error message.

use bitcoin::Transaction;
use thiserror::Error;
use tokendex_primitives::{GenesisInfo, TokenAmount, TokenId, TokenType};

use crate::{ParsedTokenTx, ParsedTxType};

/// `OP_RETURN` followed by a 4-byte push of the LOKAD id.
const SLP_MARKER: [u8; 6] = [0x6a, 0x04, b'S', b'L', b'P', 0x00];

const TOKEN_TYPE_FUNGIBLE: u8 = 0x01;
const TOKEN_TYPE_NFT1_CHILD: u8 = 0x41;
const TOKEN_TYPE_NFT1_GROUP: u8 = 0x81;

const MAX_SEND_AMOUNTS: usize = 19;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("Declaration contains non-push opcode 0x{0:02x}")]
    NonPushOpcode(u8),

    #[error("Declaration push truncated")]
    TruncatedPush,

    #[error("Too few fields for {tx_type}: expected {expected}, got {actual}")]
    TooFewFields {
        tx_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Too many fields for {tx_type}: expected {expected}, got {actual}")]
    TooManyFields {
        tx_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Token type field must be 1 or 2 bytes, got {0}")]
    InvalidTokenTypeSize(usize),

    #[error("Unknown tx type: {0:?}")]
    UnknownTxType(Vec<u8>),

    #[error("Field {field} must be {expected} bytes, got {actual}")]
    InvalidFieldSize {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Document hash must be 0 or 32 bytes, got {0}")]
    InvalidDocumentHashSize(usize),

    #[error("Decimals must be at most 9, got {0}")]
    InvalidDecimals(u8),

    #[error("Mint baton output index must be at least 2, got {0}")]
    InvalidMintBatonIdx(u8),

    #[error("NFT1 child GENESIS must have 0 decimals, got {0}")]
    Nft1ChildDecimals(u8),

    #[error("NFT1 child GENESIS must mint exactly 1 token, got {0}")]
    Nft1ChildQuantity(u64),

    #[error("NFT1 child GENESIS must not declare a mint baton")]
    Nft1ChildMintBaton,

    #[error("SEND must declare between 1 and 19 output amounts, got {0}")]
    InvalidSendAmountCount(usize),

    #[error("Declared token output index {idx} exceeds the last output index {last}")]
    OutputIdxOutOfRange { idx: usize, last: usize },
}

/// Decode the token declaration of `tx`, if it carries one.
///
/// `Ok(None)` means the transaction is not a token transaction at all.
pub fn parse_tx(
    txid: bitcoin::Txid,
    tx: &Transaction,
) -> Result<Option<ParsedTokenTx>, ParseError> {
    let Some(first_output) = tx.output.first() else {
        return Ok(None);
    };
    let script = first_output.script_pubkey.as_bytes();
    if !script.starts_with(&SLP_MARKER) {
        return Ok(None);
    }
    let num_outputs = tx.output.len();
    let pushes = parse_pushes(&script[1..])?;
    // pushes[0] is the LOKAD id, already checked via the marker prefix.
    if pushes.len() < 3 {
        return Err(ParseError::TooFewFields {
            tx_type: "token declaration",
            expected: 3,
            actual: pushes.len(),
        });
    }
    let token_type = match pushes[1].as_slice() {
        [TOKEN_TYPE_FUNGIBLE] => TokenType::Fungible,
        [TOKEN_TYPE_NFT1_GROUP] => TokenType::Nft1Group,
        [TOKEN_TYPE_NFT1_CHILD] => TokenType::Nft1Child,
        bytes if bytes.len() == 1 || bytes.len() == 2 => {
            // Unknown token type: indexed, but carries no token value and
            // skips further field checks.
            return Ok(Some(ParsedTokenTx {
                token_type: TokenType::Unknown,
                tx_type: ParsedTxType::Unknown,
                token_id: TokenId::from_bytes([0; 32]),
                output_tokens: vec![TokenAmount::EMPTY; num_outputs],
            }));
        }
        bytes => return Err(ParseError::InvalidTokenTypeSize(bytes.len())),
    };
    match pushes[2].as_slice() {
        b"GENESIS" => parse_genesis(txid, token_type, &pushes, num_outputs),
        b"MINT" => parse_mint(token_type, &pushes, num_outputs),
        b"SEND" => parse_send(token_type, &pushes, num_outputs),
        other => Err(ParseError::UnknownTxType(other.to_vec())),
    }
    .map(Some)
}

fn parse_genesis(
    txid: bitcoin::Txid,
    token_type: TokenType,
    pushes: &[Vec<u8>],
    num_outputs: usize,
) -> Result<ParsedTokenTx, ParseError> {
    check_field_count("GENESIS", pushes, 10, 10)?;
    let doc_hash = match pushes[6].len() {
        0 => None,
        32 => {
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&pushes[6]);
            Some(hash)
        }
        len => return Err(ParseError::InvalidDocumentHashSize(len)),
    };
    let decimals = parse_byte_field("decimals", &pushes[7])?;
    if decimals > 9 {
        return Err(ParseError::InvalidDecimals(decimals));
    }
    let mint_baton_idx = parse_baton_idx(&pushes[8])?;
    let initial_quantity = parse_amount("initial quantity", &pushes[9])?;
    if token_type == TokenType::Nft1Child {
        if decimals != 0 {
            return Err(ParseError::Nft1ChildDecimals(decimals));
        }
        if initial_quantity != 1 {
            return Err(ParseError::Nft1ChildQuantity(initial_quantity));
        }
        if mint_baton_idx.is_some() {
            return Err(ParseError::Nft1ChildMintBaton);
        }
    }
    let mut output_tokens = vec![TokenAmount::EMPTY; num_outputs];
    if initial_quantity > 0 {
        set_output_token(&mut output_tokens, 1, TokenAmount::amount(initial_quantity))?;
    }
    if let Some(idx) = mint_baton_idx {
        set_output_token(&mut output_tokens, idx as usize, TokenAmount::MINT_BATON)?;
    }
    Ok(ParsedTokenTx {
        token_type,
        tx_type: ParsedTxType::Genesis(GenesisInfo {
            token_ticker: pushes[3].clone(),
            token_name: pushes[4].clone(),
            token_document_url: pushes[5].clone(),
            token_document_hash: doc_hash,
            decimals: decimals as u32,
        }),
        token_id: TokenId::new(txid),
        output_tokens,
    })
}

fn parse_mint(
    token_type: TokenType,
    pushes: &[Vec<u8>],
    num_outputs: usize,
) -> Result<ParsedTokenTx, ParseError> {
    check_field_count("MINT", pushes, 6, 6)?;
    let token_id = parse_token_id(&pushes[3])?;
    let mint_baton_idx = parse_baton_idx(&pushes[4])?;
    let additional_quantity = parse_amount("additional quantity", &pushes[5])?;
    let mut output_tokens = vec![TokenAmount::EMPTY; num_outputs];
    if additional_quantity > 0 {
        set_output_token(&mut output_tokens, 1, TokenAmount::amount(additional_quantity))?;
    }
    if let Some(idx) = mint_baton_idx {
        set_output_token(&mut output_tokens, idx as usize, TokenAmount::MINT_BATON)?;
    }
    Ok(ParsedTokenTx {
        token_type,
        tx_type: ParsedTxType::Mint,
        token_id,
        output_tokens,
    })
}

fn parse_send(
    token_type: TokenType,
    pushes: &[Vec<u8>],
    num_outputs: usize,
) -> Result<ParsedTokenTx, ParseError> {
    check_field_count("SEND", pushes, 5, 4 + MAX_SEND_AMOUNTS)?;
    let token_id = parse_token_id(&pushes[3])?;
    let amounts = &pushes[4..];
    if amounts.is_empty() || amounts.len() > MAX_SEND_AMOUNTS {
        return Err(ParseError::InvalidSendAmountCount(amounts.len()));
    }
    let mut output_tokens = vec![TokenAmount::EMPTY; num_outputs];
    for (idx, amount) in amounts.iter().enumerate() {
        let amount = parse_amount("send amount", amount)?;
        set_output_token(&mut output_tokens, idx + 1, TokenAmount::amount(amount))?;
    }
    Ok(ParsedTokenTx {
        token_type,
        tx_type: ParsedTxType::Send,
        token_id,
        output_tokens,
    })
}

/// Split a script (without the leading OP_RETURN) into its pushes.
///
/// Only plain pushes and OP_PUSHDATA1/2/4 are allowed; the shorthand number
/// opcodes (OP_0, OP_1..OP_16, OP_1NEGATE) are not pushes of bytes and make
/// the declaration malformed.
fn parse_pushes(mut script: &[u8]) -> Result<Vec<Vec<u8>>, ParseError> {
    let mut pushes = Vec::new();
    while let Some((&opcode, rest)) = script.split_first() {
        let (len, rest) = match opcode {
            0x01..=0x4b => (opcode as usize, rest),
            // OP_PUSHDATA1
            0x4c => {
                let (&len, rest) = rest.split_first().ok_or(ParseError::TruncatedPush)?;
                (len as usize, rest)
            }
            // OP_PUSHDATA2
            0x4d => {
                if rest.len() < 2 {
                    return Err(ParseError::TruncatedPush);
                }
                let len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
                (len, &rest[2..])
            }
            // OP_PUSHDATA4
            0x4e => {
                if rest.len() < 4 {
                    return Err(ParseError::TruncatedPush);
                }
                let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
                (len, &rest[4..])
            }
            opcode => return Err(ParseError::NonPushOpcode(opcode)),
        };
        if rest.len() < len {
            return Err(ParseError::TruncatedPush);
        }
        pushes.push(rest[..len].to_vec());
        script = &rest[len..];
    }
    Ok(pushes)
}

fn check_field_count(
    tx_type: &'static str,
    pushes: &[Vec<u8>],
    min: usize,
    max: usize,
) -> Result<(), ParseError> {
    if pushes.len() < min {
        return Err(ParseError::TooFewFields {
            tx_type,
            expected: min,
            actual: pushes.len(),
        });
    }
    if pushes.len() > max {
        return Err(ParseError::TooManyFields {
            tx_type,
            expected: max,
            actual: pushes.len(),
        });
    }
    Ok(())
}

fn parse_token_id(bytes: &[u8]) -> Result<TokenId, ParseError> {
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ParseError::InvalidFieldSize {
            field: "token id",
            expected: 32,
            actual: bytes.len(),
        })?;
    // Declarations carry the id in display order.
    Ok(TokenId::from_be_bytes(bytes))
}

fn parse_amount(field: &'static str, bytes: &[u8]) -> Result<u64, ParseError> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ParseError::InvalidFieldSize {
            field,
            expected: 8,
            actual: bytes.len(),
        })?;
    Ok(u64::from_be_bytes(bytes))
}

fn parse_byte_field(field: &'static str, bytes: &[u8]) -> Result<u8, ParseError> {
    match bytes {
        [value] => Ok(*value),
        _ => Err(ParseError::InvalidFieldSize {
            field,
            expected: 1,
            actual: bytes.len(),
        }),
    }
}

fn parse_baton_idx(bytes: &[u8]) -> Result<Option<u8>, ParseError> {
    match bytes {
        [] => Ok(None),
        [idx] if *idx >= 2 => Ok(Some(*idx)),
        [idx] => Err(ParseError::InvalidMintBatonIdx(*idx)),
        _ => Err(ParseError::InvalidFieldSize {
            field: "mint baton output index",
            expected: 1,
            actual: bytes.len(),
        }),
    }
}

fn set_output_token(
    output_tokens: &mut [TokenAmount],
    idx: usize,
    token: TokenAmount,
) -> Result<(), ParseError> {
    if idx >= output_tokens.len() {
        return Err(ParseError::OutputIdxOutOfRange {
            idx,
            last: output_tokens.len().saturating_sub(1),
        });
    }
    output_tokens[idx] = token;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, ScriptBuf, Transaction, TxOut, Txid};

    fn token_tx(declaration: Vec<u8>, num_extra_outputs: usize) -> Transaction {
        let mut output = vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: ScriptBuf::from_bytes(declaration),
        }];
        for _ in 0..num_extra_outputs {
            output.push(TxOut {
                value: Amount::from_sat(546),
                script_pubkey: ScriptBuf::new_p2pkh(&bitcoin::PubkeyHash::all_zeros()),
            });
        }
        Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output,
        }
    }

    fn push(script: &mut Vec<u8>, bytes: &[u8]) {
        if bytes.is_empty() {
            // Empty field via OP_PUSHDATA1 with length 0.
            script.extend_from_slice(&[0x4c, 0x00]);
        } else {
            assert!(bytes.len() <= 0x4b);
            script.push(bytes.len() as u8);
            script.extend_from_slice(bytes);
        }
    }

    fn genesis_script(
        token_type: u8,
        decimals: u8,
        baton: &[u8],
        quantity: u64,
    ) -> Vec<u8> {
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[token_type]);
        push(&mut script, b"GENESIS");
        push(&mut script, b"TICK");
        push(&mut script, b"Token Name");
        push(&mut script, b"https://example.com");
        push(&mut script, &[]);
        push(&mut script, &[decimals]);
        push(&mut script, baton);
        push(&mut script, &quantity.to_be_bytes());
        script
    }

    #[test]
    fn test_non_token_tx_parses_to_none() {
        let tx = token_tx(vec![0x6a, 0x04, 0x00, 0x01, 0x02, 0x03], 1);
        let txid = Txid::all_zeros();
        assert_eq!(parse_tx(txid, &tx), Ok(None));
        // A tx with no outputs at all is also not a token tx.
        let empty = Transaction {
            version: bitcoin::transaction::Version::ONE,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        assert_eq!(parse_tx(txid, &empty), Ok(None));
    }

    #[test]
    fn test_parse_genesis() {
        let tx = token_tx(genesis_script(TOKEN_TYPE_FUNGIBLE, 4, &[0x02], 1000), 2);
        let txid = Txid::from_byte_array([7; 32]);
        let parsed = parse_tx(txid, &tx).unwrap().unwrap();
        assert_eq!(parsed.token_type, TokenType::Fungible);
        assert_eq!(parsed.token_id, TokenId::new(txid));
        let ParsedTxType::Genesis(info) = &parsed.tx_type else {
            panic!("expected GENESIS, got {:?}", parsed.tx_type);
        };
        assert_eq!(info.token_ticker, b"TICK");
        assert_eq!(info.decimals, 4);
        assert_eq!(
            parsed.output_tokens,
            vec![
                TokenAmount::EMPTY,
                TokenAmount::amount(1000),
                TokenAmount::MINT_BATON,
            ]
        );
    }

    #[test]
    fn test_parse_send() {
        let token_id = TokenId::from_bytes([3; 32]);
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[TOKEN_TYPE_FUNGIBLE]);
        push(&mut script, b"SEND");
        push(&mut script, &token_id.to_be_bytes());
        push(&mut script, &30u64.to_be_bytes());
        push(&mut script, &70u64.to_be_bytes());
        let tx = token_tx(script, 2);
        let parsed = parse_tx(Txid::all_zeros(), &tx).unwrap().unwrap();
        assert_eq!(parsed.tx_type, ParsedTxType::Send);
        assert_eq!(parsed.token_id, token_id);
        assert_eq!(
            parsed.output_tokens,
            vec![
                TokenAmount::EMPTY,
                TokenAmount::amount(30),
                TokenAmount::amount(70),
            ]
        );
    }

    #[test]
    fn test_send_with_more_amounts_than_outputs_is_malformed() {
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[TOKEN_TYPE_FUNGIBLE]);
        push(&mut script, b"SEND");
        push(&mut script, &[9; 32]);
        push(&mut script, &10u64.to_be_bytes());
        push(&mut script, &20u64.to_be_bytes());
        let tx = token_tx(script, 1);
        assert_eq!(
            parse_tx(Txid::all_zeros(), &tx),
            Err(ParseError::OutputIdxOutOfRange { idx: 2, last: 1 })
        );
    }

    #[test]
    fn test_parse_mint() {
        let token_id = TokenId::from_bytes([5; 32]);
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[TOKEN_TYPE_FUNGIBLE]);
        push(&mut script, b"MINT");
        push(&mut script, &token_id.to_be_bytes());
        push(&mut script, &[0x02]);
        push(&mut script, &500u64.to_be_bytes());
        let tx = token_tx(script, 2);
        let parsed = parse_tx(Txid::all_zeros(), &tx).unwrap().unwrap();
        assert_eq!(parsed.tx_type, ParsedTxType::Mint);
        assert_eq!(
            parsed.output_tokens,
            vec![
                TokenAmount::EMPTY,
                TokenAmount::amount(500),
                TokenAmount::MINT_BATON,
            ]
        );
    }

    #[test]
    fn test_unknown_token_type() {
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[0x77]);
        push(&mut script, b"GENESIS");
        let tx = token_tx(script, 1);
        let parsed = parse_tx(Txid::all_zeros(), &tx).unwrap().unwrap();
        assert_eq!(parsed.token_type, TokenType::Unknown);
        assert_eq!(parsed.tx_type, ParsedTxType::Unknown);
    }

    #[test]
    fn test_nft1_child_genesis_constraints() {
        let txid = Txid::all_zeros();
        let tx = token_tx(genesis_script(TOKEN_TYPE_NFT1_CHILD, 0, &[], 1), 1);
        let parsed = parse_tx(txid, &tx).unwrap().unwrap();
        assert_eq!(parsed.token_type, TokenType::Nft1Child);

        let tx = token_tx(genesis_script(TOKEN_TYPE_NFT1_CHILD, 0, &[], 2), 1);
        assert_eq!(
            parse_tx(txid, &tx),
            Err(ParseError::Nft1ChildQuantity(2))
        );

        let tx = token_tx(genesis_script(TOKEN_TYPE_NFT1_CHILD, 2, &[], 1), 1);
        assert_eq!(parse_tx(txid, &tx), Err(ParseError::Nft1ChildDecimals(2)));

        let tx = token_tx(genesis_script(TOKEN_TYPE_NFT1_CHILD, 0, &[0x02], 1), 2);
        assert_eq!(parse_tx(txid, &tx), Err(ParseError::Nft1ChildMintBaton));
    }

    #[test]
    fn test_non_push_opcode_is_malformed() {
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[TOKEN_TYPE_FUNGIBLE]);
        script.push(0x51); // OP_1 shorthand is not a push of bytes
        let tx = token_tx(script, 1);
        assert_eq!(
            parse_tx(Txid::all_zeros(), &tx),
            Err(ParseError::NonPushOpcode(0x51))
        );
    }

    #[test]
    fn test_token_id_display_order() {
        // The declaration carries the display-order bytes; parsing must
        // reverse them into natural order.
        let display_bytes: [u8; 32] = {
            let mut bytes = [0u8; 32];
            bytes[0] = 0xaa;
            bytes
        };
        let mut script = SLP_MARKER.to_vec();
        push(&mut script, &[TOKEN_TYPE_FUNGIBLE]);
        push(&mut script, b"SEND");
        push(&mut script, &display_bytes);
        push(&mut script, &1u64.to_be_bytes());
        let tx = token_tx(script, 1);
        let parsed = parse_tx(Txid::all_zeros(), &tx).unwrap().unwrap();
        assert!(parsed.token_id.to_string().starts_with("aa"));
    }
}
