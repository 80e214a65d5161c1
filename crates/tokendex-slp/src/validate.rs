//! Per-transaction validity rules.

use thiserror::Error;
use tokendex_primitives::{TokenAmount, TokenBurn, TokenId, TokenTxData, TokenTxType, TokenType};

use crate::{ParsedTokenTx, ParsedTxType, SpentToken};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("Output token sum {output_sum} exceeds input token sum {input_sum}")]
    OutputSumExceedInputSum { input_sum: u128, output_sum: u128 },

    #[error("MINT has no mint baton input for token {0}")]
    MissingMintBaton(TokenId),

    #[error("MINT has {count} mint baton inputs for token {token_id}, expected exactly 1")]
    MultipleMintBatons { token_id: TokenId, count: usize },

    #[error("NFT1 child GENESIS must consume an NFT1 group token at input 0")]
    HasNoNft1Group,
}

/// Validate a parsed declaration against the token state of the outputs the
/// transaction spends. `spent_tokens` is index-aligned with the tx inputs;
/// `None` entries carry no token value (including coinbase inputs).
///
/// On success the verdict carries per-input consumption, per-output
/// assignment and per-input burns. On failure the transaction is still
/// indexed; the caller records the error message and burns every token
/// input.
pub fn validate(
    parsed: &ParsedTokenTx,
    spent_tokens: &[Option<SpentToken>],
) -> Result<TokenTxData, ValidateError> {
    match &parsed.tx_type {
        ParsedTxType::Genesis(_) => validate_genesis(parsed, spent_tokens),
        ParsedTxType::Mint => validate_mint(parsed, spent_tokens),
        ParsedTxType::Send => validate_send(parsed, spent_tokens),
        ParsedTxType::Unknown => Ok(TokenTxData {
            token_id: parsed.token_id,
            token_type: TokenType::Unknown,
            tx_type: TokenTxType::Unknown,
            group_token_id: None,
            input_tokens: vec![TokenAmount::EMPTY; spent_tokens.len()],
            output_tokens: parsed.output_tokens.clone(),
            burns: burn_all(spent_tokens),
        }),
    }
}

/// Burns every token input that `spent_tokens` reports.
///
/// Used for inputs a transaction consumes without accounting for them, and by
/// the batch validator for transactions whose declaration failed validation.
pub fn burn_all(spent_tokens: &[Option<SpentToken>]) -> Vec<Option<TokenBurn>> {
    spent_tokens
        .iter()
        .map(|spent| {
            spent.as_ref().and_then(|spent| {
                if spent.token.is_empty() {
                    return None;
                }
                Some(TokenBurn {
                    token: spent.token,
                    token_id: spent.token_id,
                })
            })
        })
        .collect()
}

fn validate_genesis(
    parsed: &ParsedTokenTx,
    spent_tokens: &[Option<SpentToken>],
) -> Result<TokenTxData, ValidateError> {
    let mut input_tokens = vec![TokenAmount::EMPTY; spent_tokens.len()];
    let mut burns = burn_all(spent_tokens);
    let mut group_token_id = None;
    if parsed.token_type == TokenType::Nft1Child {
        // Minting an NFT1 child consumes one unit of the parent group token
        // at input 0; the group's id becomes the child's namespace.
        let group = spent_tokens
            .first()
            .and_then(|spent| spent.as_ref())
            .filter(|spent| {
                spent.token_type == TokenType::Nft1Group
                    && !spent.token.is_mint_baton
                    && spent.token.amount >= 1
            })
            .ok_or(ValidateError::HasNoNft1Group)?;
        input_tokens[0] = group.token;
        group_token_id = Some(group.token_id);
        burns[0] = if group.token.amount > 1 {
            Some(TokenBurn {
                token: TokenAmount::amount(group.token.amount - 1),
                token_id: group.token_id,
            })
        } else {
            None
        };
    }
    Ok(TokenTxData {
        token_id: parsed.token_id,
        token_type: parsed.token_type,
        tx_type: TokenTxType::Genesis,
        group_token_id,
        input_tokens,
        output_tokens: parsed.output_tokens.clone(),
        burns,
    })
}

fn validate_mint(
    parsed: &ParsedTokenTx,
    spent_tokens: &[Option<SpentToken>],
) -> Result<TokenTxData, ValidateError> {
    let baton_indices = spent_tokens
        .iter()
        .enumerate()
        .filter_map(|(idx, spent)| {
            let spent = spent.as_ref()?;
            (spent.token.is_mint_baton
                && spent.token_id == parsed.token_id
                && spent.token_type == parsed.token_type)
                .then_some(idx)
        })
        .collect::<Vec<_>>();
    let &[baton_idx] = baton_indices.as_slice() else {
        if baton_indices.is_empty() {
            return Err(ValidateError::MissingMintBaton(parsed.token_id));
        }
        return Err(ValidateError::MultipleMintBatons {
            token_id: parsed.token_id,
            count: baton_indices.len(),
        });
    };
    let mut input_tokens = vec![TokenAmount::EMPTY; spent_tokens.len()];
    let mut burns = burn_all(spent_tokens);
    input_tokens[baton_idx] = TokenAmount::MINT_BATON;
    burns[baton_idx] = None;
    let group_token_id = spent_tokens[baton_idx]
        .as_ref()
        .and_then(|spent| spent.group_token_id);
    Ok(TokenTxData {
        token_id: parsed.token_id,
        token_type: parsed.token_type,
        tx_type: TokenTxType::Mint,
        group_token_id,
        input_tokens,
        output_tokens: parsed.output_tokens.clone(),
        burns,
    })
}

fn validate_send(
    parsed: &ParsedTokenTx,
    spent_tokens: &[Option<SpentToken>],
) -> Result<TokenTxData, ValidateError> {
    let mut input_tokens = vec![TokenAmount::EMPTY; spent_tokens.len()];
    let mut burns = burn_all(spent_tokens);
    let mut matching = Vec::new();
    let mut group_token_id = None;
    for (idx, spent) in spent_tokens.iter().enumerate() {
        let Some(spent) = spent else { continue };
        if spent.token.is_mint_baton
            || spent.token_id != parsed.token_id
            || spent.token_type != parsed.token_type
        {
            // Wrong token, wrong type or a baton: consumed without being
            // declared, so it stays burned.
            continue;
        }
        input_tokens[idx] = spent.token;
        burns[idx] = None;
        matching.push((idx, spent.token.amount));
        if group_token_id.is_none() {
            group_token_id = spent.group_token_id;
        }
    }
    let input_sum: u128 = matching.iter().map(|&(_, amount)| amount as u128).sum();
    let output_sum: u128 = parsed
        .output_tokens
        .iter()
        .map(|token| token.amount as u128)
        .sum();
    if output_sum > input_sum {
        return Err(ValidateError::OutputSumExceedInputSum {
            input_sum,
            output_sum,
        });
    }
    // Surplus is burned, attributed to the first input(s) carrying the token
    // in input order.
    let mut surplus = input_sum - output_sum;
    for &(idx, amount) in &matching {
        if surplus == 0 {
            break;
        }
        let burned = surplus.min(amount as u128) as u64;
        if burned > 0 {
            burns[idx] = Some(TokenBurn {
                token: TokenAmount::amount(burned),
                token_id: parsed.token_id,
            });
        }
        surplus -= burned as u128;
    }
    Ok(TokenTxData {
        token_id: parsed.token_id,
        token_type: parsed.token_type,
        tx_type: TokenTxType::Send,
        group_token_id,
        input_tokens,
        output_tokens: parsed.output_tokens.clone(),
        burns,
    })
}
