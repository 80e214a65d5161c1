//! Token validity engine.
//!
//! Pure and storage-free: validity of a transaction is a function of its own
//! declaration and the token state of the outputs it spends. The store caches
//! the verdicts; this crate never reads them back.
//!
//! Three layers:
//! - [`parse_tx`]: decode the OP_RETURN declaration at output 0.
//! - [`validate`]: apply GENESIS/MINT/SEND rules against the spent tokens.
//! - [`validate_batch`]: validate a whole block of token transactions that
//!   may spend each other, in dependency order.

mod batch;
mod parse;
mod validate;

pub use self::batch::{BatchError, BatchTokenTx, InvalidTokenTx, validate_batch};
pub use self::parse::{ParseError, parse_tx};
pub use self::validate::{ValidateError, burn_all, validate};

use tokendex_primitives::{GenesisInfo, TokenAmount, TokenId, TokenType};

/// A token declaration decoded from a transaction, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTokenTx {
    pub token_type: TokenType,
    pub tx_type: ParsedTxType,
    /// For GENESIS this is the declaring txid itself; for MINT/SEND the id
    /// named in the declaration.
    pub token_id: TokenId,
    /// Declared token value per output, index-aligned with the tx outputs.
    /// Index 0 (the OP_RETURN itself) is always empty.
    pub output_tokens: Vec<TokenAmount>,
}

/// Declared operation, with GENESIS carrying its embedded metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedTxType {
    Genesis(GenesisInfo),
    Mint,
    Send,
    /// Unrecognized token type; indexed but carries no token value.
    Unknown,
}

/// Token state of a spent output, as resolved by the caller from previously
/// validated transactions. `None` entries in a spent-token slice mean the
/// output carries no token value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentToken {
    pub token_id: TokenId,
    pub token_type: TokenType,
    pub token: TokenAmount,
    pub group_token_id: Option<TokenId>,
}
