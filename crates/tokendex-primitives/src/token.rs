//! Token-layer value types.

use std::fmt;
use std::str::FromStr;

use bitcoin::Txid;
use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};

/// Identifier of a token: the txid of its GENESIS transaction.
///
/// Displayed in reversed ("display") hex like any txid; stored and keyed in
/// natural byte order. Token declarations on the wire carry the big-endian
/// (display-order) bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(Txid);

impl TokenId {
    pub fn new(txid: Txid) -> Self {
        TokenId(txid)
    }

    pub fn txid(&self) -> Txid {
        self.0
    }

    /// Natural (internal) byte order, used for database keys.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_byte_array()
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        TokenId(Txid::from_byte_array(bytes))
    }

    /// Display-order bytes as they appear in token declarations.
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = self.0.to_byte_array();
        bytes.reverse();
        bytes
    }

    pub fn from_be_bytes(mut bytes: [u8; 32]) -> Self {
        bytes.reverse();
        TokenId(Txid::from_byte_array(bytes))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TokenId {
    type Err = <Txid as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TokenId(Txid::from_str(s)?))
    }
}

/// Token protocol variant of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    Fungible,
    Nft1Group,
    Nft1Child,
    Unknown,
}

/// Kind of token operation a transaction declares.
///
/// Discriminants are part of the client-facing encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenTxType {
    Genesis = 0,
    Send = 1,
    Mint = 2,
    Unknown = 3,
}

/// Token value attached to a single output (or consumed by an input).
///
/// Either an amount of token units, or the mint baton authorizing further
/// issuance. The baton carries no amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenAmount {
    pub amount: u64,
    pub is_mint_baton: bool,
}

impl TokenAmount {
    pub const EMPTY: TokenAmount = TokenAmount {
        amount: 0,
        is_mint_baton: false,
    };

    pub const MINT_BATON: TokenAmount = TokenAmount {
        amount: 0,
        is_mint_baton: true,
    };

    pub fn amount(amount: u64) -> Self {
        TokenAmount {
            amount,
            is_mint_baton: false,
        }
    }

    /// Neither units nor a baton.
    pub fn is_empty(&self) -> bool {
        self.amount == 0 && !self.is_mint_baton
    }
}

/// Token metadata of a transaction or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMeta {
    pub token_type: TokenType,
    pub tx_type: TokenTxType,
    pub token_id: TokenId,
    /// For NFT1 child tokens, the id of the parent group token.
    pub group_token_id: Option<TokenId>,
}

/// Token value consumed by an input without being accounted for by the
/// spending transaction's declared outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBurn {
    pub token: TokenAmount,
    pub token_id: TokenId,
}

/// Data gathered from a GENESIS declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisInfo {
    pub token_ticker: Vec<u8>,
    pub token_name: Vec<u8>,
    pub token_document_url: Vec<u8>,
    pub token_document_hash: Option<[u8; 32]>,
    pub decimals: u32,
}

/// Validity verdict for a token transaction.
///
/// Produced once per transaction by the validity engine and cached; absent
/// (with an error message on the transaction) when the declaration failed
/// validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTxData {
    pub token_id: TokenId,
    pub token_type: TokenType,
    pub tx_type: TokenTxType,
    pub group_token_id: Option<TokenId>,
    /// Token value consumed per input, index-aligned with the tx inputs.
    pub input_tokens: Vec<TokenAmount>,
    /// Token value assigned per output, index-aligned with the tx outputs.
    pub output_tokens: Vec<TokenAmount>,
    /// Burn per input, index-aligned with the tx inputs.
    pub burns: Vec<Option<TokenBurn>>,
}

impl TokenTxData {
    pub fn meta(&self) -> TokenMeta {
        TokenMeta {
            token_type: self.token_type,
            tx_type: self.tx_type,
            token_id: self.token_id,
            group_token_id: self.group_token_id,
        }
    }
}
