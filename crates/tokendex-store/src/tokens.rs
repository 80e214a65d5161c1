//! Token validity cache tables.
//!
//! Verdicts are written once when a transaction is indexed and never
//! recomputed; validity is a pure function of the transaction and its
//! inputs' verdicts, so a cached verdict stays correct until the
//! transaction itself is unindexed (reorg).

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tokendex_primitives::{
    GenesisInfo, TokenAmount, TokenBurn, TokenId, TokenMeta, TokenTxData, TokenTxType, TokenType,
    TxNum,
};
use tokendex_slp::SpentToken;

use crate::db::Db;
use crate::keys::tx_num_key;
use crate::Result;

pub const CF_TOKEN_TX: &str = "token_tx";
pub const CF_TOKEN_META: &str = "token_meta";

/// Cached verdict for a transaction that carried a token declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbTokenVerdict {
    Valid(TokenTxData),
    /// Declaration failed parsing or validation; the transaction is indexed
    /// anyway, with its token inputs recorded as burned.
    Invalid {
        burns: Vec<Option<TokenBurn>>,
        error: String,
    },
}

impl DbTokenVerdict {
    pub fn data(&self) -> Option<&TokenTxData> {
        match self {
            DbTokenVerdict::Valid(data) => Some(data),
            DbTokenVerdict::Invalid { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DbTokenVerdict::Valid(_) => None,
            DbTokenVerdict::Invalid { error, .. } => Some(error),
        }
    }

    /// Token state of output `vout` under this verdict, as seen by a
    /// spending transaction.
    pub fn spent_token(&self, vout: u32) -> Option<SpentToken> {
        let data = self.data()?;
        let token = *data.output_tokens.get(vout as usize)?;
        if token.is_empty() {
            return None;
        }
        Some(SpentToken {
            token_id: data.token_id,
            token_type: data.token_type,
            token,
            group_token_id: data.group_token_id,
        })
    }

    /// Token amount of output `vout`, for display on outputs and UTXOs.
    pub fn output_token(&self, vout: u32) -> Option<TokenAmount> {
        let data = self.data()?;
        let token = *data.output_tokens.get(vout as usize)?;
        (!token.is_empty()).then_some(token)
    }
}

/// Metadata of a token, written once at its GENESIS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTokenMeta {
    pub token_type: TokenType,
    pub group_token_id: Option<TokenId>,
    pub genesis_info: GenesisInfo,
}

impl DbTokenMeta {
    pub fn token_meta(&self, token_id: TokenId) -> TokenMeta {
        TokenMeta {
            token_type: self.token_type,
            tx_type: TokenTxType::Genesis,
            token_id,
            group_token_id: self.group_token_id,
        }
    }
}

pub fn put_verdict(
    db: &Db,
    batch: &mut WriteBatch,
    tx_num: TxNum,
    verdict: &DbTokenVerdict,
) -> Result<()> {
    batch.put_cf(
        db.cf(CF_TOKEN_TX)?,
        tx_num_key(tx_num),
        bincode::serialize(verdict)?,
    );
    Ok(())
}

pub fn delete_verdict(db: &Db, batch: &mut WriteBatch, tx_num: TxNum) -> Result<()> {
    batch.delete_cf(db.cf(CF_TOKEN_TX)?, tx_num_key(tx_num));
    Ok(())
}

pub fn get_verdict(db: &Db, tx_num: TxNum) -> Result<Option<DbTokenVerdict>> {
    match db.get(db.cf(CF_TOKEN_TX)?, tx_num_key(tx_num))? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}

pub fn put_token_meta(
    db: &Db,
    batch: &mut WriteBatch,
    token_id: &TokenId,
    meta: &DbTokenMeta,
) -> Result<()> {
    batch.put_cf(
        db.cf(CF_TOKEN_META)?,
        token_id.to_bytes(),
        bincode::serialize(meta)?,
    );
    Ok(())
}

pub fn delete_token_meta(db: &Db, batch: &mut WriteBatch, token_id: &TokenId) -> Result<()> {
    batch.delete_cf(db.cf(CF_TOKEN_META)?, token_id.to_bytes());
    Ok(())
}

pub fn get_token_meta(db: &Db, token_id: &TokenId) -> Result<Option<DbTokenMeta>> {
    match db.get(db.cf(CF_TOKEN_META)?, token_id.to_bytes())? {
        Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
        None => Ok(None),
    }
}
