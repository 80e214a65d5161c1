//! Read-only query façade.
//!
//! Cheap to clone and safe under concurrent ingestion: every call reads
//! committed store state. Input validation happens here; the store below
//! never sees a malformed page request.

use std::sync::Arc;

use bitcoin::{OutPoint, Txid};
use tokendex_primitives::{
    BlockInfo, GenesisInfo, RichTx, ScriptPayload, TokenId, TokenMeta, Utxo, UtxoState,
};
use tokendex_store::{ChainStore, HashOrHeight, StoredBlock};

use crate::cache::{CachedPage, HistoryCache};
use crate::error::QueryError;

/// One page of a script's transaction history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHistoryPage {
    pub txs: Vec<RichTx>,
    pub num_pages: usize,
}

#[derive(Clone)]
pub struct QueryService {
    store: Arc<ChainStore>,
    cache: Arc<HistoryCache>,
    max_page_size: usize,
}

impl QueryService {
    pub(crate) fn new(
        store: Arc<ChainStore>,
        cache: Arc<HistoryCache>,
        max_page_size: usize,
    ) -> Self {
        QueryService {
            store,
            cache,
            max_page_size,
        }
    }

    /// Fetch a block by hash or height.
    pub fn block(&self, key: HashOrHeight) -> Result<StoredBlock, QueryError> {
        self.store.get_block(key)?.ok_or_else(|| match key {
            HashOrHeight::Hash(hash) => {
                QueryError::user("block-not-found", format!("Block {hash} not found"))
            }
            HashOrHeight::Height(height) => {
                QueryError::user("block-not-found", format!("Block height {height} not found"))
            }
        })
    }

    /// Fetch header/stats for the blocks in `[start, end]`.
    pub fn blocks_range(&self, start: i32, end: i32) -> Result<Vec<BlockInfo>, QueryError> {
        if start < 0 || end < start {
            return Err(QueryError::user(
                "invalid-block-range",
                format!("Invalid block range [{start}, {end}]"),
            ));
        }
        let num_blocks = (end - start) as usize + 1;
        if num_blocks > self.max_page_size {
            return Err(QueryError::user(
                "invalid-block-range",
                format!(
                    "Block range [{start}, {end}] spans {num_blocks} blocks, maximum is {}",
                    self.max_page_size
                ),
            ));
        }
        Ok(self.store.get_blocks_range(start, end)?)
    }

    /// Fetch a transaction by id, confirmed or unconfirmed.
    pub fn tx(&self, txid: &Txid) -> Result<RichTx, QueryError> {
        self.store
            .get_tx(txid)?
            .ok_or_else(|| QueryError::user("tx-not-found", format!("Tx {txid} not found")))
    }

    /// Fetch one page of a script's history in the canonical total order.
    pub fn history_page(
        &self,
        script: &ScriptPayload,
        page: usize,
        page_size: usize,
    ) -> Result<TxHistoryPage, QueryError> {
        if page_size == 0 {
            return Err(QueryError::user(
                "invalid-page-size",
                "Page size must not be 0",
            ));
        }
        if page_size > self.max_page_size {
            return Err(QueryError::user(
                "invalid-page-size",
                format!("Page size {page_size} exceeds maximum {}", self.max_page_size),
            ));
        }
        if let Some(cached) = self.cache.get(script, page, page_size) {
            return Ok(TxHistoryPage {
                txs: cached.txs.clone(),
                num_pages: cached.num_pages,
            });
        }
        let (txs, num_pages) = self.store.get_history_page(script, page, page_size)?;
        self.cache.put(
            script,
            page,
            page_size,
            Arc::new(CachedPage {
                txs: txs.clone(),
                num_pages,
            }),
        );
        Ok(TxHistoryPage { txs, num_pages })
    }

    /// Fetch all UTXOs paying to a script.
    pub fn utxos(&self, script: &ScriptPayload) -> Result<Vec<Utxo>, QueryError> {
        Ok(self.store.get_utxos_for_script(script)?)
    }

    /// Classify each outpoint as unspent/spent/unknown.
    ///
    /// Results match the input order and the batch never fails partially: an
    /// unknown or malformed reference is a verdict for that entry, not an
    /// error for the batch.
    pub fn validate_utxos(&self, outpoints: &[OutPoint]) -> Result<Vec<UtxoState>, QueryError> {
        let mut states = Vec::with_capacity(outpoints.len());
        for outpoint in outpoints {
            states.push(self.store.utxo_state(outpoint)?);
        }
        Ok(states)
    }

    /// Fetch a token's metadata by token id.
    pub fn token_meta(&self, token_id: &TokenId) -> Result<(TokenMeta, GenesisInfo), QueryError> {
        self.store.token_meta(token_id)?.ok_or_else(|| {
            QueryError::user("token-not-found", format!("Token {token_id} not found"))
        })
    }
}
