//! Chain synchronizer.
//!
//! Single-writer state machine over the node event stream. Events arrive on
//! a bounded channel in node order and are applied strictly sequentially:
//! one event is fully committed (storage write, token validation,
//! notification emission) before the next begins, so readers always observe
//! a prefix of the applied sequence.
//!
//! The node is the source of truth for block validity. If a connected block
//! does not extend the known tip, the node has already reorganized past us:
//! the synchronizer walks the tip back until the incoming block fits, then
//! lets the node's replayed connect events rebuild the new branch.
//!
//! Run [`ChainSynchronizer::run`] on a dedicated task; storage writes are
//! synchronous and retried internally with backoff, so the loop must not
//! share a thread with latency-sensitive work.

use std::sync::Arc;

use bitcoin::{Block, BlockHash, Transaction, Txid};
use parking_lot::RwLock;
use tokendex_primitives::ScriptPayload;
use tokendex_store::{ChainStore, DemotedTx, Error as StoreError};

use crate::cache::HistoryCache;
use crate::config::IndexerConfig;
use crate::subscribers::{SubscribeMessage, SubscriptionRegistry};

/// An event from the node, delivered in node-determined order.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    BlockConnected(Block),
    BlockDisconnected(BlockHash),
    MempoolTxAdded {
        tx: Transaction,
        time_first_seen: i64,
    },
    MempoolTxRemoved(Txid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Syncing,
    Synced,
}

/// Shared, observable synchronizer state.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus(Arc<RwLock<SyncState>>);

impl SyncStatus {
    pub fn get(&self) -> SyncState {
        *self.0.read()
    }

    fn set(&self, state: SyncState) {
        *self.0.write() = state;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// No common ancestor within the configured lookback; the local index
    /// has diverged from the node beyond repair.
    #[error("Reorg exceeded maximum depth {max_depth}")]
    ReorgTooDeep { max_depth: usize },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ChainSynchronizer {
    store: Arc<ChainStore>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<HistoryCache>,
    events: async_channel::Receiver<NodeEvent>,
    status: SyncStatus,
    max_reorg_depth: usize,
}

impl ChainSynchronizer {
    pub(crate) fn new(
        store: Arc<ChainStore>,
        registry: Arc<SubscriptionRegistry>,
        cache: Arc<HistoryCache>,
        events: async_channel::Receiver<NodeEvent>,
        status: SyncStatus,
        config: &IndexerConfig,
    ) -> Self {
        ChainSynchronizer {
            store,
            registry,
            cache,
            events,
            status,
            max_reorg_depth: config.max_reorg_depth,
        }
    }

    /// Consume node events until the stream closes or a fatal error occurs.
    ///
    /// A fatal error halts ingestion; correctness is preferred over
    /// availability, and the node event stream supports replay from the
    /// last committed height after a restart.
    pub async fn run(self) -> Result<(), SyncError> {
        tracing::info!("Chain synchronizer started");
        while let Ok(event) = self.events.recv().await {
            if let Err(err) = self.process_event(event) {
                tracing::error!(%err, "Fatal synchronizer error, halting ingestion");
                return Err(err);
            }
            // Synced whenever the queue is drained; a backlog means we are
            // still catching up with the node.
            self.status.set(if self.events.is_empty() {
                SyncState::Synced
            } else {
                SyncState::Syncing
            });
        }
        tracing::info!("Node event stream closed, synchronizer stopping");
        Ok(())
    }

    fn process_event(&self, event: NodeEvent) -> Result<(), SyncError> {
        match event {
            NodeEvent::BlockConnected(block) => self.handle_block_connected(block),
            NodeEvent::BlockDisconnected(hash) => self.handle_block_disconnected(hash),
            NodeEvent::MempoolTxAdded {
                tx,
                time_first_seen,
            } => self.handle_mempool_added(tx, time_first_seen),
            NodeEvent::MempoolTxRemoved(txid) => self.handle_mempool_removed(txid),
        }
    }

    fn handle_block_connected(&self, block: Block) -> Result<(), SyncError> {
        let mut depth = 0;
        loop {
            match self.store.prepare_block(&block) {
                Ok(prepared) => {
                    let applied = self.store.put_block(prepared)?;
                    for event in &applied.evicted {
                        self.notify(&event.scripts, SubscribeMessage::RemovedFromMempool(event.txid));
                    }
                    for event in &applied.confirmed {
                        self.notify(&event.scripts, SubscribeMessage::Confirmed(event.txid));
                    }
                    return Ok(());
                }
                Err(StoreError::AlreadyIndexed(hash)) => {
                    tracing::debug!(%hash, "Skipping already-indexed block");
                    return Ok(());
                }
                Err(StoreError::Conflict { got, tip }) => {
                    depth += 1;
                    if depth > self.max_reorg_depth {
                        return Err(SyncError::ReorgTooDeep {
                            max_depth: self.max_reorg_depth,
                        });
                    }
                    tracing::warn!(
                        block = %got,
                        %tip,
                        depth,
                        "Block does not extend tip, disconnecting tip"
                    );
                    self.disconnect_tip()?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn handle_block_disconnected(&self, hash: BlockHash) -> Result<(), SyncError> {
        let tip = self.store.tip()?.ok_or(StoreError::EmptyChain)?;
        if tip.hash != hash {
            return Err(StoreError::NotTip {
                got: hash,
                tip: tip.hash,
            }
            .into());
        }
        self.disconnect_tip()
    }

    /// Remove the tip block and requeue its transactions.
    fn disconnect_tip(&self) -> Result<(), SyncError> {
        let tip = self.store.tip()?.ok_or(StoreError::EmptyChain)?;
        let removed = self.store.remove_block(&tip.hash)?;
        if let Some(coinbase) = &removed.coinbase {
            self.notify(&coinbase.scripts, SubscribeMessage::Reorg(coinbase.txid));
        }
        self.requeue_demoted(removed.demoted)
    }

    /// Put reorged-out transactions back into the mempool where possible.
    ///
    /// Transactions are retried until a pass makes no progress, since
    /// canonical in-block ordering can list a child before its parent.
    /// Whatever still fails to resolve (e.g. spends of a removed coinbase)
    /// is dropped with a `Reorg` notification.
    fn requeue_demoted(&self, demoted: Vec<DemotedTx>) -> Result<(), SyncError> {
        let mut pending = demoted;
        loop {
            let mut rejected = Vec::new();
            let mut progressed = false;
            for demoted_tx in pending {
                match self
                    .store
                    .add_mempool_tx(demoted_tx.tx.clone(), demoted_tx.time_first_seen)
                {
                    Ok(Some(added)) => {
                        progressed = true;
                        self.notify(&added.scripts, SubscribeMessage::AddedToMempool(added.txid));
                    }
                    Ok(None) => progressed = true,
                    Err(StoreError::Rejected { .. }) => rejected.push(demoted_tx),
                    Err(err) => return Err(err.into()),
                }
            }
            if rejected.is_empty() {
                return Ok(());
            }
            if !progressed {
                for demoted_tx in rejected {
                    tracing::debug!(txid = %demoted_tx.txid, "Dropping reorged-out tx");
                    self.notify(&demoted_tx.scripts, SubscribeMessage::Reorg(demoted_tx.txid));
                }
                return Ok(());
            }
            pending = rejected;
        }
    }

    fn handle_mempool_added(&self, tx: Transaction, time_first_seen: i64) -> Result<(), SyncError> {
        match self.store.add_mempool_tx(tx, time_first_seen) {
            Ok(Some(added)) => {
                self.notify(&added.scripts, SubscribeMessage::AddedToMempool(added.txid));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(StoreError::Rejected { txid, missing }) => {
                // The tx is dropped and not indexed; the node's view and
                // ours may briefly differ on unconfirmed txs.
                tracing::warn!(%txid, %missing, "Rejected mempool tx with unresolvable input");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn handle_mempool_removed(&self, txid: Txid) -> Result<(), SyncError> {
        if let Some(removed) = self.store.remove_mempool_tx(&txid)? {
            self.notify(
                &removed.scripts,
                SubscribeMessage::RemovedFromMempool(removed.txid),
            );
        }
        Ok(())
    }

    /// Invalidate cached pages and fan the message out, per touched script.
    fn notify(&self, scripts: &[ScriptPayload], msg: SubscribeMessage) {
        for script in scripts {
            self.cache.invalidate_script(script);
        }
        self.registry.notify(scripts, &msg);
    }
}
