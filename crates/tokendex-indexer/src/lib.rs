//! Indexing and query engine for token-aware chains.
//!
//! Wires the chain state store to the three public surfaces:
//! - the [`ChainSynchronizer`], a single-writer loop applying node events,
//! - the [`QueryService`], concurrent read-only queries,
//! - the [`SubscriptionRegistry`], live per-script event channels.
//!
//! ```no_run
//! use tokendex_indexer::{Indexer, IndexerConfig, NodeEvent};
//! use tokendex_primitives::Network;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let path = std::path::Path::new("/var/lib/tokendex");
//! let (indexer, synchronizer) = Indexer::open(path, Network::Xec, IndexerConfig::default())?;
//! tokio::spawn(synchronizer.run());
//! let query = indexer.query();
//! # let block = todo!();
//! indexer.events().send(NodeEvent::BlockConnected(block)).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod config;
mod error;
mod query;
mod subscribers;
mod synchronizer;

pub use self::cache::{CachedPage, HistoryCache};
pub use self::config::IndexerConfig;
pub use self::error::QueryError;
pub use self::query::{QueryService, TxHistoryPage};
pub use self::subscribers::{SubscribeMessage, Subscription, SubscriptionRegistry};
pub use self::synchronizer::{ChainSynchronizer, NodeEvent, SyncError, SyncState, SyncStatus};

use std::path::Path;
use std::sync::Arc;

use tokendex_primitives::Network;
use tokendex_store::ChainStore;

/// Handle to a running indexer: event ingress, queries and subscriptions.
///
/// Cheap to clone. The paired [`ChainSynchronizer`] returned by [`open`]
/// must be driven on its own task for events to apply.
///
/// [`open`]: Indexer::open
#[derive(Clone)]
pub struct Indexer {
    store: Arc<ChainStore>,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<HistoryCache>,
    events: async_channel::Sender<NodeEvent>,
    status: SyncStatus,
    config: IndexerConfig,
}

impl Indexer {
    /// Open (or create) the index at `path` and assemble the synchronizer.
    pub fn open(
        path: &Path,
        network: Network,
        config: IndexerConfig,
    ) -> Result<(Indexer, ChainSynchronizer), tokendex_store::Error> {
        let store = Arc::new(ChainStore::open_with_retry(
            path,
            network,
            config.write_retry.clone(),
        )?);
        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(HistoryCache::new(config.history_cache_pages));
        // Bounded: a full queue blocks the event source rather than
        // buffering without limit while the synchronizer catches up.
        let (sender, receiver) = async_channel::bounded(config.event_queue_size.max(1));
        let status = SyncStatus::default();
        let synchronizer = ChainSynchronizer::new(
            store.clone(),
            registry.clone(),
            cache.clone(),
            receiver,
            status.clone(),
            &config,
        );
        let indexer = Indexer {
            store,
            registry,
            cache,
            events: sender,
            status,
            config,
        };
        Ok((indexer, synchronizer))
    }

    /// Sender for node events, consumed by the synchronizer in order.
    pub fn events(&self) -> &async_channel::Sender<NodeEvent> {
        &self.events
    }

    /// Read-only query surface.
    pub fn query(&self) -> QueryService {
        QueryService::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.max_page_size,
        )
    }

    /// Live subscription registry.
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Current synchronizer state.
    pub fn sync_status(&self) -> &SyncStatus {
        &self.status
    }

    /// Direct store access, for embedders that need it.
    pub fn store(&self) -> &Arc<ChainStore> {
        &self.store
    }
}
