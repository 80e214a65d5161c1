use serde::{Deserialize, Serialize};
use tokendex_store::RetryPolicy;

/// Default capacity of the node-event queue. Senders block once it fills,
/// applying backpressure to the event source instead of buffering without
/// bound.
const DEFAULT_EVENT_QUEUE_SIZE: usize = 256;
/// Default bound on how far a reorg may walk back before ingestion halts.
const DEFAULT_MAX_REORG_DEPTH: usize = 100;
/// Default upper bound on history/block-range page sizes.
const DEFAULT_MAX_PAGE_SIZE: usize = 200;
/// Default number of cached history pages.
const DEFAULT_HISTORY_CACHE_PAGES: usize = 1024;

/// Indexer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub event_queue_size: usize,
    pub max_reorg_depth: usize,
    pub max_page_size: usize,
    pub history_cache_pages: usize,
    pub write_retry: RetryPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        IndexerConfig {
            event_queue_size: DEFAULT_EVENT_QUEUE_SIZE,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            history_cache_pages: DEFAULT_HISTORY_CACHE_PAGES,
            write_retry: RetryPolicy::default(),
        }
    }
}
