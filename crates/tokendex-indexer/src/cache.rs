//! Size-bounded cache over assembled history pages.
//!
//! Owned by the query side and explicitly invalidated by the synchronizer
//! for every script a committed state change touches. Entries are whole
//! pages keyed by `(script, page, page_size)`.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::RwLock;
use tokendex_primitives::{RichTx, ScriptPayload};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PageKey {
    script_key: Vec<u8>,
    page: usize,
    page_size: usize,
}

/// A cached history page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub txs: Vec<RichTx>,
    pub num_pages: usize,
}

pub struct HistoryCache {
    pages: RwLock<LruCache<PageKey, Arc<CachedPage>>>,
}

impl HistoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        HistoryCache {
            pages: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn get(
        &self,
        script: &ScriptPayload,
        page: usize,
        page_size: usize,
    ) -> Option<Arc<CachedPage>> {
        self.pages
            .write()
            .get(&PageKey {
                script_key: script.to_key_bytes(),
                page,
                page_size,
            })
            .cloned()
    }

    pub fn put(
        &self,
        script: &ScriptPayload,
        page: usize,
        page_size: usize,
        cached: Arc<CachedPage>,
    ) {
        self.pages.write().put(
            PageKey {
                script_key: script.to_key_bytes(),
                page,
                page_size,
            },
            cached,
        );
    }

    /// Drop every cached page of `script`. The cache is bounded, so the
    /// sweep is cheap.
    pub fn invalidate_script(&self, script: &ScriptPayload) {
        let script_key = script.to_key_bytes();
        let mut pages = self.pages.write();
        let stale = pages
            .iter()
            .filter(|(key, _)| key.script_key == script_key)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in stale {
            pages.pop(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.read().is_empty()
    }
}
