#![forbid(unsafe_code)]

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::pager::page::PageBuffer;
use crate::types::PageId;

/// Bounded LRU of page images keyed by logical page ID.
///
/// An entry is "in use" while a reader still holds the `Arc` outside the
/// cache; such entries are not evicted. When over the limit, eviction walks
/// from the least-recently-used end; an in-use entry is cycled to the
/// most-recently-used end and the sweep stops there.
pub struct PageCache {
    entries: LruCache<PageId, Arc<PageBuffer>>,
    limit: usize,
}

impl PageCache {
    pub fn new(byte_budget: usize, page_size: usize) -> Self {
        let limit = (byte_budget / page_size).max(4);
        Self {
            entries: LruCache::unbounded(),
            limit,
        }
    }

    pub fn set_limit(&mut self, byte_budget: usize, page_size: usize) {
        self.limit = (byte_budget / page_size).max(4);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Look up `id`, updating recency unless `no_hit` is set.
    pub fn get(&mut self, id: PageId, no_hit: bool) -> Option<Arc<PageBuffer>> {
        if no_hit {
            self.entries.peek(&id).cloned()
        } else {
            self.entries.get(&id).cloned()
        }
    }

    /// Look up `id` without touching the eviction order.
    pub fn get_if_exists(&self, id: PageId) -> Option<Arc<PageBuffer>> {
        self.entries.peek(&id).cloned()
    }

    pub fn insert(&mut self, id: PageId, page: Arc<PageBuffer>) {
        self.entries.put(id, page);
        self.evict_over_limit();
    }

    pub fn remove(&mut self, id: PageId) {
        self.entries.pop(&id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn evict_over_limit(&mut self) {
        while self.entries.len() > self.limit {
            let pinned = match self.entries.peek_lru() {
                // Strong count above one means a reader still holds the page.
                Some((_, page)) => Arc::strong_count(page) > 1,
                None => return,
            };
            if pinned {
                let (id, page) = self.entries.pop_lru().expect("peeked entry exists");
                trace!(page = id.0, "cache.evict.pinned");
                self.entries.put(id, page);
                return;
            }
            let (id, _) = self.entries.pop_lru().expect("peeked entry exists");
            trace!(page = id.0, "cache.evict");
        }
    }
}
