#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-store operation counters.
#[derive(Default)]
pub struct StoreMetrics {
    sets: AtomicU64,
    clears: AtomicU64,
    clears_single_key: AtomicU64,
    gets: AtomicU64,
    range_reads: AtomicU64,
    commits: AtomicU64,
    page_reads: AtomicU64,
    ext_page_reads: AtomicU64,
    page_writes: AtomicU64,
    ext_page_writes: AtomicU64,
    page_updates: AtomicU64,
    page_preloads: AtomicU64,
    lazy_delete_pages_freed: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreMetricsSnapshot {
    pub sets: u64,
    pub clears: u64,
    pub clears_single_key: u64,
    pub gets: u64,
    pub range_reads: u64,
    pub commits: u64,
    pub page_reads: u64,
    pub ext_page_reads: u64,
    pub page_writes: u64,
    pub ext_page_writes: u64,
    pub page_updates: u64,
    pub page_preloads: u64,
    pub lazy_delete_pages_freed: u64,
}

macro_rules! bump {
    ($name:ident) => {
        pub(crate) fn $name(&self, delta: u64) {
            if delta != 0 {
                self.$name.fetch_add(delta, Ordering::Relaxed);
            }
        }
    };
}

impl StoreMetrics {
    bump!(sets);
    bump!(clears);
    bump!(clears_single_key);
    bump!(gets);
    bump!(range_reads);
    bump!(commits);
    bump!(page_reads);
    bump!(ext_page_reads);
    bump!(page_writes);
    bump!(ext_page_writes);
    bump!(page_updates);
    bump!(page_preloads);
    bump!(lazy_delete_pages_freed);

    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            sets: self.sets.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            clears_single_key: self.clears_single_key.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            range_reads: self.range_reads.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            page_reads: self.page_reads.load(Ordering::Relaxed),
            ext_page_reads: self.ext_page_reads.load(Ordering::Relaxed),
            page_writes: self.page_writes.load(Ordering::Relaxed),
            ext_page_writes: self.ext_page_writes.load(Ordering::Relaxed),
            page_updates: self.page_updates.load(Ordering::Relaxed),
            page_preloads: self.page_preloads.load(Ordering::Relaxed),
            lazy_delete_pages_freed: self.lazy_delete_pages_freed.load(Ordering::Relaxed),
        }
    }
}
