#![forbid(unsafe_code)]

//! The unversioned key-value facade: buffered sets and range clears, one
//! commit per version, reads at the last committed version. Retention is
//! single-version; each commit withdraws the snapshots before it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{GloamError, Result};
use crate::io::BlockFile;
use crate::metrics::{StoreMetrics, StoreMetricsSnapshot};
use crate::pager::{Pager, PagerOptions};
use crate::tree::record::END_KEY;
use crate::tree::VersionedBTree;
use crate::types::Version;

/// Result of a range read.
#[derive(Clone, Debug, Default)]
pub struct RangeResult {
    pub rows: Vec<(Vec<u8>, Vec<u8>)>,
    /// More data may exist past the limits.
    pub more: bool,
    /// When `more`, the last key returned; resume after (or before, for
    /// reverse reads) this key.
    pub read_through: Option<Vec<u8>>,
}

/// Storage accounting: bytes on the volume and within the data file.
#[derive(Clone, Copy, Debug, Default)]
pub struct StorageBytes {
    pub total: i64,
    pub free: i64,
    pub available: i64,
    pub used: i64,
}

/// An ordered key-value store over a single data file.
pub struct KvStore {
    pager: Arc<Pager>,
    tree: VersionedBTree,
    metrics: Arc<StoreMetrics>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore").finish_non_exhaustive()
    }
}

impl KvStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Self> {
        let pager = Pager::open(path.as_ref(), options)?;
        Self::with_pager(pager)
    }

    /// Open over an explicit block file; used by tests to inject faults.
    pub fn open_with_file(
        io: Arc<dyn BlockFile>,
        path: Option<PathBuf>,
        options: PagerOptions,
    ) -> Result<Self> {
        let pager = Pager::with_file(io, path, options)?;
        Self::with_pager(pager)
    }

    fn with_pager(pager: Arc<Pager>) -> Result<Self> {
        let metrics = Arc::new(StoreMetrics::default());
        let mut tree = VersionedBTree::open(Arc::clone(&pager), Arc::clone(&metrics))?;
        let next = Version(tree.last_committed_version().0 + 1);
        tree.set_write_version(next)?;
        info!(version = tree.last_committed_version().0, "kv.open");
        Ok(Self {
            pager,
            tree,
            metrics,
        })
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(GloamError::InvalidArgument("key must not be empty"));
        }
        if key >= END_KEY {
            return Err(GloamError::InvalidArgument("key is at or above the maximum key"));
        }
        Ok(())
    }

    /// Buffer a set; visible to reads after the next `commit`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        self.tree.set(key, value)
    }

    /// Buffer a clear of the half-open range `[begin, end)`.
    pub fn clear(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        if end > END_KEY {
            return Err(GloamError::InvalidArgument("range end is above the maximum key"));
        }
        if begin >= end {
            return Ok(());
        }
        self.tree.clear(begin, end)
    }

    /// Commit buffered changes durably, advance the retained version to the
    /// commit just made, and open the next write version.
    pub fn commit(&mut self) -> Result<()> {
        let version = self.tree.write_version();
        debug!(version = version.0, "kv.commit");
        self.tree.commit()?;
        self.tree.set_oldest_version(version);
        self.tree.set_write_version(Version(version.0 + 1))
    }

    pub fn read_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        self.metrics.gets(1);
        let mut cursor = self.tree.read_at_version(self.tree.last_committed_version())?;
        cursor.find_equal(key)?;
        Ok(if cursor.valid() {
            Some(cursor.value().to_vec())
        } else {
            None
        })
    }

    /// Like `read_value` but returns at most the first `max_len` bytes.
    pub fn read_value_prefix(&self, key: &[u8], max_len: u32) -> Result<Option<Vec<u8>>> {
        Self::check_key(key)?;
        self.metrics.gets(1);
        let mut cursor = self.tree.read_at_version(self.tree.last_committed_version())?;
        cursor.find_equal(key)?;
        Ok(if cursor.valid() {
            let value = cursor.value();
            let len = value.len().min(max_len as usize);
            Some(value[..len].to_vec())
        } else {
            None
        })
    }

    /// Read `[begin, end)`. A positive `row_limit` reads forward, negative
    /// reverse, zero returns nothing. Accumulation stops once the byte
    /// total reaches `byte_limit`; the crossing record is included.
    pub fn read_range(&self, begin: &[u8], end: &[u8], row_limit: i32, byte_limit: i32) -> Result<RangeResult> {
        if byte_limit <= 0 {
            return Err(GloamError::InvalidArgument("byte limit must be positive"));
        }
        self.metrics.range_reads(1);
        let mut result = RangeResult::default();
        if row_limit == 0 {
            return Ok(result);
        }

        let mut cursor = self.tree.read_at_version(self.tree.last_committed_version())?;
        let mut accumulated = 0usize;
        let mut remaining = row_limit.unsigned_abs() as usize;
        let byte_limit = byte_limit as usize;

        if row_limit > 0 {
            // Prefetch only pays off when more than one row is wanted.
            let prefetch = if row_limit > 1 { byte_limit } else { 0 };
            cursor.find_first_geq(begin, prefetch)?;
            while cursor.valid() && cursor.key() < end {
                accumulated += cursor.key().len() + cursor.value().len();
                result.rows.push((cursor.key().to_vec(), cursor.value().to_vec()));
                remaining -= 1;
                if remaining == 0 || accumulated >= byte_limit {
                    break;
                }
                cursor.next()?;
            }
        } else {
            cursor.find_last_leq(end, 0)?;
            if cursor.valid() && cursor.key() == end {
                cursor.prev()?;
            }
            while cursor.valid() && cursor.key() >= begin {
                accumulated += cursor.key().len() + cursor.value().len();
                result.rows.push((cursor.key().to_vec(), cursor.value().to_vec()));
                remaining -= 1;
                if remaining == 0 || accumulated >= byte_limit {
                    break;
                }
                cursor.prev()?;
            }
        }

        result.more = remaining == 0 || accumulated >= byte_limit;
        if result.more {
            result.read_through = result.rows.last().map(|(k, _)| k.clone());
        }
        Ok(result)
    }

    pub fn storage_bytes(&self) -> StorageBytes {
        let (page_count, reusable_pages, page_size) = self.pager.storage_counts();
        let (free, total) = self
            .pager
            .path()
            .and_then(|p| {
                let dir = p.parent().map(|d| d.to_path_buf()).unwrap_or(p);
                let free = fs2::available_space(&dir).ok()?;
                let total = fs2::total_space(&dir).ok()?;
                Some((free as i64, total as i64))
            })
            .unwrap_or((0, 0));
        let pager_bytes = page_count * page_size as i64;
        let reusable_bytes = reusable_pages * page_size as i64;
        StorageBytes {
            total,
            free,
            available: free + reusable_bytes,
            used: pager_bytes - reusable_bytes,
        }
    }

    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The latched fatal error, if one occurred.
    pub fn last_error(&self) -> Option<GloamError> {
        self.pager.fatal_error()
    }

    /// Pages in use by the tree (excludes headers and pager bookkeeping).
    pub fn user_page_count(&self) -> Result<i64> {
        self.pager.user_page_count()
    }

    /// Drain background reclamation: lazy subtree deletion and remap undo.
    pub fn run_maintenance(&mut self) -> Result<()> {
        self.tree.incremental_subtree_clear(usize::MAX)?;
        self.pager.drive_remap_undo(usize::MAX)?;
        Ok(())
    }

    /// Clear every key and verify that all storage is reclaimed.
    pub fn clear_all_and_verify(&mut self) -> Result<()> {
        self.tree.clear_all_and_verify()?;
        let next = Version(self.tree.last_committed_version().0 + 1);
        self.tree.set_write_version(next)
    }

    /// Close the store. Buffered, uncommitted changes are discarded.
    pub fn close(self) -> Result<()> {
        info!("kv.close");
        self.pager.close();
        Ok(())
    }

    /// Close and delete the data file.
    pub fn dispose(self) -> Result<()> {
        info!("kv.dispose");
        self.pager.dispose()
    }
}
