#![forbid(unsafe_code)]

//! The DWAL pager: maps logical page IDs to physical blocks in a single
//! file, provides page-granularity atomic updates through a remap queue
//! ("delayed write-ahead log"), and retains multi-version read snapshots.
//!
//! Atomic updates never overwrite a page in place. `atomic_update_page`
//! writes the new content to a fresh physical page and records a remap
//! `(version, original, new)`; reads at or after that version resolve the
//! original ID to the replacement. Once no retained snapshot can observe the
//! old content, a background pass copies the replacement back over the
//! original location and recycles the replacement page.

pub mod cache;
pub mod header;
pub mod page;
pub mod queue;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{GloamError, Result};
use crate::io::{BlockFile, StdBlockFile};
use crate::types::{PageId, Version, SMALLEST_PHYSICAL_BLOCK};
use cache::PageCache;
use header::{PagerHeader, PAGER_FORMAT_VERSION};
use page::PageBuffer;
use queue::{FifoQueue, QueueIo, QueueItem};

/// Configuration for the pager.
#[derive(Clone, Debug)]
pub struct PagerOptions {
    /// Page size in bytes; at least 4096 and a multiple of 4096. Applies
    /// only when creating a new file; an existing file keeps its size.
    pub page_size: u32,
    /// Page cache budget in bytes.
    pub cache_bytes: usize,
    /// Maximum remap entries undone per background slice.
    pub remap_undo_budget: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_bytes: 2 * 1024 * 1024,
            remap_undo_budget: 64,
        }
    }
}

/// Delayed-free queue item: the page may be reused only once the effective
/// oldest version has passed `version`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct DelayedFreeEntry {
    pub version: Version,
    pub page: PageId,
}

impl QueueItem for DelayedFreeEntry {
    fn encoded_len(&self) -> usize {
        16
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.0.to_be_bytes());
        out.extend_from_slice(&self.page.0.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 16 {
            return Err(GloamError::Corruption("delayed free entry truncated"));
        }
        Ok((
            Self {
                version: Version(i64::from_be_bytes(buf[0..8].try_into().unwrap())),
                page: PageId(u64::from_be_bytes(buf[8..16].try_into().unwrap())),
            },
            16,
        ))
    }
}

/// Remap queue item. An invalid `new` page is a tombstone: the original page
/// has been freed and may be recycled once its remaps are all undone.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct RemapEntry {
    pub version: Version,
    pub original: PageId,
    pub new: PageId,
}

impl QueueItem for RemapEntry {
    fn encoded_len(&self) -> usize {
        24
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.0.to_be_bytes());
        out.extend_from_slice(&self.original.0.to_be_bytes());
        out.extend_from_slice(&self.new.0.to_be_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 24 {
            return Err(GloamError::Corruption("remap entry truncated"));
        }
        Ok((
            Self {
                version: Version(i64::from_be_bytes(buf[0..8].try_into().unwrap())),
                original: PageId(u64::from_be_bytes(buf[8..16].try_into().unwrap())),
                new: PageId(u64::from_be_bytes(buf[16..24].try_into().unwrap())),
            },
            24,
        ))
    }
}

pub(crate) struct SnapshotState {
    version: Version,
    meta_key: Vec<u8>,
    expired: AtomicBool,
}

struct SnapshotEntry {
    state: Arc<SnapshotState>,
}

pub(crate) struct PagerCore {
    io: Arc<dyn BlockFile>,
    path: Option<PathBuf>,
    page_size: usize,
    cache: PageCache,
    /// Live header, mutated between commits.
    header: PagerHeader,
    /// Header as of the last durable commit.
    committed: PagerHeader,
    remap_index: HashMap<u64, BTreeMap<i64, PageId>>,
    snapshots: VecDeque<SnapshotEntry>,
    fatal: Option<GloamError>,
    closed: bool,
}

impl PagerCore {
    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(GloamError::Closed);
        }
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone_fatal());
        }
        Ok(())
    }

    fn set_fatal(&mut self, err: GloamError) -> GloamError {
        if err.is_fatal() && self.fatal.is_none() {
            warn!(error = %err, "pager.fatal");
            self.fatal = Some(err.clone_fatal());
        }
        err
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.set_fatal(e))
    }

    fn page_offset(&self, id: PageId) -> u64 {
        // Header pages occupy the first two smallest physical blocks; if the
        // configured page size is larger there is unused space before page 2.
        if id.0 <= 1 {
            id.0 * SMALLEST_PHYSICAL_BLOCK as u64
        } else {
            id.0 * self.page_size as u64
        }
    }

    fn read_physical(&mut self, id: PageId) -> Result<Arc<PageBuffer>> {
        let mut buf = vec![0u8; self.page_size];
        let read = self.io.read_at(self.page_offset(id), &mut buf);
        self.latch(read)?;
        let page = PageBuffer::from_bytes(buf);
        let verified = page.verify(id);
        self.latch(verified)?;
        trace!(page = id.0, "pager.read_physical");
        Ok(Arc::new(page))
    }

    /// Most recent content of `id`, committed or written this commit.
    fn read_page(&mut self, id: PageId, cacheable: bool, no_hit: bool) -> Result<Arc<PageBuffer>> {
        self.check_usable()?;
        if !cacheable {
            if let Some(page) = self.cache.get_if_exists(id) {
                return Ok(page);
            }
            return self.read_physical(id);
        }
        if let Some(page) = self.cache.get(id, no_hit) {
            return Ok(page);
        }
        let page = self.read_physical(id)?;
        self.cache.insert(id, page.clone());
        Ok(page)
    }

    /// Resolve `id` through the remap index for version `v`: the greatest
    /// remap entry with version <= v wins.
    fn resolve_at_version(&self, id: PageId, v: Version) -> PageId {
        if let Some(versions) = self.remap_index.get(&id.0) {
            if let Some((_, mapped)) = versions.range(..=v.0).next_back() {
                return *mapped;
            }
        }
        id
    }

    fn read_page_at_version(&mut self, id: PageId, v: Version, cacheable: bool, no_hit: bool) -> Result<Arc<PageBuffer>> {
        let resolved = self.resolve_at_version(id, v);
        if resolved != id {
            trace!(page = id.0, version = v.0, resolved = resolved.0, "pager.read_remapped");
        }
        self.read_page(resolved, cacheable, no_hit)
    }

    /// Replace the content of `id` in cache and on disk. Does not allocate.
    fn write_page(&mut self, id: PageId, mut page: PageBuffer) -> Result<()> {
        self.check_usable()?;
        debug_assert_eq!(page.size(), self.page_size);
        page.seal(id);
        let shared = Arc::new(page);
        self.cache.insert(id, shared.clone());
        let write = self.io.write_at(self.page_offset(id), shared.as_bytes());
        self.latch(write)?;
        trace!(page = id.0, "pager.write");
        Ok(())
    }

    fn write_header_page(&mut self, slot: u64, header: &PagerHeader) -> Result<()> {
        debug_assert!(slot <= 1);
        let mut page = PageBuffer::new(SMALLEST_PHYSICAL_BLOCK);
        header.encode(page.payload_mut())?;
        page.seal(PageId(slot));
        let write = self.io.write_at(slot * SMALLEST_PHYSICAL_BLOCK as u64, page.as_bytes());
        self.latch(write)?;
        Ok(())
    }

    fn read_header_page(&mut self, slot: u64) -> Result<PageBuffer> {
        let mut buf = vec![0u8; SMALLEST_PHYSICAL_BLOCK];
        let read = self.io.read_at(slot * SMALLEST_PHYSICAL_BLOCK as u64, &mut buf);
        self.latch(read)?;
        Ok(PageBuffer::from_bytes(buf))
    }

    fn sync(&mut self) -> Result<()> {
        let sync = self.io.sync();
        self.latch(sync)
    }

    /// Append a fresh page at the end of the file.
    fn new_last_page_id(&mut self) -> PageId {
        let id = PageId(self.header.page_count as u64);
        self.header.page_count += 1;
        id
    }

    /// Retention floor for page reuse: the last committed oldest version or
    /// the front snapshot's version, whichever is lower.
    fn effective_oldest(&self) -> Version {
        let front = self
            .snapshots
            .front()
            .map(|s| s.state.version)
            .unwrap_or(self.committed.oldest_version);
        self.committed.oldest_version.min(front)
    }

    fn push_latest_snapshot(&mut self) {
        self.snapshots.push_back(SnapshotEntry {
            state: Arc::new(SnapshotState {
                version: self.committed.committed_version,
                meta_key: self.committed.meta_key.clone(),
                expired: AtomicBool::new(false),
            }),
        });
    }

    /// Drop snapshots older than `v` that nothing else references. The most
    /// recent snapshot is always kept.
    fn expire_snapshots(&mut self, v: Version) {
        while self.snapshots.len() > 1 {
            let front = &self.snapshots[0];
            if front.state.version >= v || Arc::strong_count(&front.state) > 1 {
                break;
            }
            front.state.expired.store(true, Ordering::Release);
            trace!(version = front.state.version.0, "pager.snapshot_expired");
            self.snapshots.pop_front();
        }
    }
}

impl QueueIo for PagerCore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read_page(&mut self, id: PageId) -> Result<Arc<PageBuffer>> {
        PagerCore::read_page(self, id, true, false)
    }

    fn write_page(&mut self, id: PageId, page: PageBuffer) -> Result<()> {
        PagerCore::write_page(self, id, page)
    }
}

pub(crate) struct PagerShared {
    core: PagerCore,
    free_list: FifoQueue<PageId>,
    delayed_free: FifoQueue<DelayedFreeEntry>,
    remap_queue: FifoQueue<RemapEntry>,
}

impl PagerShared {
    fn route_freed(&mut self, freed: Vec<PageId>) {
        // Queue chain pages are freed at version 0 so they can be reused
        // right after the next commit.
        for id in freed {
            self.free_page_at(id, Version(0));
        }
    }

    fn free_page_at(&mut self, id: PageId, v: Version) {
        if self.core.remap_index.contains_key(&id.0) {
            // Cannot reuse the ID until its remaps are undone; leave a
            // tombstone to be processed in order by the remap-undo pass.
            trace!(page = id.0, version = v.0, "pager.free_remapped");
            self.remap_queue.push_back(RemapEntry {
                version: v,
                original: id,
                new: PageId::INVALID,
            });
        } else if v < self.core.effective_oldest() {
            trace!(page = id.0, version = v.0, "pager.free_now");
            self.free_list.push_back(id);
        } else {
            trace!(page = id.0, version = v.0, "pager.free_later");
            self.delayed_free.push_back(DelayedFreeEntry { version: v, page: id });
        }
    }

    fn new_page_id(&mut self) -> Result<PageId> {
        let mut freed = Vec::new();
        let picked = self.free_list.pop(&mut self.core, None, &mut freed)?;
        let id = match picked {
            Some(id) => {
                trace!(page = id.0, "pager.alloc.free_list");
                id
            }
            None => {
                let bound = DelayedFreeEntry {
                    version: self.core.effective_oldest(),
                    page: PageId(u64::MAX),
                };
                match self.delayed_free.pop(&mut self.core, Some(&bound), &mut freed)? {
                    Some(entry) => {
                        trace!(page = entry.page.0, "pager.alloc.delayed");
                        entry.page
                    }
                    None => {
                        let id = self.core.new_last_page_id();
                        trace!(page = id.0, "pager.alloc.grow");
                        id
                    }
                }
            }
        };
        self.route_freed(freed);
        Ok(id)
    }

    fn atomic_update_page(&mut self, id: PageId, page: PageBuffer, v: Version) -> Result<PageId> {
        let new_id = self.new_page_id()?;
        self.core.write_page(new_id, page)?;
        self.remap_queue.push_back(RemapEntry {
            version: v,
            original: id,
            new: new_id,
        });
        self.core.remap_index.entry(id.0).or_default().insert(v.0, new_id);
        trace!(page = id.0, new = new_id.0, version = v.0, "pager.atomic_update");
        Ok(id)
    }

    /// Two-phase flush of the three queues. Pops can free pages (a push) and
    /// pushes can allocate pages (a pop), so the free and delayed-free
    /// queues are driven to a fixed point before any tail is capped.
    fn flush_queues(&mut self) -> Result<()> {
        loop {
            let needed = self.remap_queue.pages_needed();
            if needed == 0 {
                break;
            }
            let id = self.new_page_id()?;
            self.remap_queue.reserve(id);
        }
        self.remap_queue.materialize(&mut self.core)?;

        loop {
            let mut work = false;
            if self.free_list.pages_needed() > 0 {
                let id = self.new_page_id()?;
                self.free_list.reserve(id);
                work = true;
            }
            if self.delayed_free.pages_needed() > 0 {
                let id = self.new_page_id()?;
                self.delayed_free.reserve(id);
                work = true;
            }
            if !work {
                break;
            }
        }
        self.free_list.materialize(&mut self.core)?;
        self.delayed_free.materialize(&mut self.core)?;
        Ok(())
    }

    fn commit(&mut self, remap_undo_budget: usize) -> Result<()> {
        self.core.check_usable()?;
        debug!(version = self.core.header.committed_version.0, "pager.commit.begin");

        // Preserve the last known good header before anything else moves.
        let backup = self.core.committed.clone();
        self.core.write_header_page(1, &backup)?;

        self.flush_queues()?;
        self.core.header.free_list = self.free_list.state();
        self.core.header.delayed_free_list = self.delayed_free.state();
        self.core.header.remap_queue = self.remap_queue.state();

        // Data must be durable before the header that references it.
        self.core.sync()?;
        let header = self.core.header.clone();
        self.core.write_header_page(0, &header)?;
        self.core.sync()?;

        self.core.committed = self.core.header.clone();
        self.core.push_latest_snapshot();
        let oldest = self.core.header.oldest_version;
        self.core.expire_snapshots(oldest);

        info!(
            version = self.core.committed.committed_version.0,
            oldest = oldest.0,
            pages = self.core.header.page_count,
            "pager.commit"
        );

        // The background remap eraser runs between commits; in this
        // synchronous rendition it is a budgeted slice at the same point.
        self.drive_remap_undo(remap_undo_budget)?;
        Ok(())
    }

    /// Undo remap entries whose version has fallen below the retention
    /// floor: copy replacement content back over the original location, drop
    /// the index entry, and recycle the replacement page. Tombstones release
    /// the original ID itself. Processes at most `budget` entries.
    fn drive_remap_undo(&mut self, budget: usize) -> Result<usize> {
        let cutoff = RemapEntry {
            version: self.core.effective_oldest(),
            original: PageId(u64::MAX),
            new: PageId(u64::MAX),
        };
        let mut undone = 0;
        while undone < budget {
            let mut freed = Vec::new();
            let popped = self.remap_queue.pop(&mut self.core, Some(&cutoff), &mut freed)?;
            self.route_freed(freed);
            let entry = match popped {
                Some(entry) => entry,
                None => break,
            };
            if !entry.new.is_valid() {
                // Tombstone: every remap for this page precedes it in the
                // queue and has been undone, so the original can be freed.
                let has_remaps = self.core.remap_index.contains_key(&entry.original.0);
                debug_assert!(!has_remaps, "tombstone popped before remaps were undone");
                trace!(page = entry.original.0, version = entry.version.0, "pager.remap_undo.tombstone");
                self.free_page_at(entry.original, entry.version);
            } else {
                let data = self.core.read_page(entry.new, false, false)?;
                self.core.write_page(entry.original, data.clone_for_update())?;
                if let Some(versions) = self.core.remap_index.get_mut(&entry.original.0) {
                    versions.remove(&entry.version.0);
                    if versions.is_empty() {
                        self.core.remap_index.remove(&entry.original.0);
                    }
                }
                trace!(page = entry.original.0, new = entry.new.0, "pager.remap_undo.copy");
                self.free_page_at(entry.new, Version(0));
            }
            undone += 1;
        }
        if undone > 0 {
            debug!(undone, remaining = self.remap_queue.num_entries(), "pager.remap_undo");
        }
        Ok(undone)
    }
}

/// The pager. Shared via `Arc`; interior state is behind a single mutex, so
/// all operations are safe from any thread while the engine itself runs a
/// single writer.
pub struct Pager {
    shared: Mutex<PagerShared>,
    remap_undo_budget: usize,
}

impl Pager {
    /// Open or create a pager file at `path`.
    pub fn open(path: impl AsRef<Path>, options: PagerOptions) -> Result<Arc<Pager>> {
        let path = path.as_ref();
        let io = StdBlockFile::open(path)?;
        Self::with_file(Arc::new(io), Some(path.to_path_buf()), options)
    }

    /// Open or create a pager over an explicit block file. Used by tests to
    /// inject fault behavior.
    pub fn with_file(io: Arc<dyn BlockFile>, path: Option<PathBuf>, options: PagerOptions) -> Result<Arc<Pager>> {
        if options.page_size < SMALLEST_PHYSICAL_BLOCK as u32
            || options.page_size % SMALLEST_PHYSICAL_BLOCK as u32 != 0
        {
            return Err(GloamError::InvalidArgument(
                "page size must be a multiple of 4096 and at least 4096",
            ));
        }
        let file_len = io.len()?;
        let shared = if file_len >= (SMALLEST_PHYSICAL_BLOCK * 2) as u64 {
            Self::recover(io, path, &options)?
        } else {
            // A file shorter than two header pages was never successfully
            // committed; build a fresh pager in its place.
            Self::create(io, path, &options)?
        };
        let pager = Arc::new(Pager {
            shared: Mutex::new(shared),
            remap_undo_budget: options.remap_undo_budget,
        });
        if file_len < (SMALLEST_PHYSICAL_BLOCK * 2) as u64 {
            pager.commit()?;
        }
        Ok(pager)
    }

    fn create(io: Arc<dyn BlockFile>, path: Option<PathBuf>, options: &PagerOptions) -> Result<PagerShared> {
        let page_size = options.page_size as usize;
        info!(page_size, "pager.create");
        let mut header = PagerHeader::new(options.page_size);
        // Pages 0 and 1 are reserved for the header and its backup.
        header.page_count = 2;
        let mut core = PagerCore {
            io,
            path,
            page_size,
            cache: PageCache::new(options.cache_bytes, page_size),
            committed: header.clone(),
            header,
            remap_index: HashMap::new(),
            snapshots: VecDeque::new(),
            fatal: None,
            closed: false,
        };
        let free_list = FifoQueue::create("free_list", core.new_last_page_id(), page_size);
        let delayed_free = FifoQueue::create("delayed_free", core.new_last_page_id(), page_size);
        let remap_queue = FifoQueue::create("remap_queue", core.new_last_page_id(), page_size);
        core.header.free_list = free_list.state();
        core.header.delayed_free_list = delayed_free.state();
        core.header.remap_queue = remap_queue.state();
        core.committed = core.header.clone();
        Ok(PagerShared {
            core,
            free_list,
            delayed_free,
            remap_queue,
        })
    }

    fn recover(io: Arc<dyn BlockFile>, path: Option<PathBuf>, options: &PagerOptions) -> Result<PagerShared> {
        let mut header_buf = vec![0u8; SMALLEST_PHYSICAL_BLOCK];
        io.read_at(0, &mut header_buf)?;
        let mut header_page = PageBuffer::from_bytes(header_buf);
        let mut recovered_from_backup = false;

        if header_page.verify(PageId(0)).is_err() {
            warn!("pager.recover.header_damaged");
            let mut backup_buf = vec![0u8; SMALLEST_PHYSICAL_BLOCK];
            io.read_at(SMALLEST_PHYSICAL_BLOCK as u64, &mut backup_buf)?;
            let backup_page = PageBuffer::from_bytes(backup_buf);
            backup_page.verify(PageId(1)).map_err(|_| {
                GloamError::Corruption("both header pages failed checksum verification")
            })?;
            header_page = backup_page;
            recovered_from_backup = true;
        }

        let header = PagerHeader::decode(header_page.payload())?;
        if header.format_version != PAGER_FORMAT_VERSION {
            return Err(GloamError::FormatMismatch {
                found: header.format_version,
                supported: PAGER_FORMAT_VERSION,
            });
        }
        let page_size = header.page_size as usize;
        if page_size < SMALLEST_PHYSICAL_BLOCK || page_size % SMALLEST_PHYSICAL_BLOCK != 0 {
            return Err(GloamError::Corruption("header page size is not block aligned"));
        }
        if page_size != options.page_size as usize {
            warn!(existing = page_size, desired = options.page_size, "pager.recover.page_size_differs");
        }

        let mut core = PagerCore {
            io,
            path,
            page_size,
            cache: PageCache::new(options.cache_bytes, page_size),
            committed: header.clone(),
            header,
            remap_index: HashMap::new(),
            snapshots: VecDeque::new(),
            fatal: None,
            closed: false,
        };

        let free_list: FifoQueue<PageId> = FifoQueue::recover("free_list", core.header.free_list, page_size);
        let delayed_free: FifoQueue<DelayedFreeEntry> = FifoQueue::recover("delayed_free", core.header.delayed_free_list, page_size);
        let remap_queue: FifoQueue<RemapEntry> = FifoQueue::recover("remap_queue", core.header.remap_queue, page_size);

        for entry in remap_queue.peek_all(&mut core)? {
            if entry.new.is_valid() {
                core.remap_index
                    .entry(entry.original.0)
                    .or_default()
                    .insert(entry.version.0, entry.new);
            }
        }

        if recovered_from_backup {
            // Promote the backup so the next crash recovers from page 0
            // again. If this write fails the backup is still intact.
            let promoted = core.committed.clone();
            core.write_header_page(0, &promoted)?;
            core.sync()?;
            info!("pager.recover.promoted_backup");
        }

        core.push_latest_snapshot();
        info!(
            version = core.committed.committed_version.0,
            oldest = core.committed.oldest_version.0,
            pages = core.header.page_count,
            remaps = core.remap_index.len(),
            "pager.recover"
        );
        Ok(PagerShared {
            core,
            free_list,
            delayed_free,
            remap_queue,
        })
    }

    pub fn page_size(&self) -> usize {
        self.shared.lock().core.page_size
    }

    /// Bytes of a page usable by callers (excludes the trailing checksum).
    pub fn usable_page_size(&self) -> usize {
        self.page_size() - 4
    }

    pub fn new_page_buffer(&self) -> PageBuffer {
        PageBuffer::new(self.page_size())
    }

    /// Allocate a page ID: recycled from the free list, from the delayed
    /// free list if its version has passed the retention floor, or appended
    /// to the file.
    pub fn new_page_id(&self) -> Result<PageId> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        shared.new_page_id()
    }

    /// Replace the content of `id`. Does not allocate; the change becomes
    /// durable at the next commit.
    pub fn update_page(&self, id: PageId, page: PageBuffer) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.core.write_page(id, page)
    }

    /// Write `page` as the content of `id` as of `version` without touching
    /// the bytes at `id`: allocates a replacement page and records a remap.
    /// Returns `id`; callers keep referring to the original.
    pub fn atomic_update_page(&self, id: PageId, page: PageBuffer, version: Version) -> Result<PageId> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        shared.atomic_update_page(id, page, version)
    }

    /// Release `id`, freed as of `version`.
    pub fn free_page(&self, id: PageId, version: Version) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        shared.free_page_at(id, version);
        Ok(())
    }

    pub fn read_page(&self, id: PageId, cacheable: bool, no_hit: bool) -> Result<Arc<PageBuffer>> {
        self.shared.lock().core.read_page(id, cacheable, no_hit)
    }

    /// Snapshot for reading at the greatest committed version `<= v`.
    pub fn get_read_snapshot(self: &Arc<Self>, v: Version) -> Result<ReadSnapshot> {
        let shared = self.shared.lock();
        shared.core.check_usable()?;
        let snapshots = &shared.core.snapshots;
        let earliest = snapshots.front().map(|s| s.state.version).unwrap_or(Version(0));
        let entry = snapshots
            .iter()
            .rev()
            .find(|s| s.state.version <= v)
            .ok_or(GloamError::VersionInvalid {
                requested: v.0,
                earliest: earliest.0,
            })?;
        Ok(ReadSnapshot {
            pager: Arc::clone(self),
            state: Arc::clone(&entry.state),
        })
    }

    /// Record the oldest version to retain as of the next commit. Snapshots
    /// older than `v` that are no longer referenced are released now.
    pub fn set_oldest_version(&self, v: Version) -> Result<()> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        if v < shared.core.header.oldest_version || v > shared.core.header.committed_version {
            return Err(GloamError::InvalidArgument(
                "oldest version must be between the current oldest and the committed version",
            ));
        }
        shared.core.header.oldest_version = v;
        shared.core.expire_snapshots(v);
        Ok(())
    }

    pub fn oldest_version(&self) -> Version {
        self.shared.lock().core.header.oldest_version
    }

    /// Last durably committed version.
    pub fn latest_version(&self) -> Version {
        self.shared.lock().core.committed.committed_version
    }

    pub fn effective_oldest(&self) -> Version {
        self.shared.lock().core.effective_oldest()
    }

    pub fn set_commit_version(&self, v: Version) {
        self.shared.lock().core.header.committed_version = v;
    }

    pub fn meta_key(&self) -> Vec<u8> {
        self.shared.lock().core.committed.meta_key.clone()
    }

    pub fn set_meta_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > PagerHeader::max_meta_key_len() {
            return Err(GloamError::InvalidArgument("meta key too large for header page"));
        }
        self.shared.lock().core.header.meta_key = key.to_vec();
        Ok(())
    }

    /// Make all updates since the previous commit durable.
    pub fn commit(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        let budget = self.remap_undo_budget;
        let result = shared.commit(budget);
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(shared.core.set_fatal(e)),
        }
    }

    /// Run a remap-undo slice of at most `budget` entries.
    pub fn drive_remap_undo(&self, budget: usize) -> Result<usize> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        shared.drive_remap_undo(budget)
    }

    /// Number of pages in use by the pager's user. Drains the remap queue
    /// and flushes the free queues first so the accounting is exact.
    pub fn user_page_count(&self) -> Result<i64> {
        let mut shared = self.shared.lock();
        shared.core.check_usable()?;
        shared.drive_remap_undo(usize::MAX)?;
        shared.flush_queues()?;
        let count = shared.core.header.page_count
            - 2
            - shared.free_list.num_pages()
            - shared.free_list.num_entries()
            - shared.delayed_free.num_pages()
            - shared.delayed_free.num_entries()
            - shared.remap_queue.num_pages();
        Ok(count)
    }

    /// `(page_count, reusable_pages, page_size)` for storage accounting.
    pub fn storage_counts(&self) -> (i64, i64, usize) {
        let shared = self.shared.lock();
        let reusable = shared.free_list.num_entries() + shared.delayed_free.num_entries();
        (shared.core.header.page_count, reusable, shared.core.page_size)
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.shared.lock().core.path.clone()
    }

    /// The first latched fatal error, if any.
    pub fn fatal_error(&self) -> Option<GloamError> {
        self.shared.lock().core.fatal.as_ref().map(|e| e.clone_fatal())
    }

    /// Stop accepting operations and drop cached state. Safe after a fatal
    /// error; does not attempt further writes.
    pub fn close(&self) {
        let mut shared = self.shared.lock();
        shared.core.closed = true;
        shared.core.cache.clear();
        shared.core.snapshots.clear();
        info!("pager.close");
    }

    /// Close and delete the underlying file.
    pub fn dispose(&self) -> Result<()> {
        self.close();
        if let Some(path) = self.path() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// A read view at one committed version. Holding a snapshot pins the
/// retention floor at or below its version until it is dropped.
#[derive(Clone)]
pub struct ReadSnapshot {
    pager: Arc<Pager>,
    state: Arc<SnapshotState>,
}

impl std::fmt::Debug for ReadSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadSnapshot").finish_non_exhaustive()
    }
}

impl ReadSnapshot {
    pub fn version(&self) -> Version {
        self.state.version
    }

    pub fn meta_key(&self) -> &[u8] {
        &self.state.meta_key
    }

    /// Read the content of `id` as visible at this snapshot's version.
    pub fn read_page(&self, id: PageId, cacheable: bool, no_hit: bool) -> Result<Arc<PageBuffer>> {
        if self.state.expired.load(Ordering::Acquire) {
            return Err(GloamError::TransactionTooOld(self.state.version.0));
        }
        let mut shared = self.pager.shared.lock();
        shared.core.read_page_at_version(id, self.state.version, cacheable, no_hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn filled_page(pager: &Pager, byte: u8) -> PageBuffer {
        let mut page = pager.new_page_buffer();
        page.payload_mut().fill(byte);
        page
    }

    #[test]
    fn create_commit_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pager.glm");
        {
            let pager = Pager::open(&path, PagerOptions::default()).unwrap();
            assert_eq!(pager.latest_version(), Version(1));
            let id = pager.new_page_id().unwrap();
            pager.update_page(id, filled_page(&pager, 0x11)).unwrap();
            pager.set_commit_version(Version(2));
            pager.commit().unwrap();
            assert_eq!(pager.latest_version(), Version(2));
        }
        let pager = Pager::open(&path, PagerOptions::default()).unwrap();
        assert_eq!(pager.latest_version(), Version(2));
    }

    #[test]
    fn update_then_read_back() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let id = pager.new_page_id().unwrap();
        pager.update_page(id, filled_page(&pager, 0x42)).unwrap();
        let read = pager.read_page(id, true, false).unwrap();
        assert!(read.payload().iter().all(|&b| b == 0x42));
    }

    #[test]
    fn atomic_update_preserves_old_version_for_snapshots() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let id = pager.new_page_id().unwrap();
        pager.update_page(id, filled_page(&pager, 0xaa)).unwrap();
        pager.set_commit_version(Version(2));
        pager.commit().unwrap();

        let old_snapshot = pager.get_read_snapshot(Version(2)).unwrap();

        // New content for the same logical ID at version 3.
        let ret = pager
            .atomic_update_page(id, filled_page(&pager, 0xbb), Version(3))
            .unwrap();
        assert_eq!(ret, id);
        pager.set_commit_version(Version(3));
        pager.commit().unwrap();

        let new_snapshot = pager.get_read_snapshot(Version(3)).unwrap();
        assert!(old_snapshot.read_page(id, true, false).unwrap().payload()[0] == 0xaa);
        assert!(new_snapshot.read_page(id, true, false).unwrap().payload()[0] == 0xbb);
    }

    #[test]
    fn remap_undo_copies_back_and_recycles() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let id = pager.new_page_id().unwrap();
        pager.update_page(id, filled_page(&pager, 0x01)).unwrap();
        pager.set_commit_version(Version(2));
        pager.commit().unwrap();

        pager.atomic_update_page(id, filled_page(&pager, 0x02), Version(3)).unwrap();
        pager.set_commit_version(Version(3));
        pager.set_oldest_version(Version(2)).unwrap();
        pager.commit().unwrap();

        // Retire version 2; the remap becomes undoable.
        pager.set_oldest_version(Version(3)).unwrap();
        pager.set_commit_version(Version(4));
        pager.commit().unwrap();
        pager.drive_remap_undo(usize::MAX).unwrap();

        // After undo the original location holds the new content directly.
        let direct = pager.read_page(id, true, false).unwrap();
        assert_eq!(direct.payload()[0], 0x02);
        let snap = pager.get_read_snapshot(Version(4)).unwrap();
        assert_eq!(snap.read_page(id, true, false).unwrap().payload()[0], 0x02);
    }

    #[test]
    fn snapshot_below_retained_range_is_rejected() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let err = pager.get_read_snapshot(Version(0)).unwrap_err();
        assert!(matches!(err, GloamError::VersionInvalid { .. }));
    }

    #[test]
    fn freed_pages_are_reused_after_a_commit() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let id = pager.new_page_id().unwrap();
        pager.update_page(id, filled_page(&pager, 0x07)).unwrap();
        pager.set_commit_version(Version(2));
        pager.commit().unwrap();

        pager.free_page(id, Version(0)).unwrap();
        pager.set_commit_version(Version(3));
        pager.commit().unwrap();

        let reused = pager.new_page_id().unwrap();
        assert_eq!(reused, id);
    }

    #[test]
    fn corrupted_primary_header_recovers_from_backup() {
        use std::io::{Read, Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let path = dir.path().join("p.glm");
        {
            let pager = Pager::open(&path, PagerOptions::default()).unwrap();
            let id = pager.new_page_id().unwrap();
            pager.update_page(id, filled_page(&pager, 0x55)).unwrap();
            pager.set_commit_version(Version(2));
            pager.commit().unwrap();
            // A second commit makes the backup header reflect version 2.
            pager.set_commit_version(Version(3));
            pager.commit().unwrap();
        }

        // Flip bytes in the primary header.
        let mut file = std::fs::OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(100)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        file.seek(SeekFrom::Start(100)).unwrap();
        file.write_all(&byte).unwrap();
        file.sync_all().unwrap();
        drop(file);

        let pager = Pager::open(&path, PagerOptions::default()).unwrap();
        // The backup held the previous committed state.
        assert_eq!(pager.latest_version(), Version(2));
    }

    #[test]
    fn page_accounting_balances_after_quiescence() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(dir.path().join("p.glm"), PagerOptions::default()).unwrap();
        let mut ids = Vec::new();
        for i in 0..10u8 {
            let id = pager.new_page_id().unwrap();
            pager.update_page(id, filled_page(&pager, i)).unwrap();
            ids.push(id);
        }
        pager.set_commit_version(Version(2));
        pager.commit().unwrap();
        assert_eq!(pager.user_page_count().unwrap(), 10);

        for id in &ids {
            pager.free_page(*id, Version(0)).unwrap();
        }
        pager.set_commit_version(Version(3));
        pager.commit().unwrap();
        assert_eq!(pager.user_page_count().unwrap(), 0);
    }
}
