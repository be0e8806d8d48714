#![forbid(unsafe_code)]

//! Copy-on-write versioned B-tree over the DWAL pager.
//!
//! Writes accumulate in an in-memory mutation buffer; `commit` walks the
//! tree top-down against the buffer, rewriting only subtrees the buffer
//! touches. Rewrites allocate new pages (or atomically update in place via
//! the pager's remap protocol when a page's shape is preserved), so earlier
//! snapshots keep reading their old roots. Subtrees dropped by range clears
//! are queued for incremental background deletion rather than traversed
//! eagerly.

pub mod cursor;
pub mod delta;
pub mod mutation;
pub mod record;

use std::cmp::Ordering;
use std::sync::Arc;

use smallvec::smallvec;
use tracing::{debug, info, trace};

use crate::error::{GloamError, Result};
use crate::metrics::StoreMetrics;
use crate::pager::header::QueueState;
use crate::pager::page::PageBuffer;
use crate::pager::queue::{FifoQueue, QueueIo, QueueItem};
use crate::pager::{Pager, ReadSnapshot};
use crate::types::{PageId, Version};
use delta::{
    build_tree, empty_tree_size, node_header_len, try_build_tree, values_in_order, DeltaTreeNav,
    NavContent, TreeCursor, LARGE_TREE_PER_NODE_EXTRA, SMALL_SIZE_LIMIT,
};
use mutation::MutationBuffer;
use record::{decode_child_page, BTreePageId, Record, END_KEY};

/// On-disk format version of the tree's meta key and page layout.
pub const TREE_FORMAT_VERSION: u16 = 1;

/// B-tree page payload header: `height u8 | kv_bytes u32`.
pub(crate) const BTREE_PAGE_HDR_LEN: usize = 5;

/// Target fill fraction when packing records into pages.
const FILL_FACTOR: f32 = 0.66;

/// Deepest unbalanced path an in-place insert may create before the page
/// falls back to a linear merge and rebuild.
const MAX_INSERT_HEIGHT: usize = 8;

/// Lazy-delete entries read per batch.
const LAZY_DELETE_BATCH: usize = 10;

/// Lazy-delete queue item: a subtree root to be descended and freed once
/// `version` falls below the retention floor.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub(crate) struct LazyDeleteEntry {
    version: Version,
    pages: BTreePageId,
}

impl QueueItem for LazyDeleteEntry {
    fn encoded_len(&self) -> usize {
        8 + 1 + self.pages.len() * 8
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.0.to_be_bytes());
        out.push(self.pages.len() as u8);
        for page in &self.pages {
            out.extend_from_slice(&page.0.to_be_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 9 {
            return Err(GloamError::Corruption("lazy delete entry truncated"));
        }
        let version = Version(i64::from_be_bytes(buf[0..8].try_into().unwrap()));
        let count = buf[8] as usize;
        let end = 9 + count * 8;
        if count == 0 || buf.len() < end {
            return Err(GloamError::Corruption("lazy delete entry truncated"));
        }
        let mut pages = BTreePageId::new();
        for chunk in buf[9..end].chunks_exact(8) {
            pages.push(PageId(u64::from_be_bytes(chunk.try_into().unwrap())));
        }
        Ok((Self { version, pages }, end))
    }
}

/// The tree's root descriptor, stored as the pager's opaque meta key.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct TreeMeta {
    pub format_version: u16,
    pub height: u8,
    pub lazy_delete_queue: QueueState,
    pub root: BTreePageId,
}

impl TreeMeta {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 34 + self.root.len() * 8);
        out.extend_from_slice(&self.format_version.to_be_bytes());
        out.push(self.height);
        self.lazy_delete_queue.encode_into(&mut out);
        out.push(self.root.len() as u8);
        for page in &self.root {
            out.extend_from_slice(&page.0.to_be_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 3 + 34 + 1 {
            return Err(GloamError::Corruption("tree meta key truncated"));
        }
        let format_version = u16::from_be_bytes(buf[0..2].try_into().unwrap());
        let height = buf[2];
        let lazy_delete_queue = QueueState::decode_from(&buf[3..37]);
        let count = buf[37] as usize;
        let end = 38 + count * 8;
        if count == 0 || buf.len() < end {
            return Err(GloamError::Corruption("tree meta root list truncated"));
        }
        let mut root = BTreePageId::new();
        for chunk in buf[38..end].chunks_exact(8) {
            root.push(PageId(u64::from_be_bytes(chunk.try_into().unwrap())));
        }
        Ok(Self {
            format_version,
            height,
            lazy_delete_queue,
            root,
        })
    }
}

/// Locking adapter so the lazy-delete queue can use the pager's public
/// interface for its page storage.
struct PagerQueueIo<'a> {
    pager: &'a Pager,
}

impl QueueIo for PagerQueueIo<'_> {
    fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    fn read_page(&mut self, id: PageId) -> Result<Arc<PageBuffer>> {
        self.pager.read_page(id, true, false)
    }

    fn write_page(&mut self, id: PageId, page: PageBuffer) -> Result<()> {
        self.pager.update_page(id, page)
    }
}

/// Read the logical content of a B-tree page: the concatenated payloads of
/// its pager pages.
pub(crate) fn read_page_content(
    snapshot: &ReadSnapshot,
    id: &BTreePageId,
    for_lazy_delete: bool,
    metrics: &StoreMetrics,
) -> Result<Arc<Vec<u8>>> {
    metrics.page_reads(1);
    if id.len() > 1 {
        metrics.ext_page_reads(id.len() as u64 - 1);
    }
    let mut content = Vec::new();
    for page_id in id {
        let page = snapshot.read_page(*page_id, !for_lazy_delete, false)?;
        content.extend_from_slice(page.payload());
    }
    if content.len() < BTREE_PAGE_HDR_LEN + empty_tree_size() {
        return Err(GloamError::Corruption("btree page content truncated"));
    }
    Ok(Arc::new(content))
}

pub(crate) fn content_height(content: &[u8]) -> u8 {
    content[0]
}

/// Result of committing one subtree: the replacement child link records (or
/// the surviving original link if unchanged; empty if the subtree is gone)
/// plus the upper bound those links were encoded against.
struct ChildLinks {
    children: Vec<Record>,
    upper_bound: Record,
}

impl ChildLinks {
    fn unchanged(decode_lower: &Record, decode_upper: &Record) -> Self {
        Self {
            children: vec![decode_lower.clone()],
            upper_bound: decode_upper.clone(),
        }
    }

    fn gone(decode_upper: &Record) -> Self {
        Self {
            children: Vec::new(),
            upper_bound: decode_upper.clone(),
        }
    }
}

/// Rebuilds an internal page's record list from its children's commit
/// results, tracking whether anything actually changed. Whenever a child's
/// recorded upper bound does not match the next child's lower bound (a
/// subtree shrank or vanished), a value-less placeholder record preserves
/// the previous child's decodable upper bound.
struct InternalPageBuilder {
    cursor: TreeCursor,
    entries: Vec<Record>,
    last_upper_bound: Record,
    modified: bool,
    child_page_count: usize,
}

impl InternalPageBuilder {
    fn new(cursor: TreeCursor) -> Self {
        Self {
            cursor,
            entries: Vec::new(),
            last_upper_bound: Record::default(),
            modified: false,
            child_page_count: 0,
        }
    }

    fn add_entry(&mut self, nav: &mut DeltaTreeNav, rec: Record) -> Result<()> {
        if rec.value.is_some() {
            self.child_page_count += 1;
        }
        if !self.modified {
            match nav.get(&self.cursor) {
                Some(original) if *original == rec => {
                    nav.move_next(&mut self.cursor)?;
                }
                _ => {
                    trace!("btree.internal_builder.modified");
                    self.modified = true;
                }
            }
        }
        self.entries.push(rec);
        Ok(())
    }

    fn add_entries(&mut self, nav: &mut DeltaTreeNav, links: ChildLinks) -> Result<()> {
        if !self.entries.is_empty()
            && self.entries.last().expect("non-empty").value.is_some()
            && (links.children.is_empty()
                || !links.children[0].same_except_value(&self.last_upper_bound))
        {
            let placeholder = self.last_upper_bound.without_value();
            self.add_entry(nav, placeholder)?;
        }
        for child in links.children {
            self.add_entry(nav, child)?;
        }
        self.last_upper_bound = links.upper_bound;
        Ok(())
    }

    fn finalize(&mut self, nav: &mut DeltaTreeNav, upper: &Record, decode_upper: &Record) -> Result<()> {
        self.modified = self.modified || self.cursor.valid();
        if !self.entries.is_empty() && self.entries.last().expect("non-empty").value.is_some() {
            if !self.modified && !self.last_upper_bound.same_except_value(decode_upper) {
                self.modified = true;
            }
            if self.modified && !self.last_upper_bound.same_except_value(upper) {
                let placeholder = self.last_upper_bound.without_value();
                self.add_entry(nav, placeholder)?;
                self.last_upper_bound = upper.clone();
            }
        }
        Ok(())
    }
}

/// The versioned B-tree. Single writer; readers operate on pager snapshots
/// through [`cursor::Cursor`].
pub struct VersionedBTree {
    pager: Arc<Pager>,
    meta: TreeMeta,
    lazy_queue: FifoQueue<LazyDeleteEntry>,
    buffer: Option<MutationBuffer>,
    write_version: Version,
    last_committed: Version,
    new_oldest: Version,
    lazy_delete_budget: usize,
    metrics: Arc<StoreMetrics>,
}

impl VersionedBTree {
    /// Open the tree stored in `pager`, creating an empty one on first use.
    pub fn open(pager: Arc<Pager>, metrics: Arc<StoreMetrics>) -> Result<Self> {
        let latest = pager.latest_version();
        let meta_key = pager.meta_key();
        let page_size = pager.page_size();

        let (meta, lazy_queue, last_committed) = if meta_key.is_empty() {
            let root_id = pager.new_page_id()?;
            let page = empty_leaf_page(&pager)?;
            pager.update_page(root_id, page)?;
            let initial = Version(latest.0 + 1);
            pager.set_commit_version(initial);

            let queue_page = pager.new_page_id()?;
            let lazy_queue = FifoQueue::create("lazy_delete", queue_page, page_size);
            let meta = TreeMeta {
                format_version: TREE_FORMAT_VERSION,
                height: 1,
                lazy_delete_queue: lazy_queue.state(),
                root: smallvec![root_id],
            };
            pager.set_meta_key(&meta.encode())?;
            pager.commit()?;
            info!(version = initial.0, "btree.create");
            (meta, lazy_queue, initial)
        } else {
            let meta = TreeMeta::decode(&meta_key)?;
            if meta.format_version != TREE_FORMAT_VERSION {
                return Err(GloamError::FormatMismatch {
                    found: meta.format_version,
                    supported: TREE_FORMAT_VERSION,
                });
            }
            let lazy_queue = FifoQueue::recover("lazy_delete", meta.lazy_delete_queue, page_size);
            info!(version = latest.0, height = meta.height, "btree.recover");
            (meta, lazy_queue, latest)
        };

        let new_oldest = pager.oldest_version();
        Ok(Self {
            pager,
            meta,
            lazy_queue,
            buffer: None,
            write_version: Version::INVALID,
            last_committed,
            new_oldest,
            lazy_delete_budget: 100,
            metrics,
        })
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    pub fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    pub fn last_committed_version(&self) -> Version {
        self.last_committed
    }

    pub fn write_version(&self) -> Version {
        self.write_version
    }

    /// Version retained as of the next commit.
    pub fn set_oldest_version(&mut self, v: Version) {
        self.new_oldest = v;
    }

    /// Start (or continue) buffering writes for version `v`, which must be
    /// greater than the last committed version and nondecreasing.
    pub fn set_write_version(&mut self, v: Version) -> Result<()> {
        if v <= self.last_committed || (self.buffer.is_some() && v < self.write_version) {
            return Err(GloamError::InvalidArgument(
                "write version must be greater than the last committed version",
            ));
        }
        if self.buffer.is_none() {
            self.buffer = Some(MutationBuffer::new());
        }
        self.write_version = v;
        Ok(())
    }

    fn buffer_mut(&mut self) -> Result<&mut MutationBuffer> {
        self.buffer
            .as_mut()
            .ok_or(GloamError::InvalidArgument("no write version set"))
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.metrics.sets(1);
        let value = value.to_vec();
        self.buffer_mut()?.insert(key).set_boundary_value(value);
        Ok(())
    }

    /// Clear the half-open range `[begin, end)`.
    pub fn clear(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.metrics.clears(1);
        // A single-key clear needs only one boundary.
        if end.len() == begin.len() + 1 && end.last() == Some(&0) && end.starts_with(begin) {
            self.metrics.clears_single_key(1);
            self.buffer_mut()?.insert(begin).clear_boundary();
            return Ok(());
        }
        let buffer = self.buffer_mut()?;
        buffer.insert(begin).clear_all();
        buffer.insert(end);
        buffer.erase_range_between(begin, end);
        Ok(())
    }

    /// Open a cursor reading at committed version `v`.
    pub fn read_at_version(&self, v: Version) -> Result<cursor::Cursor> {
        if v > self.last_committed {
            return Err(GloamError::InvalidArgument("cannot read above the committed version"));
        }
        let snapshot = self.pager.get_read_snapshot(v)?;
        let meta = TreeMeta::decode(snapshot.meta_key())?;
        Ok(cursor::Cursor::new(snapshot, meta.root, Version(0), Arc::clone(&self.metrics)))
    }

    /// Commit the current mutation buffer at the write version.
    pub fn commit(&mut self) -> Result<()> {
        let Some(mutations) = self.buffer.take() else {
            return Ok(());
        };
        let write_version = self.write_version;
        self.write_version = Version::INVALID;
        debug!(version = write_version.0, "btree.commit.begin");

        self.pager.set_oldest_version(self.new_oldest)?;

        // The lazy-delete worker runs between commits; here it is a
        // budgeted slice at the commit boundary.
        let freed = self.incremental_subtree_clear(self.lazy_delete_budget)?;
        self.metrics.lazy_delete_pages_freed(freed as u64);

        let latest = self.pager.latest_version();
        let page_version = Version(self.last_committed.0 + 1);
        let snapshot = self.pager.get_read_snapshot(latest)?;
        let root_id = self.meta.root.clone();
        let lower = Record::begin().with_child_page(&root_id);
        let upper = Record::end();

        let result = self.commit_subtree(
            &mutations,
            &snapshot,
            &root_id,
            self.meta.height == 1,
            &lower,
            &upper,
            &lower,
            &upper,
            page_version,
        )?;

        let new_root: BTreePageId = if result.children.is_empty() {
            // The whole tree was cleared; start over with an empty root.
            let root = self.pager.new_page_id()?;
            self.pager.update_page(root, empty_leaf_page(&self.pager)?)?;
            self.meta.height = 1;
            smallvec![root]
        } else if result.children.len() == 1 {
            result.children[0].child_page()?
        } else {
            let promoted = self.build_new_root(result.children, page_version)?;
            promoted[0].child_page()?
        };
        self.meta.root = new_root;

        self.pager.set_commit_version(write_version);
        self.flush_lazy_queue()?;
        self.meta.lazy_delete_queue = self.lazy_queue.state();
        self.pager.set_meta_key(&self.meta.encode())?;
        self.pager.commit()?;

        self.last_committed = write_version;
        self.metrics.commits(1);
        info!(version = write_version.0, height = self.meta.height, "btree.commit");
        Ok(())
    }

    /// Write new tree levels until a single root record remains.
    fn build_new_root(&mut self, mut records: Vec<Record>, version: Version) -> Result<Vec<Record>> {
        while records.len() > 1 {
            self.meta.height += 1;
            debug!(height = self.meta.height, records = records.len(), "btree.new_root_level");
            records = self.write_pages(
                &Record::begin(),
                &Record::end(),
                &records,
                self.meta.height,
                version,
                &BTreePageId::new(),
            )?;
        }
        Ok(records)
    }

    fn free_btree_page(&mut self, id: &BTreePageId, version: Version) -> Result<()> {
        for page in id {
            self.pager.free_page(*page, version)?;
        }
        Ok(())
    }

    /// Rewrite a page in place via per-LPID atomic updates, preserving the
    /// parent's link.
    fn update_btree_page(&mut self, old_id: &BTreePageId, content: Vec<u8>, version: Version) -> Result<BTreePageId> {
        let usable = self.pager.usable_page_size();
        debug_assert_eq!(content.len(), old_id.len() * usable);
        let mut new_id = BTreePageId::new();
        for (slot, chunk) in content.chunks(usable).enumerate() {
            let mut page = self.pager.new_page_buffer();
            page.payload_mut().copy_from_slice(chunk);
            let id = self.pager.atomic_update_page(old_id[slot], page, version)?;
            new_id.push(id);
        }
        self.metrics.page_writes(1);
        if new_id.len() > 1 {
            self.metrics.ext_page_writes(new_id.len() as u64 - 1);
        }
        Ok(new_id)
    }

    /// Pack `entries` into one or more pages between `lower` and `upper`,
    /// returning a boundary record per page written. Reuses `previous_id`
    /// via atomic update when exactly one page of identical shape results;
    /// otherwise the old pages are freed once and fresh IDs are used.
    #[allow(clippy::too_many_arguments)]
    fn write_pages(
        &mut self,
        lower: &Record,
        upper: &Record,
        entries: &[Record],
        height: u8,
        version: Version,
        previous_id: &BTreePageId,
    ) -> Result<Vec<Record>> {
        debug_assert!(!entries.is_empty());
        let block_size = self.pager.usable_page_size();
        let base_space = block_size - BTREE_PAGE_HDR_LEN;
        let minimum_entries = if height == 1 { 1 } else { 4 };
        // All entries share this prefix; deltas between siblings skip it.
        let skip_len = entries
            .first()
            .expect("non-empty")
            .common_prefix_len(entries.last().expect("non-empty"), 0);

        let mut records: Vec<Record> = Vec::new();
        let mut page_lower = lower.without_value();
        let mut start = 0usize;
        let mut i = 0usize;

        loop {
            let mut page_space = base_space;
            let mut fill_target = (page_space as f32 * FILL_FACTOR) as usize;
            let mut block_count = 1usize;
            let mut large_tree = page_space > SMALL_SIZE_LIMIT;
            let mut kv_bytes = 0usize;
            let mut compressed = empty_tree_size();

            while i < entries.len() && (i - start < minimum_entries || compressed < fill_target) {
                let entry = &entries[i];
                let base = if i == start { &page_lower } else { &entries[i - 1] };
                let skip = if i == 0 { 0 } else { skip_len };
                let delta_size = entry.delta_size(base, skip, true);
                let mut node_size = node_header_len(large_tree) + delta_size;

                let space_available = page_space as i64 - compressed as i64;
                if node_size as i64 > space_available {
                    // Expand the page by whole blocks; if the expansion
                    // crosses into the large-offset regime, per-node
                    // overhead grows for this and all prior nodes, which
                    // can itself require more blocks.
                    let mut new_blocks = 1 + (node_size as i64 - space_available - 1) / block_size as i64;
                    let mut new_page_size = page_space + new_blocks as usize * block_size;
                    if !large_tree && new_page_size > SMALL_SIZE_LIMIT {
                        large_tree = true;
                        node_size += LARGE_TREE_PER_NODE_EXTRA;
                        compressed += (i - start) * LARGE_TREE_PER_NODE_EXTRA;
                        let space_available = page_space as i64 - compressed as i64;
                        new_blocks = 1 + ((node_size as i64 - space_available - 1).max(0)) / block_size as i64;
                        new_page_size = page_space + new_blocks as usize * block_size;
                    }
                    block_count += new_blocks as usize;
                    page_space = new_page_size;
                    fill_target = (page_space as f32 * FILL_FACTOR) as usize;
                }

                kv_bytes += entry.kv_len();
                compressed += node_size;
                i += 1;
            }

            // A value-less record immediately after this page exists only to
            // bound a child that was not rewritten; the page boundary now
            // serves that purpose, so it is not carried into the next page.
            let mut next_start = i;
            if height != 1 && next_start < entries.len() && entries[next_start].value.is_none() {
                next_start += 1;
            }

            let mut page_upper = if i == entries.len() {
                upper.without_value()
            } else {
                entries[i].without_value()
            };
            let is_last_page = next_start == entries.len();
            if !is_last_page && height == 1 {
                // Shorten interior leaf boundaries to the minimum
                // distinguishing prefix.
                let common = page_upper.common_prefix_len(&entries[i - 1], 0);
                page_upper.truncate(common + 1);
            }

            // The size estimate is an upper bound in practice, but the tree
            // assigns prefix sources differently than the linear estimate;
            // widen the page if the build comes up short.
            let (content_size, tree_bytes) = loop {
                let content_size = block_count * block_size;
                let tree_space = content_size - BTREE_PAGE_HDR_LEN;
                match try_build_tree(tree_space, &entries[start..i], &page_lower, &page_upper)? {
                    Some(bytes) => break (content_size, bytes),
                    None => {
                        if content_size > (1 << 26) {
                            return Err(GloamError::Corruption("btree page build cannot fit its records"));
                        }
                        block_count += 1;
                    }
                }
            };
            let mut content = vec![0u8; content_size];
            content[0] = height;
            content[1..5].copy_from_slice(&(kv_bytes as u32).to_be_bytes());
            content[BTREE_PAGE_HDR_LEN..BTREE_PAGE_HDR_LEN + tree_bytes.len()].copy_from_slice(&tree_bytes);

            let is_only_page = is_last_page && start == 0;
            let mut child_id = BTreePageId::new();
            if is_only_page && previous_id.len() == block_count {
                for (slot, chunk) in content.chunks(block_size).enumerate() {
                    let mut page = self.pager.new_page_buffer();
                    page.payload_mut().copy_from_slice(chunk);
                    let id = self.pager.atomic_update_page(previous_id[slot], page, version)?;
                    child_id.push(id);
                }
            } else {
                // The parent must be rewritten anyway, so the original IDs
                // have no value; free them once, before the first output.
                if records.is_empty() {
                    let previous = previous_id.clone();
                    self.free_btree_page(&previous, version)?;
                }
                for chunk in content.chunks(block_size) {
                    let mut page = self.pager.new_page_buffer();
                    page.payload_mut().copy_from_slice(chunk);
                    let id = self.pager.new_page_id()?;
                    self.pager.update_page(id, page)?;
                    child_id.push(id);
                }
            }
            self.metrics.page_writes(1);
            if block_count > 1 {
                self.metrics.ext_page_writes(block_count as u64 - 1);
            }
            trace!(
                height,
                pages = block_count,
                records = i - start,
                "btree.write_page"
            );

            let mut rec = page_lower.without_value();
            rec.set_child_page(&child_id);
            records.push(rec);

            if is_last_page {
                // If the tail record was a skipped placeholder, the output
                // set's upper bound is not the last page's upper bound;
                // emit it value-less to keep the subtree decodable.
                if height != 1 && i != entries.len() {
                    records.push(page_upper);
                }
                break;
            }
            start = next_start;
            i = next_start;
            page_lower = page_upper;
        }

        Ok(records)
    }

    /// Commit one subtree against the slice of the mutation buffer that
    /// overlaps its key range.
    #[allow(clippy::too_many_arguments)]
    fn commit_subtree(
        &mut self,
        mutations: &MutationBuffer,
        snapshot: &ReadSnapshot,
        root_id: &BTreePageId,
        is_leaf: bool,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        version: Version,
    ) -> Result<ChildLinks> {
        let slice = mutations.slice(&lower.key, &upper.key);
        debug_assert!(slice.len() >= 2);
        let end_idx = slice.len() - 1;

        // When a single mutation range covers the whole subtree, it may be
        // possible to skip the page read entirely.
        if slice.len() == 2 {
            let (start_key, start_mutation) = slice[0];
            let (end_key, end_mutation) = slice[1];
            let mut cleared = start_mutation.clear_after_boundary;
            let mut unchanged = !cleared;

            if start_key == lower.key.as_slice() {
                if cleared && !start_mutation.boundary_cleared() {
                    cleared = false;
                }
                if unchanged && start_mutation.boundary_changed {
                    unchanged = false;
                }
            }
            if (cleared || unchanged) && end_key == upper.key.as_slice() {
                if end_mutation.boundary_changed {
                    unchanged = false;
                } else {
                    cleared = false;
                }
            }
            debug_assert!(!(cleared && unchanged));

            if unchanged {
                trace!("btree.commit_subtree.unchanged");
                return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
            }
            if cleared {
                trace!(pages = root_id.len(), leaf = is_leaf, "btree.commit_subtree.cleared");
                if is_leaf {
                    self.free_btree_page(root_id, version)?;
                } else {
                    self.lazy_queue.push_back(LazyDeleteEntry {
                        version,
                        pages: root_id.clone(),
                    });
                }
                return Ok(ChildLinks::gone(decode_upper));
            }
        }

        let content = read_page_content(snapshot, root_id, false, &self.metrics)?;
        let height = content_height(&content);
        if is_leaf != (height == 1) {
            return Err(GloamError::Corruption("btree page height inconsistent with parent"));
        }
        let mut nav = DeltaTreeNav::new(
            NavContent::Shared(content),
            BTREE_PAGE_HDR_LEN,
            decode_lower.without_value(),
            decode_upper.without_value(),
        )?;

        if is_leaf {
            self.commit_leaf(
                mutations, &slice, end_idx, nav, root_id, lower, upper, decode_lower, decode_upper, version,
            )
        } else {
            self.commit_internal(
                mutations, snapshot, nav, height, root_id, lower, upper, decode_lower, decode_upper, version,
            )
        }
    }

    /// Merge the mutation boundaries into a leaf page: in place when the
    /// page's decode bounds are unchanged and everything fits, otherwise by
    /// a linear merge into freshly written pages.
    #[allow(clippy::too_many_arguments)]
    fn commit_leaf(
        &mut self,
        _mutations: &MutationBuffer,
        slice: &[(&[u8], &mutation::RangeMutation)],
        end_idx: usize,
        mut nav: DeltaTreeNav,
        root_id: &BTreePageId,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        version: Version,
    ) -> Result<ChildLinks> {
        let mut updating = nav.num_items() > 0
            && decode_lower.compare(lower, 0) == Ordering::Equal
            && decode_upper.compare(upper, 0) == Ordering::Equal;
        let mut merged: Vec<Record> = Vec::new();
        let mut changes_made = false;
        let mut cursor = TreeCursor::default();
        nav.move_first(&mut cursor)?;

        let mut first_boundary = true;
        let mut bi = 0usize;
        while bi != end_idx {
            let (boundary_key, boundary_mutation) = slice[bi];
            // The first boundary may start before this page; its key change
            // belongs to a preceding leaf unless it matches our lower bound.
            let apply_boundary_change = boundary_mutation.boundary_changed
                && (!first_boundary || boundary_key >= lower.key.as_slice());
            first_boundary = false;

            // Records at the boundary key itself.
            while cursor.valid() && nav.get(&cursor).expect("valid cursor").key == boundary_key {
                if !apply_boundary_change {
                    if !updating {
                        merged.push(nav.get(&cursor).expect("valid cursor").clone());
                    }
                    nav.move_next(&mut cursor)?;
                } else {
                    changes_made = true;
                    if updating {
                        nav.erase(&mut cursor)?;
                    } else {
                        nav.move_next(&mut cursor)?;
                    }
                }
            }

            if apply_boundary_change && boundary_mutation.boundary_set() {
                let rec = Record::new(
                    boundary_key.to_vec(),
                    Version(0),
                    boundary_mutation.boundary_value.clone(),
                );
                changes_made = true;
                if updating && !nav.insert(&rec, 0, MAX_INSERT_HEIGHT)? {
                    // No room for an in-place insert: collect what the page
                    // holds before the cursor and continue as a linear merge.
                    collect_before(&mut nav, &cursor, &mut merged)?;
                    updating = false;
                }
                if !updating {
                    merged.push(rec);
                }
            }

            let remove = boundary_mutation.clear_after_boundary;
            bi += 1;
            let next_key = slice[bi].0;
            let end_rec = Record::new(next_key.to_vec(), Version(0), None);

            // Records strictly between this boundary and the next.
            if remove != updating {
                // Being removed without updating, or kept while updating:
                // either way they are skipped, not visited.
                if !updating {
                    changes_made = true;
                }
                nav.seek_geq(&mut cursor, &end_rec, 0, None)?;
            } else {
                while cursor.valid()
                    && nav.get(&cursor).expect("valid cursor").compare(&end_rec, 0) == Ordering::Less
                {
                    if updating {
                        nav.erase(&mut cursor)?;
                        changes_made = true;
                    } else {
                        merged.push(nav.get(&cursor).expect("valid cursor").clone());
                        nav.move_next(&mut cursor)?;
                    }
                }
            }
        }

        // Any remaining records share the end boundary's key.
        if cursor.valid() {
            let remove = slice[end_idx].1.boundary_changed;
            if remove {
                changes_made = true;
            }
            if remove == updating {
                while cursor.valid() {
                    if updating {
                        nav.erase(&mut cursor)?;
                    } else {
                        merged.push(nav.get(&cursor).expect("valid cursor").clone());
                        nav.move_next(&mut cursor)?;
                    }
                }
            }
        }

        if !changes_made {
            trace!("btree.commit_leaf.no_changes");
            return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
        }

        if updating {
            if nav.num_items() == 0 {
                self.free_btree_page(root_id, version)?;
                return Ok(ChildLinks::gone(decode_upper));
            }
            let content = nav.into_owned_content();
            let new_id = self.update_btree_page(root_id, content, version)?;
            self.metrics.page_updates(1);
            let mut rec = decode_lower.without_value();
            rec.set_child_page(&new_id);
            trace!("btree.commit_leaf.updated_in_place");
            return Ok(ChildLinks {
                children: vec![rec],
                upper_bound: decode_upper.clone(),
            });
        }

        if merged.is_empty() {
            self.free_btree_page(root_id, version)?;
            return Ok(ChildLinks::gone(decode_upper));
        }

        let entries = self.write_pages(lower, upper, &merged, 1, version, root_id)?;
        Ok(ChildLinks {
            children: entries,
            upper_bound: upper.clone(),
        })
    }

    /// Recurse into each child, then rebuild this page's record list from
    /// the children's outcomes if anything changed.
    #[allow(clippy::too_many_arguments)]
    fn commit_internal(
        &mut self,
        mutations: &MutationBuffer,
        snapshot: &ReadSnapshot,
        mut nav: DeltaTreeNav,
        height: u8,
        root_id: &BTreePageId,
        lower: &Record,
        upper: &Record,
        decode_lower: &Record,
        decode_upper: &Record,
        version: Version,
    ) -> Result<ChildLinks> {
        let mut cursor = TreeCursor::default();
        nav.move_first(&mut cursor)?;

        let mut results: Vec<ChildLinks> = Vec::new();
        let mut first = true;
        while cursor.valid() {
            let current = nav.get(&cursor).expect("valid cursor").clone();
            // The first record of an internal page always links a child;
            // placeholders only ever follow a linking record.
            if current.value.is_none() {
                return Err(GloamError::Corruption("internal page record missing child link"));
            }
            let child_lower = if first { lower.clone() } else { current.clone() };
            first = false;
            let decode_child_lower = current.clone();
            let child_page = current.child_page()?;

            let moved = nav.move_next(&mut cursor)?;
            let decode_child_upper = if moved {
                nav.get(&cursor).expect("valid cursor").clone()
            } else {
                decode_upper.clone()
            };
            // The decode upper bound may be a placeholder left when the
            // following subtree shrank; skip it for the true child bound.
            if moved && nav.get(&cursor).expect("valid cursor").value.is_none() {
                let moved_again = nav.move_next(&mut cursor)?;
                if moved_again && nav.get(&cursor).expect("valid cursor").value.is_none() {
                    return Err(GloamError::Corruption("consecutive placeholder records"));
                }
            }
            let child_upper = match nav.get(&cursor) {
                Some(rec) => rec.clone(),
                None => upper.clone(),
            };

            let link = self.commit_subtree(
                mutations,
                snapshot,
                &child_page,
                height == 2,
                &child_lower,
                &child_upper,
                &decode_child_lower,
                &decode_child_upper,
                version,
            )?;
            results.push(link);
        }

        let mut builder_cursor = TreeCursor::default();
        nav.move_first(&mut builder_cursor)?;
        let mut builder = InternalPageBuilder::new(builder_cursor);
        for link in results {
            if !link.children.is_empty() {
                builder.add_entries(&mut nav, link)?;
            }
        }
        builder.finalize(&mut nav, upper, decode_upper)?;

        if !builder.modified {
            trace!("btree.commit_internal.no_changes");
            return Ok(ChildLinks::unchanged(decode_lower, decode_upper));
        }
        if builder.child_page_count == 0 {
            self.free_btree_page(root_id, version)?;
            return Ok(ChildLinks::gone(decode_upper));
        }
        let entries = self.write_pages(lower, upper, &builder.entries, height, version, root_id)?;
        Ok(ChildLinks {
            children: entries,
            upper_bound: upper.clone(),
        })
    }

    fn lazy_pop(&mut self, bound: &LazyDeleteEntry) -> Result<Option<LazyDeleteEntry>> {
        let pager = Arc::clone(&self.pager);
        let mut io = PagerQueueIo { pager: &pager };
        let mut freed = Vec::new();
        let popped = self.lazy_queue.pop(&mut io, Some(bound), &mut freed)?;
        for id in freed {
            self.pager.free_page(id, Version(0))?;
        }
        Ok(popped)
    }

    fn flush_lazy_queue(&mut self) -> Result<()> {
        let pager = Arc::clone(&self.pager);
        loop {
            let needed = self.lazy_queue.pages_needed();
            if needed == 0 {
                break;
            }
            for _ in 0..needed {
                let id = pager.new_page_id()?;
                self.lazy_queue.reserve(id);
            }
        }
        let mut io = PagerQueueIo { pager: &pager };
        self.lazy_queue.materialize(&mut io)
    }

    /// Incrementally descend and free queued subtrees whose versions have
    /// retired. Stops after freeing at least `budget` pages. Returns the
    /// number of pages freed.
    pub fn incremental_subtree_clear(&mut self, budget: usize) -> Result<usize> {
        if budget == 0 {
            return Ok(0);
        }
        let latest = self.pager.latest_version();
        let snapshot = self.pager.get_read_snapshot(latest)?;
        let cutoff = LazyDeleteEntry {
            version: self.pager.effective_oldest(),
            pages: smallvec![PageId(u64::MAX)],
        };
        let mut freed_pages = 0usize;
        loop {
            let mut batch = Vec::new();
            while batch.len() < LAZY_DELETE_BATCH {
                match self.lazy_pop(&cutoff)? {
                    Some(entry) => batch.push(entry),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                let content = read_page_content(&snapshot, &entry.pages, true, &self.metrics)?;
                let height = content_height(&content);
                if height <= 1 {
                    return Err(GloamError::Corruption("leaf page queued for lazy delete"));
                }
                for value in values_in_order(&content, BTREE_PAGE_HDR_LEN)?.into_iter().flatten() {
                    let child = decode_child_page(&value)?;
                    if height == 2 {
                        // Children are leaves; free them directly.
                        freed_pages += child.len();
                        self.free_btree_page(&child, entry.version)?;
                    } else {
                        self.lazy_queue.push_front(LazyDeleteEntry {
                            version: entry.version,
                            pages: child,
                        });
                    }
                }
                freed_pages += entry.pages.len();
                self.free_btree_page(&entry.pages, entry.version)?;
            }
            if freed_pages >= budget {
                break;
            }
        }
        if freed_pages > 0 {
            debug!(freed = freed_pages, remaining = self.lazy_queue.num_entries(), "btree.lazy_delete");
        }
        Ok(freed_pages)
    }

    /// Clear every key, drain the lazy-delete queue to empty, and verify
    /// that the tree collapses back to a single empty root with no leaked
    /// pages. Test support, modeled as a maintenance routine.
    pub fn clear_all_and_verify(&mut self) -> Result<()> {
        self.set_write_version(Version(self.last_committed.0 + 1))?;
        self.clear(b"", END_KEY)?;
        loop {
            let freed = self.incremental_subtree_clear(usize::MAX)?;
            self.set_oldest_version(self.last_committed);
            self.commit()?;
            if self.lazy_queue.num_entries() == 0 && freed == 0 {
                break;
            }
            self.set_write_version(Version(self.last_committed.0 + 1))?;
        }
        self.set_oldest_version(self.last_committed);
        self.set_write_version(Version(self.last_committed.0 + 1))?;
        self.commit()?;

        if self.lazy_queue.num_entries() != 0 || self.lazy_queue.num_pages() != 1 {
            return Err(GloamError::Corruption("lazy delete queue not empty after full clear"));
        }
        if self.meta.height != 1 || self.meta.root.len() != 1 {
            return Err(GloamError::Corruption("tree did not collapse to a single root"));
        }
        // Only the empty root and the lazy-delete queue's tail page remain.
        let user_pages = self.pager.user_page_count()?;
        if user_pages != 2 {
            return Err(GloamError::Corruption("pages leaked by full clear"));
        }
        Ok(())
    }
}

fn empty_leaf_page(pager: &Pager) -> Result<PageBuffer> {
    let usable = pager.usable_page_size();
    let tree = build_tree(usable - BTREE_PAGE_HDR_LEN, &[], &Record::begin(), &Record::end())?;
    let mut page = pager.new_page_buffer();
    let payload = page.payload_mut();
    payload[0] = 1;
    payload[1..5].copy_from_slice(&0u32.to_be_bytes());
    payload[BTREE_PAGE_HDR_LEN..BTREE_PAGE_HDR_LEN + tree.len()].copy_from_slice(&tree);
    Ok(page)
}

/// Collect every record of `nav` positioned before `stop` (used when an
/// in-place update falls back to a linear merge mid-page).
fn collect_before(nav: &mut DeltaTreeNav, stop: &TreeCursor, merged: &mut Vec<Record>) -> Result<()> {
    let mut c = TreeCursor::default();
    let mut ok = nav.move_first(&mut c)?;
    while ok && c != *stop {
        merged.push(nav.get(&c).expect("valid cursor").clone());
        ok = nav.move_next(&mut c)?;
    }
    Ok(())
}
