#![forbid(unsafe_code)]

//! Read cursors. An [`InternalCursor`] is a root-to-leaf descent path of
//! per-page delta-tree cursors; the user-facing [`Cursor`] drives a pair of
//! them (candidate and successor) to decide which leaf records are present
//! at its read version.

use std::sync::Arc;

use crate::error::{GloamError, Result};
use crate::metrics::StoreMetrics;
use crate::pager::ReadSnapshot;
use crate::tree::delta::{DeltaTreeNav, NavContent, TreeCursor};
use crate::tree::record::{BTreePageId, Record};
use crate::tree::{content_height, read_page_content, BTREE_PAGE_HDR_LEN};
use crate::types::Version;

#[derive(Clone)]
struct PageLevel {
    nav: DeltaTreeNav,
    cur: TreeCursor,
    height: u8,
}

/// Cursor over the tree's leaf-level records at one snapshot. Positions may
/// be value-less internal placeholders-free leaf records only; presence at
/// a version is the outer [`Cursor`]'s concern.
#[derive(Clone)]
pub(crate) struct InternalCursor {
    snapshot: ReadSnapshot,
    root_id: BTreePageId,
    path: Vec<PageLevel>,
    metrics: Arc<StoreMetrics>,
}

impl InternalCursor {
    pub fn new(snapshot: ReadSnapshot, root_id: BTreePageId, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            snapshot,
            root_id,
            path: Vec::new(),
            metrics,
        }
    }

    fn move_to_root(&mut self) -> Result<()> {
        if !self.path.is_empty() {
            self.path.truncate(1);
            return Ok(());
        }
        let content = read_page_content(&self.snapshot, &self.root_id, false, &self.metrics)?;
        let height = content_height(&content);
        let nav = DeltaTreeNav::new(
            NavContent::Shared(content),
            BTREE_PAGE_HDR_LEN,
            Record::begin(),
            Record::end(),
        )?;
        self.path.push(PageLevel {
            nav,
            cur: TreeCursor::default(),
            height,
        });
        Ok(())
    }

    fn leaf_level(&self) -> Option<&PageLevel> {
        self.path.last().filter(|level| level.height == 1)
    }

    /// True when positioned on a leaf record.
    pub fn valid(&self) -> bool {
        self.leaf_level().map(|level| level.cur.valid()).unwrap_or(false)
    }

    /// True when positioned on a leaf record with a present value.
    pub fn present(&self) -> bool {
        self.valid() && self.get().value.is_some()
    }

    pub fn present_at_version(&self, v: Version) -> bool {
        self.present() && self.get().version <= v
    }

    pub fn valid_at_version(&self, v: Version) -> bool {
        self.valid() && self.get().version <= v
    }

    pub fn get(&self) -> &Record {
        let level = self.path.last().expect("cursor positioned");
        level.nav.get(&level.cur).expect("cursor valid")
    }

    /// Descend into the child linked at the current position. With a
    /// prefetch budget, sibling children at the level above the leaves are
    /// read ahead into the page cache until the budget is spent.
    fn push_child(&mut self, prefetch_bytes: usize) -> Result<()> {
        let (child_id, decode_lower, decode_upper, prefetch_ids) = {
            let level = self.path.last_mut().expect("cursor positioned");
            let rec = level.nav.get(&level.cur).expect("cursor valid").clone();
            let child_id = rec.child_page()?;
            let mut next_cur = level.cur;
            let upper = if level.nav.move_next(&mut next_cur)? {
                level.nav.get(&next_cur).expect("cursor valid").clone()
            } else {
                level.nav.upper_bound().clone()
            };

            let mut prefetch_ids: Vec<BTreePageId> = Vec::new();
            if prefetch_bytes > 0 && level.height == 2 {
                let mut budget = prefetch_bytes as i64;
                let mut sibling = next_cur;
                let mut sibling_valid = sibling.valid();
                while budget > 0 && sibling_valid {
                    if let Some(r) = level.nav.get(&sibling) {
                        if r.value.is_some() {
                            let id = r.child_page()?;
                            budget -= (id.len() * 4096) as i64;
                            prefetch_ids.push(id);
                        }
                    }
                    sibling_valid = level.nav.move_next(&mut sibling)?;
                }
            }
            (child_id, rec, upper, prefetch_ids)
        };

        for id in prefetch_ids {
            self.metrics.page_preloads(1);
            for page in &id {
                // Warm the cache without promoting entries.
                let _ = self.snapshot.read_page(*page, true, true);
            }
        }

        let content = read_page_content(&self.snapshot, &child_id, false, &self.metrics)?;
        let height = content_height(&content);
        let nav = DeltaTreeNav::new(
            NavContent::Shared(content),
            BTREE_PAGE_HDR_LEN,
            decode_lower.without_value(),
            decode_upper.without_value(),
        )?;
        self.path.push(PageLevel {
            nav,
            cur: TreeCursor::default(),
            height,
        });
        Ok(())
    }

    /// Position at the greatest leaf record strictly less than `query`.
    pub fn seek_less_than(&mut self, query: &Record, prefetch_bytes: usize) -> Result<bool> {
        self.move_to_root()?;
        loop {
            let (is_leaf, success) = {
                let level = self.path.last_mut().expect("root present");
                let is_leaf = level.height == 1;
                let mut ok = level.nav.seek_lt(&mut level.cur, query, 0)?;
                if !is_leaf {
                    // Placeholders carry no child link; step back past them.
                    while ok && level.nav.get(&level.cur).expect("cursor valid").value.is_none() {
                        ok = level.nav.move_prev(&mut level.cur)?;
                    }
                }
                (is_leaf, ok)
            };
            if success {
                if is_leaf {
                    return Ok(true);
                }
                self.push_child(prefetch_bytes)?;
            } else {
                // Nothing less than the query on this page: the answer is
                // the previous leaf record, if any.
                return self.move_dir(false);
            }
        }
    }

    /// Step to the next (or previous) leaf record, ascending and descending
    /// across page boundaries as needed.
    pub fn move_dir(&mut self, forward: bool) -> Result<bool> {
        loop {
            let level = self.path.last_mut().expect("cursor positioned");
            let mut ok = level.cur.valid()
                && if forward {
                    level.nav.move_next(&mut level.cur)?
                } else {
                    level.nav.move_prev(&mut level.cur)?
                };
            if level.height != 1 {
                while ok && level.nav.get(&level.cur).expect("cursor valid").value.is_none() {
                    ok = if forward {
                        level.nav.move_next(&mut level.cur)?
                    } else {
                        level.nav.move_prev(&mut level.cur)?
                    };
                }
            }
            if ok || self.path.len() == 1 {
                break;
            }
            self.path.pop();
        }

        if !self.path.last().expect("cursor positioned").cur.valid() {
            return Ok(false);
        }

        while self.path.last().expect("cursor positioned").height != 1 {
            {
                let level = self.path.last_mut().expect("cursor positioned");
                while level.nav.get(&level.cur).expect("cursor valid").value.is_none() {
                    let ok = if forward {
                        level.nav.move_next(&mut level.cur)?
                    } else {
                        level.nav.move_prev(&mut level.cur)?
                    };
                    if !ok {
                        return Ok(false);
                    }
                }
            }
            self.push_child(0)?;
            let level = self.path.last_mut().expect("child pushed");
            let ok = if forward {
                level.nav.move_first(&mut level.cur)?
            } else {
                level.nav.move_last(&mut level.cur)?
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn move_end(&mut self, begin: bool) -> Result<bool> {
        self.move_to_root()?;
        loop {
            let (is_leaf, success) = {
                let level = self.path.last_mut().expect("root present");
                let is_leaf = level.height == 1;
                let mut ok = if begin {
                    level.nav.move_first(&mut level.cur)?
                } else {
                    level.nav.move_last(&mut level.cur)?
                };
                if !is_leaf {
                    while ok && level.nav.get(&level.cur).expect("cursor valid").value.is_none() {
                        ok = if begin {
                            level.nav.move_next(&mut level.cur)?
                        } else {
                            level.nav.move_prev(&mut level.cur)?
                        };
                    }
                }
                (is_leaf, ok)
            };
            if !success {
                return Ok(false);
            }
            if is_leaf {
                return Ok(true);
            }
            self.push_child(0)?;
        }
    }

    pub fn move_first(&mut self) -> Result<bool> {
        self.move_end(true)
    }

    pub fn move_last(&mut self) -> Result<bool> {
        self.move_end(false)
    }
}

/// User-visible cursor over key/value pairs at one read version.
///
/// `cur1` tracks the candidate record and `cur2` its successor; a candidate
/// is returnable when it is present at the read version and no newer record
/// for the same key hides it.
pub struct Cursor {
    version: Version,
    cur1: InternalCursor,
    cur2: InternalCursor,
    kv: Option<(Vec<u8>, Vec<u8>)>,
}

impl Cursor {
    pub(crate) fn new(
        snapshot: ReadSnapshot,
        root_id: BTreePageId,
        version: Version,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        let cur1 = InternalCursor::new(snapshot, root_id, metrics);
        let cur2 = cur1.clone();
        Self {
            version,
            cur1,
            cur2,
            kv: None,
        }
    }

    pub fn valid(&self) -> bool {
        self.kv.is_some()
    }

    pub fn key(&self) -> &[u8] {
        &self.kv.as_ref().expect("cursor valid").0
    }

    pub fn value(&self) -> &[u8] {
        &self.kv.as_ref().expect("cursor valid").1
    }

    pub fn find_equal(&mut self, key: &[u8]) -> Result<()> {
        self.find(key, 0, 0)
    }

    pub fn find_first_geq(&mut self, key: &[u8], prefetch_bytes: usize) -> Result<()> {
        self.find(key, 1, prefetch_bytes)
    }

    pub fn find_last_leq(&mut self, key: &[u8], prefetch_bytes: usize) -> Result<()> {
        self.find(key, -1, prefetch_bytes)
    }

    pub fn next(&mut self) -> Result<()> {
        self.move_user(true)
    }

    pub fn prev(&mut self) -> Result<()> {
        self.move_user(false)
    }

    /// Seek relative to `key`: `cmp == 0` exact, `> 0` first greater-or-
    /// equal, `< 0` last less-or-equal.
    fn find(&mut self, key: &[u8], cmp: i32, prefetch_bytes: usize) -> Result<()> {
        // Query just above the read version so every record for `key` at or
        // below it orders before the query.
        let query = Record::new(key.to_vec(), Version(self.version.0 + 1), None);
        self.kv = None;

        self.cur1.seek_less_than(&query, prefetch_bytes)?;
        if self.cur1.present() && self.cur1.get().key == key {
            let rec = self.cur1.get();
            self.kv = Some((rec.key.clone(), rec.value.clone().expect("present record")));
            return Ok(());
        }
        if cmp == 0 {
            return Ok(());
        }

        if cmp > 0 {
            // cur1 is at a lesser key (or invalid); advance to the first
            // strictly greater key, then settle on a returnable record.
            if !self.cur1.valid() {
                if !self.cur1.move_first()? {
                    return Ok(());
                }
            } else {
                loop {
                    if !self.cur1.move_dir(true)? {
                        return Ok(());
                    }
                    if self.cur1.get().key.as_slice() > key {
                        break;
                    }
                }
            }
            self.move_user(true)
        } else {
            if !self.cur1.valid() {
                return Ok(());
            }
            self.move_user(false)
        }
    }

    fn move_user(&mut self, forward: bool) -> Result<()> {
        if !self.cur1.valid() && self.kv.is_some() {
            return Err(GloamError::InvalidArgument("cursor moved past the end"));
        }

        // The record at cur1 was already returned; move to a new key first.
        if self.kv.is_some() {
            loop {
                self.cur2 = self.cur1.clone();
                if !self.cur1.move_dir(forward)? {
                    break;
                }
                if self.cur1.get().key != self.cur2.get().key {
                    break;
                }
            }
        }

        if self.cur1.valid() {
            self.cur2 = self.cur1.clone();
            self.cur2.move_dir(true)?;
        }

        while self.cur1.valid() {
            let candidate = self.cur1.get().clone();
            // Exact-version fast path, plus the general rule: present at
            // the read version and not superseded by a newer record for
            // the same key.
            let returnable = (candidate.version == self.version && candidate.value.is_some())
                || (self.cur1.present_at_version(self.version)
                    && (!self.cur2.valid_at_version(self.version)
                        || self.cur2.get().key != candidate.key));
            if returnable {
                self.kv = Some((candidate.key, candidate.value.expect("present record")));
                return Ok(());
            }
            if forward {
                self.cur1 = self.cur2.clone();
                self.cur2.move_dir(true)?;
            } else {
                self.cur2 = self.cur1.clone();
                self.cur1.move_dir(false)?;
            }
        }

        self.kv = None;
        Ok(())
    }
}
