#![forbid(unsafe_code)]

//! The in-page sorted container: a balanced binary search tree serialized
//! into a byte buffer where each node stores its record as a delta against
//! one of its two in-order ancestors (the greatest-lesser or least-greater
//! one, whichever shares the longer key prefix).
//!
//! Reading decodes nodes lazily into an arena that mirrors the on-page
//! structure with reconstituted records; cursors address arena slots, so a
//! page is decoded at most once per reader no matter how many cursor moves
//! happen. Deleted nodes are flagged, not compacted; space is reclaimed
//! when the page is next rewritten.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::{GloamError, Result};
use crate::tree::record::{
    set_delta_deleted, set_delta_prefix_source, DeltaRef, Record,
};

/// Serialized tree header:
/// `flags u8 | num_items u32 | bytes_used u32 | bytes_free u32 |
///  bytes_deleted u32 | initial_height u8 | max_height u8`.
pub const TREE_HDR_LEN: usize = 19;

const FLAG_LARGE: u8 = 0x01;

/// Node offsets are 16-bit in the small regime and 32-bit in the large one,
/// chosen by the byte size the tree is built into.
pub const SMALL_SIZE_LIMIT: usize = u16::MAX as usize;

/// Extra per-node overhead when a mid-build size estimate crosses into the
/// large regime.
pub const LARGE_TREE_PER_NODE_EXTRA: usize = 4;

pub fn node_header_len(large: bool) -> usize {
    if large {
        8
    } else {
        4
    }
}

/// Overhead of an empty tree.
pub fn empty_tree_size() -> usize {
    TREE_HDR_LEN
}

fn less_or_equal_power_of_two(n: usize) -> usize {
    let mut p = 1;
    while p + p <= n {
        p += p;
    }
    p
}

/// In-order index of the root of a perfect binary search tree of `n` items
/// (minimal height, missing nodes as far right as possible).
fn perfect_split_point(n: usize) -> usize {
    let s = less_or_equal_power_of_two((n - 1) / 2 + 1) - 1;
    (s * 2 + 1).min(n - s - 1)
}

struct HeaderView;

impl HeaderView {
    fn large(buf: &[u8], off: usize) -> bool {
        buf[off] & FLAG_LARGE != 0
    }

    fn num_items(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off + 1..off + 5].try_into().unwrap())
    }

    fn set_num_items(buf: &mut [u8], off: usize, v: u32) {
        buf[off + 1..off + 5].copy_from_slice(&v.to_be_bytes());
    }

    fn bytes_used(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off + 5..off + 9].try_into().unwrap())
    }

    fn set_bytes_used(buf: &mut [u8], off: usize, v: u32) {
        buf[off + 5..off + 9].copy_from_slice(&v.to_be_bytes());
    }

    fn bytes_free(buf: &[u8], off: usize) -> u32 {
        u32::from_be_bytes(buf[off + 9..off + 13].try_into().unwrap())
    }

    fn set_bytes_free(buf: &mut [u8], off: usize, v: u32) {
        buf[off + 9..off + 13].copy_from_slice(&v.to_be_bytes());
    }

    fn max_height(buf: &[u8], off: usize) -> u8 {
        buf[off + 18]
    }

    fn set_max_height(buf: &mut [u8], off: usize, v: u8) {
        buf[off + 18] = v;
    }
}

/// Build a tree over `records` (sorted ascending) into a buffer that will
/// occupy `space` bytes of page, with `lower`/`upper` as the decode bounds.
/// Returns `None` when the records do not fit in `space`, letting the
/// caller widen the page and retry.
pub fn try_build_tree(
    space: usize,
    records: &[Record],
    lower: &Record,
    upper: &Record,
) -> Result<Option<Vec<u8>>> {
    match build_tree(space, records, lower, upper) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(_) => Ok(None),
    }
}

/// Build a tree over `records` (sorted ascending) into a buffer that will
/// occupy `space` bytes of page, with `lower`/`upper` as the decode bounds.
/// Returns the serialized bytes (header plus nodes); their length never
/// exceeds `space`.
pub fn build_tree(space: usize, records: &[Record], lower: &Record, upper: &Record) -> Result<Vec<u8>> {
    let large = space > SMALL_SIZE_LIMIT;
    let mut out = vec![0u8; TREE_HDR_LEN];
    if !records.is_empty() {
        let common = lower.common_prefix_len(upper, 0);
        build_subtree(&mut out, records, lower, upper, common, large)?;
    }
    if out.len() > space {
        return Err(GloamError::Corruption("delta tree build exceeded page space"));
    }
    let used = (out.len() - TREE_HDR_LEN) as u32;
    out[0] = if large { FLAG_LARGE } else { 0 };
    HeaderView::set_num_items(&mut out, 0, records.len() as u32);
    HeaderView::set_bytes_used(&mut out, 0, used);
    let bytes_free = (space - out.len()) as u32;
    HeaderView::set_bytes_free(&mut out, 0, bytes_free);
    // bytes_deleted starts at zero.
    out[17] = if records.is_empty() {
        1
    } else {
        records.len().ilog2() as u8 + 1
    };
    out[18] = 0;
    Ok(out)
}

fn build_subtree(
    out: &mut Vec<u8>,
    records: &[Record],
    prev: &Record,
    next: &Record,
    subtree_common: usize,
    large: bool,
) -> Result<()> {
    debug_assert!(!records.is_empty());
    let node_start = out.len();
    let hdr = node_header_len(large);
    let mid = perfect_split_point(records.len());
    let item = &records[mid];

    let common_with_prev = item.common_prefix_len(prev, subtree_common);
    let common_with_next = item.common_prefix_len(next, subtree_common);
    let source_prev = common_with_prev >= common_with_next;
    let (common, base) = if source_prev {
        (common_with_prev, prev)
    } else {
        (common_with_next, next)
    };

    out.resize(node_start + hdr, 0);
    let delta_len = {
        let mut delta = Vec::new();
        item.write_delta(base, common, &mut delta);
        out.extend_from_slice(&delta);
        delta.len()
    };
    set_delta_prefix_source(out, node_start + hdr, source_prev);

    let mut left_off = 0usize;
    if records.len() > 1 {
        left_off = hdr + delta_len;
        build_subtree(out, &records[..mid], prev, item, common_with_prev, large)?;
    }
    let mut right_off = 0usize;
    if records.len() > 2 {
        right_off = out.len() - node_start;
        build_subtree(out, &records[mid + 1..], item, next, common_with_next, large)?;
    }

    write_offsets(out, node_start, left_off, right_off, large)
}

fn write_offsets(out: &mut [u8], node_start: usize, left: usize, right: usize, large: bool) -> Result<()> {
    if large {
        out[node_start..node_start + 4].copy_from_slice(&(left as u32).to_be_bytes());
        out[node_start + 4..node_start + 8].copy_from_slice(&(right as u32).to_be_bytes());
    } else {
        if left > SMALL_SIZE_LIMIT || right > SMALL_SIZE_LIMIT {
            return Err(GloamError::Corruption("delta tree offset exceeds small regime"));
        }
        out[node_start..node_start + 2].copy_from_slice(&(left as u16).to_be_bytes());
        out[node_start + 2..node_start + 4].copy_from_slice(&(right as u16).to_be_bytes());
    }
    Ok(())
}

fn read_offsets(buf: &[u8], node_start: usize, large: bool) -> (usize, usize) {
    if large {
        (
            u32::from_be_bytes(buf[node_start..node_start + 4].try_into().unwrap()) as usize,
            u32::from_be_bytes(buf[node_start + 4..node_start + 8].try_into().unwrap()) as usize,
        )
    } else {
        (
            u16::from_be_bytes(buf[node_start..node_start + 2].try_into().unwrap()) as usize,
            u16::from_be_bytes(buf[node_start + 2..node_start + 4].try_into().unwrap()) as usize,
        )
    }
}

/// Page content backing a reader: shared for plain reads, owned once the
/// page has been cloned for an in-place update.
#[derive(Clone)]
pub(crate) enum NavContent {
    Shared(Arc<Vec<u8>>),
    Owned(Vec<u8>),
}

impl NavContent {
    fn as_slice(&self) -> &[u8] {
        match self {
            NavContent::Shared(buf) => buf,
            NavContent::Owned(buf) => buf,
        }
    }

    fn to_mut(&mut self) -> &mut Vec<u8> {
        if let NavContent::Shared(buf) = self {
            *self = NavContent::Owned(buf.as_ref().clone());
        }
        match self {
            NavContent::Owned(buf) => buf,
            NavContent::Shared(_) => unreachable!(),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Child {
    Unexplored,
    Absent,
    Present(usize),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BoundRef {
    Lower,
    Upper,
    Node(usize),
}

#[derive(Clone, Debug)]
struct DecNode {
    raw: usize,
    parent: Option<usize>,
    other_ancestor: Option<usize>,
    left: Child,
    right: Child,
    prev: BoundRef,
    next: BoundRef,
    item: Record,
}

/// Cursor into a [`DeltaTreeNav`]; addresses a decoded arena slot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct TreeCursor(pub Option<usize>);

impl TreeCursor {
    pub fn valid(&self) -> bool {
        self.0.is_some()
    }
}

/// Lazily-decoded accessor over one serialized delta tree.
#[derive(Clone)]
pub(crate) struct DeltaTreeNav {
    content: NavContent,
    tree_off: usize,
    large: bool,
    lower: Record,
    upper: Record,
    nodes: Vec<DecNode>,
    root: Option<usize>,
}

impl DeltaTreeNav {
    pub fn new(content: NavContent, tree_off: usize, lower: Record, upper: Record) -> Result<Self> {
        let buf = content.as_slice();
        if buf.len() < tree_off + TREE_HDR_LEN {
            return Err(GloamError::Corruption("delta tree header truncated"));
        }
        let large = HeaderView::large(buf, tree_off);
        let used = HeaderView::bytes_used(buf, tree_off);
        let mut nav = Self {
            content,
            tree_off,
            large,
            lower,
            upper,
            nodes: Vec::new(),
            root: None,
        };
        if used > 0 {
            let raw = tree_off + TREE_HDR_LEN;
            let idx = nav.decode_node(raw, None, false)?;
            nav.root = Some(idx);
        }
        Ok(nav)
    }

    pub fn num_items(&self) -> u32 {
        HeaderView::num_items(self.content.as_slice(), self.tree_off)
    }

    pub fn upper_bound(&self) -> &Record {
        &self.upper
    }

    pub fn get<'a>(&'a self, cur: &TreeCursor) -> Option<&'a Record> {
        cur.0.map(|i| &self.nodes[i].item)
    }

    fn record(&self, bound: BoundRef) -> &Record {
        match bound {
            BoundRef::Lower => &self.lower,
            BoundRef::Upper => &self.upper,
            BoundRef::Node(i) => &self.nodes[i].item,
        }
    }

    fn node_hdr(&self) -> usize {
        node_header_len(self.large)
    }

    fn decode_node(&mut self, raw: usize, parent: Option<usize>, went_left: bool) -> Result<usize> {
        let (prev, next, other_ancestor) = match parent {
            None => (BoundRef::Lower, BoundRef::Upper, None),
            Some(p) => {
                if went_left {
                    (self.nodes[p].prev, BoundRef::Node(p), self.prev_ancestor(p))
                } else {
                    (BoundRef::Node(p), self.nodes[p].next, self.next_ancestor(p))
                }
            }
        };
        let hdr = self.node_hdr();
        let buf = self.content.as_slice();
        if raw + hdr > buf.len() {
            return Err(GloamError::Corruption("delta tree node out of range"));
        }
        let delta = DeltaRef::parse(&buf[raw + hdr..])?;
        let base = if delta.prefix_source_prev() {
            self.record(prev)
        } else {
            self.record(next)
        };
        let item = delta.apply(base)?;
        self.nodes.push(DecNode {
            raw,
            parent,
            other_ancestor,
            left: Child::Unexplored,
            right: Child::Unexplored,
            prev,
            next,
            item,
        });
        Ok(self.nodes.len() - 1)
    }

    fn other_ancestor_prev(&self, idx: usize) -> bool {
        matches!(self.nodes[idx].parent, Some(p) if self.nodes[p].left == Child::Present(idx))
    }

    fn other_ancestor_next(&self, idx: usize) -> bool {
        matches!(self.nodes[idx].parent, Some(p) if self.nodes[p].right == Child::Present(idx))
    }

    fn prev_ancestor(&self, idx: usize) -> Option<usize> {
        if self.other_ancestor_prev(idx) {
            self.nodes[idx].other_ancestor
        } else {
            self.nodes[idx].parent
        }
    }

    fn next_ancestor(&self, idx: usize) -> Option<usize> {
        if self.other_ancestor_next(idx) {
            self.nodes[idx].other_ancestor
        } else {
            self.nodes[idx].parent
        }
    }

    fn left_child(&mut self, idx: usize) -> Result<Option<usize>> {
        match self.nodes[idx].left {
            Child::Absent => Ok(None),
            Child::Present(i) => Ok(Some(i)),
            Child::Unexplored => {
                let raw = self.nodes[idx].raw;
                let (left_off, _) = read_offsets(self.content.as_slice(), raw, self.large);
                if left_off == 0 {
                    self.nodes[idx].left = Child::Absent;
                    Ok(None)
                } else {
                    let child = self.decode_node(raw + left_off, Some(idx), true)?;
                    self.nodes[idx].left = Child::Present(child);
                    Ok(Some(child))
                }
            }
        }
    }

    fn right_child(&mut self, idx: usize) -> Result<Option<usize>> {
        match self.nodes[idx].right {
            Child::Absent => Ok(None),
            Child::Present(i) => Ok(Some(i)),
            Child::Unexplored => {
                let raw = self.nodes[idx].raw;
                let (_, right_off) = read_offsets(self.content.as_slice(), raw, self.large);
                if right_off == 0 {
                    self.nodes[idx].right = Child::Absent;
                    Ok(None)
                } else {
                    let child = self.decode_node(raw + right_off, Some(idx), false)?;
                    self.nodes[idx].right = Child::Present(child);
                    Ok(Some(child))
                }
            }
        }
    }

    fn is_deleted(&self, idx: usize) -> bool {
        let off = self.nodes[idx].raw + self.node_hdr();
        DeltaRef::parse(&self.content.as_slice()[off..])
            .map(|d| d.is_deleted())
            .unwrap_or(false)
    }

    /// Skip chain toward greater items: the next ancestor if this node was
    /// reached by branching left, otherwise down this node's right subtree.
    fn jump_next(&mut self, idx: usize) -> Result<Option<usize>> {
        if self.other_ancestor_next(idx) {
            match self.nodes[idx].other_ancestor {
                Some(a) => Ok(Some(a)),
                None => self.right_child(idx),
            }
        } else if self.root == Some(idx) {
            self.right_child(idx)
        } else {
            match self.nodes[idx].other_ancestor {
                Some(a) => self.right_child(a),
                None => Ok(self.root),
            }
        }
    }

    fn jump_prev(&mut self, idx: usize) -> Result<Option<usize>> {
        if self.other_ancestor_prev(idx) {
            match self.nodes[idx].other_ancestor {
                Some(a) => Ok(Some(a)),
                None => self.left_child(idx),
            }
        } else if self.root == Some(idx) {
            self.left_child(idx)
        } else {
            match self.nodes[idx].other_ancestor {
                Some(a) => self.left_child(a),
                None => Ok(self.root),
            }
        }
    }

    fn hide_deleted_forward(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        while let Some(i) = cur.0 {
            if !self.is_deleted(i) {
                return Ok(true);
            }
            self.move_next_raw(cur)?;
        }
        Ok(false)
    }

    fn hide_deleted_backward(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        while let Some(i) = cur.0 {
            if !self.is_deleted(i) {
                return Ok(true);
            }
            self.move_prev_raw(cur)?;
        }
        Ok(false)
    }

    fn move_next_raw(&mut self, cur: &mut TreeCursor) -> Result<()> {
        let Some(i) = cur.0 else { return Ok(()) };
        match self.right_child(i)? {
            Some(mut n) => loop {
                cur.0 = Some(n);
                match self.left_child(n)? {
                    Some(l) => n = l,
                    None => break,
                }
            },
            None => cur.0 = self.next_ancestor(i),
        }
        Ok(())
    }

    fn move_prev_raw(&mut self, cur: &mut TreeCursor) -> Result<()> {
        let Some(i) = cur.0 else { return Ok(()) };
        match self.left_child(i)? {
            Some(mut n) => loop {
                cur.0 = Some(n);
                match self.right_child(n)? {
                    Some(r) => n = r,
                    None => break,
                }
            },
            None => cur.0 = self.prev_ancestor(i),
        }
        Ok(())
    }

    pub fn move_first(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        cur.0 = self.root;
        let mut n = self.root;
        while let Some(i) = n {
            n = self.left_child(i)?;
            if n.is_some() {
                cur.0 = n;
            }
        }
        self.hide_deleted_forward(cur)
    }

    pub fn move_last(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        cur.0 = self.root;
        let mut n = self.root;
        while let Some(i) = n {
            n = self.right_child(i)?;
            if n.is_some() {
                cur.0 = n;
            }
        }
        self.hide_deleted_backward(cur)
    }

    pub fn move_next(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        self.move_next_raw(cur)?;
        self.hide_deleted_forward(cur)
    }

    pub fn move_prev(&mut self, cur: &mut TreeCursor) -> Result<bool> {
        self.move_prev_raw(cur)?;
        self.hide_deleted_backward(cur)
    }

    fn descend_le(&mut self, start: Option<usize>, cur: &mut TreeCursor, s: &Record, skip: usize) -> Result<()> {
        let mut n = start;
        while let Some(i) = n {
            match s.compare(&self.nodes[i].item, skip) {
                Ordering::Less => n = self.left_child(i)?,
                Ordering::Equal => {
                    cur.0 = Some(i);
                    break;
                }
                Ordering::Greater => {
                    cur.0 = Some(i);
                    n = self.right_child(i)?;
                }
            }
        }
        Ok(())
    }

    /// Position at the greatest record `<= s`. A valid `hint` close to the
    /// target lets the search skip along ancestor chains instead of
    /// descending from the root.
    pub fn seek_le(&mut self, cur: &mut TreeCursor, s: &Record, skip: usize, hint: Option<&TreeCursor>) -> Result<bool> {
        if let Some(h) = hint {
            if let Some(hn) = h.0 {
                return self.seek_le_hinted(cur, s, skip, hn);
            }
        }
        cur.0 = None;
        self.descend_le(self.root, cur, s, skip)?;
        self.hide_deleted_backward(cur)
    }

    fn seek_le_hinted(&mut self, cur: &mut TreeCursor, s: &Record, skip: usize, hn: usize) -> Result<bool> {
        match s.compare(&self.nodes[hn].item, skip) {
            Ordering::Equal => {
                cur.0 = Some(hn);
                self.hide_deleted_backward(cur)
            }
            Ordering::Greater => {
                // The target is ahead of the hint; jump forward until a node
                // passes s, then refine down its left subtree.
                cur.0 = Some(hn);
                let mut at = hn;
                loop {
                    match self.jump_next(at)? {
                        None => break,
                        Some(j) => match s.compare(&self.nodes[j].item, skip) {
                            Ordering::Greater => {
                                cur.0 = Some(j);
                                at = j;
                            }
                            Ordering::Equal => {
                                cur.0 = Some(j);
                                break;
                            }
                            Ordering::Less => {
                                let below = self.left_child(j)?;
                                self.descend_le(below, cur, s, skip)?;
                                break;
                            }
                        },
                    }
                }
                self.hide_deleted_backward(cur)
            }
            Ordering::Less => {
                // The target is behind the hint; jump backward to the first
                // node at or below s, then refine down its right subtree.
                cur.0 = None;
                let mut at = hn;
                loop {
                    match self.jump_prev(at)? {
                        None => break,
                        Some(j) => match s.compare(&self.nodes[j].item, skip) {
                            Ordering::Less => at = j,
                            Ordering::Equal => {
                                cur.0 = Some(j);
                                break;
                            }
                            Ordering::Greater => {
                                cur.0 = Some(j);
                                let below = self.right_child(j)?;
                                self.descend_le(below, cur, s, skip)?;
                                break;
                            }
                        },
                    }
                }
                self.hide_deleted_backward(cur)
            }
        }
    }

    /// Position at the greatest record strictly `< s`.
    pub fn seek_lt(&mut self, cur: &mut TreeCursor, s: &Record, skip: usize) -> Result<bool> {
        cur.0 = None;
        let mut n = self.root;
        while let Some(i) = n {
            if s.compare(&self.nodes[i].item, skip) == Ordering::Greater {
                cur.0 = Some(i);
                n = self.right_child(i)?;
            } else {
                n = self.left_child(i)?;
            }
        }
        self.hide_deleted_backward(cur)
    }

    /// Position at the least record `>= s`.
    pub fn seek_geq(&mut self, cur: &mut TreeCursor, s: &Record, skip: usize, hint: Option<&TreeCursor>) -> Result<bool> {
        if let Some(h) = hint {
            if let Some(hn) = h.0 {
                // A hint equal to the target answers immediately; otherwise
                // seek <= and step forward once, which reuses the jump path.
                if s.compare(&self.nodes[hn].item, skip) == Ordering::Equal && !self.is_deleted(hn) {
                    cur.0 = Some(hn);
                    return Ok(true);
                }
                let mut below = TreeCursor::default();
                let found = self.seek_le(&mut below, s, skip, Some(h))?;
                if found {
                    if s.compare(&self.nodes[below.0.unwrap()].item, skip) == Ordering::Equal {
                        *cur = below;
                        return Ok(true);
                    }
                    *cur = below;
                    return self.move_next(cur);
                }
                return self.move_first(cur);
            }
        }
        cur.0 = None;
        let mut n = self.root;
        while let Some(i) = n {
            match s.compare(&self.nodes[i].item, skip) {
                Ordering::Greater => n = self.right_child(i)?,
                Ordering::Equal => {
                    cur.0 = Some(i);
                    break;
                }
                Ordering::Less => {
                    cur.0 = Some(i);
                    n = self.left_child(i)?;
                }
            }
        }
        self.hide_deleted_forward(cur)
    }

    /// Position at the record equal to `s`, if present and not deleted.
    pub fn seek_eq(&mut self, cur: &mut TreeCursor, s: &Record, skip: usize) -> Result<bool> {
        cur.0 = None;
        let mut n = self.root;
        while let Some(i) = n {
            match s.compare(&self.nodes[i].item, skip) {
                Ordering::Equal => {
                    if self.is_deleted(i) {
                        return Ok(false);
                    }
                    cur.0 = Some(i);
                    return Ok(true);
                }
                Ordering::Greater => n = self.right_child(i)?,
                Ordering::Less => n = self.left_child(i)?,
            }
        }
        Ok(false)
    }

    /// Flag the record at `cur` deleted and advance the cursor.
    pub fn erase(&mut self, cur: &mut TreeCursor) -> Result<()> {
        let Some(i) = cur.0 else {
            return Err(GloamError::InvalidArgument("erase on invalid cursor"));
        };
        let flag_off = self.nodes[i].raw + self.node_hdr();
        let tree_off = self.tree_off;
        let buf = self.content.to_mut();
        set_delta_deleted(buf, flag_off, true);
        let items = HeaderView::num_items(buf, tree_off) - 1;
        HeaderView::set_num_items(buf, tree_off, items);
        self.move_next(cur)?;
        Ok(())
    }

    /// Insert `k` if it fits in the remaining space and within
    /// `max_height` levels. Re-inserting a deleted record revives it in
    /// place. Returns false (leaving the tree unchanged) when it cannot.
    pub fn insert(&mut self, k: &Record, skip: usize, max_height: usize) -> Result<bool> {
        let Some(mut n) = self.root else {
            return Ok(false);
        };
        let mut height = 1usize;
        let add_left;
        loop {
            match k.compare(&self.nodes[n].item, skip) {
                Ordering::Equal => {
                    // Revive if previously erased, otherwise it is a duplicate.
                    if self.is_deleted(n) {
                        let flag_off = self.nodes[n].raw + self.node_hdr();
                        let tree_off = self.tree_off;
                        let buf = self.content.to_mut();
                        set_delta_deleted(buf, flag_off, false);
                        let items = HeaderView::num_items(buf, tree_off) + 1;
                        HeaderView::set_num_items(buf, tree_off, items);
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Ordering::Greater => match self.right_child(n)? {
                    Some(r) => n = r,
                    None => {
                        add_left = false;
                        break;
                    }
                },
                Ordering::Less => match self.left_child(n)? {
                    Some(l) => n = l,
                    None => {
                        add_left = true;
                        break;
                    }
                },
            }
            height += 1;
        }
        if height > max_height {
            return Ok(false);
        }

        let (prev, next) = if add_left {
            (self.nodes[n].prev, BoundRef::Node(n))
        } else {
            (BoundRef::Node(n), self.nodes[n].next)
        };
        let common = self.record(prev).common_prefix_len(self.record(next), skip);
        let common_with_prev = k.common_prefix_len(self.record(prev), common);
        let common_with_next = k.common_prefix_len(self.record(next), common);
        let base_prev = common_with_prev >= common_with_next;
        let (common_prefix, base_ref) = if base_prev {
            (common_with_prev, prev)
        } else {
            (common_with_next, next)
        };
        let base = self.record(base_ref).clone();

        let hdr = self.node_hdr();
        let mut delta = Vec::new();
        k.write_delta(&base, common_prefix, &mut delta);
        let node_space = hdr + delta.len();
        let tree_off = self.tree_off;
        {
            let buf = self.content.as_slice();
            if node_space > HeaderView::bytes_free(buf, tree_off) as usize {
                return Ok(false);
            }
        }

        let bytes_used = HeaderView::bytes_used(self.content.as_slice(), tree_off) as usize;
        let new_raw = tree_off + TREE_HDR_LEN + bytes_used;
        let parent_raw = self.nodes[n].raw;
        let child_off = new_raw - parent_raw;
        if !self.large && child_off > SMALL_SIZE_LIMIT {
            return Ok(false);
        }

        let large = self.large;
        let buf = self.content.to_mut();
        if new_raw + node_space > buf.len() {
            return Ok(false);
        }
        buf[new_raw..new_raw + hdr].fill(0);
        buf[new_raw + hdr..new_raw + node_space].copy_from_slice(&delta);
        set_delta_prefix_source(buf, new_raw + hdr, base_prev);
        // Link from the parent; the new node is always appended after it.
        if add_left {
            if large {
                buf[parent_raw..parent_raw + 4].copy_from_slice(&(child_off as u32).to_be_bytes());
            } else {
                buf[parent_raw..parent_raw + 2].copy_from_slice(&(child_off as u16).to_be_bytes());
            }
        } else if large {
            buf[parent_raw + 4..parent_raw + 8].copy_from_slice(&(child_off as u32).to_be_bytes());
        } else {
            buf[parent_raw + 2..parent_raw + 4].copy_from_slice(&(child_off as u16).to_be_bytes());
        }
        HeaderView::set_bytes_used(buf, tree_off, (bytes_used + node_space) as u32);
        let free = HeaderView::bytes_free(buf, tree_off) as usize - node_space;
        HeaderView::set_bytes_free(buf, tree_off, free as u32);
        let items = HeaderView::num_items(buf, tree_off) + 1;
        HeaderView::set_num_items(buf, tree_off, items);
        if (height as u8) > HeaderView::max_height(buf, tree_off) {
            HeaderView::set_max_height(buf, tree_off, height as u8);
        }

        let other_ancestor = if add_left {
            self.prev_ancestor(n)
        } else {
            self.next_ancestor(n)
        };
        self.nodes.push(DecNode {
            raw: new_raw,
            parent: Some(n),
            other_ancestor,
            left: Child::Absent,
            right: Child::Absent,
            prev,
            next,
            item: k.clone(),
        });
        let new_idx = self.nodes.len() - 1;
        if add_left {
            self.nodes[n].left = Child::Present(new_idx);
        } else {
            self.nodes[n].right = Child::Present(new_idx);
        }
        Ok(true)
    }

    /// Hand back the content buffer, which must have been made owned by a
    /// mutation.
    pub fn into_owned_content(self) -> Vec<u8> {
        match self.content {
            NavContent::Owned(buf) => buf,
            NavContent::Shared(buf) => buf.as_ref().clone(),
        }
    }
}

/// In-order values of a serialized tree, skipping deleted nodes and all key
/// reconstruction. The lazy-delete worker uses this to pull child links out
/// of internal pages cheaply.
pub(crate) fn values_in_order(content: &[u8], tree_off: usize) -> Result<Vec<Option<Vec<u8>>>> {
    if content.len() < tree_off + TREE_HDR_LEN {
        return Err(GloamError::Corruption("delta tree header truncated"));
    }
    let large = HeaderView::large(content, tree_off);
    let used = HeaderView::bytes_used(content, tree_off);
    let mut out = Vec::new();
    if used == 0 {
        return Ok(out);
    }
    walk_values(content, tree_off + TREE_HDR_LEN, large, &mut out, 0)?;
    Ok(out)
}

fn walk_values(content: &[u8], raw: usize, large: bool, out: &mut Vec<Option<Vec<u8>>>, depth: usize) -> Result<()> {
    if depth > 64 {
        return Err(GloamError::Corruption("delta tree deeper than expected"));
    }
    let hdr = node_header_len(large);
    if raw + hdr > content.len() {
        return Err(GloamError::Corruption("delta tree node out of range"));
    }
    let (left, right) = read_offsets(content, raw, large);
    let delta = DeltaRef::parse(&content[raw + hdr..])?;
    if left != 0 {
        walk_values(content, raw + left, large, out, depth + 1)?;
    }
    if !delta.is_deleted() {
        out.push(delta.apply_value_only());
    }
    if right != 0 {
        walk_values(content, raw + right, large, out, depth + 1)?;
    }
    Ok(())
}
