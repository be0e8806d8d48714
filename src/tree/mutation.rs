#![forbid(unsafe_code)]

//! The mutation buffer: pending changes for one write version, organized so
//! the commit walk can cheaply answer "what changes overlap this subtree's
//! key range". It is a map from range-start boundary keys to the mutation
//! state of the boundary key itself plus a flag covering the open range up
//! to the next boundary.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::tree::record::END_KEY;

/// Mutation state for one boundary key and the range after it.
#[derive(Clone, Debug, Default)]
pub(crate) struct RangeMutation {
    /// The boundary key itself changed: set to `boundary_value`, or cleared
    /// when that is absent.
    pub boundary_changed: bool,
    pub boundary_value: Option<Vec<u8>>,
    /// Everything strictly between this boundary and the next is cleared.
    pub clear_after_boundary: bool,
}

impl RangeMutation {
    pub fn boundary_cleared(&self) -> bool {
        self.boundary_changed && self.boundary_value.is_none()
    }

    pub fn boundary_set(&self) -> bool {
        self.boundary_changed && self.boundary_value.is_some()
    }

    pub fn no_changes(&self) -> bool {
        !self.boundary_changed && !self.clear_after_boundary
    }

    pub fn clear_boundary(&mut self) {
        self.boundary_changed = true;
        self.boundary_value = None;
    }

    pub fn clear_all(&mut self) {
        self.clear_boundary();
        self.clear_after_boundary = true;
    }

    pub fn set_boundary_value(&mut self, value: Vec<u8>) {
        self.boundary_changed = true;
        self.boundary_value = Some(value);
    }
}

/// Pending mutations keyed by boundary. Two boundaries always exist: the
/// empty key (initially unchanged) and the end sentinel (marked cleared so
/// a commit walk never descends the rightmost edge for nothing).
pub(crate) struct MutationBuffer {
    mutations: BTreeMap<Vec<u8>, RangeMutation>,
}

impl MutationBuffer {
    pub fn new() -> Self {
        let mut mutations = BTreeMap::new();
        mutations.insert(Vec::new(), RangeMutation::default());
        let mut end = RangeMutation::default();
        end.clear_boundary();
        mutations.insert(END_KEY.to_vec(), end);
        Self { mutations }
    }

    /// Find or create the boundary for `key`. A new boundary splits an
    /// existing range and inherits that range's clear-after state: if the
    /// range being divided was cleared, the new boundary and the range
    /// after it are cleared too.
    pub fn insert(&mut self, key: &[u8]) -> &mut RangeMutation {
        debug_assert!(key <= END_KEY);
        if !self.mutations.contains_key(key) {
            let inherited_clear = self
                .mutations
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
                .map(|(_, m)| m.clear_after_boundary)
                .unwrap_or(false);
            let mut mutation = RangeMutation::default();
            if inherited_clear {
                mutation.clear_all();
            }
            self.mutations.insert(key.to_vec(), mutation);
        }
        self.mutations.get_mut(key).expect("boundary just ensured")
    }

    /// Erase the boundaries strictly between `begin` and `end`; a range
    /// clear keeps its own two boundaries and drops everything they
    /// swallowed.
    pub fn erase_range_between(&mut self, begin: &[u8], end: &[u8]) {
        let doomed: Vec<Vec<u8>> = self
            .mutations
            .range::<[u8], _>((Bound::Excluded(begin), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            self.mutations.remove(&key);
        }
    }

    /// The boundaries relevant to a subtree spanning `[lower, upper)`: from
    /// the greatest boundary `<= lower` through the least boundary
    /// `>= upper`, inclusive. Both ends always exist because the empty key
    /// and the end sentinel are permanent boundaries.
    pub fn slice(&self, lower: &[u8], upper: &[u8]) -> Vec<(&[u8], &RangeMutation)> {
        let start_key = self
            .mutations
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(lower)))
            .next_back()
            .map(|(k, _)| k.as_slice())
            .expect("empty-key boundary always present");
        let mut out = Vec::new();
        for (k, m) in self.mutations.range::<[u8], _>((Bound::Included(start_key), Bound::Unbounded)) {
            let past_upper = k.as_slice() >= upper;
            out.push((k.as_slice(), m));
            if past_upper {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_with_permanent_boundaries() {
        let buffer = MutationBuffer::new();
        let slice = buffer.slice(b"", END_KEY);
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].0, b"");
        assert!(slice[0].1.no_changes());
        assert_eq!(slice[1].0, END_KEY);
        assert!(slice[1].1.boundary_cleared());
    }

    #[test]
    fn insert_splits_cleared_range_inheriting_clear() {
        let mut buffer = MutationBuffer::new();
        buffer.insert(b"b").clear_all();
        buffer.insert(b"f");
        // "d" lands inside the cleared [b, f) range and must be cleared too.
        let mid = buffer.insert(b"d");
        assert!(mid.boundary_cleared());
        assert!(mid.clear_after_boundary);
        // "g" lands after the un-cleared boundary "f".
        let after = buffer.insert(b"g");
        assert!(after.no_changes());
    }

    #[test]
    fn slice_spans_surrounding_boundaries() {
        let mut buffer = MutationBuffer::new();
        buffer.insert(b"dog").set_boundary_value(b"1".to_vec());
        buffer.insert(b"fish").set_boundary_value(b"2".to_vec());

        let slice = buffer.slice(b"cat", b"eel");
        let keys: Vec<&[u8]> = slice.iter().map(|(k, _)| *k).collect();
        // Greatest <= "cat" is "", then everything through least >= "eel".
        assert_eq!(keys, vec![b"".as_ref(), b"dog".as_ref(), b"fish".as_ref()]);
    }

    #[test]
    fn erase_range_drops_interior_boundaries_only() {
        let mut buffer = MutationBuffer::new();
        buffer.insert(b"b").set_boundary_value(b"1".to_vec());
        buffer.insert(b"c").set_boundary_value(b"2".to_vec());
        buffer.insert(b"d").set_boundary_value(b"3".to_vec());
        buffer.erase_range_between(b"b", b"d");
        let slice = buffer.slice(b"", END_KEY);
        let keys: Vec<&[u8]> = slice.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![b"".as_ref(), b"b".as_ref(), b"d".as_ref(), END_KEY]);
    }
}
