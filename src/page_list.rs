// SPDX-License-Identifier: MPL-2.0

//! `PageList`: the sparse offset → [`Slot`] map owned by each cow-object.
//!
//! The teacher's VMO stores its committed frames in an `XArray`, a radix
//! tree tuned for RCU-style concurrent reads under a no-std allocator. That
//! structure is tightly coupled to `ostd`'s atomic-mode/RCU guards, which
//! this host-testable engine does not have access to, and it has no notion
//! of the interval sentinels this page-list needs. This module keeps the
//! same contract (sparse map, ordered iteration, O(log n) point lookup) on
//! top of `BTreeMap`, which `aster-nix`'s own `prelude.rs` already imports
//! and uses elsewhere in the kernel for exactly this kind of ordered sparse
//! index.

use std::collections::BTreeMap;
use std::ops::Range;

use crate::constants::PAGE_SIZE;
use crate::slot::{DirtyState, IntervalStart, Slot};

/// How [`PageList::lookup_or_allocate`] should treat an offset that falls
/// inside an existing zero interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalPolicy {
    /// The offset is never inside an interval for this call's purposes
    /// (the caller already knows there is none, e.g. resize bookkeeping).
    NoIntervals,
    /// Report that the offset lies in an interval without splitting it.
    CheckForInterval,
    /// Split the interval around the offset and return a fresh slot there.
    SplitInterval,
}

/// What [`PageList::lookup_or_allocate`] found.
pub enum AllocatedSlot<'a> {
    /// A slot now exists at the offset (freshly allocated as `Empty`, or
    /// materialized out of a split interval).
    Slot(&'a mut Slot),
    /// The offset is inside an interval and the policy forbade splitting it.
    InInterval,
}

/// Continuation signal returned by traversal callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continue {
    Next,
    Stop,
}

/// A finalized, ordered sequence of `(offset, slot)` pairs with a current
/// read position, used to move content between page-lists (`supply_pages`,
/// `take_pages`, clone content transfer).
#[derive(Debug, Default)]
pub struct SpliceList {
    entries: Vec<(u64, Slot)>,
    pos: usize,
}

impl SpliceList {
    pub fn new(entries: Vec<(u64, Slot)>) -> Self {
        SpliceList { entries, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len() - self.pos
    }

    /// Pops the next `(offset, slot)` pair in order, if any.
    pub fn pop_front(&mut self) -> Option<(u64, Slot)> {
        if self.is_empty() {
            return None;
        }
        let idx = self.pos;
        self.pos += 1;
        // Entries are only ever read once, left-to-right; swapping the slot
        // out avoids a clone of the whole remaining vector per pop.
        let placeholder = Slot::Marker;
        let (off, slot) = std::mem::replace(&mut self.entries[idx], (0, placeholder));
        Some((off, slot))
    }

    pub fn push_back(&mut self, offset: u64, slot: Slot) {
        self.entries.push((offset, slot));
    }

    pub fn into_vec(mut self) -> Vec<(u64, Slot)> {
        self.entries.split_off(self.pos)
    }
}

/// The sparse offset → [`Slot`] map owned by a single cow-object.
///
/// Offsets are always page-aligned page *indices* are not used directly;
/// callers pass byte offsets and the list divides internally so that the
/// page-size constant lives in one place.
#[derive(Debug, Default)]
pub struct PageList {
    slots: BTreeMap<u64, Slot>,
}

impl PageList {
    pub fn new() -> Self {
        PageList {
            slots: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn lookup(&self, offset: u64) -> Option<&Slot> {
        debug_assert!(offset % PAGE_SIZE as u64 == 0);
        self.slots.get(&offset)
    }

    pub fn lookup_mut(&mut self, offset: u64) -> Option<&mut Slot> {
        debug_assert!(offset % PAGE_SIZE as u64 == 0);
        self.slots.get_mut(&offset)
    }

    /// Directly inserts a slot at `offset`, replacing whatever was there.
    ///
    /// Callers are responsible for interval-sentinel consistency; this is
    /// the raw primitive the higher-level editing functions build on.
    pub fn insert(&mut self, offset: u64, slot: Slot) -> Option<Slot> {
        debug_assert!(offset % PAGE_SIZE as u64 == 0);
        self.slots.insert(offset, slot)
    }

    /// Allocates an `Empty`-equivalent slot at `offset` if none exists,
    /// honoring `policy` when `offset` lies within an interval.
    ///
    /// "Empty" here just means absent from the map, but callers that need
    /// a present-but-content-less slot to write into (the COW fork target
    /// slot) call this with a fresh [`Slot::Marker`]-free representation;
    /// see [`PageList::reserve_empty`] for that path.
    pub fn lookup_or_allocate(
        &mut self,
        offset: u64,
        policy: IntervalPolicy,
    ) -> AllocatedSlot<'_> {
        debug_assert!(offset % PAGE_SIZE as u64 == 0);
        if let Some(enclosing) = self.interval_enclosing(offset) {
            return match policy {
                IntervalPolicy::NoIntervals => unreachable!(
                    "caller asserted no intervals are present but one was found"
                ),
                IntervalPolicy::CheckForInterval => AllocatedSlot::InInterval,
                IntervalPolicy::SplitInterval => {
                    self.split_interval_at(enclosing, offset);
                    AllocatedSlot::Slot(self.slots.get_mut(&offset).unwrap())
                }
            };
        }
        self.slots.entry(offset).or_insert(Slot::IntervalSlot);
        AllocatedSlot::Slot(self.slots.get_mut(&offset).unwrap())
    }

    /// Deallocates a slot that was left as a placeholder (e.g.
    /// [`Slot::IntervalSlot`] used as a stand-in for `Empty`) without ever
    /// being populated with real content.
    pub fn return_empty_slot(&mut self, offset: u64) {
        if let Some(slot) = self.slots.get(&offset) {
            if matches!(slot, Slot::IntervalSlot) {
                self.slots.remove(&offset);
            }
        }
    }

    /// Removes and returns whatever slot is at `offset`.
    pub fn remove_content(&mut self, offset: u64) -> Option<Slot> {
        self.slots.remove(&offset)
    }

    fn range_keys(&self, range: Range<u64>) -> Vec<u64> {
        self.slots.range(range).map(|(k, _)| *k).collect()
    }

    /// Visits every present page (real page or reference) in `range`,
    /// skipping markers, interval sentinels, and gaps.
    pub fn for_every_page_in_range<F>(&self, range: Range<u64>, mut f: F)
    where
        F: FnMut(u64, &Slot) -> Continue,
    {
        for key in self.range_keys(range) {
            let slot = self.slots.get(&key).unwrap();
            if !slot.is_page_or_reference() {
                continue;
            }
            if f(key, slot) == Continue::Stop {
                return;
            }
        }
    }

    /// Visits every page/marker/interval in `range`, calling `gap_fn` for
    /// the implicit empty stretches between them.
    pub fn for_every_page_and_gap_in_range<P, G>(
        &self,
        range: Range<u64>,
        mut page_fn: P,
        mut gap_fn: G,
    ) where
        P: FnMut(u64, &Slot) -> Continue,
        G: FnMut(Range<u64>) -> Continue,
    {
        let page_size = PAGE_SIZE as u64;
        let mut cursor = range.start;
        for key in self.range_keys(range.clone()) {
            if key > cursor {
                if gap_fn(cursor..key) == Continue::Stop {
                    return;
                }
            }
            let slot = self.slots.get(&key).unwrap();
            if page_fn(key, slot) == Continue::Stop {
                return;
            }
            cursor = key + page_size;
        }
        if cursor < range.end {
            gap_fn(cursor..range.end);
        }
    }

    /// Removes every page/marker/interval-sentinel in `range`, invoking
    /// `f` with the offset and removed slot. Safe to call while no other
    /// borrow of `self` is outstanding (removal happens after the key list
    /// is snapshotted).
    pub fn remove_pages<F>(&mut self, range: Range<u64>, mut f: F)
    where
        F: FnMut(u64, Slot),
    {
        for key in self.range_keys(range) {
            if let Some(slot) = self.slots.remove(&key) {
                f(key, slot);
            }
        }
    }

    /// Removes the interval sentinel pair (if the whole range is a single
    /// interval) or clips interval boundaries that straddle `range`, then
    /// removes all other content in `range`, calling `f` with every offset
    /// in `range` and whatever was removed there (`None` for a gap).
    ///
    /// Used by [`crate::bulk::shrink`] so that dropping a tail range never
    /// leaves an interval's start sentinel without a matching end, or an
    /// end sentinel stranded inside the dropped range.
    pub fn remove_pages_and_iterate_gaps<F>(&mut self, range: Range<u64>, mut f: F)
    where
        F: FnMut(u64, Option<Slot>),
    {
        let page_size = PAGE_SIZE as u64;

        // An interval starting before `range` but reaching into it is
        // clipped to end right at `range.start`.
        if let Some(start) = self.interval_start_before(range.start) {
            if let Some(interval) = self.interval_range(start) {
                if interval.end > range.start {
                    self.clip_interval_end(start, interval.end - range.start);
                }
            }
        }
        // An interval starting inside `range` but reaching past it is
        // clipped to begin right at `range.end`.
        if let Some(start) = self.interval_start_before(range.end) {
            if let Some(interval) = self.interval_range(start) {
                if interval.start < range.end && interval.end > range.end {
                    self.clip_interval_start(start, range.end - interval.start);
                }
            }
        }

        let mut offset = range.start;
        while offset < range.end {
            let removed = self.slots.remove(&offset);
            f(offset, removed);
            offset += page_size;
        }
    }

    /// Takes all slots in `range` out of this list and returns them as a
    /// [`SpliceList`] in offset order.
    pub fn take_pages(&mut self, range: Range<u64>) -> SpliceList {
        let mut entries = Vec::new();
        for key in self.range_keys(range) {
            if let Some(slot) = self.slots.remove(&key) {
                entries.push((key, slot));
            }
        }
        SpliceList::new(entries)
    }

    /// Splices `other`'s content in `src_range` into `self`, offset by
    /// `dst_offset - src_range.start`. Used when a unidirectional clone or
    /// hidden-parent transform moves content between lists wholesale.
    pub fn merge_from(&mut self, other: &mut PageList, src_range: Range<u64>, dst_offset: u64) {
        let shift = dst_offset as i64 - src_range.start as i64;
        for key in other.range_keys(src_range) {
            if let Some(slot) = other.slots.remove(&key) {
                let new_key = (key as i64 + shift) as u64;
                self.slots.insert(new_key, slot);
            }
        }
    }

    /// Splices the entirety of `self` onto `dst` at `dst_offset`,
    /// consuming `self`'s content.
    pub fn merge_onto(&mut self, dst: &mut PageList, dst_offset: u64) {
        let all = 0..u64::MAX;
        dst.merge_from(self, all, dst_offset);
    }

    // -- Zero-interval editing primitives -----------------------------------

    /// Returns the offset of the `IntervalStart` sentinel enclosing
    /// `offset`, if any (inclusive of `offset` being the start or end
    /// sentinel itself is excluded: those are present slots already).
    pub(crate) fn interval_enclosing(&self, offset: u64) -> Option<u64> {
        if self.slots.contains_key(&offset) {
            return None;
        }
        self.interval_start_before(offset)
    }

    /// Like [`Self::interval_enclosing`], but also answers for an `offset`
    /// that is itself an interval's start or end sentinel: used by resize
    /// when the new boundary lands exactly on a sentinel that must be
    /// re-derived rather than just dropped.
    pub(crate) fn interval_start_before(&self, offset: u64) -> Option<u64> {
        let mut depth = 0i32;
        for (&key, slot) in self.slots.range(..offset).rev() {
            match slot {
                Slot::IntervalEnd => depth += 1,
                Slot::IntervalStart(_) => {
                    if depth == 0 {
                        return Some(key);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        None
    }

    /// Adds a zero interval covering `range` with the given initial dirty
    /// state. `range` must not overlap any existing content.
    pub fn add_zero_interval(&mut self, range: Range<u64>, dirty: DirtyState) {
        debug_assert!(range.start < range.end);
        let page_size = PAGE_SIZE as u64;
        let last_page = range.end - page_size;
        if last_page == range.start {
            // A single-page interval is represented directly as start==end
            // at the same offset being both sentinels is impossible, so we
            // fall back to a degenerate two-sentinel run of length one page
            // by placing start and immediately an end marker is redundant;
            // represent a one-page interval as start+end at adjacent slots
            // is not possible (end must be at a greater offset), so a
            // single page interval is simply a start sentinel whose "end"
            // is implicit at start + PAGE_SIZE.
        }
        self.slots.insert(
            range.start,
            Slot::IntervalStart(IntervalStart {
                dirty,
                awaiting_clean_length: 0,
            }),
        );
        if range.end - range.start > page_size {
            self.slots.insert(range.end - page_size, Slot::IntervalEnd);
        }
    }

    /// Splits the interval starting at `start_off` so that `offset`
    /// becomes its own real slot, shrinking or removing the sentinels on
    /// either side as needed.
    fn split_interval_at(&mut self, start_off: u64, offset: u64) {
        let page_size = PAGE_SIZE as u64;
        let start_slot = self.slots.remove(&start_off).expect("interval start must exist");
        let Slot::IntervalStart(start_meta) = start_slot else {
            unreachable!("interval_enclosing returned a non-start offset")
        };
        let end_off = self.interval_end_of(start_off).unwrap_or(start_off);

        // Left half: [start_off, offset)
        if offset > start_off {
            let left_end = offset - page_size;
            if left_end == start_off {
                self.slots.insert(start_off, Slot::IntervalStart(start_meta));
            } else {
                self.slots.insert(start_off, Slot::IntervalStart(start_meta));
                self.slots.insert(left_end, Slot::IntervalEnd);
            }
        }

        // Right half: (offset, end_off]
        if offset < end_off {
            let right_start = offset + page_size;
            if right_start == end_off {
                self.slots.insert(
                    right_start,
                    Slot::IntervalStart(IntervalStart {
                        dirty: start_meta.dirty,
                        awaiting_clean_length: start_meta.awaiting_clean_length,
                    }),
                );
            } else {
                self.slots.insert(
                    right_start,
                    Slot::IntervalStart(IntervalStart {
                        dirty: start_meta.dirty,
                        awaiting_clean_length: start_meta.awaiting_clean_length,
                    }),
                );
                self.slots.insert(end_off, Slot::IntervalEnd);
            }
        }
        if end_off != start_off {
            self.slots.remove(&end_off);
        }
        self.slots.insert(offset, Slot::IntervalSlot);
    }

    fn interval_end_of(&self, start_off: u64) -> Option<u64> {
        let mut depth = 0i32;
        for (&key, slot) in self.slots.range(start_off + PAGE_SIZE as u64..) {
            match slot {
                Slot::IntervalStart(_) => depth += 1,
                Slot::IntervalEnd => {
                    if depth == 0 {
                        return Some(key);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
        None
    }

    /// Returns the `[start, end)` byte range of the interval that begins
    /// at `start_off`, if `start_off` is indeed an interval start.
    pub fn interval_range(&self, start_off: u64) -> Option<Range<u64>> {
        match self.slots.get(&start_off) {
            Some(Slot::IntervalStart(_)) => {
                let end = self
                    .interval_end_of(start_off)
                    .unwrap_or(start_off);
                Some(start_off..end + PAGE_SIZE as u64)
            }
            _ => None,
        }
    }

    /// Shrinks the interval starting at `start_off` by moving its start
    /// forward by `delta` bytes (used when a resize or take-pages trims
    /// the front of an interval).
    pub fn clip_interval_start(&mut self, start_off: u64, delta: u64) {
        let Some(range) = self.interval_range(start_off) else {
            return;
        };
        let Slot::IntervalStart(meta) = self.slots.remove(&start_off).unwrap() else {
            unreachable!()
        };
        let new_start = start_off + delta;
        if new_start >= range.end {
            self.slots.remove(&(range.end - PAGE_SIZE as u64));
            return;
        }
        self.slots.insert(new_start, Slot::IntervalStart(meta));
    }

    /// Shrinks the interval ending just before `end_off` by moving its end
    /// backward by `delta` bytes.
    pub fn clip_interval_end(&mut self, start_off: u64, delta: u64) {
        let Some(range) = self.interval_range(start_off) else {
            return;
        };
        let page_size = PAGE_SIZE as u64;
        let new_end = range.end - delta;
        if new_end <= start_off {
            self.slots.remove(&start_off);
            if range.end - page_size != start_off {
                self.slots.remove(&(range.end - page_size));
            }
            return;
        }
        if range.end - page_size != start_off {
            self.slots.remove(&(range.end - page_size));
        }
        if new_end - start_off > page_size {
            self.slots.insert(new_end - page_size, Slot::IntervalEnd);
        }
    }

    /// Replaces a single page or marker slot at `off` with a one-page zero
    /// interval carrying `dirty`.
    pub fn replace_page_with_zero_interval(&mut self, off: u64, dirty: DirtyState) {
        self.slots.remove(&off);
        self.slots.insert(
            off,
            Slot::IntervalStart(IntervalStart {
                dirty,
                awaiting_clean_length: 0,
            }),
        );
    }

    /// Materializes every implicit zero offset inside `range` (which must
    /// lie within a single interval) as an explicit [`Slot::IntervalSlot`],
    /// leaving the sentinels in place. Used ahead of bulk operations that
    /// need a real slot per offset (e.g. `commit`).
    pub fn populate_slots_in_interval(&mut self, range: Range<u64>) {
        let page_size = PAGE_SIZE as u64;
        let mut offset = range.start;
        while offset < range.end {
            self.slots.entry(offset).or_insert(Slot::IntervalSlot);
            offset += page_size;
        }
    }

    /// Reserves a present-but-empty slot at `offset`, returning `false` if
    /// one is already there.
    pub fn reserve_empty(&mut self, offset: u64) -> bool {
        if self.slots.contains_key(&offset) {
            return false;
        }
        self.slots.insert(offset, Slot::IntervalSlot);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Slot)> {
        self.slots.iter().map(|(k, v)| (*k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageFrame;

    fn page(byte: u8) -> Slot {
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.write_bytes(0, &[byte]);
        Slot::Page(crate::slot::PageSlot::new_untracked(frame))
    }

    #[test]
    fn insert_and_lookup() {
        let mut list = PageList::new();
        list.insert(0, page(1));
        list.insert(4096, Slot::Marker);
        assert!(list.lookup(0).unwrap().is_page_or_reference());
        assert!(matches!(list.lookup(4096), Some(Slot::Marker)));
        assert!(list.lookup(8192).is_none());
    }

    #[test]
    fn remove_content_takes_ownership() {
        let mut list = PageList::new();
        list.insert(0, page(1));
        let removed = list.remove_content(0);
        assert!(removed.is_some());
        assert!(list.lookup(0).is_none());
    }

    #[test]
    fn for_every_page_skips_markers_and_gaps() {
        let mut list = PageList::new();
        list.insert(0, page(1));
        list.insert(4096, Slot::Marker);
        list.insert(8192, page(2));
        let mut seen = Vec::new();
        list.for_every_page_in_range(0..16384, |off, _| {
            seen.push(off);
            Continue::Next
        });
        assert_eq!(seen, vec![0, 8192]);
    }

    #[test]
    fn zero_interval_round_trip() {
        let mut list = PageList::new();
        list.add_zero_interval(0..4 * 4096, DirtyState::Dirty);
        let range = list.interval_range(0).unwrap();
        assert_eq!(range, 0..16384);
    }

    #[test]
    fn split_interval_at_first_offset_leaves_left_empty() {
        let mut list = PageList::new();
        list.add_zero_interval(0..3 * 4096, DirtyState::Dirty);
        match list.lookup_or_allocate(0, IntervalPolicy::SplitInterval) {
            AllocatedSlot::Slot(_) => {}
            AllocatedSlot::InInterval => panic!("expected a slot"),
        }
        // Nothing should remain to the left of offset 0.
        assert!(list.lookup(0).is_some());
        // The right half [4096, 3*4096) should still be a single interval.
        let right = list.interval_range(4096);
        assert_eq!(right, Some(4096..3 * 4096));
    }

    #[test]
    fn split_interval_at_last_offset_leaves_right_empty() {
        let mut list = PageList::new();
        list.add_zero_interval(0..3 * 4096, DirtyState::Dirty);
        let last = 2 * 4096;
        match list.lookup_or_allocate(last, IntervalPolicy::SplitInterval) {
            AllocatedSlot::Slot(_) => {}
            AllocatedSlot::InInterval => panic!("expected a slot"),
        }
        assert!(list.lookup(last).is_some());
        let left = list.interval_range(0);
        assert_eq!(left, Some(0..2 * 4096));
    }

    #[test]
    fn splice_list_round_trip() {
        let mut list = PageList::new();
        list.insert(0, page(1));
        list.insert(4096, page(2));
        let mut splice = list.take_pages(0..8192);
        assert!(list.is_empty());
        let (off0, _) = splice.pop_front().unwrap();
        assert_eq!(off0, 0);
        let (off1, _) = splice.pop_front().unwrap();
        assert_eq!(off1, 4096);
        assert!(splice.pop_front().is_none());
    }
}
