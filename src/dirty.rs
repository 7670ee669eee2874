// SPDX-License-Identifier: MPL-2.0

//! The dirty/writeback state machine for pager-preserving objects (§4.6).
//!
//! Grounded in `aster-nix`'s `Vmo::writeback_begin`/`writeback_end` pair,
//! which drive the same four-state transition table against a pager; this
//! module additionally covers the zero-interval writeback clipping rule,
//! which the teacher's anonymous-only VMO tree never needed.

use std::ops::Range;

use crate::constants::PAGE_SIZE;
use crate::error::Result;
use crate::object::CowObject;
use crate::page_list::Continue;
use crate::paged_ref::RangeChangeOp;
use crate::slot::{DirtyState, Slot};

/// `writeback_begin(offset, len, is_zero_range)` (§4.6).
///
/// Sets every Dirty page in the range to `AwaitingClean` and removes write
/// permission from any mapping. When `is_zero_range` is set, committed
/// non-zero pages are deliberately left Dirty: the pager has indicated it
/// only intends to write back the zero portions of the range.
pub fn writeback_begin(object: &CowObject, offset: u64, len: u64, is_zero_range: bool) -> Result<()> {
    let range = offset..offset + len;
    object.with_page_list_mut(|list| transition_range(list, range.clone(), is_zero_range));
    if let Some(paged_ref) = object.paged_ref() {
        paged_ref.range_change_update(offset, len, RangeChangeOp::RemoveWrite);
    }
    log::debug!("writeback_begin: {offset}..{} (is_zero_range={is_zero_range})", offset + len);
    Ok(())
}

fn transition_range(list: &mut crate::page_list::PageList, range: Range<u64>, is_zero_range: bool) {
    let page_size = PAGE_SIZE as u64;
    let mut offset = range.start;
    while offset < range.end {
        match list.lookup_mut(offset) {
            Some(Slot::Page(p)) => {
                if p.dirty == DirtyState::Dirty && !(is_zero_range && !frame_is_zero(&p.frame)) {
                    p.dirty = DirtyState::AwaitingClean;
                }
                offset += page_size;
            }
            Some(Slot::IntervalStart(meta)) => {
                if meta.dirty == DirtyState::Dirty {
                    let interval_end = list
                        .interval_range(offset)
                        .map(|r| r.end)
                        .unwrap_or(offset + page_size);
                    let covered_end = interval_end.min(range.end);
                    let covered_len = covered_end - offset;
                    if let Some(Slot::IntervalStart(meta)) = list.lookup_mut(offset) {
                        meta.dirty = DirtyState::AwaitingClean;
                        meta.awaiting_clean_length = meta.awaiting_clean_length.max(covered_len);
                    }
                    offset = covered_end;
                } else {
                    offset += page_size;
                }
            }
            _ => offset += page_size,
        }
    }
}

fn frame_is_zero(frame: &crate::page::PageFrame) -> bool {
    frame.is_all_zero()
}

/// `writeback_end(offset, len)` (§4.6).
///
/// Transitions AwaitingClean pages to Clean. Intervals whose
/// `awaiting_clean_length` fully covers `[offset, offset+len)` are removed
/// outright; partial intervals are clipped at the start.
pub fn writeback_end(object: &CowObject, offset: u64, len: u64) -> Result<()> {
    let range = offset..offset + len;
    object.with_page_list_mut(|list| {
        let page_size = PAGE_SIZE as u64;
        let mut cursor = range.start;
        while cursor < range.end {
            match list.lookup_mut(cursor) {
                Some(Slot::Page(p)) => {
                    if p.dirty == DirtyState::AwaitingClean {
                        p.dirty = DirtyState::Clean;
                    }
                    cursor += page_size;
                }
                Some(Slot::IntervalStart(meta)) if meta.dirty == DirtyState::AwaitingClean => {
                    let awaiting_len = meta.awaiting_clean_length;
                    let interval_range = list
                        .interval_range(cursor)
                        .unwrap_or(cursor..cursor + page_size);
                    if awaiting_len >= interval_range.end - cursor {
                        list.remove_content(cursor);
                        if interval_range.end - page_size != cursor {
                            list.remove_content(interval_range.end - page_size);
                        }
                        list.add_zero_interval(interval_range.clone(), DirtyState::Clean);
                    } else {
                        let clip_len = awaiting_len.min(interval_range.end - cursor);
                        list.clip_interval_start(cursor, clip_len);
                        if clip_len > 0 {
                            let remaining = (cursor + clip_len)..interval_range.end;
                            if remaining.start < remaining.end {
                                list.add_zero_interval(remaining, DirtyState::Clean);
                            }
                        }
                    }
                    cursor = interval_range.end;
                }
                _ => cursor += page_size,
            }
        }
    });
    log::debug!("writeback_end: {offset}..{}", offset + len);
    Ok(())
}

/// `invalidate_dirty_requests(range)`: spuriously completes any
/// outstanding dirty requests touching the range, used by resize and
/// source detach.
pub fn invalidate_dirty_requests(requests: &[&crate::source::PageRequest], range: Range<u64>) {
    for request in requests {
        let req_end = request.offset + request.len;
        if request.offset < range.end && req_end > range.start {
            request.complete_spuriously();
        }
    }
}

/// Visits every Dirty page or interval in `range`, used by tests and by
/// higher-level bulk operations that need to know writeback progress.
pub fn for_every_dirty_in_range(object: &CowObject, range: Range<u64>, mut f: impl FnMut(u64, DirtyState)) {
    object.with_page_list(|list| {
        list.for_every_page_and_gap_in_range(
            range,
            |offset, slot| {
                if let Some(state) = slot.dirty_state() {
                    f(offset, state);
                }
                Continue::Next
            },
            |_| Continue::Next,
        );
    });
}

/// Appends a Dirty zero interval covering `[start, end)`, used by
/// [`crate::bulk::resize`] when growing a pager-preserving object.
pub fn append_dirty_zero_interval(list: &mut crate::page_list::PageList, start: u64, end: u64) {
    list.add_zero_interval(start..end, DirtyState::Dirty);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CowObjectBuilder;
    use crate::slot::SplitBits;

    #[test]
    fn dirty_page_transitions_through_writeback() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let frame = crate::page::PageFrame::alloc_zeroed().unwrap();
        root.with_page_list_mut(|list| {
            list.insert(
                0,
                Slot::Page(crate::slot::PageSlot {
                    frame,
                    split: SplitBits::none(),
                    dirty: DirtyState::Dirty,
                }),
            );
        });
        writeback_begin(&root, 0, 4096, false).unwrap();
        assert!(root.with_page_list(|l| matches!(
            l.lookup(0),
            Some(Slot::Page(p)) if p.dirty == DirtyState::AwaitingClean
        )));
        writeback_end(&root, 0, 4096).unwrap();
        assert!(root.with_page_list(|l| matches!(
            l.lookup(0),
            Some(Slot::Page(p)) if p.dirty == DirtyState::Clean
        )));
    }

    #[test]
    fn fully_acknowledged_interval_becomes_clean() {
        let root = CowObjectBuilder::new(8192).build_root().unwrap();
        root.with_page_list_mut(|list| list.add_zero_interval(0..8192, DirtyState::Dirty));
        writeback_begin(&root, 0, 8192, true).unwrap();
        writeback_end(&root, 0, 8192).unwrap();
        let clean = root.with_page_list(|l| {
            matches!(l.lookup(0), Some(Slot::IntervalStart(s)) if s.dirty == DirtyState::Clean)
        });
        assert!(clean);
    }
}
