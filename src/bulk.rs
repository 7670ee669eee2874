// SPDX-License-Identifier: MPL-2.0

//! Bulk operations that compose the cursor, page-list, and dirty-tracking
//! primitives: resize, commit/pin/unpin/decommit/zero, and pager data
//! transfer (§4.7-4.9).
//!
//! Grounded in `aster-nix`'s `Vmo::{resize, commit_pages, decommit_pages,
//! zero}`, which are themselves thin wrappers that loop a cursor-like
//! primitive over a range and report partial progress the same way
//! `commit` does here via `committed_len`.

use std::ops::Range;
use std::sync::Arc;

use crate::constants::PAGE_SIZE;
use crate::cursor::LookupCursor;
use crate::dirty::{append_dirty_zero_interval, invalidate_dirty_requests};
use crate::error::{Errno, Result};
use crate::object::CowObject;
use crate::page::PageFrame;
use crate::page_list::{AllocatedSlot, Continue, IntervalPolicy, SpliceList};
use crate::paged_ref::RangeChangeOp;
use crate::range_change::propagate_range_change;
use crate::return_errno_with_message;
use crate::slot::{DirtyState, PageSlot, Slot};
use crate::source::{DebugInfo, PageRequest};

fn validate_range(object: &CowObject, range: &Range<u64>) -> Result<()> {
    if !crate::constants::is_page_aligned(range.start) || !crate::constants::is_page_aligned(range.end) {
        return_errno_with_message!(Errno::InvalidArguments, "range must be page-aligned");
    }
    if range.end > object.size() {
        return_errno_with_message!(Errno::OutOfRange, "range extends beyond object size");
    }
    Ok(())
}

/// `resize(new_size, requests)` (§4.7). `requests` lists any outstanding
/// read or dirty requests a caller is holding onto for this object; a
/// shrink spuriously completes the ones that touch the removed tail so a
/// waiter doesn't block forever on a range that no longer exists.
pub fn resize(object: &Arc<CowObject>, new_size: u64, requests: &[&PageRequest]) -> Result<()> {
    if !crate::constants::is_page_aligned(new_size) {
        return_errno_with_message!(Errno::InvalidArguments, "new size must be page-aligned");
    }
    if object.is_slice() {
        return_errno_with_message!(Errno::NotSupported, "slices are not resizable");
    }
    let old_size = object.size();
    if new_size < old_size {
        shrink(object, new_size, old_size, requests)?;
    } else if new_size > old_size {
        grow(object, old_size, new_size)?;
    }
    Ok(())
}

fn shrink(object: &Arc<CowObject>, new_size: u64, old_size: u64, requests: &[&PageRequest]) -> Result<()> {
    let tail_pinned = object.with_page_list(|list| {
        let mut pinned = false;
        list.for_every_page_in_range(new_size..old_size, |_, slot| {
            if let Slot::Page(p) = slot {
                if p.frame.is_pinned() {
                    pinned = true;
                    return Continue::Stop;
                }
            }
            Continue::Next
        });
        pinned
    });
    if tail_pinned {
        return_errno_with_message!(Errno::BadState, "cannot shrink past a pinned page");
    }

    propagate_range_change(object, new_size, old_size - new_size, RangeChangeOp::Unmap);

    object.with_page_list_mut(|list| list.remove_pages_and_iterate_gaps(new_size..old_size, |_, _| {}));

    invalidate_dirty_requests(requests, new_size..old_size);

    object.set_size(new_size);
    for child in object.children_snapshot() {
        let limit = child.parent_limit().min(new_size.saturating_sub(child.parent_offset()));
        child.set_parent_window(child.parent_offset(), child.parent_start_limit().min(limit), limit);
    }
    Ok(())
}

fn grow(object: &Arc<CowObject>, old_size: u64, new_size: u64) -> Result<()> {
    if object.root_parent_offset() + new_size < object.root_parent_offset() {
        return_errno_with_message!(Errno::OutOfRange, "growth would overflow root parent offset");
    }
    object.set_size(new_size);
    if object.is_pager_preserving() {
        object.with_page_list_mut(|list| append_dirty_zero_interval(list, old_size, new_size));
    }
    Ok(())
}

/// `commit(range, request)`: ensures every offset in range has a page
/// owned by the target. Returns the number of bytes successfully
/// committed, supporting partial progress.
pub fn commit(object: &Arc<CowObject>, range: Range<u64>, request: &PageRequest) -> Result<u64> {
    validate_range(object, &range)?;
    let mut cursor = LookupCursor::new(object, range.start, range.end - range.start)?;
    let debug_info = DebugInfo { name: "commit", koid: 0 };
    let mut committed = 0u64;
    while cursor.offset() < range.end {
        match cursor.require_owned_page(false, None, request, debug_info) {
            Ok(_) => committed += PAGE_SIZE as u64,
            Err(e) if e.errno() == Errno::ShouldWait => break,
            Err(e) => return Err(e),
        }
    }
    Ok(committed)
}

/// `pin(range)`: increments the pin count on every page in range,
/// requiring every slot to already be a real page; rolls back on failure.
pub fn pin(object: &CowObject, range: Range<u64>) -> Result<()> {
    validate_range(object, &range)?;
    let mut pinned_offsets = Vec::new();
    let result = object.with_page_list(|list| {
        let page_size = PAGE_SIZE as u64;
        let mut offset = range.start;
        while offset < range.end {
            match list.lookup(offset) {
                Some(Slot::Page(p)) => {
                    if p.frame.pin().is_err() {
                        return Err(Errno::BadState.into());
                    }
                    pinned_offsets.push(p.frame.clone());
                }
                _ => return Err(Errno::NotFound.into()),
            }
            offset += page_size;
        }
        Ok(())
    });
    if let Err(e) = result {
        for frame in pinned_offsets {
            frame.unpin();
        }
        return Err(e);
    }
    let count = (range.end - range.start) / PAGE_SIZE as u64;
    object.pin_pages(count as u32)
}

/// `unpin(range, allow_gaps)`: decrements the pin count; absent slots are
/// skipped only when `allow_gaps` is set.
pub fn unpin(object: &CowObject, range: Range<u64>, allow_gaps: bool) -> Result<()> {
    validate_range(object, &range)?;
    let mut unpinned = 0u32;
    let result = object.with_page_list(|list| {
        let page_size = PAGE_SIZE as u64;
        let mut offset = range.start;
        while offset < range.end {
            match list.lookup(offset) {
                Some(Slot::Page(p)) => {
                    p.frame.unpin();
                    unpinned += 1;
                }
                _ if allow_gaps => {}
                _ => return Err(Errno::NotFound.into()),
            }
            offset += page_size;
        }
        Ok(())
    });
    object.unpin_pages(unpinned);
    result
}

/// `decommit(range)`: forbidden on an object with a parent or a
/// preserving source; unmaps and removes pages in the range.
pub fn decommit(object: &Arc<CowObject>, range: Range<u64>) -> Result<()> {
    validate_range(object, &range)?;
    if object.parent().is_some() {
        return_errno_with_message!(Errno::NotSupported, "cannot decommit a child object");
    }
    if object.is_pager_preserving() {
        return_errno_with_message!(Errno::NotSupported, "cannot decommit a pager-preserving object");
    }
    propagate_range_change(object, range.start, range.end - range.start, RangeChangeOp::Unmap);
    object.with_page_list_mut(|list| list.remove_pages(range, |_, _| {}));
    Ok(())
}

/// `zero_pages(range, request)`: zeroes a range, choosing the cheapest
/// applicable strategy per offset.
pub fn zero_pages(object: &Arc<CowObject>, range: Range<u64>, request: &PageRequest) -> Result<()> {
    validate_range(object, &range)?;
    let has_parent = object.parent().is_some();
    let preserving = object.is_pager_preserving();

    if !has_parent && !preserving {
        // Whole-range decommit is the cheapest path for an anonymous root.
        return decommit(object, range);
    }

    let page_size = PAGE_SIZE as u64;
    let debug_info = DebugInfo { name: "zero_pages", koid: 0 };
    let mut offset = range.start;
    while offset < range.end {
        let parent_has_content = has_parent
            && !object.with_page_list(|list| list.lookup(offset).is_some())
            && parent_content_exists(object, offset);
        if parent_has_content {
            object.with_page_list_mut(|list| {
                list.insert(offset, Slot::Marker);
            });
        } else if preserving {
            object.with_page_list_mut(|list| {
                if list.lookup(offset).is_none() {
                    list.add_zero_interval(offset..offset + page_size, DirtyState::Dirty);
                } else {
                    list.replace_page_with_zero_interval(offset, DirtyState::Dirty);
                }
            });
        } else {
            let mut cursor = LookupCursor::new(object, offset, page_size)?;
            let (frame, _) = cursor.require_owned_page(true, None, request, debug_info)?;
            frame.zero();
        }
        offset += page_size;
    }
    propagate_range_change(object, range.start, range.end - range.start, RangeChangeOp::Unmap);
    Ok(())
}

fn parent_content_exists(object: &CowObject, offset: u64) -> bool {
    let Some(parent) = object.parent() else {
        return false;
    };
    if offset < object.parent_start_limit() || offset >= object.parent_limit() {
        return false;
    }
    let parent_offset = object.parent_offset() + offset;
    parent.with_page_list(|list| list.lookup(parent_offset).is_some())
}

/// `supply_pages(range, splice_list)` (§4.9): pops one slot per offset
/// from `splice_list` and installs it, firing `on_pages_supplied` on the
/// source for each contiguous run.
pub fn supply_pages(
    object: &Arc<CowObject>,
    range: Range<u64>,
    splice_list: &mut SpliceList,
) -> Result<()> {
    validate_range(object, &range)?;
    let page_size = PAGE_SIZE as u64;
    let mut offset = range.start;
    let run_start = range.start;
    while offset < range.end {
        let already_present = object.with_page_list(|list| list.lookup(offset).is_some());
        if already_present {
            return_errno_with_message!(Errno::AlreadyExists, "supply onto a non-empty slot");
        }
        let slot = match splice_list.pop_front() {
            Some((_, slot)) => slot,
            None => Slot::Marker,
        };
        let slot = match slot {
            Slot::Page(mut p) => {
                p.dirty = DirtyState::Clean;
                Slot::Page(p)
            }
            other => other,
        };
        object.with_page_list_mut(|list| {
            list.insert(offset, slot);
        });
        offset += page_size;
    }
    if let Some(source) = object.page_source() {
        source.on_pages_supplied(run_start, range.end - run_start);
    }
    Ok(())
}

/// `take_pages(range, out_splice, request)` (§4.9): moves content out of
/// the range, leaving a freshly allocated zero page in each taken slot's
/// place so the object's logical content is preserved.
pub fn take_pages(
    object: &Arc<CowObject>,
    range: Range<u64>,
    request: &PageRequest,
) -> Result<SpliceList> {
    validate_range(object, &range)?;
    if object.parent().is_none() && object.page_source().is_none() {
        propagate_range_change(object, range.start, range.end - range.start, RangeChangeOp::Unmap);
        return Ok(object.with_page_list_mut(|list| list.take_pages(range)));
    }

    // Child path: first ensure every offset is target-owned.
    let debug_info = DebugInfo { name: "take_pages", koid: 0 };
    let mut cursor = LookupCursor::new(object, range.start, range.end - range.start)?;
    while cursor.offset() < range.end {
        cursor.require_owned_page(false, None, request, debug_info)?;
    }

    let page_size = PAGE_SIZE as u64;
    let mut entries = Vec::new();
    let mut offset = range.start;
    while offset < range.end {
        let taken = object.with_page_list_mut(|list| list.remove_content(offset));
        let replacement = PageFrame::alloc_zeroed()?;
        object.with_page_list_mut(|list| {
            match list.lookup_or_allocate(offset, IntervalPolicy::SplitInterval) {
                AllocatedSlot::Slot(slot) => {
                    *slot = Slot::Page(PageSlot::new_untracked(replacement.clone()));
                }
                AllocatedSlot::InInterval => {
                    list.insert(offset, Slot::Page(PageSlot::new_untracked(replacement.clone())));
                }
            }
        });
        if let Some(slot) = taken {
            entries.push((offset, slot));
        }
        offset += page_size;
    }
    invalidate_dirty_requests(&[request], range.clone());
    propagate_range_change(object, range.start, range.end - range.start, RangeChangeOp::Unmap);
    Ok(SpliceList::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CowObjectBuilder;

    #[test]
    fn commit_fills_every_offset_in_range() {
        let root = CowObjectBuilder::new(3 * PAGE_SIZE as u64).build_root().unwrap();
        let request = PageRequest::new(0, 3 * PAGE_SIZE as u64);
        let committed = commit(&root, 0..3 * PAGE_SIZE as u64, &request).unwrap();
        assert_eq!(committed, 3 * PAGE_SIZE as u64);
        let count = root.with_page_list(|l| l.len());
        assert_eq!(count, 3);
    }

    #[test]
    fn pin_then_unpin_restores_pin_count() {
        let root = CowObjectBuilder::new(PAGE_SIZE as u64).build_root().unwrap();
        let request = PageRequest::new(0, PAGE_SIZE as u64);
        commit(&root, 0..PAGE_SIZE as u64, &request).unwrap();
        pin(&root, 0..PAGE_SIZE as u64).unwrap();
        assert_eq!(root.pinned_page_count(), 1);
        unpin(&root, 0..PAGE_SIZE as u64, false).unwrap();
        assert_eq!(root.pinned_page_count(), 0);
    }

    #[test]
    fn shrink_drops_tail_content() {
        let root = CowObjectBuilder::new(3 * PAGE_SIZE as u64).build_root().unwrap();
        let request = PageRequest::new(0, 3 * PAGE_SIZE as u64);
        commit(&root, 0..3 * PAGE_SIZE as u64, &request).unwrap();
        resize(&root, PAGE_SIZE as u64, &[]).unwrap();
        assert_eq!(root.size(), PAGE_SIZE as u64);
        assert_eq!(root.with_page_list(|l| l.len()), 1);
    }

    #[test]
    fn shrink_spuriously_completes_requests_touching_the_removed_tail() {
        let root = CowObjectBuilder::new(3 * PAGE_SIZE as u64).build_root().unwrap();
        let commit_request = PageRequest::new(0, 3 * PAGE_SIZE as u64);
        commit(&root, 0..3 * PAGE_SIZE as u64, &commit_request).unwrap();

        let tail_request = PageRequest::new(2 * PAGE_SIZE as u64, PAGE_SIZE as u64);
        let untouched_request = PageRequest::new(0, PAGE_SIZE as u64);
        resize(&root, PAGE_SIZE as u64, &[&tail_request, &untouched_request]).unwrap();

        assert!(tail_request.is_completed());
        assert!(untouched_request.is_pending());
    }

    #[test]
    fn zero_pages_on_anonymous_root_reads_back_zero() {
        let root = CowObjectBuilder::new(PAGE_SIZE as u64).build_root().unwrap();
        let request = PageRequest::new(0, PAGE_SIZE as u64);
        commit(&root, 0..PAGE_SIZE as u64, &request).unwrap();
        zero_pages(&root, 0..PAGE_SIZE as u64, &request).unwrap();
        assert_eq!(root.with_page_list(|l| l.len()), 0);
    }

    #[test]
    fn zero_pages_on_slice_forwards_to_root() {
        let root = CowObjectBuilder::new(2 * PAGE_SIZE as u64).build_root().unwrap();
        let request = PageRequest::new(0, 2 * PAGE_SIZE as u64);
        commit(&root, 0..2 * PAGE_SIZE as u64, &request).unwrap();
        let slice = CowObjectBuilder::new(PAGE_SIZE as u64)
            .build_slice(&root, PAGE_SIZE as u64, PAGE_SIZE as u64)
            .unwrap();
        zero_pages(&slice, 0..PAGE_SIZE as u64, &request).unwrap();
        let root_tail_is_page = root.with_page_list(|l| matches!(l.lookup(PAGE_SIZE as u64), Some(Slot::Page(_))));
        assert!(!root_tail_is_page);
    }

    #[test]
    fn supply_then_take_round_trips_content_on_a_root() {
        let root = CowObjectBuilder::new(PAGE_SIZE as u64).build_root().unwrap();
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.write_bytes(0, &[5]);
        let mut splice = SpliceList::new(vec![(0, Slot::Page(PageSlot::new_untracked(frame)))]);
        supply_pages(&root, 0..PAGE_SIZE as u64, &mut splice).unwrap();

        let request = PageRequest::new(0, PAGE_SIZE as u64);
        let taken = take_pages(&root, 0..PAGE_SIZE as u64, &request).unwrap();
        assert_eq!(taken.len(), 1);
        assert!(root.with_page_list(|l| l.lookup(0).is_none()));
    }
}
