// SPDX-License-Identifier: MPL-2.0

//! The COW fork algorithm (§4.4) and zero-page dedup (§4.5).
//!
//! Grounded in `aster-nix`'s `VmoCowPages::cow_clone_page`: a page owned by
//! a hidden ancestor is either migrated down to the descendant that needs
//! it (when the sibling subtree can no longer see it) or copied, setting a
//! split bit so the sibling keeps seeing the original.

use std::sync::Arc;

use crate::compressor::Compressor;
use crate::error::{Errno, Result};
use crate::object::CowObject;
use crate::return_errno_with_message;
use crate::page::PageFrame;
use crate::page_list::{AllocatedSlot, IntervalPolicy};
use crate::paged_ref::RangeChangeOp;
use crate::range_change::propagate_range_change;
use crate::slot::{Direction, PageSlot, Slot};

/// Resolves the page at `ancestor_offset` in the hidden `ancestor`,
/// migrating or copying it step by step down to `target`, and returns the
/// frame now owned by `target` at the corresponding offset.
///
/// `target` must be a (possibly indirect) descendant of `ancestor` through
/// a chain of hidden nodes; `ancestor_offset` is the offset in `ancestor`'s
/// own space at which the page to fork currently lives. A marker or
/// reference slot along the way is forwarded as-is (no real content to
/// copy); `compressor` is only consulted if the content that finally lands
/// at `target` turns out to be a reference needing decompression.
pub fn cow_fork_page(
    target: &Arc<CowObject>,
    ancestor: &Arc<CowObject>,
    ancestor_offset: u64,
    compressor: Option<&dyn Compressor>,
) -> Result<PageFrame> {
    let path = build_descent_path(target, ancestor, ancestor_offset)?;

    let mut cur = ancestor.clone();
    let mut cur_offset = ancestor_offset;
    let mut first_copy_level: Option<usize> = None;

    for (level, (next, next_offset)) in path.iter().enumerate() {
        let direction = cur
            .child_direction(next)
            .expect("descent path child must be a recorded child of cur");
        let sibling = cur.sibling_of(next);

        let uni_accessible = is_uni_accessible(&cur, cur_offset, direction, sibling.as_ref());

        if uni_accessible {
            migrate_page(&cur, cur_offset, next, *next_offset)?;
            log::debug!("cow fork: migrated page at offset {cur_offset}");
        } else {
            copy_page(&cur, cur_offset, direction, next, *next_offset)?;
            log::debug!("cow fork: copied page at offset {cur_offset}");
            if first_copy_level.is_none() {
                first_copy_level = Some(level);
            }
            if let Some(sib) = &sibling {
                propagate_range_change(sib, 0, sib.size(), RangeChangeOp::Unmap);
            }
        }

        cur = next.clone();
        cur_offset = *next_offset;
    }

    propagate_range_change(target, 0, target.size(), RangeChangeOp::Unmap);

    let slot = target
        .with_page_list(|list| list.lookup(cur_offset).cloned())
        .ok_or_else(|| crate::error::Error::with_message(
            Errno::NotFound,
            "cow fork did not leave content at the target offset",
        ))?;
    match slot {
        Slot::Page(p) => Ok(p.frame),
        // Zero content: hand back the shared zero page rather than
        // allocating a fresh one nobody asked to write into.
        Slot::Marker => Ok(crate::page::shared_zero_page()),
        Slot::Reference(r) => {
            let Some(compressor) = compressor else {
                return_errno_with_message!(
                    Errno::NotSupported,
                    "cow fork landed on a reference but no compressor was supplied"
                );
            };
            Ok(compressor.decompress(&r.reference))
        }
        _ => Err(Errno::NotFound.into()),
    }
}

/// Builds the `(node, offset_in_node)` chain from just below `ancestor`
/// down to `target`, inclusive of `target` itself.
fn build_descent_path(
    target: &Arc<CowObject>,
    ancestor: &Arc<CowObject>,
    ancestor_offset: u64,
) -> Result<Vec<(Arc<CowObject>, u64)>> {
    let mut reversed = Vec::new();
    let mut node = target.clone();
    loop {
        if Arc::ptr_eq(&node, ancestor) {
            break;
        }
        let Some(parent) = node.parent() else {
            return Err(Errno::NotFound.into());
        };
        reversed.push(node.clone());
        node = parent;
    }
    reversed.reverse();

    let mut path = Vec::with_capacity(reversed.len());
    let mut running_offset = ancestor_offset;
    for child in reversed {
        let offset_in_child = running_offset
            .checked_sub(child.parent_offset())
            .ok_or(Errno::NotFound)?;
        path.push((child.clone(), offset_in_child));
        running_offset = offset_in_child;
    }
    Ok(path)
}

/// A page owned by a hidden node at `offset` is uni-accessible from the
/// child we are descending into (`direction`) iff the slot's split bit for
/// the *opposite* direction is already set, or the sibling's visible
/// window does not cover `offset` at all.
fn is_uni_accessible(
    hidden: &CowObject,
    offset: u64,
    direction: Direction,
    sibling: Option<&Arc<CowObject>>,
) -> bool {
    let split_set = hidden
        .with_page_list(|list| list.lookup(offset).and_then(Slot::split_bits))
        .map(|bits| bits.is_set(direction.opposite()))
        .unwrap_or(false);
    if split_set {
        return true;
    }
    let Some(sibling) = sibling else {
        return true;
    };
    let window_start = sibling.parent_offset() + sibling.parent_start_limit();
    let window_end = sibling.parent_offset() + sibling.parent_limit();
    !(offset >= window_start && offset < window_end)
}

fn migrate_page(
    cur: &CowObject,
    cur_offset: u64,
    next: &Arc<CowObject>,
    next_offset: u64,
) -> Result<()> {
    let mut slot = cur
        .with_page_list_mut(|list| list.remove_content(cur_offset))
        .ok_or(Errno::NotFound)?;
    slot.clear_split_bits();
    next.with_page_list_mut(|list| {
        list.insert(next_offset, slot);
    });
    Ok(())
}

enum CopySource {
    Page(PageFrame),
    Marker,
    Reference(crate::compressor::CompressedRef),
}

fn copy_page(
    cur: &CowObject,
    cur_offset: u64,
    direction: Direction,
    next: &Arc<CowObject>,
    next_offset: u64,
) -> Result<()> {
    let source = cur
        .with_page_list_mut(|list| match list.lookup_mut(cur_offset) {
            Some(Slot::Page(p)) => {
                p.split.set(direction);
                Some(CopySource::Page(p.frame.clone()))
            }
            Some(Slot::Marker) => Some(CopySource::Marker),
            Some(Slot::Reference(r)) => {
                r.split.set(direction);
                Some(CopySource::Reference(r.reference.clone()))
            }
            _ => None,
        })
        .ok_or(Errno::NotFound)?;

    // A marker or reference has no real page content to copy; the sibling
    // keeps seeing the original through the split bit, and the target gets
    // an equivalent slot of its own instead of a byte-for-byte copy.
    let new_slot = match source {
        CopySource::Page(original_frame) => {
            let new_frame = PageFrame::alloc_zeroed()?;
            new_frame.copy_from(&original_frame);
            Slot::Page(PageSlot::new_untracked(new_frame))
        }
        CopySource::Marker => Slot::Marker,
        CopySource::Reference(reference) => Slot::Reference(crate::slot::ReferenceSlot {
            reference,
            split: crate::slot::SplitBits::none(),
        }),
    };

    next.with_page_list_mut(|list| {
        match list.lookup_or_allocate(next_offset, IntervalPolicy::SplitInterval) {
            AllocatedSlot::Slot(slot) => {
                *slot = new_slot;
            }
            AllocatedSlot::InInterval => {
                list.insert(next_offset, new_slot);
            }
        }
    });
    Ok(())
}

/// Forks a page up through `target`'s ancestry exactly like
/// [`cow_fork_page`], but inserts a [`Slot::Marker`] in `target` instead of
/// a real page, saving the allocation. Frees the original page when it was
/// uni-accessible at the final step.
pub fn clone_cow_page_as_zero(
    target: &Arc<CowObject>,
    ancestor: &Arc<CowObject>,
    ancestor_offset: u64,
) -> Result<()> {
    // Materialize up through target's parent first (stop one level short).
    let Some(parent) = target.parent() else {
        target.with_page_list_mut(|list| list.insert(ancestor_offset, Slot::Marker));
        return Ok(());
    };
    if !Arc::ptr_eq(&parent, ancestor) {
        cow_fork_page(&parent, ancestor, ancestor_offset, None)?;
    }
    let parent_offset = target.parent_offset() + ancestor_offset - ancestor.parent_offset();
    target.with_page_list_mut(|list| {
        list.insert(parent_offset, Slot::Marker);
    });
    Ok(())
}

/// Optimistic zero-page dedup (§4.5): if `page` reads back as all zero
/// under a rescan, replaces its slot with a [`Slot::Marker`] and reports
/// the frame to be returned to the allocator.
pub fn dedup_zero_page(object: &CowObject, page: &PageFrame, offset: u64) -> Result<bool> {
    if object.is_high_priority() {
        return_errno_with_message!(Errno::BadState, "cannot dedup pages of a high-priority object");
    }
    if page.is_pinned() || page.is_loaned() {
        return Ok(false);
    }
    if !page.is_all_zero() {
        return Ok(false);
    }
    if let Some(paged_ref) = object.paged_ref() {
        paged_ref.range_change_update(offset, crate::constants::PAGE_SIZE as u64, RangeChangeOp::RemoveWrite);
    }
    // Rescan under the object's own lock (held implicitly by `with_page_list_mut`).
    let deduped = object.with_page_list_mut(|list| match list.lookup(offset) {
        Some(Slot::Page(p)) if p.frame.is_same_frame(page) && p.frame.is_all_zero() => {
            list.insert(offset, Slot::Marker);
            true
        }
        _ => false,
    });
    if deduped {
        object.record_reclamation_event();
    }
    Ok(deduped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone_ops::{create_clone, CloneKind};
    use crate::object::CowObjectBuilder;

    fn page_with_byte(byte: u8) -> PageFrame {
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.write_bytes(0, &[byte]);
        frame
    }

    #[test]
    fn migrate_vs_copy_fork_preserves_content() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        root.with_page_list_mut(|list| {
            list.insert(0, Slot::Page(PageSlot::new_untracked(page_with_byte(7))));
        });

        // This becomes hidden with two children after the snapshot below.
        let right = create_clone(&root, CloneKind::Snapshot, 0, 4096).unwrap();
        let left = root
            .children_snapshot()
            .into_iter()
            .find(|c| !Arc::ptr_eq(c, &right))
            .unwrap();
        assert!(root.is_hidden());

        // Forking for `right` must copy (left's window still covers it),
        // leaving left's own content untouched afterward.
        let forked = cow_fork_page(&right, &root, 0, None).unwrap();
        let mut buf = [0u8; 1];
        forked.read_bytes(0, &mut buf);
        assert_eq!(buf, [7]);

        // Left can still see the original content through the hidden node.
        assert!(left.with_page_list(|l| l.lookup(0).is_none()));
    }

    #[test]
    fn copy_fork_of_a_marker_slot_leaves_a_marker_behind() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        root.with_page_list_mut(|list| {
            list.insert(0, Slot::Marker);
        });

        let right = create_clone(&root, CloneKind::Snapshot, 0, 4096).unwrap();
        let left = root
            .children_snapshot()
            .into_iter()
            .find(|c| !Arc::ptr_eq(c, &right))
            .unwrap();
        assert!(root.is_hidden());

        // left's window still covers offset 0, so forking for right must
        // copy rather than migrate; a marker has no frame to hand over, so
        // the shared zero page stands in for it.
        let forked = cow_fork_page(&right, &root, 0, None).unwrap();
        assert!(forked.is_all_zero());
        assert!(right.with_page_list(|l| matches!(l.lookup(0), Some(Slot::Marker))));
        assert!(left.with_page_list(|l| l.lookup(0).is_none()));
    }

    #[test]
    fn dedup_replaces_zero_page_with_marker() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let frame = PageFrame::alloc_zeroed().unwrap();
        root.with_page_list_mut(|list| {
            list.insert(0, Slot::Page(PageSlot::new_untracked(frame.clone())));
        });
        let result = dedup_zero_page(&root, &frame, 0).unwrap();
        assert!(result);
        assert!(root.with_page_list(|l| matches!(l.lookup(0), Some(Slot::Marker))));
    }

    #[test]
    fn dedup_refuses_non_zero_page() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let frame = page_with_byte(1);
        root.with_page_list_mut(|list| {
            list.insert(0, Slot::Page(PageSlot::new_untracked(frame.clone())));
        });
        let result = dedup_zero_page(&root, &frame, 0).unwrap();
        assert!(!result);
    }
}
