// SPDX-License-Identifier: MPL-2.0

//! `create_clone` and the three clone forms of §4.2.
//!
//! Grounded in `aster-nix`'s `Vmo::create_child`, which dispatches on a
//! `ChildType` the same way `create_clone` dispatches on [`CloneKind`] here,
//! and in particular its handling of turning the parent into a hidden node
//! for a `CloneType::Snapshot` child.

use std::sync::Arc;

use crate::constants;
use crate::error::{Errno, Result};
use crate::object::{CowObject, CowObjectBuilder, ObjectOptions};
use crate::paged_ref::RangeChangeOp;
use crate::range_change::propagate_range_change;
use crate::return_errno_with_message;

/// Which of the three clone forms §4.2 defines the caller requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneKind {
    /// Bidirectional: both the original and the new clone see each other's
    /// write-time forks as a frozen snapshot.
    Snapshot,
    /// Unidirectional: the new clone sees the source's content up to the
    /// moment of the clone, but the source is never forked on its own
    /// behalf afterward.
    SnapshotAtLeastOnWrite,
    /// A 1:1 aliasing child; not independently resizable.
    Slice,
}

/// Maps a requested clone kind to a compatible one at `object`'s current
/// configuration (§4.2 "upgrade rule"), so the caller never sees a
/// surprise rejection when a weaker-but-compatible form exists.
fn upgrade_kind(object: &CowObject, requested: CloneKind) -> CloneKind {
    match requested {
        CloneKind::SnapshotAtLeastOnWrite
            if !object
                .options()
                .contains(ObjectOptions::SNAPSHOT_AT_LEAST_ON_WRITE_ELIGIBLE) =>
        {
            CloneKind::Snapshot
        }
        other => other,
    }
}

/// Creates a clone of `object` covering `[offset, offset+len)`, per the
/// clone form chosen by `kind` (possibly upgraded, see [`upgrade_kind`]).
pub fn create_clone(
    object: &Arc<CowObject>,
    kind: CloneKind,
    offset: u64,
    len: u64,
) -> Result<Arc<CowObject>> {
    if !constants::is_page_aligned(offset) || !constants::is_page_aligned(len) {
        return_errno_with_message!(Errno::InvalidArguments, "clone range must be page-aligned");
    }
    let kind = upgrade_kind(object, kind);
    // A clone whose range exceeds the parent's size is clipped by
    // parent_limit, per the boundary behavior in §8.
    let clipped_len = len.min(object.size().saturating_sub(offset));

    match kind {
        CloneKind::Snapshot => create_snapshot(object, offset, clipped_len),
        CloneKind::SnapshotAtLeastOnWrite => {
            create_snapshot_at_least_on_write(object, offset, clipped_len)
        }
        CloneKind::Slice => CowObjectBuilder::new(clipped_len).build_slice(object, offset, clipped_len),
    }
}

fn create_snapshot(object: &Arc<CowObject>, offset: u64, len: u64) -> Result<Arc<CowObject>> {
    if object.pinned_page_count() > 0 {
        return_errno_with_message!(Errno::BadState, "cannot snapshot an object with pinned pages");
    }
    if object.is_pager_preserving() {
        return_errno_with_message!(
            Errno::NotSupported,
            "a pager-preserving object cannot be bidirectionally snapshotted"
        );
    }
    if object.is_hidden() {
        return_errno_with_message!(Errno::BadState, "hidden nodes cannot be cloned directly");
    }

    let size = object.size();

    // The left child inherits the current object's identity: size,
    // children, back-reference, high-priority count, reclamation event
    // count, attribution id.
    let left = CowObjectBuilder::new(size).build_root()?;
    object.transfer_identity_to(&left);
    left.set_parent(Some(object.clone()));
    left.set_parent_window(0, 0, size);
    left.set_root_parent_offset(object.root_parent_offset());

    for child in object.children_snapshot() {
        child.set_parent(Some(left.clone()));
        left.add_child_for_clone(&child);
    }
    object.clear_children_for_clone();

    if let Some(paged_ref) = object.paged_ref() {
        left.attach_paged_ref(std::sync::Arc::downgrade(&paged_ref));
        object.detach_paged_ref();
    }

    // The right child is the caller's new clone.
    let right = CowObjectBuilder::new(len).build_root()?;
    right.set_parent(Some(object.clone()));
    right.set_parent_window(offset, 0, len);
    right.set_root_parent_offset(object.root_parent_offset() + offset);

    object.add_child_for_clone(&left);
    object.add_child_for_clone(&right);
    object.set_options(ObjectOptions::HIDDEN);

    log::debug!("create_clone(Snapshot): turned object into hidden node with two children");

    // All existing writable mappings of the hidden object must have write
    // removed before return; those mappings now hang off the left child.
    propagate_range_change(&left, 0, size, RangeChangeOp::RemoveWrite);

    Ok(right)
}

fn create_snapshot_at_least_on_write(
    object: &Arc<CowObject>,
    offset: u64,
    len: u64,
) -> Result<Arc<CowObject>> {
    if !object
        .options()
        .contains(ObjectOptions::SNAPSHOT_AT_LEAST_ON_WRITE_ELIGIBLE)
    {
        return_errno_with_message!(
            Errno::NotSupported,
            "object does not advertise snapshot-at-least-on-write capability"
        );
    }

    // Walk up the parent chain as long as the walked range contains no
    // pages or intervals, clipping the window as we ascend.
    let mut cur = object.clone();
    let mut cur_offset = offset;
    let mut cur_len = len;
    loop {
        let Some(parent) = cur.parent() else { break };
        if !parent_range_is_empty(&cur, cur_offset, cur_len) {
            break;
        }
        let parent_window_start = cur.parent_start_limit();
        let parent_window_end = cur.parent_limit();
        let translated_start = cur.parent_offset() + cur_offset;
        let translated_end = translated_start + cur_len;
        let clipped_start = translated_start.max(cur.parent_offset() + parent_window_start);
        let clipped_end = translated_end.min(cur.parent_offset() + parent_window_end);
        if clipped_start >= clipped_end {
            break;
        }
        cur_offset = clipped_start;
        cur_len = clipped_end - clipped_start;
        cur = parent;
    }

    let new_child = CowObjectBuilder::new(cur_len).build_slice(&cur, cur_offset, cur_len)?;
    new_child.set_options(ObjectOptions::empty());
    log::debug!("create_clone(SnapshotAtLeastOnWrite): installed child on ancestor");
    Ok(new_child)
}

/// Whether `[offset, offset+len)` in `object`'s own page-list is entirely
/// absent (no pages, no markers, no interval content), which is the
/// condition under which an unidirectional clone may ascend past it.
fn parent_range_is_empty(object: &CowObject, offset: u64, len: u64) -> bool {
    if len == 0 {
        return true;
    }
    let mut empty = true;
    object.with_page_list(|list| {
        list.for_every_page_and_gap_in_range(
            offset..offset + len,
            |_, _| {
                empty = false;
                crate::page_list::Continue::Stop
            },
            |_| crate::page_list::Continue::Next,
        );
    });
    empty
}
