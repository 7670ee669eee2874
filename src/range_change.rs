// SPDX-License-Identifier: MPL-2.0

//! Range-change (TLB/mapping invalidation) propagation (§4.11).
//!
//! A single work-list threads the operation across a cow-object's
//! descendants. Grounded in how `aster-nix`'s VMO propagates
//! `zero_range`/resize notifications down through its children's mapped
//! VMARs; here the list is a plain `Vec` used as a stack since no cross-
//! thread handoff is needed (the whole walk runs under the caller's own
//! traversal, picking up and releasing each node's lock in turn).

use std::sync::Arc;

use crate::object::CowObject;
use crate::paged_ref::RangeChangeOp;

struct QueuedRange {
    object: Arc<CowObject>,
    offset: u64,
    len: u64,
}

/// The in-memory queue used by [`propagate_range_change`].
#[derive(Default)]
pub struct RangeChangeList {
    queue: Vec<QueuedRange>,
}

impl RangeChangeList {
    pub fn new() -> Self {
        RangeChangeList { queue: Vec::new() }
    }

    fn push(&mut self, object: Arc<CowObject>, offset: u64, len: u64) {
        self.queue.push(QueuedRange { object, offset, len });
    }

    fn pop(&mut self) -> Option<QueuedRange> {
        self.queue.pop()
    }
}

/// Runs the range-change propagation algorithm of §4.11 starting at
/// `object`.
///
/// For each popped node: notify its external back-reference (if any) to
/// apply `op`, then for every child whose parent window intersects the
/// range, push the child with the range translated into the child's own
/// offset space — unless the child's own content already fully covers the
/// intersected range, in which case the child (and everything below it)
/// cannot see parent content there and is skipped.
pub fn propagate_range_change(object: &Arc<CowObject>, offset: u64, len: u64, op: RangeChangeOp) {
    let mut list = RangeChangeList::new();
    list.push(object.clone(), offset, len);

    while let Some(QueuedRange {
        object,
        offset,
        len,
    }) = list.pop()
    {
        if let Some(paged_ref) = object.paged_ref() {
            paged_ref.range_change_update(offset, len, op);
        }

        for child in object.children_snapshot() {
            let window_start = child.parent_start_limit();
            let window_end = child.parent_limit();
            let parent_offset = child.parent_offset();

            // Translate [offset, offset+len) from the parent's space into
            // the child's own offset space, then clip to the child's
            // visible window.
            let range_start_in_child = offset.saturating_sub(parent_offset);
            let range_end_in_child = (offset + len).saturating_sub(parent_offset);
            let clipped_start = range_start_in_child.max(window_start);
            let clipped_end = range_end_in_child.min(window_end);
            if clipped_start >= clipped_end {
                continue;
            }

            if child.range_fully_covered_locally(clipped_start, clipped_end - clipped_start) {
                continue;
            }

            list.push(child, clipped_start, clipped_end - clipped_start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CowObjectBuilder;
    use crate::paged_ref::RecordingPagedRef;

    #[test]
    fn propagates_to_paged_ref() {
        let root = CowObjectBuilder::new(8192).build_root().unwrap();
        let paged_ref = RecordingPagedRef::new(root.clone());
        root.attach_paged_ref(Arc::downgrade(
            &(paged_ref.clone() as Arc<dyn crate::paged_ref::PagedRef>),
        ));

        propagate_range_change(&root, 0, 4096, RangeChangeOp::Unmap);
        assert_eq!(
            paged_ref.recorded_updates(),
            vec![(0, 4096, RangeChangeOp::Unmap)]
        );
    }
}
