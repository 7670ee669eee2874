// SPDX-License-Identifier: MPL-2.0

//! `CowObject`, the core entity of the engine (§3).
//!
//! Grounded in `aster-nix`'s `Vmo`/`VmoInner` split: a thin `Arc`-shared
//! handle (`Vmo`) wrapping a lock-guarded mutable body (`VmoInner`), with
//! a handful of fields readable via atomics without taking the lock at
//! all. This module keeps that split: [`CowObject`] is the `Arc`-shared
//! handle, [`Inner`] is the `spin::Mutex`-guarded body, and the pin/high-
//! priority counters live outside the lock as plain atomics per §5.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::constants::{self, PAGE_SIZE};
use crate::discardable::DiscardableTracker;
use crate::error::{Errno, Result};
use crate::page_list::PageList;
use crate::paged_ref::PagedRef;
use crate::slot::Slot;
use crate::source::PageSource;

bitflags::bitflags! {
    /// Structural flags from §3's `options` field.
    pub struct ObjectOptions: u8 {
        /// Internal node created by a bidirectional clone; has exactly two
        /// children and no external back-reference (invariant 2).
        const HIDDEN = 1 << 0;
        /// A child that aliases a sub-range of its parent 1:1.
        const SLICE = 1 << 1;
        /// Eligible to be the target of a snapshot-at-least-on-write clone.
        const SNAPSHOT_AT_LEAST_ON_WRITE_ELIGIBLE = 1 << 2;
        /// Content may be discarded wholesale under memory pressure.
        const DISCARDABLE = 1 << 3;
    }
}

/// Monotonic lifecycle of a cow-object (§3 "Lifecycle").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifeCycle {
    Init,
    Alive,
    Dead,
}

struct Inner {
    size: u64,
    parent: Option<Arc<CowObject>>,
    parent_offset: u64,
    parent_start_limit: u64,
    parent_limit: u64,
    root_parent_offset: u64,
    children: Vec<Weak<CowObject>>,
    page_list: PageList,
    options: ObjectOptions,
    life_cycle: LifeCycle,
    paged_ref: Option<Weak<dyn PagedRef>>,
    page_source: Option<Arc<dyn PageSource>>,
    discardable: Option<Arc<dyn DiscardableTracker>>,
    partial_cow_release: bool,
}

/// A node in the cow-object hierarchy (§3).
pub struct CowObject {
    inner: spin::Mutex<Inner>,
    pinned_page_count: AtomicU32,
    high_priority_count: AtomicI64,
    reclamation_event_count: AtomicU64,
    page_attribution_user_id: AtomicU64,
}

impl CowObject {
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn life_cycle(&self) -> LifeCycle {
        self.inner.lock().life_cycle
    }

    pub fn is_hidden(&self) -> bool {
        self.inner.lock().options.contains(ObjectOptions::HIDDEN)
    }

    pub fn is_slice(&self) -> bool {
        self.inner.lock().options.contains(ObjectOptions::SLICE)
    }

    pub fn is_discardable(&self) -> bool {
        self.inner.lock().options.contains(ObjectOptions::DISCARDABLE)
    }

    pub fn parent(&self) -> Option<Arc<CowObject>> {
        self.inner.lock().parent.clone()
    }

    pub fn parent_offset(&self) -> u64 {
        self.inner.lock().parent_offset
    }

    pub fn parent_start_limit(&self) -> u64 {
        self.inner.lock().parent_start_limit
    }

    pub fn parent_limit(&self) -> u64 {
        self.inner.lock().parent_limit
    }

    pub fn root_parent_offset(&self) -> u64 {
        self.inner.lock().root_parent_offset
    }

    pub fn partial_cow_release(&self) -> bool {
        self.inner.lock().partial_cow_release
    }

    pub fn set_partial_cow_release(&self, value: bool) {
        self.inner.lock().partial_cow_release = value;
    }

    pub fn page_attribution_user_id(&self) -> u64 {
        self.page_attribution_user_id.load(Ordering::Acquire)
    }

    pub fn set_page_attribution_user_id(&self, id: u64) {
        self.page_attribution_user_id.store(id, Ordering::Release);
    }

    pub fn reclamation_event_count(&self) -> u64 {
        self.reclamation_event_count.load(Ordering::Acquire)
    }

    pub fn record_reclamation_event(&self) {
        self.reclamation_event_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn pinned_page_count(&self) -> u32 {
        self.pinned_page_count.load(Ordering::Acquire)
    }

    pub fn high_priority_count(&self) -> i64 {
        self.high_priority_count.load(Ordering::Acquire)
    }

    pub fn is_high_priority(&self) -> bool {
        self.high_priority_count() > 0
    }

    /// Adjusts the high-priority count, propagating the delta to the
    /// parent whenever this object's count crosses zero (invariant 10).
    pub fn adjust_high_priority_count(self: &Arc<Self>, delta: i64) {
        let prev = self.high_priority_count.fetch_add(delta, Ordering::AcqRel);
        let became_nonzero = prev == 0 && prev + delta > 0;
        let became_zero = prev > 0 && prev + delta == 0;
        if became_nonzero || became_zero {
            if let Some(parent) = self.parent() {
                let parent_delta = if became_nonzero { 1 } else { -1 };
                parent.adjust_high_priority_count(parent_delta);
            }
        }
    }

    pub fn paged_ref(&self) -> Option<Arc<dyn PagedRef>> {
        self.inner.lock().paged_ref.as_ref().and_then(Weak::upgrade)
    }

    pub fn attach_paged_ref(&self, paged_ref: Weak<dyn PagedRef>) {
        let mut inner = self.inner.lock();
        inner.paged_ref = Some(paged_ref);
        if inner.life_cycle == LifeCycle::Init {
            inner.life_cycle = LifeCycle::Alive;
        }
    }

    pub fn page_source(&self) -> Option<Arc<dyn PageSource>> {
        self.inner.lock().page_source.clone()
    }

    pub fn is_pager_preserving(&self) -> bool {
        use crate::source::SourceKind;
        matches!(
            self.page_source().map(|s| s.kind()),
            Some(SourceKind::PagerProxy)
        )
    }

    pub fn discardable_tracker(&self) -> Option<Arc<dyn DiscardableTracker>> {
        self.inner.lock().discardable.clone()
    }

    pub fn children_snapshot(&self) -> Vec<Arc<CowObject>> {
        let inner = self.inner.lock();
        inner.children.iter().filter_map(Weak::upgrade).collect()
    }

    pub fn child_count(&self) -> usize {
        self.children_snapshot().len()
    }

    /// Number of present page/reference slots this object currently owns,
    /// independent of its parent's content (§8 "count_pages").
    pub fn count_pages(&self) -> usize {
        self.inner
            .lock()
            .page_list
            .iter()
            .filter(|(_, slot)| slot.is_page_or_reference())
            .count()
    }

    /// Whether `offset` holds an explicit zero [`Slot::Marker`] in this
    /// object's own page-list.
    pub fn is_marker_at(&self, offset: u64) -> bool {
        matches!(self.inner.lock().page_list.lookup(offset), Some(Slot::Marker))
    }

    /// Which of `self`'s two hidden-node children `child` is, by position
    /// in the children list (the left child is always inserted first by
    /// [`crate::clone_ops::create_clone`]'s `Snapshot` path).
    pub fn child_direction(&self, child: &Arc<CowObject>) -> Option<crate::slot::Direction> {
        use crate::slot::Direction;
        let children = self.children_snapshot();
        children.iter().enumerate().find_map(|(i, c)| {
            Arc::ptr_eq(c, child).then_some(if i == 0 { Direction::Left } else { Direction::Right })
        })
    }

    /// The sibling of `child` under a hidden node with exactly two
    /// children.
    pub fn sibling_of(&self, child: &Arc<CowObject>) -> Option<Arc<CowObject>> {
        self.children_snapshot()
            .into_iter()
            .find(|c| !Arc::ptr_eq(c, child))
    }

    fn add_child(&self, child: &Arc<CowObject>) {
        self.inner.lock().children.push(Arc::downgrade(child));
    }

    pub(crate) fn add_child_for_clone(&self, child: &Arc<CowObject>) {
        self.add_child(child);
    }

    pub(crate) fn clear_children_for_clone(&self) {
        self.inner.lock().children.clear();
    }

    pub(crate) fn detach_paged_ref(&self) {
        self.inner.lock().paged_ref = None;
    }

    fn prune_dead_children(&self) {
        self.inner.lock().children.retain(|c| c.strong_count() > 0);
    }

    /// Whether `self`'s own page-list already supplies content for the
    /// whole of `[offset, offset+len)`, independent of its parent. Used by
    /// range-change propagation to stop descending once a child can no
    /// longer see the parent's content in a range.
    pub fn range_fully_covered_locally(&self, offset: u64, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let inner = self.inner.lock();
        let page_size = PAGE_SIZE as u64;
        let mut cursor = offset;
        let end = offset + len;
        while cursor < end {
            match inner.page_list.lookup(cursor) {
                Some(slot) if !slot.is_interval_sentinel() || slot.dirty_state().is_some() => {
                    cursor += page_size;
                }
                _ => return false,
            }
        }
        true
    }

    pub(crate) fn with_page_list<R>(&self, f: impl FnOnce(&PageList) -> R) -> R {
        f(&self.inner.lock().page_list)
    }

    pub(crate) fn with_page_list_mut<R>(&self, f: impl FnOnce(&mut PageList) -> R) -> R {
        f(&mut self.inner.lock().page_list)
    }

    pub(crate) fn set_options(&self, options: ObjectOptions) {
        self.inner.lock().options = options;
    }

    pub(crate) fn options(&self) -> ObjectOptions {
        self.inner.lock().options
    }

    pub(crate) fn set_parent_window(
        &self,
        parent_offset: u64,
        parent_start_limit: u64,
        parent_limit: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.parent_offset = parent_offset;
        inner.parent_start_limit = parent_start_limit;
        inner.parent_limit = parent_limit;
    }

    pub(crate) fn set_parent(&self, parent: Option<Arc<CowObject>>) {
        self.inner.lock().parent = parent;
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.inner.lock().size = size;
    }

    pub(crate) fn set_root_parent_offset(&self, offset: u64) {
        self.inner.lock().root_parent_offset = offset;
    }

    /// Moves `self`'s pin count, source, and attribution id into `target`,
    /// used when constructing the left child of a bidirectional clone.
    pub(crate) fn transfer_identity_to(&self, target: &CowObject) {
        let pin_count = self.pinned_page_count.load(Ordering::Acquire);
        target.pinned_page_count.store(pin_count, Ordering::Release);
        let hp_count = self.high_priority_count.load(Ordering::Acquire);
        target.high_priority_count.store(hp_count, Ordering::Release);
        let reclaim_count = self.reclamation_event_count.load(Ordering::Acquire);
        target
            .reclamation_event_count
            .store(reclaim_count, Ordering::Release);
        let attribution = self.page_attribution_user_id.load(Ordering::Acquire);
        target
            .page_attribution_user_id
            .store(attribution, Ordering::Release);
    }

    pub(crate) fn pin_pages(&self, count: u32) -> Result<()> {
        let prev = self.pinned_page_count.fetch_add(count, Ordering::AcqRel);
        if prev.checked_add(count).is_none() {
            self.pinned_page_count.fetch_sub(count, Ordering::AcqRel);
            return Err(Errno::BadState.into());
        }
        Ok(())
    }

    pub(crate) fn unpin_pages(&self, count: u32) {
        let prev = self.pinned_page_count.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(prev >= count, "unpin underflow");
    }

    /// Transitions toward Dead if there is no external back-reference and
    /// no children left; removes `self` from its parent's children list
    /// and recurses into the parent (§3 "Lifecycle", §9 "deferred dead
    /// transition").
    pub fn maybe_transition_dead(self: &Arc<Self>) {
        let should_die = {
            let mut inner = self.inner.lock();
            if inner.life_cycle == LifeCycle::Dead {
                false
            } else {
                let has_ref = inner
                    .paged_ref
                    .as_ref()
                    .map(|w| w.strong_count() > 0)
                    .unwrap_or(false);
                let has_children = inner.children.iter().any(|c| c.strong_count() > 0);
                if !has_ref && !has_children {
                    inner.life_cycle = LifeCycle::Dead;
                    inner.page_list = PageList::new();
                    if let Some(source) = inner.page_source.take() {
                        source.close();
                    }
                    true
                } else {
                    false
                }
            }
        };
        if should_die {
            log::debug!("cow-object transitioned to Dead");
            if let Some(parent) = self.parent() {
                self.set_parent(None);
                parent.prune_dead_children();
                parent.maybe_transition_dead();
            }
        }
    }
}

/// Builder for root and child cow-objects, replacing a constructor
/// overload set with explicit named steps (mirrors
/// `VmoOptions`/`VmoChildOptions` in the teacher).
pub struct CowObjectBuilder {
    size: u64,
    source: Option<Arc<dyn PageSource>>,
    discardable: Option<Arc<dyn DiscardableTracker>>,
    attribution_id: u64,
}

impl CowObjectBuilder {
    pub fn new(size: u64) -> Self {
        CowObjectBuilder {
            size,
            source: None,
            discardable: None,
            attribution_id: 0,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_discardable(mut self, tracker: Arc<dyn DiscardableTracker>) -> Self {
        self.discardable = Some(tracker);
        self
    }

    pub fn with_attribution_id(mut self, id: u64) -> Self {
        self.attribution_id = id;
        self
    }

    fn validate(&self) -> Result<()> {
        if !constants::is_page_aligned(self.size) {
            return Err(Errno::InvalidArguments.into());
        }
        if self.size > constants::MAX_OBJECT_SIZE {
            return Err(Errno::OutOfRange.into());
        }
        Ok(())
    }

    /// Builds a root object: no parent, `root_parent_offset = 0`.
    pub fn build_root(self) -> Result<Arc<CowObject>> {
        self.validate()?;
        let mut options = ObjectOptions::empty();
        options.insert(ObjectOptions::SNAPSHOT_AT_LEAST_ON_WRITE_ELIGIBLE);
        if self.discardable.is_some() {
            options.insert(ObjectOptions::DISCARDABLE);
        }
        let object = Arc::new(CowObject {
            inner: spin::Mutex::new(Inner {
                size: self.size,
                parent: None,
                parent_offset: 0,
                parent_start_limit: 0,
                parent_limit: 0,
                root_parent_offset: 0,
                children: Vec::new(),
                page_list: PageList::new(),
                options,
                life_cycle: LifeCycle::Init,
                paged_ref: None,
                page_source: self.source.clone(),
                discardable: self.discardable.clone(),
                partial_cow_release: false,
            }),
            pinned_page_count: AtomicU32::new(0),
            high_priority_count: AtomicI64::new(0),
            reclamation_event_count: AtomicU64::new(0),
            page_attribution_user_id: AtomicU64::new(self.attribution_id),
        });
        if let Some(tracker) = &self.discardable {
            tracker.init_cow_pages(object.clone());
        }
        Ok(object)
    }

    /// Builds a slice child of `parent` covering `[offset, offset+len)` of
    /// the parent's own offset space (§4.2 "Slice").
    pub fn build_slice(self, parent: &Arc<CowObject>, offset: u64, len: u64) -> Result<Arc<CowObject>> {
        if !constants::is_page_aligned(offset) || !constants::is_page_aligned(self.size) {
            return Err(Errno::InvalidArguments.into());
        }
        if parent.is_slice() {
            // Slice-of-slice is disallowed; re-home on the parent's own parent.
            let grandparent = parent
                .parent()
                .ok_or_else(|| crate::error::Error::with_message(
                    Errno::NotSupported,
                    "slice-of-slice requires a grandparent",
                ))?;
            let new_offset = parent.parent_offset() + offset;
            return CowObjectBuilder { size: len, ..self }.build_slice(&grandparent, new_offset, len);
        }
        if offset + len > parent.size() {
            return Err(Errno::OutOfRange.into());
        }
        let root_parent_offset = parent.root_parent_offset() + offset;
        let object = Arc::new(CowObject {
            inner: spin::Mutex::new(Inner {
                size: len,
                parent: Some(parent.clone()),
                parent_offset: offset,
                parent_start_limit: 0,
                parent_limit: len,
                root_parent_offset,
                children: Vec::new(),
                page_list: PageList::new(),
                options: ObjectOptions::SLICE,
                life_cycle: LifeCycle::Init,
                paged_ref: None,
                page_source: None,
                discardable: None,
                partial_cow_release: false,
            }),
            pinned_page_count: AtomicU32::new(0),
            high_priority_count: AtomicI64::new(0),
            reclamation_event_count: AtomicU64::new(0),
            page_attribution_user_id: AtomicU64::new(parent.page_attribution_user_id()),
        });
        parent.add_child(&object);
        Ok(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_starts_in_init_lifecycle() {
        let root = CowObjectBuilder::new(8192).build_root().unwrap();
        assert_eq!(root.life_cycle(), LifeCycle::Init);
        assert_eq!(root.size(), 8192);
    }

    #[test]
    fn misaligned_size_is_rejected() {
        let result = CowObjectBuilder::new(100).build_root();
        assert!(result.is_err());
    }

    #[test]
    fn slice_inherits_attribution_and_parent_window() {
        let root = CowObjectBuilder::new(16384).build_root().unwrap();
        root.set_page_attribution_user_id(42);
        let slice = CowObjectBuilder::new(8192)
            .build_slice(&root, 4096, 8192)
            .unwrap();
        assert!(slice.is_slice());
        assert_eq!(slice.parent_offset(), 4096);
        assert_eq!(slice.page_attribution_user_id(), 42);
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn dead_transition_empties_and_unlinks() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let slice = CowObjectBuilder::new(4096).build_slice(&root, 0, 4096).unwrap();
        slice.maybe_transition_dead();
        assert_eq!(slice.life_cycle(), LifeCycle::Dead);
        assert_eq!(root.child_count(), 0);
    }

    #[test]
    fn high_priority_count_propagates_to_parent() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let slice = CowObjectBuilder::new(4096).build_slice(&root, 0, 4096).unwrap();
        slice.adjust_high_priority_count(1);
        assert!(root.is_high_priority());
        slice.adjust_high_priority_count(-1);
        assert!(!root.is_high_priority());
    }
}
