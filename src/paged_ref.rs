// SPDX-License-Identifier: MPL-2.0

//! `PagedRef`, the mapping layer's view of a cow-object (§6).
//!
//! Address-space region management is out of scope; what the core needs is
//! a narrow callback surface so it can ask "unmap/protect this range" and
//! "re-point yourself at a different cow-object" without depending on the
//! VMAR implementation. Grounded in how `aster-nix`'s `Vmar` holds a
//! mapping back-reference to its `Vmo` and receives range-change callbacks
//! from it.

use std::sync::{Arc, Weak};

use crate::object::CowObject;

bitflags::bitflags! {
    /// Mirrors the cache-policy flags a mapping layer would apply; only
    /// carried here because [`PagedRef::get_mapping_cache_policy`] needs a
    /// concrete return type.
    pub struct CacheFlags: u8 {
        const CACHED = 0;
        const UNCACHED = 1 << 0;
        const WRITE_COMBINING = 1 << 1;
    }
}

/// What a [`PagedRef::range_change_update`] call should do to existing
/// mappings of the affected range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeChangeOp {
    Unmap,
    RemoveWrite,
    DebugUnpin,
}

/// The mapping layer's back-reference interface, held weakly by a
/// cow-object (hidden nodes hold none at all, per invariant 2).
pub trait PagedRef: Send + Sync {
    fn get_mapping_cache_policy(&self) -> CacheFlags;

    /// Applies `op` to every mapping of `[offset, offset+len)`.
    fn range_change_update(&self, offset: u64, len: u64, op: RangeChangeOp);

    /// Re-points this back-reference at `new_cow`, returning the cow-object
    /// it previously pointed at. Used by the bidirectional clone to hand
    /// the caller's external reference to the freshly created left child.
    fn set_cow_pages_reference(&self, new_cow: Arc<CowObject>) -> Option<Arc<CowObject>>;

    fn can_dedup_zero_pages(&self) -> bool;
}

/// A minimal in-test [`PagedRef`] that just records the calls it receives,
/// standing in for a real VMAR mapping.
pub struct RecordingPagedRef {
    inner: spin::Mutex<RecordingState>,
}

struct RecordingState {
    cow: Option<Arc<CowObject>>,
    updates: Vec<(u64, u64, RangeChangeOp)>,
}

impl RecordingPagedRef {
    pub fn new(cow: Arc<CowObject>) -> Arc<Self> {
        Arc::new(RecordingPagedRef {
            inner: spin::Mutex::new(RecordingState {
                cow: Some(cow),
                updates: Vec::new(),
            }),
        })
    }

    pub fn recorded_updates(&self) -> Vec<(u64, u64, RangeChangeOp)> {
        self.inner.lock().updates.clone()
    }

    pub fn current_cow(&self) -> Option<Arc<CowObject>> {
        self.inner.lock().cow.clone()
    }
}

impl PagedRef for RecordingPagedRef {
    fn get_mapping_cache_policy(&self) -> CacheFlags {
        CacheFlags::CACHED
    }

    fn range_change_update(&self, offset: u64, len: u64, op: RangeChangeOp) {
        self.inner.lock().updates.push((offset, len, op));
    }

    fn set_cow_pages_reference(&self, new_cow: Arc<CowObject>) -> Option<Arc<CowObject>> {
        let mut state = self.inner.lock();
        state.cow.replace(new_cow)
    }

    fn can_dedup_zero_pages(&self) -> bool {
        true
    }
}

/// A weak handle to a [`PagedRef`], the form a cow-object actually stores
/// (it must never keep the mapping layer alive).
pub type PagedRefWeak = Weak<dyn PagedRef>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::CowObjectBuilder;

    #[test]
    fn records_range_change_updates() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let paged_ref = RecordingPagedRef::new(root);
        paged_ref.range_change_update(0, 4096, RangeChangeOp::Unmap);
        assert_eq!(
            paged_ref.recorded_updates(),
            vec![(0, 4096, RangeChangeOp::Unmap)]
        );
    }
}
