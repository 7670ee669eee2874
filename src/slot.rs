// SPDX-License-Identifier: MPL-2.0

//! `Slot`, the tagged cell stored at each present offset of a [`crate::page_list::PageList`].
//!
//! The teacher's `VmoMark` approach tags a whole `XArray` entry out-of-band
//! with a bitmask (`CowVmo`, `ExclusivePage`); this engine's slot needs
//! richer per-offset state (split bits, dirty state, interval sentinels),
//! so the tag lives directly on the slot itself as a small sum type, per
//! the "Tagged variants" design note.

use crate::compressor::CompressedRef;
use crate::page::PageFrame;

/// Split-bit pair recorded on a real `Page` or `Reference` slot.
///
/// At most one of the two may be set; both set is a corruption the engine
/// never produces (checked by [`SplitBits::validate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SplitBits {
    pub left: bool,
    pub right: bool,
}

impl SplitBits {
    pub const fn none() -> Self {
        SplitBits {
            left: false,
            right: false,
        }
    }

    pub fn validate(self) {
        debug_assert!(
            !(self.left && self.right),
            "a page or reference must not have both split bits set"
        );
    }

    pub fn is_set(self, side: Direction) -> bool {
        match side {
            Direction::Left => self.left,
            Direction::Right => self.right,
        }
    }

    pub fn set(&mut self, side: Direction) {
        match side {
            Direction::Left => self.left = true,
            Direction::Right => self.right = true,
        }
        self.validate();
    }

    pub fn clear(&mut self) {
        self.left = false;
        self.right = false;
    }
}

/// Which child a descent through a hidden node took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }
}

/// Writeback progress of a page or zero interval in a pager-preserving
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// The object has no preserving source; dirty tracking does not apply.
    Untracked,
    /// Content matches the external pager.
    Clean,
    /// Locally modified; writeback is needed.
    Dirty,
    /// Writeback has begun but not yet been acknowledged.
    AwaitingClean,
}

/// A real, owned page plus its split-bit and dirty-tracking bookkeeping.
#[derive(Debug, Clone)]
pub struct PageSlot {
    pub frame: PageFrame,
    pub split: SplitBits,
    pub dirty: DirtyState,
}

impl PageSlot {
    pub fn new_untracked(frame: PageFrame) -> Self {
        PageSlot {
            frame,
            split: SplitBits::none(),
            dirty: DirtyState::Untracked,
        }
    }
}

/// A compressed-content handle plus its split-bit bookkeeping.
///
/// Behaves exactly like [`PageSlot`] for split-bit purposes (§3): a
/// reference is a first-class content kind, not a degraded page.
#[derive(Debug, Clone)]
pub struct ReferenceSlot {
    pub reference: CompressedRef,
    pub split: SplitBits,
}

/// Sentinel marking the start of a zero interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalStart {
    pub dirty: DirtyState,
    /// Only meaningful while `dirty == AwaitingClean`; see the
    /// "Awaiting-clean length rationale" design note.
    pub awaiting_clean_length: u64,
}

/// The tagged cell occupying one present offset in a [`crate::page_list::PageList`].
#[derive(Debug, Clone)]
pub enum Slot {
    /// Explicitly-zero single offset; used in anonymous trees and for
    /// pager-supplied zero pages.
    Marker,
    /// An owned real page.
    Page(PageSlot),
    /// A compressed-content handle.
    Reference(ReferenceSlot),
    /// Opens a zero interval; the matching end sentinel is at a greater
    /// offset in the same page-list.
    IntervalStart(IntervalStart),
    /// Closes a zero interval opened by an [`Slot::IntervalStart`].
    IntervalEnd,
    /// An internal offset of an interval, distinct from its start/end.
    ///
    /// Used transiently when [`crate::page_list::IntervalPolicy::SplitInterval`]
    /// splits an interval around an offset that is neither its first nor
    /// last page: the engine materializes this offset out of the interval
    /// before immediately overwriting it with real content.
    IntervalSlot,
}

impl Slot {
    pub fn is_page_or_reference(&self) -> bool {
        matches!(self, Slot::Page(_) | Slot::Reference(_))
    }

    pub fn split_bits(&self) -> Option<SplitBits> {
        match self {
            Slot::Page(p) => Some(p.split),
            Slot::Reference(r) => Some(r.split),
            _ => None,
        }
    }

    pub fn set_split_bit(&mut self, side: Direction) {
        match self {
            Slot::Page(p) => p.split.set(side),
            Slot::Reference(r) => r.split.set(side),
            _ => debug_assert!(false, "set_split_bit on a non-page/reference slot"),
        }
    }

    pub fn clear_split_bits(&mut self) {
        match self {
            Slot::Page(p) => p.split.clear(),
            Slot::Reference(r) => r.split.clear(),
            _ => {}
        }
    }

    pub fn dirty_state(&self) -> Option<DirtyState> {
        match self {
            Slot::Page(p) => Some(p.dirty),
            Slot::IntervalStart(s) => Some(s.dirty),
            _ => None,
        }
    }

    pub fn is_interval_sentinel(&self) -> bool {
        matches!(
            self,
            Slot::IntervalStart(_) | Slot::IntervalEnd | Slot::IntervalSlot
        )
    }
}
