// SPDX-License-Identifier: MPL-2.0

//! Engine-wide configuration constants.
//!
//! Mirrors `aster_frame::config::PAGE_SIZE`: these are compile-time
//! constants, not runtime-configurable knobs, so their invariants are
//! checked with `static_assertions` rather than a runtime `assert!`.

use static_assertions::const_assert;

/// The granularity at which a cow-object's content is tracked.
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Maximum number of times a single page may be pinned concurrently.
///
/// Chosen so that pinning every page of [`MAX_OBJECT_SIZE`] this many times
/// cannot overflow a `u32` pin counter.
pub const MAX_PIN_COUNT: u32 = u32::MAX / 2;

/// Maximum size, in bytes, of a single cow-object.
///
/// Chosen so that `root_parent_offset + size` can never overflow a 64-bit
/// counter even at the deepest permitted ancestry.
pub const MAX_OBJECT_SIZE: u64 = 1 << 48;

const_assert!(MAX_OBJECT_SIZE < u64::MAX / 2);

/// Rounds `offset` down to the nearest page boundary.
pub const fn page_align_down(offset: u64) -> u64 {
    offset & !((PAGE_SIZE as u64) - 1)
}

/// Rounds `offset` up to the nearest page boundary.
pub const fn page_align_up(offset: u64) -> u64 {
    page_align_down(offset + (PAGE_SIZE as u64) - 1)
}

/// Returns whether `offset` already lies on a page boundary.
pub const fn is_page_aligned(offset: u64) -> bool {
    offset % (PAGE_SIZE as u64) == 0
}
