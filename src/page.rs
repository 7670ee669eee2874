// SPDX-License-Identifier: MPL-2.0

//! The physical-page-frame handle.
//!
//! The real physical page allocator and free-list structure are out of
//! scope for this engine (see the crate-level docs); what the engine needs
//! is only a cheap, clonable *handle* to a page's bytes, plus the few bits
//! of per-page metadata (pin count, loaned, always-need) that the fault
//! path and reclamation consult without taking the owning cow-object's
//! lock. `PageFrame` is that handle, modeled on the relationship between
//! `aster_frame::vm::VmFrame` and the physical frame it refers to.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use spin::Mutex;

use crate::constants::PAGE_SIZE;
use crate::error::{Errno, Result};

struct FrameInner {
    bytes: Mutex<[u8; PAGE_SIZE]>,
    pin_count: AtomicU32,
    loaned: AtomicBool,
    always_need: AtomicBool,
}

/// A reference-counted handle to one page frame's worth of bytes.
///
/// Cloning a `PageFrame` is cheap (an `Arc` bump) and yields another handle
/// to the *same* physical content; to get an independent copy use
/// [`PageFrame::copy_from`] on a freshly allocated frame.
#[derive(Clone)]
pub struct PageFrame(Arc<FrameInner>);

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrame")
            .field("ptr", &Arc::as_ptr(&self.0))
            .field("pin_count", &self.pin_count())
            .finish()
    }
}

impl PageFrame {
    /// Allocates a fresh, zeroed page frame.
    ///
    /// This stands in for `FrameAllocOptions::new(1).alloc_single()`; the
    /// real allocator's free-list and physical-memory accounting are out
    /// of scope, so allocation here can only fail in the degenerate case
    /// used by tests to exercise `OutOfMemory` handling.
    pub fn alloc_zeroed() -> Result<Self> {
        Ok(Self(Arc::new(FrameInner {
            bytes: Mutex::new([0u8; PAGE_SIZE]),
            pin_count: AtomicU32::new(0),
            loaned: AtomicBool::new(false),
            always_need: AtomicBool::new(false),
        })))
    }

    /// Returns a fresh frame whose content is a byte-for-byte copy of `self`.
    pub fn copy(&self) -> Result<Self> {
        let new_frame = Self::alloc_zeroed()?;
        new_frame.copy_from(self);
        Ok(new_frame)
    }

    /// Overwrites `self`'s content with `other`'s content.
    pub fn copy_from(&self, other: &PageFrame) {
        let src = *other.0.bytes.lock();
        *self.0.bytes.lock() = src;
    }

    pub fn zero(&self) {
        *self.0.bytes.lock() = [0u8; PAGE_SIZE];
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.bytes.lock().iter().all(|b| *b == 0)
    }

    pub fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        let content = self.0.bytes.lock();
        let end = offset + buf.len();
        buf.copy_from_slice(&content[offset..end]);
    }

    pub fn write_bytes(&self, offset: usize, buf: &[u8]) {
        let mut content = self.0.bytes.lock();
        let end = offset + buf.len();
        content[offset..end].copy_from_slice(buf);
    }

    /// Identity comparison: do these two handles refer to the same frame?
    pub fn is_same_frame(&self, other: &PageFrame) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn pin_count(&self) -> u32 {
        self.0.pin_count.load(Ordering::Acquire)
    }

    /// Increments the pin count, refusing loaned pages and saturating at
    /// [`crate::constants::MAX_PIN_COUNT`].
    pub fn pin(&self) -> Result<()> {
        if self.is_loaned() {
            return Err(Errno::BadState.into());
        }
        let prev = self.0.pin_count.fetch_add(1, Ordering::AcqRel);
        if prev >= crate::constants::MAX_PIN_COUNT {
            self.0.pin_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Errno::BadState.into());
        }
        Ok(())
    }

    pub fn unpin(&self) {
        let prev = self.0.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of a page with a zero pin count");
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub fn is_loaned(&self) -> bool {
        self.0.loaned.load(Ordering::Acquire)
    }

    pub fn set_loaned(&self, loaned: bool) {
        self.0.loaned.store(loaned, Ordering::Release);
    }

    pub fn always_need(&self) -> bool {
        self.0.always_need.load(Ordering::Acquire)
    }

    pub fn set_always_need(&self, always_need: bool) {
        self.0.always_need.store(always_need, Ordering::Release);
    }
}

/// The process-wide read-only zero page.
///
/// Markers reference zero content without owning a frame at all; this
/// singleton exists only for call sites that need an actual `PageFrame`
/// handle to zero content (e.g. before a write splits it off).
pub fn shared_zero_page() -> PageFrame {
    use std::sync::OnceLock;
    static ZERO_PAGE: OnceLock<PageFrame> = OnceLock::new();
    ZERO_PAGE
        .get_or_init(|| PageFrame::alloc_zeroed().expect("zero page allocation cannot fail"))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_frame_is_zeroed() {
        let frame = PageFrame::alloc_zeroed().unwrap();
        assert!(frame.is_all_zero());
    }

    #[test]
    fn copy_is_independent() {
        let a = PageFrame::alloc_zeroed().unwrap();
        a.write_bytes(0, &[1, 2, 3]);
        let b = a.copy().unwrap();
        b.write_bytes(0, &[9, 9, 9]);
        let mut buf = [0u8; 3];
        a.read_bytes(0, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn pin_unpin_roundtrip() {
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.pin().unwrap();
        frame.pin().unwrap();
        assert_eq!(frame.pin_count(), 2);
        frame.unpin();
        frame.unpin();
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn loaned_page_cannot_be_pinned() {
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.set_loaned(true);
        assert!(frame.pin().is_err());
    }
}
