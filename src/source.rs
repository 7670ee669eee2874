// SPDX-License-Identifier: MPL-2.0

//! `PageSource`, the external producer/acknowledger interface (§6), and the
//! `PageRequest` object the cursor polls while waiting on it.
//!
//! Grounded in the relationship `aster-nix`'s VMO has with its pager: the
//! core never assumes anything about how content eventually arrives, it
//! only defines the request/acknowledge protocol and a debug-info handle
//! threaded through every call, the way `vmo/pager.rs` passes a `VmoInfo`
//! to its `Pager` trait methods.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Result;

/// Identifies the cow-object on whose behalf a `PageSource` call is made.
///
/// Attribution accounting itself is out of scope; this only exists because
/// the interface shapes in this module require a debug handle as a
/// parameter.
#[derive(Debug, Clone, Copy)]
pub struct DebugInfo {
    pub name: &'static str,
    pub koid: u64,
}

/// Which role a [`PageSource`] plays, deciding whether its content is
/// preserving (pager, dirty-tracked) or supplying (contiguous, physical).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// A user pager: content is preserving, supports dirty tracking.
    PagerProxy,
    /// A contiguous physical provider: supplies specific physical pages.
    PhysicalProvider,
    /// An anonymous requester with no real backing; mostly used in tests.
    AnonymousRequester,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Pending,
    Completed,
    Failed,
}

impl RequestState {
    fn to_u8(self) -> u8 {
        match self {
            RequestState::Pending => 0,
            RequestState::Completed => 1,
            RequestState::Failed => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => RequestState::Pending,
            1 => RequestState::Completed,
            _ => RequestState::Failed,
        }
    }
}

/// A request for an asynchronous read or dirty transition.
///
/// Models the "coroutine/async shape" design note as a plain state machine:
/// the issuing call either completes synchronously or fills this in and
/// returns [`crate::error::Errno::ShouldWait`]; the source's completion
/// callback (`on_pages_supplied`/`on_pages_dirtied`/`on_pages_failed`)
/// flips the state, and the caller polls it on retry. No OS wait/wake
/// primitive is introduced, matching §9: the scheduler is out of scope.
#[derive(Debug)]
pub struct PageRequest {
    state: AtomicU8,
    pub offset: u64,
    pub len: u64,
}

impl PageRequest {
    pub fn new(offset: u64, len: u64) -> Self {
        PageRequest {
            state: AtomicU8::new(RequestState::Pending.to_u8()),
            offset,
            len,
        }
    }

    pub fn is_pending(&self) -> bool {
        RequestState::from_u8(self.state.load(Ordering::Acquire)) == RequestState::Pending
    }

    pub fn is_completed(&self) -> bool {
        RequestState::from_u8(self.state.load(Ordering::Acquire)) == RequestState::Completed
    }

    pub fn is_failed(&self) -> bool {
        RequestState::from_u8(self.state.load(Ordering::Acquire)) == RequestState::Failed
    }

    pub fn complete(&self) {
        self.state
            .store(RequestState::Completed.to_u8(), Ordering::Release);
    }

    pub fn fail(&self) {
        self.state
            .store(RequestState::Failed.to_u8(), Ordering::Release);
    }

    /// Marks the request as spuriously completed, used by resize/detach to
    /// unblock waiters whose range no longer applies.
    pub fn complete_spuriously(&self) {
        self.complete();
    }
}

/// The external source of content for a pager-preserving or
/// physically-supplying cow-object (§6).
///
/// Implementations are expected to hold their own lock independent of any
/// cow-object lock, matching §5's lock-order rule that the core never
/// blocks on a source callback while holding its own lock.
pub trait PageSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Requests that `[offset, offset+len)` be filled. Never succeeds
    /// synchronously for preserving sources; on success the caller must
    /// wait for [`PageSource::on_pages_supplied`] or
    /// [`PageSource::on_pages_failed`] to fire against `request`.
    fn get_pages(
        &self,
        offset: u64,
        len: u64,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<()>;

    /// Requests a dirty-transition acknowledgement over `[offset, offset+len)`.
    fn request_dirty_transition(
        &self,
        request: &PageRequest,
        offset: u64,
        len: u64,
        debug_info: DebugInfo,
    ) -> Result<()>;

    /// Called by the source to resolve waiters on a prior `get_pages`.
    fn on_pages_supplied(&self, offset: u64, len: u64);

    /// Called by the source to resolve waiters on a prior
    /// `request_dirty_transition`.
    fn on_pages_dirtied(&self, offset: u64, len: u64);

    /// Called by the source to fail waiters over `[offset, offset+len)`.
    fn on_pages_failed(&self, offset: u64, len: u64, status: crate::error::Errno);

    /// Whether write faults on Clean pages must round-trip through
    /// `request_dirty_transition` before becoming writable.
    fn should_trap_dirty_transitions(&self) -> bool;

    /// Sanity hook: does the source consider `page` valid content for `offset`?
    fn debug_is_page_ok(&self, page: &crate::page::PageFrame, offset: u64) -> bool {
        let _ = (page, offset);
        true
    }

    fn is_detached(&self) -> bool;

    /// Detaches the source, failing all outstanding requests with a
    /// bad-state error.
    fn detach(&self);

    fn close(&self);
}

/// A minimal in-memory [`PageSource`] used by tests: every `get_pages`
/// and `request_dirty_transition` call completes synchronously by
/// immediately marking the request completed, acting as a `PagerProxy`
/// that never actually defers.
pub struct ImmediateSource {
    trap_dirty: bool,
    detached: std::sync::atomic::AtomicBool,
}

impl ImmediateSource {
    pub fn new(trap_dirty: bool) -> Self {
        ImmediateSource {
            trap_dirty,
            detached: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

impl PageSource for ImmediateSource {
    fn kind(&self) -> SourceKind {
        SourceKind::PagerProxy
    }

    fn get_pages(
        &self,
        _offset: u64,
        _len: u64,
        _request: &PageRequest,
        _debug_info: DebugInfo,
    ) -> Result<()> {
        // Genuinely asynchronous: the request is left Pending for the
        // caller (or a test standing in for the pager) to complete via
        // `on_pages_supplied`.
        Ok(())
    }

    fn request_dirty_transition(
        &self,
        _request: &PageRequest,
        _offset: u64,
        _len: u64,
        _debug_info: DebugInfo,
    ) -> Result<()> {
        Ok(())
    }

    fn on_pages_supplied(&self, _offset: u64, _len: u64) {}
    fn on_pages_dirtied(&self, _offset: u64, _len: u64) {}
    fn on_pages_failed(&self, _offset: u64, _len: u64, _status: crate::error::Errno) {}

    fn should_trap_dirty_transitions(&self) -> bool {
        self.trap_dirty
    }

    fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let req = PageRequest::new(0, 4096);
        assert!(req.is_pending());
        req.complete();
        assert!(req.is_completed());
    }

    #[test]
    fn immediate_source_leaves_request_pending_until_acknowledged() {
        let source = ImmediateSource::new(true);
        let debug = DebugInfo { name: "test", koid: 1 };
        let req = PageRequest::new(0, 4096);
        source.get_pages(0, 4096, &req, debug).unwrap();
        assert!(req.is_pending());
        source.on_pages_supplied(0, 4096);
        req.complete();
        assert!(req.is_completed());
        assert!(source.should_trap_dirty_transitions());
    }
}
