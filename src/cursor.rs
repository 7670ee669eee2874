// SPDX-License-Identifier: MPL-2.0

//! `LookupCursor`, the single point through which faults, commit,
//! read/write, zero-fill, and pin operations resolve content (§4.3).
//!
//! Grounded in `aster-nix`'s `VmoCowPages::commit_with_cursor` iterator,
//! which plays the same role of walking the parent chain lazily one page
//! at a time instead of materializing the whole range up front.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::compressor::Compressor;
use crate::constants::PAGE_SIZE;
use crate::error::{Errno, Result};
use crate::fork::cow_fork_page;
use crate::object::CowObject;
use crate::page::PageFrame;
use crate::page_list::{AllocatedSlot, IntervalPolicy};
use crate::slot::{DirtyState, PageSlot, Slot};
use crate::source::{DebugInfo, PageRequest};
use crate::{return_errno, return_errno_with_message};

/// Where content for a given offset was ultimately found, relative to the
/// cursor's target object.
enum Owner {
    /// Content lives directly in the target.
    Target,
    /// Content lives in a non-hidden ancestor; a plain copy will do.
    NonHiddenAncestor(Arc<CowObject>, u64),
    /// Content lives in a hidden ancestor; a full COW fork is needed.
    HiddenAncestor(Arc<CowObject>, u64),
    /// No content anywhere in the chain; zero-fill (or request) applies.
    NotFound,
}

/// Configuration bits affecting cursor behavior (§4.3).
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorFlags {
    pub disable_zero_fork: bool,
    pub disable_mark_accessed: bool,
}

/// Walks the target's ancestry to resolve content for faults and bulk
/// operations, one page at a time.
pub struct LookupCursor {
    target: Arc<CowObject>,
    offset: u64,
    end_offset: u64,
    flags: CursorFlags,
}

impl LookupCursor {
    pub fn new(target: &Arc<CowObject>, offset: u64, max_len: u64) -> Result<Self> {
        if !crate::constants::is_page_aligned(offset) {
            return_errno_with_message!(Errno::InvalidArguments, "cursor offset must be page-aligned");
        }
        if target.is_hidden() {
            return_errno_with_message!(Errno::NotSupported, "cannot construct a cursor on a hidden node");
        }
        let end_offset = offset.saturating_add(max_len).min(target.size());
        Ok(LookupCursor {
            target: target.clone(),
            offset,
            end_offset,
            flags: CursorFlags::default(),
        })
    }

    pub fn with_flags(mut self, flags: CursorFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn remaining(&self) -> u64 {
        self.end_offset.saturating_sub(self.offset)
    }

    fn advance(&mut self) {
        self.offset += PAGE_SIZE as u64;
    }

    /// The parent-walk algorithm of §4.3: finds who owns content for
    /// `offset` relative to `self.target`.
    fn find_owner(&self, offset: u64) -> Owner {
        let mut cur = self.target.clone();
        let mut cur_offset = offset;
        loop {
            if let Some(slot) = cur.with_page_list(|l| l.lookup(cur_offset).cloned()) {
                if !slot.is_interval_sentinel() || slot.dirty_state().is_some() {
                    return if Arc::ptr_eq(&cur, &self.target) {
                        Owner::Target
                    } else if cur.is_hidden() {
                        Owner::HiddenAncestor(cur, cur_offset)
                    } else {
                        Owner::NonHiddenAncestor(cur, cur_offset)
                    };
                }
            }
            if cur_offset >= cur.parent_limit() || cur_offset < cur.parent_start_limit() {
                return Owner::NotFound;
            }
            let Some(parent) = cur.parent() else {
                return Owner::NotFound;
            };
            let parent_offset = cur.parent_offset() + cur_offset;
            if parent_offset >= parent.size() {
                return Owner::NotFound;
            }
            cur = parent;
            cur_offset = parent_offset;
        }
    }

    /// `maybe_page(will_write)`: returns a directly usable frame if the
    /// current offset already has a ready page needing no dirty
    /// transition or COW, else `None`. Always advances one page.
    pub fn maybe_page(&mut self, will_write: bool) -> Option<PageFrame> {
        if self.remaining() == 0 {
            return None;
        }
        let offset = self.offset;
        let result = match self.find_owner(offset) {
            Owner::Target => self.target.with_page_list(|l| match l.lookup(offset) {
                Some(Slot::Page(p)) => {
                    let needs_dirty = will_write
                        && self.target.is_pager_preserving()
                        && p.dirty != DirtyState::Dirty;
                    if needs_dirty {
                        None
                    } else {
                        Some(p.frame.clone())
                    }
                }
                _ => None,
            }),
            _ => None,
        };
        self.advance();
        result
    }

    /// `if_exist_pages(will_write, max, out)`: collects contiguous ready
    /// pages starting at the cursor into `out`, stopping at the first slot
    /// that is not immediately usable. Returns the count collected.
    pub fn if_exist_pages(
        &mut self,
        will_write: bool,
        max: usize,
        out: &mut SmallVec<[PageFrame; 4]>,
    ) -> usize {
        let mut count = 0;
        while count < max {
            match self.maybe_page(will_write) {
                Some(frame) => {
                    out.push(frame);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Advances the cursor over a contiguous run of absent slots in the
    /// owner, stopping at the first present slot (or end of range).
    pub fn skip_missing_pages(&mut self) {
        while self.remaining() > 0 {
            if !matches!(self.find_owner(self.offset), Owner::NotFound) {
                break;
            }
            self.advance();
        }
    }

    /// `require_read_page`: guarantees a readable page at the current
    /// offset, returning the shared zero page for zero content and
    /// issuing a read request to the page-source when content is truly
    /// absent. Never returns a writable page.
    pub fn require_read_page(
        &mut self,
        compressor: Option<&dyn Compressor>,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<PageFrame> {
        let offset = self.offset;
        let frame = self.resolve(offset, false, compressor, request, debug_info)?.0;
        self.advance();
        Ok(frame)
    }

    /// `require_owned_page`: guarantees a page belonging to the target,
    /// performing COW and dirty transitions as needed. Returns the frame
    /// and whether it is writable in place without further action.
    pub fn require_owned_page(
        &mut self,
        will_write: bool,
        compressor: Option<&dyn Compressor>,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<(PageFrame, bool)> {
        let offset = self.offset;
        let result = self.resolve(offset, will_write, compressor, request, debug_info)?;
        self.advance();
        Ok(result)
    }

    fn resolve(
        &self,
        offset: u64,
        will_write: bool,
        compressor: Option<&dyn Compressor>,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<(PageFrame, bool)> {
        match self.find_owner(offset) {
            Owner::Target => self.resolve_in_target(offset, will_write, request, debug_info),
            Owner::NonHiddenAncestor(ancestor, ancestor_offset) => {
                self.copy_from_non_hidden_ancestor(offset, &ancestor, ancestor_offset)
            }
            Owner::HiddenAncestor(ancestor, ancestor_offset) => {
                let frame = cow_fork_page(&self.target, &ancestor, ancestor_offset, compressor)?;
                Ok((frame, !self.target.is_pager_preserving()))
            }
            Owner::NotFound => self.resolve_absent(offset, will_write, compressor, request, debug_info),
        }
    }

    fn resolve_in_target(
        &self,
        offset: u64,
        will_write: bool,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<(PageFrame, bool)> {
        let preserving = self.target.is_pager_preserving();
        let slot_info = self.target.with_page_list_mut(|list| match list.lookup_mut(offset) {
            Some(Slot::Page(p)) => {
                if p.frame.is_loaned() && will_write {
                    p.frame.set_loaned(false);
                }
                Some((p.frame.clone(), p.dirty))
            }
            _ => None,
        });
        let Some((frame, mut dirty)) = slot_info else {
            return Err(Errno::NotFound.into());
        };
        if will_write && preserving && dirty != DirtyState::Dirty {
            if let Some(source) = self.target.page_source() {
                if source.should_trap_dirty_transitions() && !request.is_completed() {
                    source.request_dirty_transition(request, offset, PAGE_SIZE as u64, debug_info)?;
                    return_errno!(Errno::ShouldWait);
                }
            }
            self.target.with_page_list_mut(|list| {
                if let Some(Slot::Page(p)) = list.lookup_mut(offset) {
                    p.dirty = DirtyState::Dirty;
                }
            });
            dirty = DirtyState::Dirty;
        }
        Ok((frame, !preserving || !will_write || dirty == DirtyState::Dirty))
    }

    fn copy_from_non_hidden_ancestor(
        &self,
        offset: u64,
        ancestor: &Arc<CowObject>,
        ancestor_offset: u64,
    ) -> Result<(PageFrame, bool)> {
        let source_frame = ancestor
            .with_page_list(|list| match list.lookup(ancestor_offset) {
                Some(Slot::Page(p)) => Some(p.frame.clone()),
                _ => None,
            })
            .ok_or(Errno::NotFound)?;
        let new_frame = PageFrame::alloc_zeroed()?;
        new_frame.copy_from(&source_frame);
        self.target.with_page_list_mut(|list| {
            list.insert(offset, Slot::Page(PageSlot::new_untracked(new_frame.clone())));
        });
        Ok((new_frame, true))
    }

    fn resolve_absent(
        &self,
        offset: u64,
        will_write: bool,
        compressor: Option<&dyn Compressor>,
        request: &PageRequest,
        debug_info: DebugInfo,
    ) -> Result<(PageFrame, bool)> {
        // Check for a compressed reference that needs decompressing first.
        let reference = self
            .target
            .with_page_list(|list| match list.lookup(offset) {
                Some(Slot::Reference(r)) => Some(r.reference.clone()),
                _ => None,
            });
        if let Some(reference) = reference {
            let Some(compressor) = compressor else {
                return_errno_with_message!(Errno::NotSupported, "reference present but no compressor supplied");
            };
            let frame = compressor.decompress(&reference);
            self.target.with_page_list_mut(|list| {
                list.insert(offset, Slot::Page(PageSlot::new_untracked(frame.clone())));
            });
            return self.resolve_in_target(offset, will_write, request, debug_info);
        }

        let preserving = self.target.is_pager_preserving();
        if let Some(source) = self.target.page_source() {
            if preserving {
                source.get_pages(offset, PAGE_SIZE as u64, request, debug_info)?;
                return_errno!(Errno::ShouldWait);
            }
        }

        // Zero content: allocate a fresh zero page.
        let frame = PageFrame::alloc_zeroed()?;
        let dirty = if will_write && preserving {
            if let Some(source) = self.target.page_source() {
                if source.should_trap_dirty_transitions() && !request.is_completed() {
                    source.request_dirty_transition(request, offset, PAGE_SIZE as u64, debug_info)?;
                    return_errno!(Errno::ShouldWait);
                }
            }
            DirtyState::Dirty
        } else if preserving {
            DirtyState::Clean
        } else {
            DirtyState::Untracked
        };
        self.target.with_page_list_mut(|list| {
            match list.lookup_or_allocate(offset, IntervalPolicy::SplitInterval) {
                AllocatedSlot::Slot(slot) => {
                    *slot = Slot::Page(PageSlot {
                        frame: frame.clone(),
                        split: crate::slot::SplitBits::none(),
                        dirty,
                    });
                }
                AllocatedSlot::InInterval => unreachable!("SplitInterval policy always yields a slot"),
            }
        });
        Ok((frame, !preserving || !will_write || dirty == DirtyState::Dirty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clone_ops::{create_clone, CloneKind};
    use crate::object::CowObjectBuilder;
    use crate::source::{ImmediateSource, PageSource};

    fn debug_info() -> DebugInfo {
        DebugInfo { name: "test", koid: 0 }
    }

    #[test]
    fn resolves_zero_fill_for_absent_anonymous_offset() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        let mut cursor = LookupCursor::new(&root, 0, 4096).unwrap();
        let request = PageRequest::new(0, 4096);
        let (frame, writable) = cursor
            .require_owned_page(true, None, &request, debug_info())
            .unwrap();
        assert!(writable);
        assert!(frame.is_all_zero());
    }

    #[test]
    fn require_owned_page_copies_from_non_hidden_ancestor() {
        let root = CowObjectBuilder::new(4096).build_root().unwrap();
        root.with_page_list_mut(|list| {
            let frame = PageFrame::alloc_zeroed().unwrap();
            frame.write_bytes(0, &[9]);
            list.insert(0, Slot::Page(PageSlot::new_untracked(frame)));
        });
        let slice = CowObjectBuilder::new(4096).build_slice(&root, 0, 4096).unwrap();
        let mut cursor = LookupCursor::new(&slice, 0, 4096).unwrap();
        let request = PageRequest::new(0, 4096);
        let (frame, _) = cursor
            .require_owned_page(false, None, &request, debug_info())
            .unwrap();
        let mut buf = [0u8; 1];
        frame.read_bytes(0, &mut buf);
        assert_eq!(buf, [9]);
    }

    #[test]
    fn dirty_trap_returns_should_wait_then_succeeds() {
        let source = Arc::new(ImmediateSource::new(true));
        let root = CowObjectBuilder::new(4096)
            .with_source(source.clone())
            .build_root()
            .unwrap();
        root.with_page_list_mut(|list| {
            list.insert(
                0,
                Slot::Page(PageSlot {
                    frame: PageFrame::alloc_zeroed().unwrap(),
                    split: crate::slot::SplitBits::none(),
                    dirty: DirtyState::Clean,
                }),
            );
        });
        let mut cursor = LookupCursor::new(&root, 0, 4096).unwrap();
        let request = PageRequest::new(0, 4096);
        let first = cursor.require_owned_page(true, None, &request, debug_info());
        assert!(matches!(first, Err(e) if e.errno() == Errno::ShouldWait));
        assert!(request.is_pending());

        // Simulate the pager acknowledging the dirty transition, then retry
        // with a fresh cursor but the same (now-completed) request.
        source.on_pages_dirtied(0, 4096);
        request.complete();

        let mut cursor2 = LookupCursor::new(&root, 0, 4096).unwrap();
        let (_, writable) = cursor2
            .require_owned_page(true, None, &request, debug_info())
            .unwrap();
        assert!(writable);
    }

    #[test]
    fn if_exist_pages_stops_at_the_first_absent_offset() {
        let root = CowObjectBuilder::new(3 * 4096).build_root().unwrap();
        root.with_page_list_mut(|list| {
            list.insert(0, Slot::Page(PageSlot::new_untracked(PageFrame::alloc_zeroed().unwrap())));
            list.insert(4096, Slot::Page(PageSlot::new_untracked(PageFrame::alloc_zeroed().unwrap())));
            // Offset 2 * 4096 is left absent.
        });
        let mut cursor = LookupCursor::new(&root, 0, 3 * 4096).unwrap();
        let mut out = SmallVec::new();
        let count = cursor.if_exist_pages(false, 3, &mut out);
        assert_eq!(count, 2);
        assert_eq!(out.len(), 2);
    }
}
