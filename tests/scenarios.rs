// SPDX-License-Identifier: MPL-2.0

//! End-to-end scenarios exercising the public surface together: clone,
//! fault resolution, dirty tracking, resize, reclamation, and slices.

use std::sync::Arc;

use cow_pages::bulk::{resize, supply_pages, zero_pages};
use cow_pages::clone_ops::{create_clone, CloneKind};
use cow_pages::compressor::TestCompressor;
use cow_pages::cursor::LookupCursor;
use cow_pages::dirty::for_every_dirty_in_range;
use cow_pages::error::Errno;
use cow_pages::fork::dedup_zero_page;
use cow_pages::object::CowObjectBuilder;
use cow_pages::page::PageFrame;
use cow_pages::page_list::SpliceList;
use cow_pages::reclaim::{reclaim_page, BatchedPageQueueRemove, ReclaimHint, ReclaimOutcome};
use cow_pages::slot::{DirtyState, PageSlot, Slot};
use cow_pages::source::{DebugInfo, ImmediateSource, PageRequest, PageSource};

const PAGE: u64 = 4096;

fn debug_info() -> DebugInfo {
    DebugInfo { name: "scenario", koid: 0 }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn page_with_byte(byte: u8) -> PageFrame {
    let frame = PageFrame::alloc_zeroed().unwrap();
    frame.write_bytes(0, &[byte]);
    frame
}

fn first_byte(frame: &PageFrame) -> u8 {
    let mut buf = [0u8; 1];
    frame.read_bytes(0, &mut buf);
    buf[0]
}

fn read_first_byte(target: &Arc<cow_pages::object::CowObject>, offset: u64) -> u8 {
    let mut cursor = LookupCursor::new(target, offset, PAGE).unwrap();
    let request = PageRequest::new(offset, PAGE);
    let (frame, _) = cursor
        .require_owned_page(false, None, &request, debug_info())
        .unwrap();
    first_byte(&frame)
}

/// Scenario A: a bidirectional snapshot freezes the parent's content while
/// letting the new clone diverge independently.
#[test]
fn scenario_a_snapshot_preserves_content() {
    init_logging();
    let root = CowObjectBuilder::new(3 * PAGE).build_root().unwrap();
    let mut splice = SpliceList::new(vec![
        (0, Slot::Page(PageSlot::new_untracked(page_with_byte(1)))),
        (PAGE, Slot::Page(PageSlot::new_untracked(page_with_byte(2)))),
        (2 * PAGE, Slot::Page(PageSlot::new_untracked(page_with_byte(3)))),
    ]);
    supply_pages(&root, 0..3 * PAGE, &mut splice).unwrap();

    let clone = create_clone(&root, CloneKind::Snapshot, 0, 3 * PAGE).unwrap();
    assert!(root.is_hidden());
    let original = root
        .children_snapshot()
        .into_iter()
        .find(|c| !Arc::ptr_eq(c, &clone))
        .unwrap();

    // Write to the clone at offset PAGE; this must not disturb the
    // original's view of the same offset.
    let mut cursor = LookupCursor::new(&clone, PAGE, PAGE).unwrap();
    let request = PageRequest::new(PAGE, PAGE);
    let (frame, writable) = cursor
        .require_owned_page(true, None, &request, debug_info())
        .unwrap();
    assert!(writable);
    frame.write_bytes(0, &[0x5A]);

    assert_eq!(read_first_byte(&original, PAGE), 2);
    assert_eq!(read_first_byte(&clone, PAGE), 0x5A);
    // Offset 0 was never written on either side, so both still see the
    // original content, shared via the hidden parent.
    assert_eq!(read_first_byte(&original, 0), 1);
    assert_eq!(read_first_byte(&clone, 0), 1);
}

/// Scenario B: an all-zero committed page dedups to a marker.
#[test]
fn scenario_b_zero_page_dedup() {
    init_logging();
    let root = CowObjectBuilder::new(2 * PAGE).build_root().unwrap();
    let frame = PageFrame::alloc_zeroed().unwrap();
    let mut splice = SpliceList::new(vec![(0, Slot::Page(PageSlot::new_untracked(frame.clone())))]);
    supply_pages(&root, 0..PAGE, &mut splice).unwrap();

    let deduped = dedup_zero_page(&root, &frame, 0).unwrap();
    assert!(deduped);
    assert!(root.is_marker_at(0));
    assert_eq!(root.count_pages(), 0);
}

/// Scenario C: a write fault on a pager-preserving object must round-trip
/// through a dirty-transition request before becoming writable.
#[test]
fn scenario_c_dirty_transition_gated_by_trap() {
    init_logging();
    let source = Arc::new(ImmediateSource::new(true));
    let root = CowObjectBuilder::new(PAGE)
        .with_source(source.clone())
        .build_root()
        .unwrap();
    let mut splice = SpliceList::new(vec![(
        0,
        Slot::Page(PageSlot {
            frame: page_with_byte(0xAA),
            split: cow_pages::slot::SplitBits::none(),
            dirty: DirtyState::Clean,
        }),
    )]);
    supply_pages(&root, 0..PAGE, &mut splice).unwrap();

    let request = PageRequest::new(0, PAGE);
    let mut cursor = LookupCursor::new(&root, 0, PAGE).unwrap();
    let first = cursor.require_owned_page(true, None, &request, debug_info());
    assert!(matches!(first, Err(e) if e.errno() == Errno::ShouldWait));

    source.on_pages_dirtied(0, PAGE);
    request.complete();

    let mut retry = LookupCursor::new(&root, 0, PAGE).unwrap();
    let (frame, writable) = retry
        .require_owned_page(true, None, &request, debug_info())
        .unwrap();
    assert!(writable);
    assert_eq!(first_byte(&frame), 0xAA);
}

/// Scenario D: shrinking a preserving object's dirty zero interval clips it
/// rather than leaving dangling tail content, and dirty tracking over the
/// surviving range is preserved.
#[test]
fn scenario_d_resize_clips_intervals() {
    init_logging();
    let source = Arc::new(ImmediateSource::new(false));
    let root = CowObjectBuilder::new(0).with_source(source).build_root().unwrap();
    resize(&root, 4 * PAGE, &[]).unwrap();

    // A request touching only the surviving range, and one touching only
    // the dropped tail; the shrink must spuriously complete the latter and
    // leave the former untouched.
    let surviving_request = PageRequest::new(0, PAGE);
    let tail_request = PageRequest::new(3 * PAGE, PAGE);

    resize(&root, 3 * PAGE, &[&surviving_request, &tail_request]).unwrap();
    assert_eq!(root.size(), 3 * PAGE);
    assert!(tail_request.is_completed());
    assert!(surviving_request.is_pending());

    let mut touched = Vec::new();
    for_every_dirty_in_range(&root, 0..3 * PAGE, |off, state| touched.push((off, state)));
    assert_eq!(touched, vec![(0, DirtyState::Dirty)]);
}

/// Scenario E: reclamation either compresses a page into a reference or
/// leaves it untouched, and content read back afterward is unchanged.
#[test]
fn scenario_e_compression_round_trip() {
    init_logging();
    let root = CowObjectBuilder::new(PAGE).build_root().unwrap();
    let frame = PageFrame::alloc_zeroed().unwrap();
    frame.write_bytes(0, &[9u8; 256]);
    let mut splice = SpliceList::new(vec![(0, Slot::Page(PageSlot::new_untracked(frame)))]);
    supply_pages(&root, 0..PAGE, &mut splice).unwrap();

    let compressor = TestCompressor;
    let mut freed = BatchedPageQueueRemove::new();
    let outcome = reclaim_page(&root, 0, ReclaimHint::Follow, &mut freed, Some(&compressor)).unwrap();
    assert!(matches!(outcome, ReclaimOutcome::Compressed | ReclaimOutcome::Skipped));

    let mut cursor = LookupCursor::new(&root, 0, PAGE).unwrap();
    let request = PageRequest::new(0, PAGE);
    let frame = cursor
        .require_read_page(Some(&compressor), &request, debug_info())
        .unwrap();
    let mut buf = [0u8; 256];
    frame.read_bytes(0, &mut buf);
    assert_eq!(buf, [9u8; 256]);
}

/// Scenario F: zeroing through a slice is equivalent to zeroing the
/// corresponding range of the root directly.
#[test]
fn scenario_f_slice_forwarding() {
    init_logging();
    let root = CowObjectBuilder::new(2 * PAGE).build_root().unwrap();
    let mut splice = SpliceList::new(vec![
        (0, Slot::Page(PageSlot::new_untracked(page_with_byte(1)))),
        (PAGE, Slot::Page(PageSlot::new_untracked(page_with_byte(2)))),
    ]);
    supply_pages(&root, 0..2 * PAGE, &mut splice).unwrap();
    let slice = CowObjectBuilder::new(PAGE).build_slice(&root, PAGE, PAGE).unwrap();

    zero_pages(&slice, 0..PAGE, &PageRequest::new(0, PAGE)).unwrap();

    assert_eq!(read_first_byte(&root, 0), 1);
    let mut slice_cursor = LookupCursor::new(&slice, 0, PAGE).unwrap();
    let (frame, _) = slice_cursor
        .require_owned_page(false, None, &PageRequest::new(0, PAGE), debug_info())
        .unwrap();
    assert!(frame.is_all_zero());
}
