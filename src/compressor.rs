// SPDX-License-Identifier: MPL-2.0

//! The compressor external interface (§6) and its reference handle.
//!
//! Codec selection and the compression work queue are out of scope; what
//! the core needs is the lifecycle of a reference: `start` hands a page to
//! the compressor and gets a temporary handle back, `compress` does the
//! (blocking, lock-free) work, and the result is either installed as a
//! real `Reference` slot or the original page is restored.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::page::PageFrame;

struct CompressedRefInner {
    data: Vec<u8>,
    /// Set while the reference is a temporary handle owned by the
    /// initiating cow-object between `start` and `finalize`.
    is_temp: AtomicBool,
}

/// A handle to compressed content, or to a page mid-compression.
#[derive(Clone)]
pub struct CompressedRef(Arc<CompressedRefInner>);

impl std::fmt::Debug for CompressedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedRef")
            .field("ptr", &Arc::as_ptr(&self.0))
            .field("is_temp", &self.is_temporary())
            .finish()
    }
}

impl CompressedRef {
    pub fn is_same_reference(&self, other: &CompressedRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn is_temporary(&self) -> bool {
        self.0.is_temp.load(Ordering::Acquire)
    }

    pub fn data(&self) -> &[u8] {
        &self.0.data
    }
}

/// Outcome of [`Compressor::compress`].
pub enum CompressResult {
    /// The page was entirely zero; no reference is needed at all.
    Zero,
    /// Compression did not shrink the page (or otherwise failed); the
    /// original page should be restored to the "compression failed" state.
    Fail,
    /// Compression succeeded; install this reference in the page-list.
    Reference(CompressedRef),
}

/// The compressor external interface (§6).
///
/// Implementations hold their own independent lock (§5); the core never
/// holds a cow-object lock while `compress` runs.
pub trait Compressor: Send + Sync {
    /// Takes ownership of `page`, returning a temporary reference handle.
    fn start(&self, page: &PageFrame) -> CompressedRef;

    /// Runs the (possibly slow) compression work. Must be called without
    /// holding any cow-object lock.
    fn compress(&self, temp_reference: &CompressedRef) -> CompressResult;

    /// If `reference` is still a temporary handle, hands the original page
    /// back and consumes the handle; otherwise returns `None`.
    fn move_reference(&self, reference: &CompressedRef) -> Option<PageFrame>;

    fn is_temp_reference(&self, reference: &CompressedRef) -> bool {
        reference.is_temporary()
    }

    /// Decompresses `reference` back into a fresh, owned page.
    fn decompress(&self, reference: &CompressedRef) -> PageFrame;

    fn free(&self, reference: &CompressedRef);

    fn return_temp_reference(&self, reference: &CompressedRef);

    fn finalize(&self, reference: &CompressedRef);
}

/// A simple run-length-style compressor used by tests and as a default.
///
/// Grounded in the same role the teacher leaves to an external codec: this
/// implementation never fails (unless the content doesn't compress), does
/// its work under no lock at all, and treats "became all zero" and
/// "shrank" as the only two success paths, matching §4.10's contract.
pub struct TestCompressor;

impl Compressor for TestCompressor {
    fn start(&self, page: &PageFrame) -> CompressedRef {
        let mut buf = vec![0u8; crate::constants::PAGE_SIZE];
        page.read_bytes(0, &mut buf);
        let data = buf;
        CompressedRef(Arc::new(CompressedRefInner {
            data,
            is_temp: AtomicBool::new(true),
        }))
    }

    fn compress(&self, temp_reference: &CompressedRef) -> CompressResult {
        if temp_reference.data().iter().all(|b| *b == 0) {
            return CompressResult::Zero;
        }
        let compressed = rle_encode(temp_reference.data());
        if compressed.len() >= temp_reference.data().len() {
            return CompressResult::Fail;
        }
        temp_reference.0.is_temp.store(false, Ordering::Release);
        CompressResult::Reference(CompressedRef(Arc::new(CompressedRefInner {
            data: compressed,
            is_temp: AtomicBool::new(false),
        })))
    }

    fn move_reference(&self, reference: &CompressedRef) -> Option<PageFrame> {
        if !reference.is_temporary() {
            return None;
        }
        let frame = PageFrame::alloc_zeroed().ok()?;
        frame.write_bytes(0, reference.data());
        Some(frame)
    }

    fn decompress(&self, reference: &CompressedRef) -> PageFrame {
        let frame = PageFrame::alloc_zeroed().expect("decompress allocation cannot fail in tests");
        let bytes = rle_decode(reference.data(), crate::constants::PAGE_SIZE);
        frame.write_bytes(0, &bytes);
        frame
    }

    fn free(&self, _reference: &CompressedRef) {}

    fn return_temp_reference(&self, reference: &CompressedRef) {
        reference.0.is_temp.store(true, Ordering::Release);
    }

    fn finalize(&self, reference: &CompressedRef) {
        reference.0.is_temp.store(false, Ordering::Release);
    }
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = data.iter().peekable();
    while let Some(&byte) = iter.next() {
        let mut run = 1u8;
        while run < u8::MAX {
            match iter.peek() {
                Some(&&next) if next == byte => {
                    iter.next();
                    run += 1;
                }
                _ => break,
            }
        }
        out.push(run);
        out.push(byte);
    }
    out
}

fn rle_decode(data: &[u8], expected_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(expected_len);
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        out.extend(std::iter::repeat(chunk[1]).take(chunk[0] as usize));
    }
    out.resize(expected_len, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compresses_repetitive_page() {
        let frame = PageFrame::alloc_zeroed().unwrap();
        frame.write_bytes(0, &[7u8; 64]);
        let compressor = TestCompressor;
        let temp = compressor.start(&frame);
        match compressor.compress(&temp) {
            CompressResult::Reference(r) => {
                let restored = compressor.decompress(&r);
                let mut buf = [0u8; 64];
                restored.read_bytes(0, &mut buf);
                assert_eq!(buf, [7u8; 64]);
            }
            _ => panic!("expected a reference"),
        }
    }

    #[test]
    fn all_zero_page_reports_zero() {
        let frame = PageFrame::alloc_zeroed().unwrap();
        let compressor = TestCompressor;
        let temp = compressor.start(&frame);
        assert!(matches!(compressor.compress(&temp), CompressResult::Zero));
    }
}
