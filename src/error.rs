// SPDX-License-Identifier: MPL-2.0

//! Error taxonomy for the cow-object engine.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// The error categories a cow-object operation can fail with.
///
/// These are deliberately not a POSIX `errno` mirror: the engine has no
/// notion of file descriptors, signals, or processes, so its error space
/// is the eight categories a VM fault path can actually hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// Misaligned offset/length, contradictory flags.
    InvalidArguments,
    /// Range extends beyond the object's size.
    OutOfRange,
    /// Page or metadata allocation failed without retry.
    OutOfMemory,
    /// An asynchronous request was issued; the caller must wait and retry.
    ShouldWait,
    /// Pinned page where none is allowed, detached source, wrong life-cycle
    /// phase, or a dedup attempt on a high-priority object.
    BadState,
    /// Attempt to overwrite forbidden content.
    AlreadyExists,
    /// Reclamation race: the page is no longer where it was expected.
    NotFound,
    /// Operation is not permitted on this cow-object variant.
    NotSupported,
}

/// A [`Errno`] plus an optional static message, as returned by every
/// fallible operation in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn errno(&self) -> Errno {
        self.errno
    }

    pub const fn message(&self) -> Option<&'static str> {
        self.msg
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = core::result::Result<T, Error>;

#[macro_export]
macro_rules! return_errno {
    ($errno:expr) => {
        return Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno:expr, $message:expr) => {
        return Err($crate::error::Error::with_message($errno, $message))
    };
}

/// Process-wide count of externally-visible allocation failures.
///
/// Incremented by [`report_alloc_failure`]; read by tests and, in a real
/// kernel, by whatever triggers an asynchronous out-of-memory response.
static ALLOC_FAILURE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Records an externally-visible allocation failure.
///
/// Never blocks. May in principle kick off an asynchronous low-memory
/// response; that response is out of scope here, so this just logs and
/// counts.
pub fn report_alloc_failure(context: &str) {
    ALLOC_FAILURE_COUNT.fetch_add(1, Ordering::Relaxed);
    log::error!("allocation failure: {context}");
}

/// Returns the number of allocation failures reported so far.
pub fn alloc_failure_count() -> u64 {
    ALLOC_FAILURE_COUNT.load(Ordering::Relaxed)
}
