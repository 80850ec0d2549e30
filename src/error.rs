// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the control plane. Public client entry points return
// these and additionally record a thread-local diagnostic string so callers
// layered over a C-style boolean surface can still fetch the reason.

use std::io;

use crate::lock::LockId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Region exists but was minted by a different library version.
    #[error("shared memory version mismatch: region has {found}, library expects {expected}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The region's invalid flag is set; the call was a no-op.
    #[error("shared memory region has been invalidated")]
    Invalidated,

    /// The shared memory object could not be created or mapped.
    #[error("failed to attach shared memory region: {0}")]
    AttachFailed(#[source] io::Error),

    /// A named lock could not be acquired within the timeout.
    #[error("timed out acquiring {0} lock")]
    LockTimeout(LockId),

    /// The work queue had no free slot at push time.
    #[error("work queue is full")]
    QueueFull,

    /// An argument exceeds a compile-time size limit.
    #[error("payload of {size} exceeds limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// An argument falls outside its closed set or valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The synchronous export pipe could not be opened, read short, or
    /// timed out.
    #[error("export pipe failure: {0}")]
    PipeError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

std::thread_local! {
    static LAST_ERROR: std::cell::RefCell<String> = const { std::cell::RefCell::new(String::new()) };
}

/// The diagnostic string for the most recent failed call on this thread.
pub fn last_error_string() -> String {
    LAST_ERROR.with(|e| e.borrow().clone())
}

pub(crate) fn record_error(err: &Error) {
    LAST_ERROR.with(|e| *e.borrow_mut() = err.to_string());
}

/// Record and propagate in one step.
pub(crate) fn fail<T>(err: Error) -> Result<T> {
    record_error(&err);
    Err(err)
}
