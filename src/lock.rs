// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Cross-process locks over the 32-bit words in the region header. A word is
// 0 when free and 1 when held; contended acquires sleep on the word (futex
// on Linux, a named kernel semaphore per index on Windows) and retry until
// the deadline. The word itself always reflects held/free state so `peek`
// never enters the kernel.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::layout::{LOCK_COUNT, MAX_PARAMETER_BLOCK_SLOTS, NAMED_LOCK_COUNT};
use crate::platform::LockWaiters;

/// `try_acquire` with this timeout waits forever.
pub const INFINITE_TIMEOUT: u32 = u32::MAX;

const LOCK_HELD: i32 = 1;

/// A lock in the region's table: the four named locks, then one lock per
/// parameter-block slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockId {
    /// Guards the server's ephemeral workspace in the scratch arena.
    ScratchSpace,
    /// Guards the raw-RF prefix of the scratch arena.
    UploadRf,
    /// Held across a synchronous export round trip.
    ExportSync,
    /// Serializes producers posting compute-class work items.
    DispatchCompute,
    /// Guards one parameter block's subregions.
    ParameterBlock(u32),
}

impl LockId {
    pub const fn index(self) -> usize {
        match self {
            Self::ScratchSpace => 0,
            Self::UploadRf => 1,
            Self::ExportSync => 2,
            Self::DispatchCompute => 3,
            Self::ParameterBlock(block) => NAMED_LOCK_COUNT + block as usize,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Some(match index {
            0 => Self::ScratchSpace,
            1 => Self::UploadRf,
            2 => Self::ExportSync,
            3 => Self::DispatchCompute,
            _ if index < NAMED_LOCK_COUNT + MAX_PARAMETER_BLOCK_SLOTS => {
                Self::ParameterBlock((index - NAMED_LOCK_COUNT) as u32)
            }
            _ => return None,
        })
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScratchSpace => write!(f, "ScratchSpace"),
            Self::UploadRf => write!(f, "UploadRF"),
            Self::ExportSync => write!(f, "ExportSync"),
            Self::DispatchCompute => write!(f, "DispatchCompute"),
            Self::ParameterBlock(block) => write!(f, "ParameterBlock[{block}]"),
        }
    }
}

const _: () = assert!(LockId::DispatchCompute.index() + 1 == NAMED_LOCK_COUNT);
const _: () = assert!(LockId::ParameterBlock(0).index() == NAMED_LOCK_COUNT);
const _: () =
    assert!(LockId::ParameterBlock((MAX_PARAMETER_BLOCK_SLOTS - 1) as u32).index() == LOCK_COUNT - 1);

/// Acquire/release over a borrowed slice of lock words. The waiter side
/// table (a no-op on POSIX) lives here, one per attached region.
pub struct LockTable {
    waiters: LockWaiters,
}

impl LockTable {
    pub fn new(region_name: &str) -> Self {
        Self {
            waiters: LockWaiters::new(region_name),
        }
    }

    /// Try to take the lock within `timeout_ms` milliseconds.
    /// `0` makes a single non-blocking attempt; [`INFINITE_TIMEOUT`] waits
    /// forever. Returns whether the lock was acquired.
    pub fn try_acquire(&self, words: &[AtomicI32], id: LockId, timeout_ms: u32) -> bool {
        let index = id.index();
        let word = &words[index];

        if word
            .compare_exchange(0, LOCK_HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        if timeout_ms == 0 {
            return false;
        }

        let deadline = (timeout_ms != INFINITE_TIMEOUT)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

        loop {
            let remaining = match deadline {
                None => None,
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(r) if !r.is_zero() => Some(r),
                    _ => return false,
                },
            };
            self.waiters.wait(index, word, LOCK_HELD, remaining);
            if word
                .compare_exchange(0, LOCK_HELD, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Release the lock and wake one waiter.
    pub fn release(&self, words: &[AtomicI32], id: LockId) {
        let index = id.index();
        let word = &words[index];
        word.store(0, Ordering::Release);
        self.waiters.wake(index, word);
    }

    /// Release a lock the server uses as a completion barrier. Releasing an
    /// unheld barrier lock is expected in debug runs (the client may never
    /// have contended for it); anywhere else release-on-unheld is a bug.
    pub fn release_sync_barrier(&self, words: &[AtomicI32], id: LockId) {
        if cfg!(debug_assertions) && self.peek(words, id) == 0 {
            return;
        }
        self.release(words, id);
    }

    /// Plain load of the lock word, for diagnostics.
    pub fn peek(&self, words: &[AtomicI32], id: LockId) -> i32 {
        words[id.index()].load(Ordering::Relaxed)
    }
}
