// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// POSIX implementation of the shared memory mapping and the lock-word
// wait/wake primitive. On Linux the lock words are futexes; elsewhere
// waiting falls back to adaptive-backoff polling on the word.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::AtomicI32;
use std::time::Duration;

use crate::shm_name;

// ---------------------------------------------------------------------------
// PlatformShm — POSIX shared memory
// ---------------------------------------------------------------------------

pub struct PlatformShm {
    mem: *mut u8,
    size: usize,
    name: String, // POSIX name (with leading '/')
}

// Safety: the shared memory region is process-shared by design.
unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

impl PlatformShm {
    /// Acquire a named shared memory region of exactly `size` bytes.
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let posix_name = shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let perms: libc::mode_t = 0o666;

        // For CreateOrOpen: try exclusive create first so ftruncate only runs
        // when we actually own the new object. On macOS, calling ftruncate on
        // an already-sized shm object can zero its contents before returning
        // EINVAL.
        let (fd, need_truncate) = match mode {
            ShmMode::Create => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, true)
            }
            ShmMode::Open => {
                let f =
                    unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint) };
                if f == -1 {
                    return Err(io::Error::last_os_error());
                }
                (f, false)
            }
            ShmMode::CreateOrOpen => {
                let f = unsafe {
                    libc::shm_open(
                        c_name.as_ptr(),
                        libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                        perms as libc::c_uint,
                    )
                };
                if f != -1 {
                    (f, true)
                } else {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() != Some(libc::EEXIST) {
                        return Err(e);
                    }
                    let f2 = unsafe {
                        libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
                    };
                    if f2 == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    (f2, false)
                }
            }
        };

        unsafe { libc::fchmod(fd, perms) };

        if need_truncate {
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(err);
            }
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };

        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            mem: mem as *mut u8,
            size,
            name: posix_name,
        })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.mem
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Force-remove the backing object (shm_unlink). Does NOT drop the mapping.
    pub fn unlink(&self) {
        if let Ok(c_name) = CString::new(self.name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }

    pub fn unlink_by_name(name: &str) {
        let posix_name = shm_name::make_shm_name(name);
        if let Ok(c_name) = CString::new(posix_name.as_bytes()) {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        }
    }
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.size) };
    }
}

// ---------------------------------------------------------------------------
// Lock-word wait/wake
// ---------------------------------------------------------------------------

/// Per-region waiter state. The lock words themselves are the wait objects
/// on POSIX, so no side table is needed.
pub struct LockWaiters;

impl LockWaiters {
    pub fn new(_region_name: &str) -> Self {
        Self
    }

    /// Sleep until `word` is observed with a value other than `busy`, or
    /// until `timeout` elapses. May wake spuriously; the caller re-checks.
    pub fn wait(&self, _index: usize, word: &AtomicI32, busy: i32, timeout: Option<Duration>) {
        wait_on_word(word, busy, timeout);
    }

    /// Wake one waiter sleeping on `word`.
    pub fn wake(&self, _index: usize, word: &AtomicI32) {
        wake_word(word, 1);
    }
}

#[cfg(target_os = "linux")]
fn wait_on_word(word: &AtomicI32, busy: i32, timeout: Option<Duration>) {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            busy,
            ts.as_ref()
                .map_or(ptr::null(), |t| t as *const libc::timespec),
            ptr::null::<libc::c_int>(),
            0,
        );
    }
}

#[cfg(target_os = "linux")]
fn wake_word(word: &AtomicI32, count: i32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<libc::c_int>(),
            0,
        );
    }
}

// No cross-process futex outside Linux; poll the word with adaptive backoff.
#[cfg(not(target_os = "linux"))]
fn wait_on_word(word: &AtomicI32, busy: i32, timeout: Option<Duration>) {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    let deadline = timeout.map(|d| Instant::now() + d);
    let mut k = 0u32;
    while word.load(Ordering::Relaxed) == busy {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return;
            }
        }
        adaptive_yield(&mut k);
    }
}

#[cfg(not(target_os = "linux"))]
fn wake_word(_word: &AtomicI32, _count: i32) {
    // Pollers observe the store directly.
}

/// Adaptive backoff:
/// - k < 4:  busy spin
/// - k < 16: CPU pause hint
/// - k < 32: thread yield
/// - k >= 32: sleep 1ms
#[cfg(not(target_os = "linux"))]
#[inline]
fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_millis(1));
        return;
    }
    *k += 1;
}
