// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Windows implementation of the shared memory mapping and the lock-word
// wait/wake primitive. The lock words in the region are not usable for
// kernel waits here, so each lock index is backed by a lazily-created
// named semaphore; the word still mirrors held/free state so `peek`
// never leaves userspace.

use std::io;
use std::ptr;
use std::sync::atomic::AtomicI32;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_ALREADY_EXISTS, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    PAGE_READWRITE, SEC_COMMIT,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, ReleaseSemaphore, WaitForSingleObject, INFINITE,
};

/// Encode a name as a null-terminated wide string for Win32 APIs.
fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

// ---------------------------------------------------------------------------
// PlatformShm — Windows shared memory via file mapping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmMode {
    Create,
    Open,
    CreateOrOpen,
}

pub struct PlatformShm {
    handle: HANDLE,
    mem: *mut u8,
    size: usize,
    name: String,
}

unsafe impl Send for PlatformShm {}
unsafe impl Sync for PlatformShm {}

impl PlatformShm {
    pub fn acquire(name: &str, size: usize, mode: ShmMode) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "name is empty"));
        }
        if size == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "size is 0"));
        }

        let wide_name = to_wide(name);

        let handle = if mode == ShmMode::Open {
            let h = unsafe { OpenFileMappingW(FILE_MAP_ALL_ACCESS, 0, wide_name.as_ptr()) };
            if h.is_null() {
                return Err(io::Error::last_os_error());
            }
            h
        } else {
            let h = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    ptr::null(),
                    PAGE_READWRITE | SEC_COMMIT,
                    (size as u64 >> 32) as u32,
                    size as u32,
                    wide_name.as_ptr(),
                )
            };
            let err = unsafe { GetLastError() };
            if mode == ShmMode::Create && err == ERROR_ALREADY_EXISTS {
                if !h.is_null() {
                    unsafe { CloseHandle(h) };
                }
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "shared memory already exists",
                ));
            }
            if h.is_null() {
                return Err(io::Error::last_os_error());
            }
            h
        };

        let mem = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if mem.Value.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e);
        }

        Ok(Self {
            handle,
            mem: mem.Value as *mut u8,
            size,
            name: name.to_string(),
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

    /// Kernel file mappings disappear with their last handle; nothing to do.
    pub fn unlink(&self) {}

    pub fn unlink_by_name(_name: &str) {}
}

impl Drop for PlatformShm {
    fn drop(&mut self) {
        unsafe {
            if !self.mem.is_null() {
                UnmapViewOfFile(windows_sys::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.mem as _,
                });
            }
            if !self.handle.is_null() {
                CloseHandle(self.handle);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lock-word wait/wake — named semaphore per lock index
// ---------------------------------------------------------------------------

/// Side table of kernel semaphores, one per lock index, created lazily on
/// first wait. The semaphore name is derived from the region name so all
/// attached processes share the same kernel objects.
pub struct LockWaiters {
    region_name: String,
    handles: Mutex<Vec<HANDLE>>,
}

unsafe impl Send for LockWaiters {}
unsafe impl Sync for LockWaiters {}

impl LockWaiters {
    pub fn new(region_name: &str) -> Self {
        Self {
            region_name: region_name.to_string(),
            handles: Mutex::new(Vec::new()),
        }
    }

    fn handle_for(&self, index: usize) -> HANDLE {
        let mut handles = self.handles.lock().unwrap();
        if handles.len() <= index {
            handles.resize(index + 1, ptr::null_mut());
        }
        if handles[index].is_null() {
            let name = to_wide(&format!("{}_lock_{index}", self.region_name));
            handles[index] =
                unsafe { CreateSemaphoreW(ptr::null(), 0, i32::MAX, name.as_ptr()) };
        }
        handles[index]
    }

    /// Sleep on the semaphore for `index` until posted or `timeout` elapses.
    /// Stale posts make this return early; the caller re-checks the word.
    pub fn wait(&self, index: usize, _word: &AtomicI32, _busy: i32, timeout: Option<Duration>) {
        let h = self.handle_for(index);
        if h.is_null() {
            std::thread::sleep(Duration::from_millis(1));
            return;
        }
        let ms = match timeout {
            None => INFINITE,
            Some(d) => d.as_millis().min(u128::from(u32::MAX - 1)) as u32,
        };
        let _ = unsafe { WaitForSingleObject(h, ms) } == WAIT_OBJECT_0;
    }

    /// Post the semaphore for `index`, waking one waiter.
    pub fn wake(&self, index: usize, _word: &AtomicI32) {
        let h = self.handle_for(index);
        if !h.is_null() {
            unsafe { ReleaseSemaphore(h, 1, ptr::null_mut()) };
        }
    }
}

impl Drop for LockWaiters {
    fn drop(&mut self) {
        let handles = self.handles.lock().unwrap();
        for &h in handles.iter() {
            if !h.is_null() {
                unsafe { CloseHandle(h) };
            }
        }
    }
}
