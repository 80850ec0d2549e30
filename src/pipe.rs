// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Synchronous export pipe: a filesystem FIFO on POSIX, a named pipe on
// Windows. The client opens the read side before posting its export work
// item; the server opens the write side, emits one frame, and closes.

use std::io;
use std::time::{Duration, Instant};

/// Retry period while the peer end of the pipe is not connected yet.
const PIPE_RETRY_PERIOD: Duration = Duration::from_millis(100);

pub struct ExportPipe {
    inner: imp::Pipe,
    /// Readers own the filesystem entry and remove it on drop.
    read_side: bool,
}

impl ExportPipe {
    /// Create the pipe at `path` and open its read side, non-blocking.
    pub fn reader(path: &str) -> io::Result<Self> {
        Ok(Self {
            inner: imp::open_reader(path)?,
            read_side: true,
        })
    }

    /// Open the write side of an existing pipe.
    pub fn writer(path: &str) -> io::Result<Self> {
        Ok(Self {
            inner: imp::open_writer(path)?,
            read_side: false,
        })
    }

    /// Read exactly `buf.len()` bytes within `timeout_ms` milliseconds.
    /// Returns whether the buffer was filled; a short read leaves the
    /// prefix in place.
    pub fn read_exact_timeout(&self, buf: &mut [u8], timeout_ms: u32) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut total = 0usize;
        while total < buf.len() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            let remaining = if remaining.is_zero() {
                break;
            } else {
                remaining.min(PIPE_RETRY_PERIOD)
            };
            match imp::read_some(&self.inner, &mut buf[total..], remaining) {
                ReadStep::Data(n) => total += n,
                ReadStep::NotReady => {}
                // EOF before the frame completed: the writer is gone.
                ReadStep::Closed if total > 0 => break,
                // No writer has connected yet; keep waiting.
                ReadStep::Closed => std::thread::sleep(PIPE_RETRY_PERIOD.min(remaining)),
                ReadStep::Failed => break,
            }
        }
        total == buf.len()
    }

    /// Write the whole buffer. The read side may disappear underneath us
    /// (a client that timed out); the caller drops the payload in that case.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        imp::write_all(&self.inner, data)
    }
}

impl Drop for ExportPipe {
    fn drop(&mut self) {
        imp::close(&mut self.inner, self.read_side);
    }
}

enum ReadStep {
    Data(usize),
    NotReady,
    Closed,
    Failed,
}

// ---------------------------------------------------------------------------
// POSIX: FIFO
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod imp {
    use super::ReadStep;
    use std::ffi::CString;
    use std::io;
    use std::time::Duration;

    pub struct Pipe {
        pub fd: i32,
        pub path: CString,
    }

    fn c_path(path: &str) -> io::Result<CString> {
        CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    pub fn open_reader(path: &str) -> io::Result<Pipe> {
        let c = c_path(path)?;
        unsafe { libc::mkfifo(c.as_ptr(), 0o660) };
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe { fd, path: c })
    }

    pub fn open_writer(path: &str) -> io::Result<Pipe> {
        let c = c_path(path)?;
        // O_NONBLOCK so a vanished reader yields ENXIO instead of blocking
        // the server loop forever.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe { fd, path: c })
    }

    pub fn read_some(pipe: &Pipe, buf: &mut [u8], wait: Duration) -> ReadStep {
        let mut pfd = libc::pollfd {
            fd: pipe.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&mut pfd, 1, wait.as_millis() as i32) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return ReadStep::NotReady;
            }
            return ReadStep::Failed;
        }
        if ready == 0 {
            return ReadStep::NotReady;
        }

        let r = unsafe { libc::read(pipe.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        match r {
            0 => ReadStep::Closed,
            n if n > 0 => ReadStep::Data(n as usize),
            _ => {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => ReadStep::NotReady,
                    _ => ReadStep::Failed,
                }
            }
        }
    }

    pub fn write_all(pipe: &Pipe, data: &[u8]) -> io::Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let w = unsafe {
                libc::write(
                    pipe.fd,
                    data[written..].as_ptr() as *const libc::c_void,
                    data.len() - written,
                )
            };
            if w >= 0 {
                written += w as usize;
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => {
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
                _ => return Err(err),
            }
        }
        Ok(())
    }

    pub fn close(pipe: &mut Pipe, read_side: bool) {
        unsafe { libc::close(pipe.fd) };
        if read_side {
            unsafe { libc::unlink(pipe.path.as_ptr()) };
        }
        pipe.fd = -1;
    }
}

// ---------------------------------------------------------------------------
// Windows: named pipe
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use super::ReadStep;
    use std::ffi::CString;
    use std::io;
    use std::ptr;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::{
        CloseHandle, GetLastError, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileA, ReadFile, WriteFile, OPEN_EXISTING, PIPE_ACCESS_INBOUND,
    };
    use windows_sys::Win32::System::Pipes::{
        CreateNamedPipeA, DisconnectNamedPipe, PIPE_NOWAIT, PIPE_TYPE_BYTE,
    };

    const ERROR_NO_DATA: u32 = 232;
    const ERROR_PIPE_NOT_CONNECTED: u32 = 233;
    const ERROR_PIPE_LISTENING: u32 = 536;

    pub struct Pipe {
        pub handle: HANDLE,
    }

    pub fn open_reader(path: &str) -> io::Result<Pipe> {
        let c = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let handle = unsafe {
            CreateNamedPipeA(
                c.as_ptr() as *const u8,
                PIPE_ACCESS_INBOUND,
                PIPE_TYPE_BYTE | PIPE_NOWAIT,
                1,
                0,
                1024 * 1024,
                0,
                ptr::null(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe { handle })
    }

    pub fn open_writer(path: &str) -> io::Result<Pipe> {
        let c = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let handle = unsafe {
            CreateFileA(
                c.as_ptr() as *const u8,
                GENERIC_WRITE,
                0,
                ptr::null(),
                OPEN_EXISTING,
                0,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Pipe { handle })
    }

    pub fn read_some(pipe: &Pipe, buf: &mut [u8], wait: Duration) -> ReadStep {
        let mut read = 0i32;
        let ok = unsafe {
            ReadFile(
                pipe.handle,
                buf.as_mut_ptr(),
                buf.len() as u32,
                &mut read as *mut i32 as *mut u32,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let error = unsafe { GetLastError() };
            return match error {
                ERROR_NO_DATA | ERROR_PIPE_LISTENING | ERROR_PIPE_NOT_CONNECTED => {
                    std::thread::sleep(wait);
                    ReadStep::NotReady
                }
                _ => ReadStep::Failed,
            };
        }
        if read == 0 {
            std::thread::sleep(wait);
            return ReadStep::NotReady;
        }
        ReadStep::Data(read as usize)
    }

    pub fn write_all(pipe: &Pipe, data: &[u8]) -> io::Result<()> {
        let mut written = 0usize;
        while written < data.len() {
            let mut w = 0u32;
            let ok = unsafe {
                WriteFile(
                    pipe.handle,
                    data[written..].as_ptr(),
                    (data.len() - written) as u32,
                    &mut w,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }
            written += w as usize;
        }
        Ok(())
    }

    pub fn close(pipe: &mut Pipe, read_side: bool) {
        unsafe {
            if read_side {
                DisconnectNamedPipe(pipe.handle);
            }
            CloseHandle(pipe.handle);
        }
        pipe.handle = INVALID_HANDLE_VALUE;
    }
}
