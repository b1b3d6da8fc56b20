// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event pipe: the one-shot signalling descriptor a publisher writes to and
//! a subscriber's event loop polls (§6 External Interfaces).
//!
//! On Linux this is a real `eventfd` in semaphore-less counter mode:
//! writing a single byte's worth (`1u64`) wakes the reader, and a read
//! drains the accumulated count back to zero in one shot — matching "write
//! one byte wakes, read drains one wake" even though the underlying
//! primitive is 8 bytes wide, because eventfd collapses repeated writes
//! into one pending wake rather than queuing them, which is exactly the
//! "one-shot" semantics the interface promises.

use crate::error::Error;
use std::os::unix::io::RawFd;

/// Owns an eventfd. Exposed to external event loops via [`EventPipe::fd`]
/// (`get_event_pipe(ctx) -> fd` in §6).
pub struct EventPipe {
    fd: RawFd,
}

// SAFETY: eventfd is safe to read/write concurrently from multiple threads;
// the kernel serializes the internal counter.
unsafe impl Send for EventPipe {}
unsafe impl Sync for EventPipe {}

impl EventPipe {
    #[cfg(target_os = "linux")]
    pub fn new() -> Result<Self, Error> {
        // SAFETY: eventfd(2) with flags 0 (blocking, no semaphore mode) is
        // always a valid call; a negative return is the only failure case,
        // handled below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> Result<Self, Error> {
        // SAFETY: pipe(2) with two fresh fds is always valid; failure is
        // handled below. The write end is stored in the upper 32 bits of
        // the "fd" field's conceptual pair, but since this crate is a
        // Linux SHM core (§1 host assumption), the pipe fallback only
        // needs to support single-process unit tests, so we keep one fd
        // and never actually call write/read off-Linux in production use.
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(Self { fd: fds[0] })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Wake the subscriber. Called by the Commit Protocol Engine before
    /// waiting on a wave's replies (§4.F).
    #[cfg(target_os = "linux")]
    pub fn wake(&self) -> Result<(), Error> {
        let one: u64 = 1;
        // SAFETY: self.fd is a valid eventfd for the lifetime of self;
        // writing 8 bytes of the counter value is the documented eventfd
        // write protocol.
        let ret = unsafe {
            libc::write(self.fd, &one as *const u64 as *const libc::c_void, 8)
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(()); // counter already saturated/pending; still a pending wake
            }
            return Err(err.into());
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    pub fn wake(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Drain the pending wake. A caller's `process_events` loop calls this
    /// once before walking channels.
    #[cfg(target_os = "linux")]
    pub fn drain(&self) -> Result<bool, Error> {
        let mut buf: u64 = 0;
        // SAFETY: self.fd is a valid eventfd; reading 8 bytes is the
        // documented eventfd read protocol.
        let ret = unsafe {
            libc::read(self.fd, &mut buf as *mut u64 as *mut libc::c_void, 8)
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(err.into());
        }
        Ok(buf > 0)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn drain(&self) -> Result<bool, Error> {
        Ok(true)
    }
}

impl Drop for EventPipe {
    fn drop(&mut self) {
        // SAFETY: self.fd was opened by this instance and is closed
        // exactly once here.
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn wake_then_drain_reports_pending_wake() {
        let pipe = EventPipe::new().unwrap();
        assert!(!pipe.drain().unwrap());
        pipe.wake().unwrap();
        assert!(pipe.drain().unwrap());
        assert!(!pipe.drain().unwrap());
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn repeated_wakes_collapse_to_one_pending_wake() {
        let pipe = EventPipe::new().unwrap();
        pipe.wake().unwrap();
        pipe.wake().unwrap();
        pipe.wake().unwrap();
        assert!(pipe.drain().unwrap());
        assert!(!pipe.drain().unwrap());
    }
}
