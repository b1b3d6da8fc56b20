// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Linux futex wrapper used by the lock primitives (§4.B) to block a thread
//! on an atomic cell that lives in shared memory.
//!
//! # CRITICAL: SHARED vs PRIVATE
//!
//! This module uses `FUTEX_WAIT` and `FUTEX_WAKE` (NOT the `_PRIVATE`
//! variants). The `_PRIVATE` variants assume all waiters share one address
//! space; here waiters are independent processes each with their own
//! mapping of the same shared page, so the private fast path would silently
//! fail to wake them.

use std::ptr;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

const FUTEX_WAIT: i32 = 0; // NOT 128 (FUTEX_WAIT_PRIVATE)
const FUTEX_WAKE: i32 = 1; // NOT 129 (FUTEX_WAKE_PRIVATE)

/// Wait on a futex cell until it changes away from `expected` or the
/// timeout expires.
///
/// Returns `0` on wake (real or spurious), `-1` with `EAGAIN` if the value
/// already differs from `expected`, `-1` with `ETIMEDOUT` on timeout.
///
/// # Safety
/// `addr` must remain valid (mapped, not moved) for the call's duration;
/// for cross-process use it must point into shared memory.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> i32 {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a valid reference to an AtomicU32; the futex syscall
    // reads/compares it atomically. FUTEX_WAIT (not _PRIVATE) is required
    // because waiters live in different address spaces over one shared page.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

/// Wake up to `count` waiters blocked on `addr`.
///
/// # Safety
/// `addr` must be the same address waiters are blocked on.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: see futex_wait. FUTEX_WAKE (not _PRIVATE).
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            ptr::null::<libc::timespec>(),
            ptr::null::<u32>(),
            0i32,
        ) as i32
    }
}

#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_one(addr: &AtomicU32) -> i32 {
    futex_wake(addr, 1)
}

#[cfg(target_os = "linux")]
#[inline]
pub fn futex_wake_all(addr: &AtomicU32) -> i32 {
    futex_wake(addr, i32::MAX)
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wait(_addr: &AtomicU32, _expected: u32, timeout: Option<Duration>) -> i32 {
    std::thread::sleep(timeout.unwrap_or(Duration::from_millis(1)).min(Duration::from_millis(10)));
    0
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_one(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(not(target_os = "linux"))]
#[inline]
pub fn futex_wake_all(_addr: &AtomicU32) -> i32 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_without_waiters_does_not_error() {
        let val = AtomicU32::new(0);
        assert!(futex_wake(&val, 1) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_on_mismatched_value_returns_immediately() {
        let val = AtomicU32::new(42);
        let result = futex_wait(&val, 0, Some(Duration::from_millis(100)));
        assert_eq!(result, -1);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wake_actually_wakes_a_waiting_thread() {
        let val = Arc::new(AtomicU32::new(0));
        let waiter = Arc::clone(&val);

        let handle = thread::spawn(move || {
            while waiter.load(Ordering::Acquire) == 0 {
                futex_wait(&waiter, 0, Some(Duration::from_secs(1)));
            }
            waiter.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(10));
        val.store(7, Ordering::Release);
        futex_wake(&val, 1);

        assert_eq!(handle.join().unwrap(), 7);
    }
}
