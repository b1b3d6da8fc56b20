// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timed multi-reader / upgradable / writer locks placed in shared memory
//! (§4.B Lock Primitives).
//!
//! Each [`RawLock`] is the `{readers_count, upgradable_holder, writer_flag}`
//! triple from the design, plus a `generation` cell used purely as the
//! futex word: every state transition bumps it and wakes waiters, mirroring
//! the commit-marker discipline this crate's channel code already uses for
//! torn-read protection (bump-then-wake on write, read-then-trust on wait).
//!
//! Acquisition never blocks past the caller's timeout, and a timed-out
//! acquisition leaves no trace of having been attempted (§4.B contract).

use crate::shm::futex;
use crate::types::Cid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Deadlock-avoidance rank, enumerated in the order §4.B mandates
/// (`subs_lock` → per-kind SHM sublock → `ext_shm_lock`). Debug builds
/// assert a thread never acquires a lock whose rank is ≤ the deepest rank
/// it already holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockRank {
    SubsLock = 0,
    ChangeSub = 1,
    OperGetLock = 2,
    OperPollLock = 3,
    NotifLock = 4,
    RpcExtLock = 5,
    ExtShmLock = 6,
}

#[cfg(debug_assertions)]
thread_local! {
    static LOCK_DEPTH: std::cell::Cell<i16> = const { std::cell::Cell::new(-1) };
}

#[cfg(debug_assertions)]
fn assert_and_enter_rank(rank: LockRank) -> i16 {
    LOCK_DEPTH.with(|depth| {
        let current = depth.get();
        let incoming = rank as i16;
        assert!(
            incoming > current,
            "lock order violation: attempted to acquire rank {incoming} while holding rank {current}"
        );
        depth.set(incoming);
        current
    })
}

#[cfg(debug_assertions)]
fn restore_rank(previous: i16) {
    LOCK_DEPTH.with(|depth| depth.set(previous));
}

#[cfg(not(debug_assertions))]
fn assert_and_enter_rank(_rank: LockRank) -> i16 {
    0
}

#[cfg(not(debug_assertions))]
fn restore_rank(_previous: i16) {}

/// The lock state as it lives in shared memory. `0` in `upgradable_holder`
/// means free; any other value is the holder's [`Cid`].
#[repr(C, align(64))]
pub struct RawLock {
    pub readers_count: AtomicU32,
    pub upgradable_holder: AtomicU32,
    pub writer_flag: AtomicU32,
    pub generation: AtomicU32,
    _pad: [u8; 48],
}

impl RawLock {
    pub const fn new() -> Self {
        Self {
            readers_count: AtomicU32::new(0),
            upgradable_holder: AtomicU32::new(0),
            writer_flag: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            _pad: [0u8; 48],
        }
    }

    fn bump_and_wake(&self) {
        self.generation.fetch_add(1, Ordering::Release);
        futex::futex_wake_all(&self.generation);
    }

    fn wait_for_change(&self, seen: u32, deadline: Instant) -> Result<(), crate::error::Error> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(crate::error::Error::TimeOut);
        }
        futex::futex_wait(&self.generation, seen, Some(remaining));
        if Instant::now() >= deadline && self.generation.load(Ordering::Acquire) == seen {
            return Err(crate::error::Error::TimeOut);
        }
        Ok(())
    }

    /// Clear a stale read-upgradable holder. Called by an acquirer that has
    /// determined (via `is_alive`) that the current holder's process is
    /// dead. This is the holder-death recovery pass from §4.B.
    pub fn recover_stale_upgradable_holder(&self, stale: Cid) -> bool {
        let recovered = self
            .upgradable_holder
            .compare_exchange(stale.0, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if recovered {
            self.bump_and_wake();
        }
        recovered
    }
}

impl Default for RawLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Live mode of an acquired lock, mirroring §4.B's three modes plus the
/// unlocked state used before any acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Read,
    ReadUpgradable,
    Write,
}

/// RAII guard releasing its lock (and restoring the debug lock-depth
/// counter) on drop, so every exit path — including `?` and unwinding —
/// releases without an explicit cleanup block (§5 shared-resource policy).
pub struct LockGuard<'a> {
    lock: &'a RawLock,
    mode: LockMode,
    holder: Option<Cid>,
    rank: LockRank,
    prev_depth: i16,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Promote a read-upgradable guard to write. On timeout the guard
    /// remains read-upgradable (§4.B contract) and the error is returned.
    pub fn upgrade(mut self, timeout: Duration) -> Result<LockGuard<'a>, (LockGuard<'a>, crate::error::Error)> {
        if self.mode != LockMode::ReadUpgradable {
            return Err((self, crate::error::Error::Internal(
                "upgrade requires a read-upgradable guard".into(),
            )));
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .lock
                .writer_flag
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
            let seen = self.lock.generation.load(Ordering::Acquire);
            if let Err(e) = self.lock.wait_for_change(seen, deadline) {
                return Err((self, e));
            }
            if Instant::now() >= deadline {
                return Err((self, crate::error::Error::TimeOut));
            }
        }
        // writer_flag is ours; wait for any readers to drain.
        loop {
            if self.lock.readers_count.load(Ordering::Acquire) == 0 {
                self.mode = LockMode::Write;
                return Ok(self);
            }
            let seen = self.lock.generation.load(Ordering::Acquire);
            if self.lock.wait_for_change(seen, deadline).is_err() {
                // Roll back: release the writer bit we grabbed, retain
                // read-upgradable as the spec requires on upgrade timeout.
                self.lock.writer_flag.store(0, Ordering::Release);
                self.lock.bump_and_wake();
                return Err((self, crate::error::Error::TimeOut));
            }
        }
    }

    /// Downgrade a write guard back to read-upgradable, used by `del_notif`
    /// (§4.C) so a synthetic callback can run without the engine holding
    /// exclusive access and without allowing reentrant mutation.
    pub fn downgrade_to_read_upgradable(mut self, holder: Cid) -> LockGuard<'a> {
        assert_eq!(self.mode, LockMode::Write, "downgrade requires a write guard");
        self.lock.upgradable_holder.store(holder.0, Ordering::Release);
        self.lock.writer_flag.store(0, Ordering::Release);
        self.lock.bump_and_wake();
        self.mode = LockMode::ReadUpgradable;
        self.holder = Some(holder);
        self
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.mode {
            LockMode::None => {}
            LockMode::Read => {
                self.lock.readers_count.fetch_sub(1, Ordering::AcqRel);
                self.lock.bump_and_wake();
            }
            LockMode::ReadUpgradable => {
                self.lock.upgradable_holder.store(0, Ordering::Release);
                self.lock.bump_and_wake();
            }
            LockMode::Write => {
                self.lock.writer_flag.store(0, Ordering::Release);
                self.lock.bump_and_wake();
            }
        }
        restore_rank(self.prev_depth);
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquire `lock` in read mode, bounded by `timeout`.
pub fn acquire_read(lock: &RawLock, rank: LockRank, timeout: Duration) -> Result<LockGuard<'_>, crate::error::Error> {
    let prev_depth = assert_and_enter_rank(rank);
    let deadline = Instant::now() + timeout;
    loop {
        if lock.writer_flag.load(Ordering::Acquire) == 0 {
            lock.readers_count.fetch_add(1, Ordering::AcqRel);
            if lock.writer_flag.load(Ordering::Acquire) == 0 {
                return Ok(LockGuard {
                    lock,
                    mode: LockMode::Read,
                    holder: None,
                    rank,
                    prev_depth,
                    released: false,
                });
            }
            // A writer snuck in between our check and increment; back off.
            lock.readers_count.fetch_sub(1, Ordering::AcqRel);
            lock.bump_and_wake();
        }
        let seen = lock.generation.load(Ordering::Acquire);
        if let Err(e) = lock.wait_for_change(seen, deadline) {
            restore_rank(prev_depth);
            return Err(e);
        }
    }
}

/// Acquire `lock` in read-upgradable mode. `cid` is recorded as the holder
/// so peers can detect a crashed holder and recover (§4.B).
pub fn acquire_read_upgradable(
    lock: &RawLock,
    rank: LockRank,
    cid: Cid,
    timeout: Duration,
    is_alive: impl Fn(Cid) -> bool,
) -> Result<LockGuard<'_>, crate::error::Error> {
    let prev_depth = assert_and_enter_rank(rank);
    let deadline = Instant::now() + timeout;
    loop {
        if lock
            .upgradable_holder
            .compare_exchange(0, cid.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Ok(LockGuard {
                lock,
                mode: LockMode::ReadUpgradable,
                holder: Some(cid),
                rank,
                prev_depth,
                released: false,
            });
        }
        let current = lock.upgradable_holder.load(Ordering::Acquire);
        if current != 0 && !is_alive(Cid(current)) {
            lock.recover_stale_upgradable_holder(Cid(current));
            continue;
        }
        let seen = lock.generation.load(Ordering::Acquire);
        if let Err(e) = lock.wait_for_change(seen, deadline) {
            restore_rank(prev_depth);
            return Err(e);
        }
    }
}

/// Acquire `lock` exclusively: no readers, no upgradable holder, no other
/// writer.
pub fn acquire_write(lock: &RawLock, rank: LockRank, timeout: Duration) -> Result<LockGuard<'_>, crate::error::Error> {
    let prev_depth = assert_and_enter_rank(rank);
    let deadline = Instant::now() + timeout;
    loop {
        if lock
            .writer_flag
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
        let seen = lock.generation.load(Ordering::Acquire);
        if let Err(e) = lock.wait_for_change(seen, deadline) {
            restore_rank(prev_depth);
            return Err(e);
        }
    }
    loop {
        let quiescent = lock.readers_count.load(Ordering::Acquire) == 0
            && lock.upgradable_holder.load(Ordering::Acquire) == 0;
        if quiescent {
            return Ok(LockGuard {
                lock,
                mode: LockMode::Write,
                holder: None,
                rank,
                prev_depth,
                released: false,
            });
        }
        let seen = lock.generation.load(Ordering::Acquire);
        if lock.wait_for_change(seen, deadline).is_err() {
            lock.writer_flag.store(0, Ordering::Release);
            lock.bump_and_wake();
            restore_rank(prev_depth);
            return Err(crate::error::Error::TimeOut);
        }
    }
}
