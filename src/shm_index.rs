// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SHM Subscription Index (§4.D): publishes a registry's in-process
//! subscription lists into the ext SHM arena so that other processes
//! attached to the same module can see them.
//!
//! A module's five subscriber lists (change × 4 datastores, oper-get,
//! oper-poll, notif, rpc) are independent: each is protected by its own
//! [`RawLock`] in the module's [`ModuleRecord`], so publishing to one list
//! never blocks a peer reading another. Growth beyond a list's current
//! capacity takes `ext_shm_lock` in addition to the list's own lock,
//! ranked innermost (§4.B) since it is only ever needed while already
//! holding a per-kind lock.
//!
//! Registry and SHM are kept in lockstep by the caller (typically
//! [`crate::registry::SubscriptionContext`]): an add/del that fails to
//! update SHM must roll back the in-process table too (§4.D add/delete
//! contract). This module only performs the SHM-side half of that
//! transaction.

use crate::error::Result;
use crate::lock::{acquire_read, acquire_write, LockRank};
use crate::shm::layout::{ExtShm, MainShm, ModuleRecord, SubListRef, SubRecord};
use crate::lock::RawLock;
use crate::types::{Cid, Datastore};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Which of a module's five subscriber lists to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Change(Datastore),
    OperGet,
    OperPoll,
    Notif,
    Rpc,
}

impl ListKind {
    fn rank(self) -> LockRank {
        match self {
            Self::Change(_) => LockRank::ChangeSub,
            Self::OperGet => LockRank::OperGetLock,
            Self::OperPoll => LockRank::OperPollLock,
            Self::Notif => LockRank::NotifLock,
            Self::Rpc => LockRank::RpcExtLock,
        }
    }

    fn is_config_change(self) -> bool {
        matches!(self, Self::Change(_))
    }
}

fn lock_and_list(record: &ModuleRecord, kind: ListKind) -> (&RawLock, &SubListRef) {
    match kind {
        ListKind::Change(ds) => {
            let idx = ModuleRecord::datastore_index(ds);
            (&record.change_lock[idx], &record.change_list[idx])
        }
        ListKind::OperGet => (&record.oper_get_lock, &record.oper_get_list),
        ListKind::OperPoll => (&record.oper_poll_lock, &record.oper_poll_list),
        ListKind::Notif => (&record.notif_lock, &record.notif_list),
        ListKind::Rpc => (&record.rpc_lock, &record.rpc_list),
    }
}

fn touch_timestamp(record: &ModuleRecord, kind: ListKind) {
    let ts = now_ns();
    if kind.is_config_change() {
        record.last_config_change_ts.store(ts, Ordering::Release);
    } else {
        record.last_oper_change_ts.store(ts, Ordering::Release);
    }
}

/// Handle onto the attached main/ext SHM pair for one process.
pub struct ShmIndex {
    main: MainShm,
    ext: ExtShm,
}

impl ShmIndex {
    pub fn new(main: MainShm, ext: ExtShm) -> Self {
        Self { main, ext }
    }

    /// Replace a module's subscriber list wholesale under its write lock
    /// (§4.D). Growing beyond the list's current capacity additionally
    /// takes `ext_shm_lock`.
    pub fn sync(&self, name: &str, kind: ListKind, records: &[SubRecord], timeout: Duration) -> Result<()> {
        let module = self.main.find_or_create_module(name)?;
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_write(lock, kind.rank(), timeout)?;

        let needed = records.len() as u32;
        let current_cap = list_ref.cap.load(Ordering::Acquire);
        let offset = if needed > current_cap {
            let _ext_guard = acquire_write(&self.ext.write_lock, LockRank::ExtShmLock, timeout)?;
            let prior_capacity = self.ext.capacity();
            let new_offset = self.ext.allocate_records(needed as usize)?;
            if self.ext.grew_past(prior_capacity) {
                self.main.bump_generation();
            }
            list_ref.offset.store(new_offset, Ordering::Release);
            list_ref.cap.store(needed, Ordering::Release);
            new_offset
        } else {
            list_ref.offset.load(Ordering::Acquire)
        };

        for (i, record) in records.iter().enumerate() {
            self.ext.write_record(offset, i, *record);
        }
        list_ref.len.store(needed, Ordering::Release);
        touch_timestamp(module, kind);
        Ok(())
    }

    /// Read back a module's current subscriber list under its read lock.
    pub fn read_list(&self, name: &str, kind: ListKind, timeout: Duration) -> Result<Vec<SubRecord>> {
        let Some(module) = self.main.find_module(name) else {
            return Ok(Vec::new());
        };
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_read(lock, kind.rank(), timeout)?;
        let len = list_ref.len.load(Ordering::Acquire) as usize;
        let offset = list_ref.offset.load(Ordering::Acquire);
        Ok((0..len).map(|i| self.ext.read_record(offset, i)).collect())
    }

    /// Swap-remove every record owned by `dead` from a module's list
    /// (§4.G liveness/recovery). Returns how many were removed.
    pub fn remove_dead(&self, name: &str, kind: ListKind, dead: Cid, timeout: Duration) -> Result<usize> {
        let Some(module) = self.main.find_module(name) else {
            return Ok(0);
        };
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_write(lock, kind.rank(), timeout)?;

        let len = list_ref.len.load(Ordering::Acquire) as usize;
        let offset = list_ref.offset.load(Ordering::Acquire);
        let mut kept: Vec<SubRecord> = Vec::with_capacity(len);
        let mut removed = 0;
        for i in 0..len {
            let record = self.ext.read_record(offset, i);
            if record.cid == dead.0 {
                removed += 1;
            } else {
                kept.push(record);
            }
        }
        if removed > 0 {
            for (i, record) in kept.iter().enumerate() {
                self.ext.write_record(offset, i, *record);
            }
            list_ref.len.store(kept.len() as u32, Ordering::Release);
        }
        Ok(removed)
    }

    /// Appends one record to a module's list (§4.D add contract), growing
    /// storage if the list is already at capacity. Unlike [`ShmIndex::sync`]
    /// this never touches any other process's existing entries in the same
    /// list — the operation a single subscribe call needs.
    pub fn add_record(&self, name: &str, kind: ListKind, record: SubRecord, timeout: Duration) -> Result<()> {
        let module = self.main.find_or_create_module(name)?;
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_write(lock, kind.rank(), timeout)?;

        let len = list_ref.len.load(Ordering::Acquire);
        let cap = list_ref.cap.load(Ordering::Acquire);
        let offset = if len >= cap {
            let needed = (len + 1).max(4);
            let _ext_guard = acquire_write(&self.ext.write_lock, LockRank::ExtShmLock, timeout)?;
            let prior_capacity = self.ext.capacity();
            let new_offset = self.ext.allocate_records(needed as usize)?;
            if self.ext.grew_past(prior_capacity) {
                // §4.A: a remap invalidates peers' cached *mapping size*,
                // never the offsets themselves; bumping main SHM's
                // generation is how a peer notices it must re-map before
                // trusting an offset near the old boundary.
                self.main.bump_generation();
            }
            let old_offset = list_ref.offset.load(Ordering::Acquire);
            for i in 0..len as usize {
                let existing = self.ext.read_record(old_offset, i);
                self.ext.write_record(new_offset, i, existing);
            }
            list_ref.offset.store(new_offset, Ordering::Release);
            list_ref.cap.store(needed, Ordering::Release);
            new_offset
        } else {
            list_ref.offset.load(Ordering::Acquire)
        };
        self.ext.write_record(offset, len as usize, record);
        list_ref.len.store(len + 1, Ordering::Release);
        touch_timestamp(module, kind);
        Ok(())
    }

    /// Swap-removes the single record matching `sub_id` (§3 invariants:
    /// swap-with-last locality, the same pattern [`ShmIndex::remove_dead`]
    /// uses for whole batches). Returns whether a record was found.
    pub fn remove_record(&self, name: &str, kind: ListKind, sub_id: u32, timeout: Duration) -> Result<bool> {
        let Some(module) = self.main.find_module(name) else {
            return Ok(false);
        };
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_write(lock, kind.rank(), timeout)?;

        let len = list_ref.len.load(Ordering::Acquire) as usize;
        let offset = list_ref.offset.load(Ordering::Acquire);
        let Some(idx) = (0..len).find(|&i| self.ext.read_record(offset, i).sub_id == sub_id) else {
            return Ok(false);
        };
        if idx != len - 1 {
            let last = self.ext.read_record(offset, len - 1);
            self.ext.write_record(offset, idx, last);
        }
        list_ref.len.store((len - 1) as u32, Ordering::Release);
        touch_timestamp(module, kind);
        Ok(true)
    }

    /// Flips a single record's `suspended` flag in place (§4.G: suspended
    /// entries are skipped by the engine but retained in the list). Returns
    /// whether a matching `sub_id` was found.
    pub fn set_suspended(&self, name: &str, kind: ListKind, sub_id: u32, suspended: bool, timeout: Duration) -> Result<bool> {
        let Some(module) = self.main.find_module(name) else {
            return Ok(false);
        };
        let (lock, list_ref) = lock_and_list(module, kind);
        let _guard = acquire_write(lock, kind.rank(), timeout)?;

        let len = list_ref.len.load(Ordering::Acquire) as usize;
        let offset = list_ref.offset.load(Ordering::Acquire);
        for i in 0..len {
            let mut record = self.ext.read_record(offset, i);
            if record.sub_id == sub_id {
                record.suspended = u32::from(suspended);
                self.ext.write_record(offset, i, record);
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn main(&self) -> &MainShm {
        &self.main
    }

    pub fn ext(&self) -> &ExtShm {
        &self.ext
    }
}
