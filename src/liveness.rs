// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Liveness & Recovery (§4.G): detects dead peer processes and compacts
//! their SHM footprint so a long-running publisher never accumulates
//! garbage from subscribers that crashed without unsubscribing.
//!
//! `is_alive` is a host-OS process check, not a protocol handshake: on
//! Linux, `kill(pid, 0)` reports `ESRCH` for a process that no longer
//! exists without actually signalling it (the same probe this crate's
//! connection-liveness code already relies on for its own peers).

use crate::shm_index::{ListKind, ShmIndex};
use crate::types::{Cid, Datastore};
use std::time::Duration;

/// Returns whether the process identified by `cid` (its low 32 bits are
/// treated as a PID, per this crate's CID-is-PID-derived convention) is
/// still alive.
#[cfg(target_os = "linux")]
pub fn is_alive(cid: Cid) -> bool {
    let pid = cid.0 as libc::pid_t;
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 sends nothing; it only validates that `pid` is a
    // live process this caller has permission to signal.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0
}

#[cfg(not(target_os = "linux"))]
pub fn is_alive(_cid: Cid) -> bool {
    true
}

const ALL_CHANGE_KINDS: [ListKind; 4] = [
    ListKind::Change(Datastore::Startup),
    ListKind::Change(Datastore::Running),
    ListKind::Change(Datastore::Candidate),
    ListKind::Change(Datastore::Operational),
];

const ALL_NON_CHANGE_KINDS: [ListKind; 3] = [ListKind::OperGet, ListKind::OperPoll, ListKind::Notif];

/// Sweeps every list of a module for records owned by a dead `cid`,
/// removing them in place (§4.G, §8 "liveness recovery" property). Callers
/// typically run this opportunistically before publishing, so that a
/// commit never waits on a subscriber that will never reply.
pub fn reap_dead_subscribers(index: &ShmIndex, module: &str, timeout: Duration) -> crate::error::Result<usize> {
    let mut total = 0;
    for kind in ALL_CHANGE_KINDS.into_iter().chain(ALL_NON_CHANGE_KINDS) {
        total += reap_kind(index, module, kind, timeout)?;
    }
    total += reap_kind(index, module, ListKind::Rpc, timeout)?;
    Ok(total)
}

fn reap_kind(index: &ShmIndex, module: &str, kind: ListKind, timeout: Duration) -> crate::error::Result<usize> {
    let records = index.read_list(module, kind, timeout)?;
    let mut removed = 0;
    for record in records {
        if !is_alive(Cid(record.cid)) {
            let count = index.remove_dead(module, kind, Cid(record.cid), timeout)?;
            if count > 0 {
                crate::warn!("liveness recovery removed dead subscriber: module kind={kind:?} cid={}", record.cid);
            }
            removed += count;
        }
    }
    Ok(removed)
}

impl std::fmt::Debug for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Change(ds) => write!(f, "Change({ds})"),
            Self::OperGet => write!(f, "OperGet"),
            Self::OperPoll => write!(f, "OperPoll"),
            Self::Notif => write!(f, "Notif"),
            Self::Rpc => write!(f, "Rpc"),
        }
    }
}
