// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Core identifiers shared across the registry, SHM index, and engine.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Connection ID: host-unique handle for a process attachment to SHM.
///
/// CIDs, not pointer identity, are the unit of cross-process ownership
/// (§9 Design Notes) — every SHM record names its owner by `Cid` so that a
/// peer process can reason about liveness without dereferencing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid(pub u32);

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid#{}", self.0)
    }
}

/// Session handle, scoped to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

/// Subscription ID, unique within one subscription context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubId(pub u32);

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Monotonic generator for `sub_id`s within one subscription context.
///
/// `last_sub_id` only ever increases (§3 invariants); allocation never
/// reuses an id even after the owning subscription is removed.
#[derive(Debug, Default)]
pub struct SubIdGenerator {
    last: AtomicU32,
}

impl SubIdGenerator {
    pub fn new() -> Self {
        Self {
            last: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> SubId {
        SubId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn last(&self) -> u32 {
        self.last.load(Ordering::Relaxed)
    }
}

/// Request ID: monotonic identifier pairing an event with its replies inside
/// one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RequestId(pub u32);

/// Logical configuration store selected by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datastore {
    Startup,
    Running,
    Candidate,
    Operational,
}

impl Datastore {
    /// File suffix used in the SHM channel naming scheme (§6).
    pub fn as_file_suffix(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Running => "running",
            Self::Candidate => "candidate",
            Self::Operational => "operational",
        }
    }
}

impl fmt::Display for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_file_suffix())
    }
}

/// Total-ordered subscriber priority. Higher values are visited first
/// (§3 invariants, §4.C priority and ordering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Priority(pub i32);

/// Event kind driving the channel's state machine cell (§4.E, §4.F).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventKind {
    None = 0,
    Update = 1,
    Change = 2,
    Done = 3,
    Abort = 4,
    Enabled = 5,
    OperGet = 6,
    Rpc = 7,
    Notif = 8,
}

impl EventKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::None,
            1 => Self::Update,
            2 => Self::Change,
            3 => Self::Done,
            4 => Self::Abort,
            5 => Self::Enabled,
            6 => Self::OperGet,
            7 => Self::Rpc,
            8 => Self::Notif,
            _ => return None,
        })
    }
}

/// FNV-1a hash used throughout for deriving channel/bucket names from
/// strings (oper-get `hash(path, priority)`, RPC `hash(path)`).
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Hash used to key oper-get channels by `(path, priority)`.
pub fn hash_path_priority(path: &str, priority: Priority) -> u64 {
    let mut buf = Vec::with_capacity(path.len() + 4);
    buf.extend_from_slice(path.as_bytes());
    buf.extend_from_slice(&priority.0.to_le_bytes());
    fnv1a_hash(&buf)
}

/// Hash used to key RPC channels by path alone.
pub fn hash_path(path: &str) -> u64 {
    fnv1a_hash(path.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_id_generator_is_monotonic_and_unique() {
        let gen = SubIdGenerator::new();
        let a = gen.next();
        let b = gen.next();
        let c = gen.next();
        assert!(a.0 < b.0 && b.0 < c.0);
        assert_eq!(gen.last(), c.0);
    }

    #[test]
    fn event_kind_round_trips() {
        for raw in 0..=8u32 {
            assert!(EventKind::from_u32(raw).is_some());
        }
        assert!(EventKind::from_u32(9).is_none());
    }

    #[test]
    fn hash_path_priority_distinguishes_priority() {
        let a = hash_path_priority("/m:state", Priority(10));
        let b = hash_path_priority("/m:state", Priority(20));
        assert_ne!(a, b);
    }

    #[test]
    fn priority_orders_descending_when_reversed() {
        let mut v = vec![Priority(5), Priority(20), Priority(10)];
        v.sort_by(|a, b| b.cmp(a));
        assert_eq!(v, vec![Priority(20), Priority(10), Priority(5)]);
    }
}
