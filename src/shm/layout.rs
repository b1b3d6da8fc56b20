// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Main SHM (module table) and ext SHM (variable-length subscription
//! arrays) layout, §4.A and §4.D.
//!
//! Main SHM is a fixed-size header plus a growable module table indexed by
//! hash of the module name (open addressing, linear probe). Ext SHM is a
//! flat byte arena holding fixed-size [`SubRecord`] arrays; the module
//! table stores `(offset, len, cap)` references into it rather than
//! pointers, so the arena can be remapped after growth without
//! invalidating anything but cached lengths (invalidated via the
//! generation counter).

use crate::error::Error;
use crate::lock::RawLock;
use crate::shm::segment::Segment;
use crate::types::fnv1a_hash;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MAGIC: [u8; 4] = *b"SRV1";
pub const FORMAT_VERSION: u32 = 1;
const MODULE_NAME_CAP: usize = 64;

/// 16-byte magic header prefixing every SHM/channel file (§6). Incompatible
/// magic fails attach with `Unsupported`.
#[repr(C)]
pub struct FileMagic {
    pub magic: [u8; 4],
    pub version: u32,
    pub endian: u32,
    pub page_size: u32,
}

impl FileMagic {
    pub fn new(page_size: u32) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            endian: if cfg!(target_endian = "little") { 1 } else { 0 },
            page_size,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.magic != MAGIC {
            return Err(Error::Unsupported(format!(
                "bad magic {:?}, expected {:?}",
                self.magic, MAGIC
            )));
        }
        if self.version != FORMAT_VERSION {
            return Err(Error::Unsupported(format!(
                "unsupported format version {}",
                self.version
            )));
        }
        Ok(())
    }
}

/// A parallel per-registry-entry record living in ext SHM (§4.D): who owns
/// it, whether it's suspended, and how a publisher wakes it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SubRecord {
    pub sub_id: u32,
    pub cid: u32,
    pub suspended: u32,
    pub priority: i32,
    pub flags: u32,
    pub event_pipe_id: u64,
    pub insertion_index: u32,
    _pad: u32,
}

impl SubRecord {
    pub fn new(sub_id: u32, cid: u32, priority: i32, flags: u32, event_pipe_id: u64, insertion_index: u32) -> Self {
        Self {
            sub_id,
            cid,
            suspended: 0,
            priority,
            flags,
            event_pipe_id,
            insertion_index,
            _pad: 0,
        }
    }
}

/// `(offset, len, cap)` reference into the ext SHM arena for one
/// `(module, kind)` subscriber list. Offsets are immutable once published;
/// only `len` ever changes in place (§5 shared-resource policy).
#[repr(C)]
pub struct SubListRef {
    pub offset: AtomicU64,
    pub len: AtomicU32,
    pub cap: AtomicU32,
}

impl SubListRef {
    pub const fn empty() -> Self {
        Self {
            offset: AtomicU64::new(0),
            len: AtomicU32::new(0),
            cap: AtomicU32::new(0),
        }
    }
}

/// Per-module SHM record (§3 "SHM Module Record"): name, per-kind locks and
/// list references, and mutation timestamps.
#[repr(C)]
pub struct ModuleRecord {
    pub name_hash: AtomicU64,
    pub used: AtomicU32,
    name_len: AtomicU32,
    name: [std::sync::atomic::AtomicU8; MODULE_NAME_CAP],
    pub change_lock: [RawLock; 4],
    pub change_list: [SubListRef; 4],
    pub oper_get_lock: RawLock,
    pub oper_get_list: SubListRef,
    pub oper_poll_lock: RawLock,
    pub oper_poll_list: SubListRef,
    pub notif_lock: RawLock,
    pub notif_list: SubListRef,
    pub rpc_lock: RawLock,
    pub rpc_list: SubListRef,
    pub last_config_change_ts: AtomicU64,
    pub last_oper_change_ts: AtomicU64,
}

impl ModuleRecord {
    pub fn name(&self) -> String {
        let len = self.name_len.load(Ordering::Acquire) as usize;
        let bytes: Vec<u8> = self.name[..len.min(MODULE_NAME_CAP)]
            .iter()
            .map(|b| b.load(Ordering::Acquire))
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn set_name(&self, name: &str) -> Result<(), Error> {
        if name.len() > MODULE_NAME_CAP {
            return Err(Error::InvalArg(format!(
                "module name exceeds {MODULE_NAME_CAP} bytes: {name}"
            )));
        }
        for (i, b) in name.as_bytes().iter().enumerate() {
            self.name[i].store(*b, Ordering::Release);
        }
        self.name_len.store(name.len() as u32, Ordering::Release);
        Ok(())
    }

    pub fn datastore_index(ds: crate::types::Datastore) -> usize {
        match ds {
            crate::types::Datastore::Startup => 0,
            crate::types::Datastore::Running => 1,
            crate::types::Datastore::Candidate => 2,
            crate::types::Datastore::Operational => 3,
        }
    }
}

/// Main SHM header: magic, generation counter (invalidates cached offsets
/// on remap, §4.A), and the live module count.
#[repr(C)]
pub struct MainShmHeader {
    pub magic: FileMagic,
    pub generation: AtomicU32,
    pub module_count: AtomicU32,
    pub module_capacity: u32,
}

/// Handle onto the mapped main SHM segment: header followed by the module
/// table, open-addressed by `hash(module_name) % capacity`.
pub struct MainShm {
    segment: Segment,
    capacity: usize,
}

impl MainShm {
    fn header(&self) -> &MainShmHeader {
        // SAFETY: the segment was sized and initialized by `create`/`open`
        // to hold a `MainShmHeader` at offset 0.
        unsafe { &*(self.segment.as_ptr() as *const MainShmHeader) }
    }

    fn table_base(&self) -> *const ModuleRecord {
        // SAFETY: the module table immediately follows the header, both
        // laid out by `required_size`.
        unsafe { (self.segment.as_ptr().add(std::mem::size_of::<MainShmHeader>())) as *const ModuleRecord }
    }

    fn required_size(capacity: usize) -> usize {
        std::mem::size_of::<MainShmHeader>() + capacity * std::mem::size_of::<ModuleRecord>()
    }

    pub fn create(path: &std::path::Path, capacity: usize, page_size: u32) -> Result<Self, Error> {
        let size = Self::required_size(capacity);
        let segment = Segment::create_file(path, size)?;
        let this = Self { segment, capacity };
        let header = this.header();
        // SAFETY: header was just allocated and zeroed by create_file;
        // writing the magic/generation fields here is the sole initializer.
        unsafe {
            let magic_ptr = &header.magic as *const FileMagic as *mut FileMagic;
            magic_ptr.write(FileMagic::new(page_size));
        }
        header.generation.store(0, Ordering::Release);
        header.module_count.store(0, Ordering::Release);
        // SAFETY: module_capacity is a plain (non-atomic) field written once
        // at creation before any other process can have opened this file.
        unsafe {
            let cap_ptr = &header.module_capacity as *const u32 as *mut u32;
            cap_ptr.write(capacity as u32);
        }
        Ok(this)
    }

    pub fn open(path: &std::path::Path) -> Result<Self, Error> {
        let probe = Segment::open_file(path, std::mem::size_of::<MainShmHeader>())?;
        // SAFETY: probe maps at least size_of::<MainShmHeader>() bytes.
        let capacity = unsafe { (*(probe.as_ptr() as *const MainShmHeader)).module_capacity as usize };
        drop(probe);
        let size = Self::required_size(capacity);
        let segment = Segment::open_file(path, size)?;
        let this = Self { segment, capacity };
        this.header().magic.validate()?;
        Ok(this)
    }

    pub fn generation(&self) -> u32 {
        self.header().generation.load(Ordering::Acquire)
    }

    /// Advances the generation counter (§4.A), signalling peers that a
    /// remap happened elsewhere in the arena and any offset they cached
    /// near the old mapping boundary should be re-validated against the
    /// current size before use.
    pub fn bump_generation(&self) {
        self.header().generation.fetch_add(1, Ordering::AcqRel);
    }

    fn slot(&self, index: usize) -> &ModuleRecord {
        // SAFETY: index < capacity is enforced by callers; table_base
        // points at `capacity` contiguous ModuleRecord slots.
        unsafe { &*self.table_base().add(index) }
    }

    /// Find an existing module record by name.
    pub fn find_module(&self, name: &str) -> Option<&ModuleRecord> {
        let hash = fnv1a_hash(name.as_bytes());
        let start = (hash as usize) % self.capacity;
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            let slot = self.slot(idx);
            if slot.used.load(Ordering::Acquire) == 0 {
                return None;
            }
            if slot.name_hash.load(Ordering::Acquire) == hash && slot.name() == name {
                return Some(slot);
            }
        }
        None
    }

    /// Find or create a module record, claiming a free slot under linear
    /// probing from `hash(name)`.
    pub fn find_or_create_module(&self, name: &str) -> Result<&ModuleRecord, Error> {
        if let Some(existing) = self.find_module(name) {
            return Ok(existing);
        }
        let hash = fnv1a_hash(name.as_bytes());
        let start = (hash as usize) % self.capacity;
        for probe in 0..self.capacity {
            let idx = (start + probe) % self.capacity;
            let slot = self.slot(idx);
            if slot
                .used
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.set_name(name)?;
                slot.name_hash.store(hash, Ordering::Release);
                self.header().module_count.fetch_add(1, Ordering::AcqRel);
                return Ok(slot);
            }
            // Someone else claimed this slot for the same name while we
            // raced them.
            if slot.used.load(Ordering::Acquire) == 1
                && slot.name_hash.load(Ordering::Acquire) == hash
                && slot.name() == name
            {
                return Ok(slot);
            }
        }
        Err(Error::NoMemory)
    }
}

/// Ext SHM: a flat byte arena holding [`SubRecord`] arrays. Growth copies
/// the arena into a larger backing file and bumps main SHM's generation
/// counter so peers know their cached offsets (but not the offsets
/// themselves, which remain valid) must be re-resolved against the new
/// mapping size.
pub struct ExtShm {
    segment: Segment,
    pub write_lock: RawLock,
    bump: AtomicU64,
}

impl ExtShm {
    pub fn create(path: &std::path::Path, initial_bytes: usize) -> Result<Self, Error> {
        let segment = Segment::create_file(path, initial_bytes)?;
        Ok(Self {
            segment,
            write_lock: RawLock::new(),
            bump: AtomicU64::new(0),
        })
    }

    pub fn open(path: &std::path::Path, size: usize) -> Result<Self, Error> {
        let segment = Segment::open_file(path, size)?;
        Ok(Self {
            segment,
            write_lock: RawLock::new(),
            bump: AtomicU64::new(size as u64),
        })
    }

    pub fn capacity(&self) -> usize {
        self.segment.size()
    }

    /// Allocate `count` contiguous [`SubRecord`] slots, returning the byte
    /// offset. Caller must already hold `write_lock`. Grows the backing
    /// segment (§4.A: "computes the new size (next power of two), calls
    /// the platform remap") when the arena is exhausted, rather than
    /// failing outright; [`Error::NoMemory`] is reserved for the case
    /// where even a doubled arena could not fit `count` records, which
    /// would indicate a single allocation larger than any reasonable
    /// doubling step.
    pub fn allocate_records(&self, count: usize) -> Result<u64, Error> {
        let bytes_needed = (count * std::mem::size_of::<SubRecord>()) as u64;
        loop {
            let offset = self.bump.fetch_add(bytes_needed, Ordering::AcqRel);
            if offset + bytes_needed <= self.capacity() as u64 {
                return Ok(offset);
            }
            self.bump.fetch_sub(bytes_needed, Ordering::AcqRel);
            let needed_total = offset.saturating_add(bytes_needed) as usize;
            let new_capacity = Self::next_capacity(needed_total.max(self.capacity() + 1));
            if new_capacity <= self.capacity() {
                return Err(Error::NoMemory);
            }
            self.segment.grow(new_capacity)?;
        }
    }

    /// Whether the arena has grown past `prior_capacity` bytes, used by
    /// callers that need to know whether to bump main SHM's generation
    /// counter after an [`ExtShm::allocate_records`] call (§4.A: growth
    /// invalidates peers' cached offsets-to-mapping-size assumptions, not
    /// the offsets themselves).
    pub fn grew_past(&self, prior_capacity: usize) -> bool {
        self.capacity() > prior_capacity
    }

    /// Next power-of-two capacity able to hold `min_bytes`.
    pub fn next_capacity(min_bytes: usize) -> usize {
        min_bytes.next_power_of_two().max(4096)
    }

    fn records_ptr(&self, offset: u64) -> *mut SubRecord {
        // SAFETY: offset is caller-provided and must have come from
        // `allocate_records` on this same arena.
        unsafe { self.segment.as_ptr().add(offset as usize) as *mut SubRecord }
    }

    /// Read the `i`-th record of a list starting at `offset`.
    pub fn read_record(&self, offset: u64, i: usize) -> SubRecord {
        // SAFETY: i < len is the caller's responsibility, enforced by
        // SubListRef bookkeeping in the registry/index layer.
        unsafe { *self.records_ptr(offset).add(i) }
    }

    pub fn write_record(&self, offset: u64, i: usize, record: SubRecord) {
        // SAFETY: see read_record.
        unsafe { self.records_ptr(offset).add(i).write(record) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Datastore;

    #[test]
    fn find_or_create_then_find_returns_same_slot() {
        let dir = tempfile::tempdir().unwrap();
        let shm = MainShm::create(&dir.path().join("main.sr"), 16, 4096).unwrap();
        let rec = shm.find_or_create_module("ietf-interfaces").unwrap();
        assert_eq!(rec.name(), "ietf-interfaces");
        let again = shm.find_module("ietf-interfaces").unwrap();
        assert_eq!(again.name_hash.load(Ordering::Acquire), rec.name_hash.load(Ordering::Acquire));
    }

    #[test]
    fn datastore_index_is_stable_and_distinct() {
        let indices: Vec<usize> = [
            Datastore::Startup,
            Datastore::Running,
            Datastore::Candidate,
            Datastore::Operational,
        ]
        .into_iter()
        .map(ModuleRecord::datastore_index)
        .collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn ext_shm_allocates_non_overlapping_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let ext = ExtShm::create(&dir.path().join("ext.sr"), 4096).unwrap();
        let a = ext.allocate_records(4).unwrap();
        let b = ext.allocate_records(4).unwrap();
        assert_ne!(a, b);
        ext.write_record(a, 0, SubRecord::new(1, 10, 5, 0, 0, 0));
        let rec = ext.read_record(a, 0);
        assert_eq!(rec.sub_id, 1);
    }

    #[test]
    fn ext_shm_grows_instead_of_failing_when_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let ext = ExtShm::create(&dir.path().join("ext.sr"), 128).unwrap();
        let prior_capacity = ext.capacity();
        let offset = ext.allocate_records(100).unwrap();
        assert!(ext.grew_past(prior_capacity));
        ext.write_record(offset, 0, SubRecord::new(1, 10, 5, 0, 0, 0));
        assert_eq!(ext.read_record(offset, 0).sub_id, 1);
    }

    #[test]
    fn ext_shm_allocations_stay_disjoint_across_a_grow() {
        let dir = tempfile::tempdir().unwrap();
        let ext = ExtShm::create(&dir.path().join("ext.sr"), 64).unwrap();
        let a = ext.allocate_records(2).unwrap();
        ext.write_record(a, 0, SubRecord::new(1, 0, 0, 0, 0, 0));
        // Forces growth past the tiny initial 64-byte arena.
        let b = ext.allocate_records(32).unwrap();
        ext.write_record(b, 0, SubRecord::new(2, 0, 0, 0, 0, 0));
        assert_ne!(a, b);
        assert_eq!(ext.read_record(a, 0).sub_id, 1);
        assert_eq!(ext.read_record(b, 0).sub_id, 2);
    }
}
