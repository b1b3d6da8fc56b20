// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Event channels: the memory-mapped per-topic files the Commit Protocol
//! Engine drives (§4.E).
//!
//! Layout: `header { event_kind, request_id, priority, error_code,
//! payload_len, orig_cid, orig_sid }` (atomics) followed by the payload
//! buffer, followed by a fixed-capacity reply slot array. Writers take the
//! module-kind write lock to touch the header; readers take it in read
//! mode to snapshot, then in write mode to post their reply — the same
//! discipline as the rest of SHM (§4.B).
//!
//! The payload copy itself is protected against torn reads the way this
//! crate's ring buffer already protects slot payloads: the writer marks
//! the slot in-progress before copying and commits (release store) only
//! once the copy is complete; a reader takes an acquire load of the commit
//! marker before trusting the bytes.

use crate::error::Error;
use crate::shm::layout::FileMagic;
use crate::shm::segment::Segment;
use crate::types::EventKind;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

const MAX_REPLY_ERR_MSG: usize = 256;

#[repr(C)]
pub struct ChannelHeader {
    pub magic: FileMagic,
    pub event_kind: AtomicU32,
    pub request_id: AtomicU32,
    pub priority: AtomicU32,
    pub error_code: AtomicU32,
    pub payload_len: AtomicU32,
    pub orig_cid: AtomicU32,
    pub orig_sid: AtomicU32,
    /// 0 = payload not yet committed for the current request_id, 1 =
    /// committed and safe to read (torn-read guard, release/acquire).
    pub payload_committed: AtomicU32,
    pub reply_count: AtomicU32,
    pub reply_capacity: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ReplySlot {
    pub sub_id: u32,
    pub err_code: u32,
    pub err_msg_len: u32,
    pub err_msg: [u8; MAX_REPLY_ERR_MSG],
}

impl ReplySlot {
    pub fn empty() -> Self {
        Self {
            sub_id: 0,
            err_code: 0,
            err_msg_len: 0,
            err_msg: [0u8; MAX_REPLY_ERR_MSG],
        }
    }

    pub fn message(&self) -> String {
        let len = (self.err_msg_len as usize).min(MAX_REPLY_ERR_MSG);
        String::from_utf8_lossy(&self.err_msg[..len]).into_owned()
    }
}

/// A mapped event channel: header, payload region, reply slots.
///
/// `payload_capacity` is an atomic, not a plain field, because
/// [`Channel::publish`] takes `&self` (channels are shared via `Arc` across
/// the threads that hold a module's write lock over time) yet must grow
/// the payload region in place under that lock (§4.E: "The channel grows
/// by power-of-two if `payload_len` exceeds capacity; growth is a remap
/// under write lock").
pub struct Channel {
    segment: Segment,
    payload_capacity: AtomicUsize,
}

impl Channel {
    fn header_size() -> usize {
        std::mem::size_of::<ChannelHeader>()
    }

    fn required_size(payload_capacity: usize, reply_capacity: usize) -> usize {
        Self::header_size() + payload_capacity + reply_capacity * std::mem::size_of::<ReplySlot>()
    }

    pub fn create(
        path: &std::path::Path,
        payload_capacity: usize,
        reply_capacity: usize,
        page_size: u32,
    ) -> Result<Self, Error> {
        let size = Self::required_size(payload_capacity, reply_capacity);
        let segment = Segment::create_file(path, size)?;
        let this = Self {
            segment,
            payload_capacity: AtomicUsize::new(payload_capacity),
        };
        let header = this.header();
        // SAFETY: header is freshly zeroed memory from create_file; this is
        // the one-time initializer before any peer attaches.
        unsafe {
            (&header.magic as *const FileMagic as *mut FileMagic).write(FileMagic::new(page_size));
        }
        header.event_kind.store(EventKind::None as u32, Ordering::Release);
        // SAFETY: reply_capacity is a plain field written once at creation.
        unsafe {
            (&header.reply_capacity as *const u32 as *mut u32).write(reply_capacity as u32);
        }
        Ok(this)
    }

    pub fn open(path: &std::path::Path, payload_capacity: usize, reply_capacity: usize) -> Result<Self, Error> {
        let size = Self::required_size(payload_capacity, reply_capacity);
        let segment = Segment::open_file(path, size)?;
        let this = Self {
            segment,
            payload_capacity: AtomicUsize::new(payload_capacity),
        };
        this.header().magic.validate()?;
        Ok(this)
    }

    pub fn header(&self) -> &ChannelHeader {
        // SAFETY: the segment was sized to place a ChannelHeader at offset 0.
        unsafe { &*(self.segment.as_ptr() as *const ChannelHeader) }
    }

    fn payload_ptr(&self) -> *mut u8 {
        // SAFETY: payload immediately follows the header within the sized
        // mapping.
        unsafe { self.segment.as_ptr().add(Self::header_size()) }
    }

    fn reply_base(&self) -> *mut ReplySlot {
        // SAFETY: replies immediately follow the (possibly grown) payload
        // region; payload_capacity is always read fresh via the atomic.
        unsafe { self.payload_ptr().add(self.payload_capacity()) as *mut ReplySlot }
    }

    pub fn payload_capacity(&self) -> usize {
        self.payload_capacity.load(Ordering::Acquire)
    }

    /// Grows the payload region to at least `min_capacity`, relocating the
    /// reply-slot array forward by the same delta so it stays immediately
    /// after the (now larger) payload region (§4.E). Caller must hold the
    /// module-kind write lock — the same lock `publish`/`post_reply`
    /// require — so no reader can observe the reply region mid-shift.
    pub fn grow(&self, min_capacity: usize) -> Result<(), Error> {
        let old_capacity = self.payload_capacity();
        if min_capacity <= old_capacity {
            return Ok(());
        }
        let new_capacity = min_capacity.next_power_of_two();
        let reply_capacity = self.header().reply_capacity as usize;
        let new_size = Self::required_size(new_capacity, reply_capacity);
        self.segment.grow(new_size)?;

        let reply_bytes = reply_capacity * std::mem::size_of::<ReplySlot>();
        // SAFETY: the segment now maps at least new_size bytes, which
        // includes room for the reply region at its new offset
        // (header_size + new_capacity); old and new reply regions may
        // overlap, so this is a memmove via `copy`, not `copy_nonoverlapping`.
        unsafe {
            let old_reply_ptr = self.payload_ptr().add(old_capacity);
            let new_reply_ptr = self.payload_ptr().add(new_capacity);
            std::ptr::copy(old_reply_ptr, new_reply_ptr, reply_bytes);
        }
        self.payload_capacity.store(new_capacity, Ordering::Release);
        Ok(())
    }

    /// Write a new event's payload and flip `event_kind`/`request_id`.
    /// Caller must hold the module-kind write lock.
    pub fn publish(&self, kind: EventKind, request_id: u32, priority: u32, orig_cid: u32, orig_sid: u32, payload: &[u8]) -> Result<(), Error> {
        if payload.len() > self.payload_capacity() {
            self.grow(payload.len())?;
        }
        let header = self.header();
        header.payload_committed.store(0, Ordering::Release);
        // SAFETY: payload.len() <= payload_capacity checked above; the
        // mapping is at least payload_capacity bytes past the header.
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), self.payload_ptr(), payload.len());
        }
        header.payload_len.store(payload.len() as u32, Ordering::Release);
        header.orig_cid.store(orig_cid, Ordering::Release);
        header.orig_sid.store(orig_sid, Ordering::Release);
        header.priority.store(priority, Ordering::Release);
        header.request_id.store(request_id, Ordering::Release);
        header.reply_count.store(0, Ordering::Release);
        header.payload_committed.store(1, Ordering::Release);
        header.event_kind.store(kind as u32, Ordering::Release);
        Ok(())
    }

    /// Snapshot the current payload. Caller must hold at least a read
    /// lock, and must check `payload_committed` before trusting bytes to
    /// guard against a writer racing ahead (torn-read guard).
    pub fn snapshot_payload(&self) -> Option<Vec<u8>> {
        let header = self.header();
        if header.payload_committed.load(Ordering::Acquire) == 0 {
            return None;
        }
        let len = header.payload_len.load(Ordering::Acquire) as usize;
        let len = len.min(self.payload_capacity());
        let mut buf = vec![0u8; len];
        // SAFETY: len <= payload_capacity, and payload_committed==1 means
        // the writer's copy_nonoverlapping above has fully completed
        // (release store observed via this acquire load).
        unsafe {
            std::ptr::copy_nonoverlapping(self.payload_ptr(), buf.as_mut_ptr(), len);
        }
        Some(buf)
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::from_u32(self.header().event_kind.load(Ordering::Acquire))
    }

    pub fn request_id(&self) -> u32 {
        self.header().request_id.load(Ordering::Acquire)
    }

    /// Flag a stale, unprocessed event as ignored by forcing the channel
    /// back to `None` before the next writer reuses it (§4.C del_notif,
    /// §4.F stale oper-get requests).
    pub fn mark_ignored(&self) {
        self.header().event_kind.store(EventKind::None as u32, Ordering::Release);
    }

    /// Write this subscriber's reply slot. Caller must hold the write lock.
    pub fn post_reply(&self, sub_id: u32, err_code: u32, err_msg: &str) -> Result<(), Error> {
        let header = self.header();
        let idx = header.reply_count.fetch_add(1, Ordering::AcqRel) as usize;
        if idx >= header.reply_capacity as usize {
            header.reply_count.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::NoMemory);
        }
        let mut slot = ReplySlot::empty();
        slot.sub_id = sub_id;
        slot.err_code = err_code;
        let msg_bytes = err_msg.as_bytes();
        let copy_len = msg_bytes.len().min(MAX_REPLY_ERR_MSG);
        slot.err_msg[..copy_len].copy_from_slice(&msg_bytes[..copy_len]);
        slot.err_msg_len = copy_len as u32;
        // SAFETY: idx < reply_capacity checked above; reply_base points at
        // reply_capacity contiguous ReplySlot entries.
        unsafe { self.reply_base().add(idx).write(slot) };
        Ok(())
    }

    pub fn replies(&self) -> Vec<ReplySlot> {
        let count = self.header().reply_count.load(Ordering::Acquire) as usize;
        let count = count.min(self.header().reply_capacity as usize);
        (0..count)
            // SAFETY: i < count <= reply_capacity, all within the mapping.
            .map(|i| unsafe { *self.reply_base().add(i) })
            .collect()
    }
}
