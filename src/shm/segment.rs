// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File-backed shared memory segment management.
//!
//! Main SHM and ext SHM (§4.A) are POSIX `shm_open` segments; event
//! channels (§4.E) are ordinary files under the run directory mapped the
//! same way. Both cases share this wrapper: it differs only in whether the
//! backing name is a `/name` POSIX shm object or a filesystem path.

use crate::error::Error;
use arc_swap::ArcSwap;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

/// One mmap'd view of a segment's backing file/shm object. Growth (§4.A)
/// never resizes this in place: it maps a fresh, larger view and publishes
/// it via [`Segment::mapping`]'s `ArcSwap`, so a thread mid-read through an
/// already-loaded `Arc<Mapping>` keeps a valid pointer until it drops that
/// guard, at which point this `Mapping`'s own backing memory unmaps.
struct Mapping {
    ptr: *mut u8,
    size: usize,
}

// SAFETY: the mapped region is shared memory synchronized by the locks and
// atomics defined on top of it (§4.B); the mapping itself is a dumb
// pointer+len and carries no thread-confined state.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/size were produced by a successful mmap and this is
        // the sole owner of that mapping (ArcSwap drops the Arc exactly
        // once all loaded guards have gone out of scope).
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// Where a segment's bytes live, kept around so [`Segment::grow`] can
/// reopen the backing object at a larger size.
enum Source {
    Posix(String),
    File(PathBuf),
}

/// A memory-mapped shared region, either POSIX `shm_open`-backed or a plain
/// file. Never unlinks (the owner decides the name's lifetime separately,
/// e.g. the Liveness & Recovery sweep in §4.G).
///
/// The current mapping lives behind an [`ArcSwap`] rather than a bare
/// pointer so that [`Segment::grow`] (§4.A ext-SHM growth, §4.E channel
/// growth) can publish a new, larger mapping without invalidating a
/// pointer a concurrent reader already snapshotted via [`Segment::as_ptr`].
pub struct Segment {
    mapping: ArcSwap<Mapping>,
    source: Source,
}

impl Segment {
    /// Create (or replace) a POSIX shm object of the given name and size.
    pub fn create_posix(name: &str, size: usize) -> Result<Self, Error> {
        validate_posix_name(name)?;
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalArg(format!("segment name contains NUL: {name}")))?;

        // SAFETY: c_name is NUL-terminated; shm_unlink of a nonexistent name
        // is harmless and ignored; O_CREAT|O_EXCL|O_RDWR with mode 0o600 are
        // well-defined POSIX shm_open arguments.
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR | libc::O_EXCL, 0o600)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mapping = Self::finish_create(fd, size)?;
        Ok(Self {
            mapping: ArcSwap::new(Arc::new(mapping)),
            source: Source::Posix(name.to_string()),
        })
    }

    /// Open an existing POSIX shm object.
    pub fn open_posix(name: &str, size: usize) -> Result<Self, Error> {
        validate_posix_name(name)?;
        let mapping = Self::map_posix(name, size)?;
        Ok(Self {
            mapping: ArcSwap::new(Arc::new(mapping)),
            source: Source::Posix(name.to_string()),
        })
    }

    /// Create (or truncate) a plain file-backed segment, used for event
    /// channels named per §6 under the run directory.
    pub fn create_file(path: &Path, size: usize) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::os::unix::io::AsRawFd;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(size as u64)?;
        let fd = file.as_raw_fd();
        let mapping = Self::map_fd(fd, size)?;
        // file's Drop closes fd after mmap already holds its own reference.
        Ok(Self {
            mapping: ArcSwap::new(Arc::new(mapping)),
            source: Source::File(path.to_path_buf()),
        })
    }

    /// Open an existing file-backed segment for mapping.
    pub fn open_file(path: &Path, size: usize) -> Result<Self, Error> {
        if !path.exists() {
            return Err(Error::NotFound(path.display().to_string()));
        }
        let mapping = Self::map_file(path, size)?;
        Ok(Self {
            mapping: ArcSwap::new(Arc::new(mapping)),
            source: Source::File(path.to_path_buf()),
        })
    }

    /// Remaps to a larger backing object, publishing the new mapping via
    /// the `ArcSwap` (§4.A growth: "computes the new size ... calls the
    /// platform remap"). A no-op if `new_size` does not exceed the current
    /// mapping's size. Concurrent readers holding an older `Arc<Mapping>`
    /// snapshot (via `as_ptr`/`size`) are unaffected; the old mapping
    /// unmaps once the last such snapshot drops.
    pub fn grow(&self, new_size: usize) -> Result<(), Error> {
        if new_size <= self.size() {
            return Ok(());
        }
        let mapping = match &self.source {
            Source::Posix(name) => Self::grow_posix(name, new_size)?,
            Source::File(path) => Self::grow_file(path, new_size)?,
        };
        self.mapping.store(Arc::new(mapping));
        Ok(())
    }

    fn finish_create(fd: i32, size: usize) -> Result<Mapping, Error> {
        // SAFETY: fd was just returned by a successful shm_open/open call.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and owned by this error path only.
            unsafe { libc::close(fd) };
            return Err(err.into());
        }
        Self::map_fd(fd, size)
    }

    fn map_posix(name: &str, size: usize) -> Result<Mapping, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalArg(format!("segment name contains NUL: {name}")))?;
        // SAFETY: c_name is NUL-terminated; O_RDWR against an existing
        // object is a well-defined POSIX shm_open call.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(Error::NotFound(name.to_string()));
            }
            return Err(err.into());
        }
        Self::map_fd(fd, size)
    }

    fn map_file(path: &Path, size: usize) -> Result<Mapping, Error> {
        use std::os::unix::io::AsRawFd;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();
        Self::map_fd(fd, size)
    }

    /// Reopens a POSIX shm object, grows its backing store to `new_size`,
    /// and maps the larger region.
    fn grow_posix(name: &str, new_size: usize) -> Result<Mapping, Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalArg(format!("segment name contains NUL: {name}")))?;
        // SAFETY: c_name is NUL-terminated; O_RDWR against an existing
        // object is a well-defined POSIX shm_open call.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: fd was just opened successfully above.
        let ret = unsafe { libc::ftruncate(fd, new_size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and owned by this error path only.
            unsafe { libc::close(fd) };
            return Err(err.into());
        }
        Self::map_fd(fd, new_size)
    }

    /// Grows a file-backed segment's backing file to `new_size` and maps
    /// the larger region.
    fn grow_file(path: &Path, new_size: usize) -> Result<Mapping, Error> {
        use std::os::unix::io::AsRawFd;
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        file.set_len(new_size as u64)?;
        let fd = file.as_raw_fd();
        Self::map_fd(fd, new_size)
    }

    fn map_fd(fd: i32, size: usize) -> Result<Mapping, Error> {
        // SAFETY: fd is a valid, open file descriptor; size is the caller's
        // intended mapping length; MAP_SHARED + PROT_READ|PROT_WRITE is a
        // standard shared read/write mapping.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: fd is valid; the mapping (if it succeeded) holds its own
        // reference, so closing fd here is safe either way.
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Mapping {
            ptr: ptr as *mut u8,
            size,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mapping.load().ptr
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.mapping.load().size
    }

    /// Unlink a POSIX shm object by name. Idempotent: missing name is not
    /// an error.
    pub fn unlink_posix(name: &str) -> Result<(), Error> {
        let c_name = CString::new(name)
            .map_err(|_| Error::InvalArg(format!("segment name contains NUL: {name}")))?;
        // SAFETY: c_name is NUL-terminated; shm_unlink only affects the
        // filesystem namespace entry, not existing mappings.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Unlink a file-backed segment by path. Idempotent.
    pub fn unlink_file(path: &Path) -> Result<(), Error> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Sweeps `run_dir` for `.sr`/`.sub` files whose magic header (§6) is
    /// missing, truncated, or fails [`crate::shm::layout::FileMagic::validate`]
    /// and unlinks them (§4.A.1). Run opportunistically, e.g. at connection
    /// bootstrap; a live peer's files always pass validation, so this never
    /// removes anything a running instance still needs. Returns the number
    /// of files removed.
    pub fn sweep_stale_run_dir(run_dir: &Path) -> Result<usize, Error> {
        use crate::shm::layout::FileMagic;
        use std::io::Read;

        let entries = match std::fs::read_dir(run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_candidate = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("sr") | Some("sub")
            );
            if !is_candidate {
                continue;
            }

            let mut file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(_) => continue,
            };
            let mut header = [0u8; std::mem::size_of::<FileMagic>()];
            let valid = matches!(file.read_exact(&mut header), Ok(())) && {
                // SAFETY: header is a plain, fully-initialized byte buffer
                // exactly the size of FileMagic; FileMagic is #[repr(C)]
                // with no padding-sensitive invariants beyond field values.
                let magic = unsafe { std::ptr::read(header.as_ptr() as *const FileMagic) };
                magic.validate().is_ok()
            };
            drop(file);

            if !valid {
                crate::warn!("unlinking stale/corrupt SHM file: {}", path.display());
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn validate_posix_name(name: &str) -> Result<(), Error> {
    if !name.starts_with('/') {
        return Err(Error::InvalArg(format!("segment name must start with '/': {name}")));
    }
    if name.len() > 1 && name[1..].contains('/') {
        return Err(Error::InvalArg(format!("segment name must have one path component: {name}")));
    }
    if name.len() > 255 {
        return Err(Error::InvalArg(format!("segment name too long: {name}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_posix_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/srsub_test_{ts}")
    }

    #[test]
    fn validate_name_rejects_bad_shapes() {
        assert!(validate_posix_name("/ok").is_ok());
        assert!(validate_posix_name("no_leading_slash").is_err());
        assert!(validate_posix_name("/a/b").is_err());
    }

    #[test]
    fn create_then_open_posix_shares_bytes() {
        let name = unique_posix_name();
        let w = Segment::create_posix(&name, 4096).unwrap();
        // SAFETY: w owns a 4096-byte mapping; offset 0 is in bounds.
        unsafe { *w.as_ptr() = 0x42 };
        let r = Segment::open_posix(&name, 4096).unwrap();
        // SAFETY: r maps the same segment w just wrote into.
        unsafe { assert_eq!(*r.as_ptr(), 0x42) };
        drop(w);
        drop(r);
        Segment::unlink_posix(&name).unwrap();
    }

    #[test]
    fn open_missing_posix_segment_is_not_found() {
        let err = Segment::open_posix("/srsub_definitely_missing", 4096).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn unlink_posix_is_idempotent() {
        let name = unique_posix_name();
        let _seg = Segment::create_posix(&name, 4096).unwrap();
        assert!(Segment::unlink_posix(&name).is_ok());
        assert!(Segment::unlink_posix(&name).is_ok());
    }

    #[test]
    fn file_segment_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.running.sub");
        let w = Segment::create_file(&path, 4096).unwrap();
        // SAFETY: w's mapping is 4096 bytes; offset 0 is in bounds.
        unsafe { *w.as_ptr() = 7 };
        drop(w);
        let r = Segment::open_file(&path, 4096).unwrap();
        // SAFETY: r maps the same file just written.
        unsafe { assert_eq!(*r.as_ptr(), 7) };
    }

    #[test]
    fn grow_file_segment_preserves_bytes_and_extends_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mod.oper.sub");
        let seg = Segment::create_file(&path, 4096).unwrap();
        // SAFETY: offset 0 is in bounds of a 4096-byte mapping.
        unsafe { *seg.as_ptr() = 9 };
        seg.grow(8192).unwrap();
        assert_eq!(seg.size(), 8192);
        // SAFETY: the grown mapping still covers offset 0, carried over
        // from the original file's contents.
        unsafe { assert_eq!(*seg.as_ptr(), 9) };
        // SAFETY: offset 4097 is only valid after growth.
        unsafe { *seg.as_ptr().add(4097) = 11 };
    }

    #[test]
    fn grow_posix_segment_is_a_noop_when_not_larger() {
        let name = unique_posix_name();
        let seg = Segment::create_posix(&name, 4096).unwrap();
        seg.grow(4096).unwrap();
        seg.grow(2048).unwrap();
        assert_eq!(seg.size(), 4096);
        Segment::unlink_posix(&name).unwrap();
    }

    #[test]
    fn sweep_removes_corrupt_files_and_keeps_valid_and_unrelated_ones() {
        use crate::shm::layout::FileMagic;

        let dir = tempfile::tempdir().unwrap();

        let good_path = dir.path().join("m.running.sub");
        {
            let magic = FileMagic::new(4096);
            let seg = Segment::create_file(&good_path, std::mem::size_of::<FileMagic>()).unwrap();
            // SAFETY: seg's mapping is exactly size_of::<FileMagic>() bytes.
            unsafe { std::ptr::write(seg.as_ptr() as *mut FileMagic, magic) };
        }

        let corrupt_path = dir.path().join("m.notif.sub");
        std::fs::write(&corrupt_path, b"not a valid header").unwrap();

        let unrelated_path = dir.path().join("notes.txt");
        std::fs::write(&unrelated_path, b"leave me alone").unwrap();

        let removed = Segment::sweep_stale_run_dir(dir.path()).unwrap();
        assert_eq!(removed, 1);
        assert!(good_path.exists());
        assert!(!corrupt_path.exists());
        assert!(unrelated_path.exists());
    }

    #[test]
    fn sweep_missing_run_dir_is_a_noop() {
        let removed = Segment::sweep_stale_run_dir(std::path::Path::new("/nonexistent/srsub-run-dir")).unwrap();
        assert_eq!(removed, 0);
    }
}
