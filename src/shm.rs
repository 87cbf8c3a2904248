//! Low-level POSIX shared memory operations

use crate::error::{Result, SimlinkError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

const SHM_PREFIX: &str = "/simlink_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Handle to a shared memory segment
///
/// The creating side (producer) owns the segment name and is the only side
/// allowed to unlink it; the opening side (consumer) only ever maps and
/// unmaps. `unlink` is explicit and idempotent so the producer can order the
/// release after the shutdown acknowledgment instead of leaving it to drop
/// timing.
pub struct ShmSegment {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
    unlinked: bool,
}

// SAFETY: ShmSegment can be safely shared between threads.
// Concurrent access to the mapped bytes is governed by the single-writer /
// single-reader discipline of the callers plus atomic flag publication.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new shared memory segment
    ///
    /// The name is prefixed with "/simlink_" and must be unique process-wide:
    /// creation is exclusive, so a duplicate name fails with `ShmCreate`
    /// rather than silently reusing a leaked segment.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(SimlinkError::SegmentNameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }

        let c_name = c_name(name);
        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
        )
        .map_err(|e| SimlinkError::ShmCreate {
            name: name.to_string(),
            source: e.into(),
        })?;

        ftruncate(&fd, size as u64).map_err(|e| SimlinkError::Truncate(e.into()))?;

        let addr = map(&fd, size)?;

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
            unlinked: false,
        })
    }

    /// Open an existing shared memory segment
    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_name(name);
        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            SimlinkError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| SimlinkError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;

        let addr = map(&fd, size)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
            unlinked: false,
        })
    }

    /// Get raw pointer to the mapped bytes
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of the segment in bytes
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the (unprefixed) segment name
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns the segment name
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Remove the segment name from the OS (owner side only)
    ///
    /// Idempotent: a second call, or a call racing an already-removed name,
    /// is a no-op. The mapping itself stays valid until drop.
    pub fn unlink(&mut self) {
        if self.is_owner && !self.unlinked {
            let _ = shm_unlink(c_name(&self.name).as_c_str());
            self.unlinked = true;
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.unlink();
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }
    }
}

fn c_name(name: &str) -> CString {
    // Segment names never contain NUL: they are built from a fixed prefix,
    // the process id and a counter.
    CString::new(format!("{SHM_PREFIX}{name}")).unwrap_or_default()
}

fn map(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = unsafe {
        mmap(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            fd,
            0,
        )
        .map_err(|e| SimlinkError::Mmap(e.into()))?
    };
    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| SimlinkError::Mmap(std::io::Error::other("mmap returned null")))
}

static SEGMENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Build a segment name that is unique for the life of this process
pub(crate) fn unique_name(tag: &str) -> String {
    let n = SEGMENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}_{}_{}", std::process::id(), n, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_open() {
        let name = unique_name("shm_create");
        let size = 4096;

        let shm1 = ShmSegment::create(&name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr(), 42u8);
        }

        let shm2 = ShmSegment::open(&name).unwrap();
        assert!(!shm2.is_owner());

        let val = unsafe { std::ptr::read(shm2.as_ptr()) };
        assert_eq!(val, 42u8);

        drop(shm2);
        drop(shm1);
        assert!(ShmSegment::open(&name).is_err());
    }

    #[test]
    fn duplicate_name_is_fatal() {
        let name = unique_name("shm_dup");
        let _shm = ShmSegment::create(&name, 64).unwrap();
        assert!(matches!(
            ShmSegment::create(&name, 64),
            Err(SimlinkError::ShmCreate { .. })
        ));
    }

    #[test]
    fn double_unlink_is_a_noop() {
        let name = unique_name("shm_unlink");
        let mut shm = ShmSegment::create(&name, 64).unwrap();
        shm.unlink();
        shm.unlink();
        assert!(ShmSegment::open(&name).is_err());
    }

    #[test]
    fn name_too_long() {
        let name = "x".repeat(300);
        assert!(matches!(
            ShmSegment::create(&name, 64),
            Err(SimlinkError::SegmentNameTooLong { .. })
        ));
    }
}
