// SPDX-License-Identifier: Apache-2.0 OR MIT

//! POSIX shared memory segment management.
//!
//! Safe wrapper around `shm_open`, `ftruncate`, and `mmap`, adapted from
//! the teacher's `transport::shm::segment::ShmSegment`. Unlike the
//! teacher's SPMC ring transport, this crate layers a refcounted block
//! array on top (see [`crate::shm::block`]), but the raw segment lifecycle
//! (create/open/unlink, zero-init on create, munmap on drop) is unchanged.
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.

use crate::error::{Error, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// POSIX shared memory segment wrapper.
///
/// Automatically unmaps the memory region on drop. Does NOT automatically
/// unlink the segment (caller's responsibility).
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapped region is designed for concurrent cross-process
// access; all shared state inside it is synchronized via atomics.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

/// Outcome of [`ShmSegment::create_exclusive`].
pub enum CreateOutcome {
    /// A fresh segment of the requested size was created.
    Created(ShmSegment),
    /// A segment with this name already existed; caller should attach.
    AlreadyExists,
}

impl ShmSegment {
    /// Exclusively create a new segment, distinguishing "already exists"
    /// from other failures so callers can implement the open-or-create
    /// protocol in §4.A without racing a separate `exists()` check.
    pub fn create_exclusive(name: &str, size: usize) -> Result<CreateOutcome> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| Error::InvalidSegmentName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; O_CREAT|O_EXCL
        // atomically fails with EEXIST if the segment is already present,
        // which is exactly the open-or-create discriminator we need.
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::AlreadyExists {
                return Ok(CreateOutcome::AlreadyExists);
            }
            return Err(Error::SegmentUnavailable(err));
        }

        // SAFETY: fd is a valid descriptor from the shm_open above; size is
        // caller-provided and bounded by the segment layout computation.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is still valid and not reused elsewhere.
            unsafe { libc::close(fd) };
            return Err(Error::SegmentUnavailable(err));
        }

        // SAFETY: fd has been sized to `size` bytes; MAP_SHARED makes the
        // mapping visible to any other process that opens the same name.
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

        // SAFETY: the mapping (success or failure) does not need fd kept open.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            let _ = Self::unlink(name);
            return Err(Error::SegmentUnavailable(io::Error::last_os_error()));
        }

        // SAFETY: ptr is a valid mapping of exactly `size` bytes that no
        // other thread can yet observe (segment was just created).
        unsafe {
            ptr::write_bytes(ptr as *mut u8, 0, size);
        }

        Ok(CreateOutcome::Created(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        }))
    }

    /// Open an existing shared memory segment.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| Error::InvalidSegmentName(name.to_string()))?;

        // SAFETY: c_name is valid; O_RDWR opens an existing segment only.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::SegmentUnavailable(io::Error::last_os_error()));
        }

        // SAFETY: fd is valid and sized by the creator; size is the
        // caller's expected layout size.
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
        // SAFETY: mapping holds its own reference once established.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::SegmentUnavailable(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            name: name.to_string(),
        })
    }

    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(Error::InvalidSegmentName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(Error::InvalidSegmentName(format!(
                "segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(Error::InvalidSegmentName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a shared memory segment by name. Idempotent: a
    /// not-found segment is not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| Error::InvalidSegmentName(name.to_string()))?;
        // SAFETY: shm_unlink only touches the filesystem namespace entry;
        // safe to call even if the segment does not exist.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(Error::SegmentUnavailable(err));
            }
        }
        Ok(())
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: read-only existence probe, fd closed immediately.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr/self.size come from a successful mmap in
        // create_exclusive/open and have not been unmapped before.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
        // We do NOT unlink here; the segment owner decides cleanup policy.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("/corobus_test_{ts}")
    }

    #[test]
    fn create_then_open_shares_memory() {
        let name = unique_name();
        let outcome = ShmSegment::create_exclusive(&name, 4096).expect("create failed");
        let CreateOutcome::Created(seg1) = outcome else {
            panic!("expected fresh create");
        };

        // SAFETY: seg1 is a valid 4096-byte mapping just created.
        unsafe {
            *seg1.as_ptr() = 0x42;
        }

        let seg2 = ShmSegment::open(&name, 4096).expect("open failed");
        // SAFETY: seg2 maps the same segment seg1 just wrote into.
        unsafe {
            assert_eq!(*seg2.as_ptr(), 0x42);
        }

        drop(seg1);
        drop(seg2);
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn create_exclusive_detects_existing() {
        let name = unique_name();
        let _seg = ShmSegment::create_exclusive(&name, 4096).expect("create failed");
        let second = ShmSegment::create_exclusive(&name, 4096).expect("should not error");
        assert!(matches!(second, CreateOutcome::AlreadyExists));
        ShmSegment::unlink(&name).ok();
    }

    #[test]
    fn unlink_is_idempotent() {
        let name = unique_name();
        let _seg = ShmSegment::create_exclusive(&name, 4096).expect("create failed");
        assert!(ShmSegment::unlink(&name).is_ok());
        assert!(ShmSegment::unlink(&name).is_ok());
    }

    #[test]
    fn validate_name_rules() {
        assert!(matches!(
            ShmSegment::open("no_leading_slash", 8),
            Err(Error::InvalidSegmentName(_))
        ));
        assert!(matches!(
            ShmSegment::open("/has/inner/slash", 8),
            Err(Error::InvalidSegmentName(_))
        ));
    }
}
