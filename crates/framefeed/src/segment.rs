// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 framefeed contributors

//! Anchor-file management: create, map, and tear down the `/dev/shm` file
//! backing a feed segment.
//!
//! The anchor is an ordinary file on a RAM-backed tmpfs, created with the
//! standard `open`/`ftruncate`/`mmap` sequence. Keeping it a plain path
//! (rather than a POSIX shm object name) is what allows teardown to rename
//! it out of the namespace before unmapping.

use crate::{FeedError, Result};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

/// One process's mapping of a segment file.
///
/// Unmaps on drop. Never touches the file itself; archival and unlink are
/// explicit steps owned by the teardown protocol.
pub(crate) struct SegmentMap {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is shared memory designed for concurrent access from
// many processes; everything mutable inside it is an atomic or futex word.
unsafe impl Send for SegmentMap {}
unsafe impl Sync for SegmentMap {}

fn c_path(path: &Path) -> CString {
    // Anchor paths come from `anchor_path`, which never produces interior
    // NUL bytes.
    CString::new(path.as_os_str().as_bytes()).unwrap_or_default()
}

impl SegmentMap {
    /// Create the anchor file and map it read/write shared.
    ///
    /// Fails with [`FeedError::AlreadyExists`]-level `io::Error` mapping if
    /// the file exists (`O_EXCL`); the caller translates that. On any later
    /// failure the half-made anchor is unlinked so the name stays usable.
    pub(crate) fn create(path: &Path, len: usize) -> Result<Self> {
        let c = c_path(path);

        // SAFETY: c is a valid NUL-terminated path. O_EXCL makes creation
        // atomic; mode 0o700 gives the owner read/write/execute as the
        // anchor-file contract specifies.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o700 as libc::c_uint) };
        if fd < 0 {
            return Err(FeedError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is the descriptor opened above; len is the computed
        // segment size.
        let rc = unsafe { libc::ftruncate(fd, len as libc::off_t) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open; c is the path we just created.
            unsafe {
                libc::close(fd);
                libc::unlink(c.as_ptr());
            }
            return Err(FeedError::SegmentCreate(err));
        }

        // SAFETY: fd is open and sized to len; a MAP_SHARED read/write
        // mapping of [0, len) is what every mapper of this segment uses.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: the mapping (if any) holds its own reference; fd is no
        // longer needed either way.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            // SAFETY: c names the file created above.
            unsafe { libc::unlink(c.as_ptr()) };
            return Err(FeedError::Mmap(err));
        }

        // SAFETY: ptr..ptr+len is our freshly created private view; zero
        // fill puts every lock word in its unlocked state.
        unsafe { ptr::write_bytes(ptr as *mut u8, 0, len) };

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Map an existing anchor file read/write shared.
    ///
    /// The length is taken from the file itself; the caller validates it
    /// against the header's own arithmetic. Read/write even for consumers:
    /// acquiring the in-segment locks mutates their futex words.
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let c = c_path(path);

        // SAFETY: c is a valid NUL-terminated path.
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_RDWR) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(FeedError::NotFound(path.display().to_string()));
            }
            return Err(FeedError::SegmentOpen(err));
        }

        // SAFETY: fd is open; seeking to the end reports the segment size
        // chosen by the creator's ftruncate.
        let end = unsafe { libc::lseek(fd, 0, libc::SEEK_END) };
        if end < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is open.
            unsafe { libc::close(fd) };
            return Err(FeedError::SegmentOpen(err));
        }
        let len = end as usize;

        // SAFETY: fd is open and len is its current size.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        // SAFETY: mapping holds its own reference.
        unsafe { libc::close(fd) };

        if ptr == libc::MAP_FAILED {
            return Err(FeedError::Mmap(io::Error::last_os_error()));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SegmentMap {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Move the anchor aside so no new `open` can reach the segment while
/// teardown proceeds. Returns false (and logs) on failure; teardown
/// continues best-effort.
pub(crate) fn archive_anchor(path: &Path, archived: &Path) -> bool {
    let from = c_path(path);
    let to = c_path(archived);
    // SAFETY: both are valid NUL-terminated paths; rename is atomic within
    // the tmpfs.
    let rc = unsafe { libc::rename(from.as_ptr(), to.as_ptr()) };
    if rc != 0 {
        log::error!(
            "could not archive {} during teardown: {}",
            path.display(),
            io::Error::last_os_error()
        );
        return false;
    }
    true
}

/// Remove an anchor (live or archived). Missing files are not an error.
pub(crate) fn unlink_anchor(path: &Path) {
    let c = c_path(path);
    // SAFETY: c is a valid NUL-terminated path.
    let rc = unsafe { libc::unlink(c.as_ptr()) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::NotFound {
            log::warn!("could not unlink {}: {}", path.display(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unique_path(tag: &str) -> PathBuf {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PathBuf::from(format!("/dev/shm/framefeed_test_{tag}_{ts}"))
    }

    #[test]
    fn test_create_and_open_share_bytes() {
        let path = unique_path("share");
        let a = SegmentMap::create(&path, 4096).expect("create");
        assert_eq!(a.len(), 4096);

        // SAFETY: offsets 0 and 1 are inside the 4096-byte mapping.
        unsafe {
            *a.as_ptr() = 0x42;
            *a.as_ptr().add(1) = 0x43;
        }

        let b = SegmentMap::open(&path).expect("open");
        assert_eq!(b.len(), 4096);
        // SAFETY: same mapping, same bounds.
        unsafe {
            assert_eq!(*b.as_ptr(), 0x42);
            assert_eq!(*b.as_ptr().add(1), 0x43);
        }

        drop(a);
        drop(b);
        unlink_anchor(&path);
    }

    #[test]
    fn test_create_refuses_existing() {
        let path = unique_path("excl");
        let _a = SegmentMap::create(&path, 4096).expect("create");
        assert!(matches!(
            SegmentMap::create(&path, 4096),
            Err(FeedError::SegmentCreate(_))
        ));
        unlink_anchor(&path);
    }

    #[test]
    fn test_open_missing_is_not_found() {
        let path = unique_path("missing");
        assert!(matches!(
            SegmentMap::open(&path),
            Err(FeedError::NotFound(_))
        ));
    }

    #[test]
    fn test_archive_then_unlink() {
        let path = unique_path("arch");
        let archived = PathBuf::from(format!("{}-archived", path.display()));
        let map = SegmentMap::create(&path, 4096).expect("create");

        assert!(archive_anchor(&path, &archived));
        assert!(!path.exists());
        assert!(archived.exists());

        drop(map);
        unlink_anchor(&archived);
        assert!(!archived.exists());
    }

    #[test]
    fn test_unlink_missing_is_silent() {
        unlink_anchor(&unique_path("gone"));
    }
}
