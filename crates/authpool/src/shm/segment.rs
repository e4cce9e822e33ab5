// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Provides safe wrappers around `shm_open`, `ftruncate`, and `mmap`.
//!
//! # Segment Lifecycle
//!
//! 1. The first process to need the table calls `ShmSegment::open_or_create()`;
//!    a fresh segment is zero-filled by the kernel
//! 2. Every later process maps the same segment with `open_or_create()` or
//!    `open()` (diagnostic tools)
//! 3. The mapping is released on drop
//! 4. The segment name survives until `ShmSegment::unlink()`, so a restarted
//!    worker pool finds the table its clients are still using
//!
//! `ShmSegment::anonymous()` maps a `MAP_SHARED | MAP_ANONYMOUS` region
//! instead. It is shared with forked children and with every thread of the
//! host process, which is all a single-process host needs.
//!
//! # Naming Convention
//!
//! Segment names must start with `/` and contain no other `/`.
//! Example: `/authpool_clientauth`

use super::ShmError;
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

type Result<T> = std::result::Result<T, ShmError>;

/// POSIX shared memory mapping.
///
/// Automatically unmaps the memory region on drop.
/// Does NOT unlink the segment name.
pub struct ShmSegment {
    /// Pointer to mapped memory region
    ptr: *mut u8,
    /// Size of the mapping
    size: usize,
    /// Segment name, empty for anonymous mappings
    name: String,
}

// SAFETY: the mapping is process-wide and stays valid until drop. All data
// placed in it is synchronized through atomics and the table lock.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Open a named segment, creating and sizing it if it does not exist yet.
    ///
    /// Returns the mapping and whether this call sized a fresh segment.
    ///
    /// # Errors
    ///
    /// Returns error if the segment exists with a different size, or if
    /// creation or mapping fails.
    pub fn open_or_create(name: &str, size: usize) -> Result<(Self, bool)> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString
        // - O_CREAT|O_RDWR opens the existing object or creates an empty one
        // - 0o600 restricts access to the owning user
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        let result = Self::size_and_map(fd, name, size);

        // SAFETY: fd came from the successful shm_open above and is closed
        // exactly once; an established mapping keeps its own reference.
        unsafe { libc::close(fd) };

        result
    }

    fn size_and_map(fd: libc::c_int, name: &str, size: usize) -> Result<(Self, bool)> {
        let actual = fd_size(fd).map_err(ShmError::SegmentOpen)?;

        let created = if actual == 0 {
            // SAFETY: fd is a valid descriptor opened read-write. Two racing
            // creators truncate to the same size, which is idempotent.
            let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
            if ret < 0 {
                return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
            }
            true
        } else if actual != size {
            return Err(ShmError::SizeMismatch {
                expected: size,
                actual,
            });
        } else {
            false
        };

        let ptr = map_shared(fd, size, 0)?;
        Ok((
            Self {
                ptr,
                size,
                name: name.to_string(),
            },
            created,
        ))
    }

    /// Open an existing shared memory segment.
    ///
    /// # Errors
    ///
    /// Returns error if the segment doesn't exist, is smaller than `size`,
    /// or mapping fails.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY:
        // - c_name is a valid null-terminated CString
        // - Mode 0 is ignored when O_CREAT is not specified
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        let result = fd_size(fd)
            .map_err(ShmError::SegmentOpen)
            .and_then(|actual| {
                if actual < size {
                    Err(ShmError::SizeMismatch {
                        expected: size,
                        actual,
                    })
                } else {
                    map_shared(fd, size, 0)
                }
            });

        // SAFETY: fd is valid and closed exactly once.
        unsafe { libc::close(fd) };

        Ok(Self {
            ptr: result?,
            size,
            name: name.to_string(),
        })
    }

    /// Map an anonymous shared region of `size` zeroed bytes.
    ///
    /// # Errors
    ///
    /// Returns error if mapping fails.
    pub fn anonymous(size: usize) -> Result<Self> {
        let ptr = map_shared(-1, size, libc::MAP_ANONYMOUS)?;
        Ok(Self {
            ptr,
            size,
            name: String::new(),
        })
    }

    /// Validate segment name follows POSIX rules
    fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(ShmError::InvalidName(format!(
                "Segment name cannot contain '/' after prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(ShmError::InvalidName(format!(
                "Segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink (delete) a shared memory segment by name.
    ///
    /// The memory is released once every process has unmapped it.
    ///
    /// # Errors
    ///
    /// Returns error if unlink fails (segment not found is not an error).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid null-terminated CString; shm_unlink only
        // touches the filesystem namespace.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            // Not found is OK (idempotent cleanup)
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }

        Ok(())
    }

    /// Check if a segment with the given name exists
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };

        // SAFETY: c_name is a valid null-terminated CString; O_RDONLY without
        // O_CREAT never creates anything.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };

        if fd >= 0 {
            // SAFETY: fd is valid and not used afterwards
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    /// Get raw pointer to the mapped memory
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Get the size of the mapping
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the segment name (empty for anonymous mappings)
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this mapping has no name in the shm namespace
    #[inline]
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly what mmap returned/received, and Drop
        // runs once.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

fn fd_size(fd: libc::c_int) -> io::Result<usize> {
    let mut stat = MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fd is a valid descriptor and stat points to writable storage
    // large enough for struct stat.
    let ret = unsafe { libc::fstat(fd, stat.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fstat succeeded, so the struct is fully initialized
    let stat = unsafe { stat.assume_init() };
    Ok(stat.st_size as usize)
}

fn map_shared(fd: libc::c_int, size: usize, extra_flags: libc::c_int) -> Result<*mut u8> {
    // SAFETY:
    // - a null hint lets the kernel pick a page-aligned address
    // - fd is either a valid descriptor sized to at least `size`, or -1 with
    //   MAP_ANONYMOUS
    // - MAP_SHARED makes writes visible to every process mapping the object
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | extra_flags,
            fd,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Mmap(io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}
