// SPDX-FileCopyrightText: 2023 Linutronix GmbH
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Owned memory mappings
use anyhow::{anyhow, Context, Result};
use nix::libc::c_void;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::{self, NonNull};

/// A memory mapping that is unmapped again on drop
#[derive(Debug)]
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY:
// The region is plain memory without thread affinity. Concurrent access to the
// contents is coordinated by the ring protocol and the frame ownership tokens.
unsafe impl Send for MmapRegion {}
// SAFETY:
// See above, `MmapRegion` itself only hands out raw pointers.
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Page-aligned, zero-initialized private memory
    ///
    /// # Errors
    ///
    /// Will return `Err` if `len` is zero or the mapping fails.
    pub fn anonymous(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(anyhow!("Can not map an empty region"));
        }

        // SAFETY:
        // A fresh anonymous mapping does not alias any existing memory.
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .context("Failed to map anonymous memory")?;

        Self::from_raw(addr, len)
    }

    /// Shared mapping of `len` bytes of `fd` at page offset `offset`
    ///
    /// # Errors
    ///
    /// Will return `Err` if `len` is zero or the mapping fails.
    pub fn shared(fd: BorrowedFd<'_>, len: usize, offset: i64) -> Result<Self> {
        if len == 0 {
            return Err(anyhow!("Can not map an empty region"));
        }

        // SAFETY:
        // The kernel hands out a new mapping, nothing in this process aliases it yet.
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_POPULATE,
                fd.as_raw_fd(),
                offset,
            )
        }
        .with_context(|| format!("Failed to map {len} bytes at offset {offset:#x}"))?;

        Self::from_raw(addr, len)
    }

    fn from_raw(addr: *mut c_void, len: usize) -> Result<Self> {
        Ok(Self {
            ptr: NonNull::new(addr.cast::<u8>()).ok_or_else(|| anyhow!("mmap returned null"))?,
            len,
        })
    }

    /// Length in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Never true, an empty region can not be created
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Start of the mapping
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Pointer to `offset` if `size` bytes starting there lie within the mapping
    #[must_use]
    pub fn checked_ptr(&self, offset: usize, size: usize) -> Option<*mut u8> {
        let end = offset.checked_add(size)?;
        if end > self.len {
            return None;
        }
        // SAFETY:
        // offset + size is within the mapping as checked above.
        Some(unsafe { self.as_ptr().add(offset) })
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY:
        // The region was mapped with exactly this address and length and
        // all borrows of it are tied to the lifetime of self.
        if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } {
            log::warn!("Failed to unmap {} bytes: {}", self.len, e);
        }
    }
}
