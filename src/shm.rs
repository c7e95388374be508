//! Low-level POSIX shared memory operations

use crate::error::{FramelinkError, Result};
use rustix::fd::OwnedFd;
use rustix::fs::{fstat, ftruncate};
use rustix::mm::{madvise, mlock, mmap, munmap, Advice, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::CString;
use std::ptr::NonNull;

/// POSIX limit for shared-memory object names
const MAX_NAME_LEN: usize = 255;

/// Mapping strategy for a region.
///
/// Huge pages and page locking are best-effort: a failed `MAP_HUGETLB`
/// attempt falls back to ordinary pages, a failed `mlock` is ignored.
#[derive(Clone, Copy, Debug, Default)]
pub struct MapOptions {
    /// Attempt a 2 MiB huge-page backed mapping first
    pub huge_pages: bool,
    /// Pre-populate page tables (`MAP_POPULATE`)
    pub populate: bool,
    /// Lock pages resident (`mlock`)
    pub lock: bool,
}

/// Handle to a shared memory region
pub struct ShmRegion {
    #[allow(dead_code)]
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
    huge_pages: bool,
}

// SAFETY: ShmRegion can be safely shared between threads
// The shared memory region itself is synchronized via atomic operations
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create a new shared memory region.
    ///
    /// Any stale object with the same name is unlinked first; creation is
    /// then exclusive, so the caller ends up owning a fresh, zeroed region.
    ///
    /// # Arguments
    /// * `name` - Shared memory object name with leading slash (e.g. `/sensor`)
    /// * `size` - Size in bytes
    /// * `opts` - Mapping strategy (huge pages, populate, lock)
    pub fn create(name: &str, size: usize, opts: MapOptions) -> Result<Self> {
        if name.len() > MAX_NAME_LEN {
            return Err(FramelinkError::NameTooLong {
                max: MAX_NAME_LEN,
                got: name.len(),
            });
        }

        let c_name = CString::new(name).map_err(|e| FramelinkError::ShmCreate {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        // Remove any stale object left by a crashed owner
        let _ = shm_unlink(c_name.as_c_str());

        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH,
        )
        .map_err(|e| FramelinkError::ShmCreate {
            name: name.to_string(),
            source: e.into(),
        })?;

        if let Err(e) = ftruncate(&fd, size as u64) {
            let _ = shm_unlink(c_name.as_c_str());
            return Err(FramelinkError::Truncate(e.into()));
        }

        let (addr, huge_pages) = match Self::map(&fd, size, true, opts) {
            Ok(mapping) => mapping,
            Err(e) => {
                let _ = shm_unlink(c_name.as_c_str());
                return Err(e);
            }
        };

        // Zero initialize
        unsafe {
            std::ptr::write_bytes(addr.as_ptr(), 0, size);
        }

        log::debug!(
            "created shm region '{}' ({} bytes, huge_pages={})",
            name,
            size,
            huge_pages
        );

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
            huge_pages,
        })
    }

    /// Open an existing shared memory region read-write
    pub fn open(name: &str) -> Result<Self> {
        let c_name = CString::new(name).map_err(|e| FramelinkError::ShmOpen {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            FramelinkError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let size = Self::queried_size(&fd, name)?;
        let (addr, huge_pages) = Self::map(&fd, size, true, MapOptions::default())?;

        log::debug!("opened shm region '{}' ({} bytes)", name, size);

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
            huge_pages,
        })
    }

    /// Open an existing shared memory region read-only.
    ///
    /// When `try_huge_pages` is set, a huge-page mapping is attempted first
    /// and falls back transparently (used when the writer's region may be
    /// huge-page backed).
    pub fn open_read_only(name: &str, try_huge_pages: bool) -> Result<Self> {
        let c_name = CString::new(name).map_err(|e| FramelinkError::ShmOpen {
            name: name.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
        })?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDONLY, Mode::empty()).map_err(|e| {
            FramelinkError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let size = Self::queried_size(&fd, name)?;
        let opts = MapOptions {
            huge_pages: try_huge_pages,
            ..MapOptions::default()
        };
        let (addr, huge_pages) = Self::map(&fd, size, false, opts)?;

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
            huge_pages,
        })
    }

    fn queried_size(fd: &OwnedFd, name: &str) -> Result<usize> {
        let stat = fstat(fd).map_err(|e| FramelinkError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        Ok(stat.st_size as usize)
    }

    /// Map the region, attempting huge pages first when requested.
    ///
    /// Returns the mapping address and whether it is huge-page backed.
    fn map(fd: &OwnedFd, size: usize, writable: bool, opts: MapOptions) -> Result<(NonNull<u8>, bool)> {
        let prot = if writable {
            ProtFlags::READ | ProtFlags::WRITE
        } else {
            ProtFlags::READ
        };
        let mut flags = MapFlags::SHARED;
        if opts.populate {
            flags |= MapFlags::POPULATE;
        }

        let mut huge = false;
        let mut mapped: Option<*mut std::ffi::c_void> = None;

        if opts.huge_pages {
            if let Ok(addr) = unsafe {
                mmap(
                    std::ptr::null_mut(),
                    size,
                    prot,
                    flags | MapFlags::HUGETLB,
                    fd,
                    0,
                )
            } {
                mapped = Some(addr);
                huge = true;
            }
        }

        let addr = match mapped {
            Some(addr) => addr,
            None => unsafe {
                mmap(std::ptr::null_mut(), size, prot, flags, fd, 0)
                    .map_err(|e| FramelinkError::Mmap(e.into()))?
            },
        };

        if opts.lock {
            // Best-effort: failure to lock pages resident is not fatal
            let _ = unsafe { mlock(addr, size) };
        }
        let _ = unsafe { madvise(addr, size, Advice::Sequential) };
        let _ = unsafe { madvise(addr, size, Advice::WillNeed) };

        let addr = NonNull::new(addr.cast::<u8>()).expect("mmap returned null");
        Ok((addr, huge))
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of shared memory
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Whether the mapping is huge-page backed
    #[inline(always)]
    pub fn is_huge_page_backed(&self) -> bool {
        self.huge_pages
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        // Unmap memory
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // If owner, unlink the shared memory
        if self.is_owner {
            if let Ok(c_name) = CString::new(self.name.clone()) {
                let _ = shm_unlink(c_name.as_c_str());
            }
        }
    }
}
