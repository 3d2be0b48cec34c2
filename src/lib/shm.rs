//! # Shared Memory Buffer Objects
//!
//! Every byte exchanged with the remote renderer lives in a POSIX shared
//! memory segment: the ring itself, indirect command buffers, and the reply
//! buffer. This module owns the mapping lifecycle and hands out [`Bo`]
//! handles, which are reference counted so that a buffer stays mapped for as
//! long as any submission still points at it.
//!
//! ```text
//!    Driver Process                  Shared Memory                 Renderer
//! +------------------+           +------------------+         +------------------+
//! |  Bo (res_id 7)   | --mmap--> |  /vnstream-..-7  | <-mmap- |  resource 7      |
//! |  Arc refcount    |           |  [ bytes ...   ] |         |  (own mapping)   |
//! +------------------+           +------------------+         +------------------+
//! ```

use std::ffi::{c_void, CString};
use std::fmt;
use std::num::NonZeroUsize;
use std::os::unix::io::{FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Weak};

use libc::{shm_open, shm_unlink, O_CREAT, O_EXCL, O_RDWR};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;

use crate::error::{Error, Result};

/// A mapped POSIX shared memory segment.
pub struct SharedMemory {
    /// Name of shared memory region
    name: String,
    /// Pointer to mapped memory
    base_ptr: *mut u8,
    /// Size of mapped region
    size: usize,
    /// Whether this mapping created (and will unlink) the segment
    is_creator: bool,
}

// The mapping is plain memory; concurrent access is coordinated by the
// protocol (atomics for cursors, ownership handoff for payloads).
unsafe impl Send for SharedMemory {}
unsafe impl Sync for SharedMemory {}

fn shm_name(name: &str) -> Result<(String, CString)> {
    let shm_name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    let c_name = CString::new(shm_name.clone())
        .map_err(|_| Error::Shm(format!("invalid shm name {:?}", shm_name)))?;
    Ok((shm_name, c_name))
}

fn map_fd(fd: &OwnedFd, size: usize) -> Result<*mut u8> {
    let len = NonZeroUsize::new(size).ok_or_else(|| Error::Shm("zero-sized mapping".into()))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            Some(fd),
            0,
        )
    }
    .map_err(|e| match e {
        nix::Error::ENOMEM => Error::OutOfDeviceMemory,
        other => Error::Shm(format!("mmap failed: {}", other)),
    })?;
    Ok(ptr as *mut u8)
}

impl SharedMemory {
    /// Creates and maps a new zero-filled segment of `size` bytes.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let (shm_name, c_name) = shm_name(name)?;

        // Try to unlink any stale segment left behind by a crashed run
        unsafe {
            shm_unlink(c_name.as_ptr());
        }

        let fd = unsafe { shm_open(c_name.as_ptr(), O_CREAT | O_EXCL | O_RDWR, 0o600) };
        if fd < 0 {
            return Err(Error::Shm(format!(
                "shm_open {} failed: {}",
                shm_name,
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mapped = ftruncate(&fd, size as i64)
            .map_err(|e| Error::Shm(format!("ftruncate failed: {}", e)))
            .and_then(|_| map_fd(&fd, size));
        let base_ptr = match mapped {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    shm_unlink(c_name.as_ptr());
                }
                return Err(err);
            }
        };

        // The mapping keeps the segment alive; the fd closes when dropped here.
        Ok(Self {
            name: shm_name,
            base_ptr,
            size,
            is_creator: true,
        })
    }

    /// Maps an existing segment created by someone else.
    pub fn open(name: &str) -> Result<Self> {
        let (shm_name, c_name) = shm_name(name)?;

        let fd = unsafe { shm_open(c_name.as_ptr(), O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::Shm(format!(
                "shm_open {} failed: {}",
                shm_name,
                std::io::Error::last_os_error()
            )));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let stat = fstat(std::os::fd::AsRawFd::as_raw_fd(&fd))
            .map_err(|e| Error::Shm(format!("fstat failed: {}", e)))?;
        let size = stat.st_size as usize;
        let base_ptr = map_fd(&fd, size)?;

        Ok(Self {
            name: shm_name,
            base_ptr,
            size,
            is_creator: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn check_range(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).map_or(false, |end| end <= self.size),
            "access [{}, +{}) out of bounds of {} byte segment {}",
            offset,
            len,
            self.size,
            self.name
        );
    }

    /// Copies `data` into the segment at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.check_range(offset, data.len());
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base_ptr.add(offset), data.len());
        }
    }

    /// Copies bytes at `offset` out of the segment into `out`.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.check_range(offset, out.len());
        unsafe {
            ptr::copy_nonoverlapping(self.base_ptr.add(offset), out.as_mut_ptr(), out.len());
        }
    }

    /// Atomic view of the 4 bytes at `offset`, which must be 4-byte aligned.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.check_range(offset, 4);
        assert_eq!(offset % 4, 0, "unaligned atomic at offset {}", offset);
        unsafe { &*(self.base_ptr.add(offset) as *const AtomicU32) }
    }

    /// Zero the whole segment.
    pub fn clear(&self) {
        unsafe {
            ptr::write_bytes(self.base_ptr, 0, self.size);
        }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if !self.base_ptr.is_null() {
            unsafe {
                let _ = munmap(self.base_ptr as *mut c_void, self.size);
            }
        }

        // Unlink shared memory if we created it
        if self.is_creator {
            if let Ok(c_name) = CString::new(self.name.clone()) {
                unsafe {
                    shm_unlink(c_name.as_ptr());
                }
            }
        }
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

struct BoInner {
    res_id: u32,
    mem: SharedMemory,
}

/// A reference-counted buffer object the remote side knows by `res_id`.
///
/// Cloning adds a reference. The mapping goes away when the last clone is
/// dropped, so a `Bo` captured by an in-flight submission keeps its bytes
/// valid until the submission retires.
#[derive(Clone)]
pub struct Bo {
    inner: Arc<BoInner>,
}

impl Bo {
    pub fn new(res_id: u32, mem: SharedMemory) -> Self {
        Self {
            inner: Arc::new(BoInner { res_id, mem }),
        }
    }

    pub fn res_id(&self) -> u32 {
        self.inner.res_id
    }

    pub fn size(&self) -> usize {
        self.inner.mem.size()
    }

    pub fn shm_name(&self) -> &str {
        self.inner.mem.name()
    }

    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        self.inner.mem.write_bytes(offset, data)
    }

    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        self.inner.mem.read_bytes(offset, out)
    }

    pub fn read_vec(&self, offset: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.read_bytes(offset, &mut out);
        out
    }

    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        self.inner.mem.atomic_u32(offset)
    }

    pub fn clear(&self) {
        self.inner.mem.clear()
    }

    /// Number of live handles to this buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Bo) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakBo {
        WeakBo {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// A handle that does not keep the buffer mapped.
#[derive(Clone)]
pub struct WeakBo {
    inner: Weak<BoInner>,
}

impl WeakBo {
    /// Whether every [`Bo`] clone is gone.
    pub fn is_dropped(&self) -> bool {
        self.inner.strong_count() == 0
    }
}

impl fmt::Debug for Bo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bo")
            .field("res_id", &self.inner.res_id)
            .field("size", &self.inner.mem.size())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn unique(name: &str) -> String {
        format!("/vnstream_test_{}_{}", name, std::process::id())
    }

    #[test]
    fn test_create_open_share_bytes() {
        let name = unique("share");
        let creator = SharedMemory::create(&name, 4096).unwrap();
        let other = SharedMemory::open(&name).unwrap();
        assert_eq!(other.size(), 4096);

        creator.write_bytes(100, b"venus");
        let mut out = [0u8; 5];
        other.read_bytes(100, &mut out);
        assert_eq!(&out, b"venus");
    }

    #[test]
    fn test_atomic_view_is_shared() {
        let name = unique("atomic");
        let creator = SharedMemory::create(&name, 4096).unwrap();
        let other = SharedMemory::open(&name).unwrap();

        creator.atomic_u32(64).store(42, Ordering::Release);
        assert_eq!(other.atomic_u32(64).load(Ordering::Acquire), 42);
    }

    #[test]
    #[should_panic]
    fn test_out_of_bounds_write_panics() {
        let name = unique("oob");
        let mem = SharedMemory::create(&name, 4096).unwrap();
        mem.write_bytes(4090, &[0u8; 16]);
    }

    #[test]
    fn test_open_survives_creator_unlink() {
        let name = unique("unlink");
        let creator = SharedMemory::create(&name, 4096).unwrap();
        let other = SharedMemory::open(&name).unwrap();
        creator.write_bytes(0, &[7u8; 4]);
        drop(creator);

        let mut out = [0u8; 4];
        other.read_bytes(0, &mut out);
        assert_eq!(out, [7u8; 4]);
        assert!(SharedMemory::open(&name).is_err());
    }

    #[test]
    fn test_bo_refcount() {
        let name = unique("bo");
        let bo = Bo::new(3, SharedMemory::create(&name, 4096).unwrap());
        assert_eq!(bo.ref_count(), 1);
        let held = bo.clone();
        assert_eq!(bo.ref_count(), 2);
        assert!(held.ptr_eq(&bo));
        drop(held);
        assert_eq!(bo.ref_count(), 1);
        assert_eq!(bo.res_id(), 3);
    }

    #[test]
    fn test_weak_bo_tracks_last_clone() {
        let name = unique("weak");
        let bo = Bo::new(4, SharedMemory::create(&name, 4096).unwrap());
        let weak = bo.downgrade();
        let held = bo.clone();
        drop(bo);
        assert!(!weak.is_dropped());
        drop(held);
        assert!(weak.is_dropped());
    }
}
