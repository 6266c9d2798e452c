//! Memory regions shared between guest and host.

use nix::sys::mman::{mlock, mmap, MapFlags, ProtFlags};
use std::{
    ptr::{self, NonNull},
    slice,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShmemError {
    #[error("refusing to map an empty region")]
    Empty,
    #[error("failed to map {len:#x} bytes: {source}")]
    Map { len: usize, source: nix::Error },
    #[error("failed to lock {len:#x} bytes: {source}")]
    Lock { len: usize, source: nix::Error },
}

/// Page-aligned, zero-initialized anonymous mapping the host reads or writes by
/// guest virtual address.
///
/// Regions are never unmapped: their lifetime is the lifetime of the fuzzing
/// session, and the host's snapshot restore resets them, not the agent.
#[derive(Debug)]
pub struct SharedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The host only touches a region while the guest is suspended in a hypercall.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Maps `len` bytes, readable and writable, shared and anonymous.
    pub fn map(len: usize) -> Result<Self, ShmemError> {
        if len == 0 {
            return Err(ShmemError::Empty);
        }
        let addr = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        }
        .map_err(|source| ShmemError::Map { len, source })?;
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or(ShmemError::Map {
            len,
            source: nix::Error::from(nix::errno::Errno::EINVAL),
        })?;
        // Anonymous mappings are zero filled already, the explicit clear also
        // faults every page in before the host first touches it.
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, len) };
        Ok(Self { ptr, len })
    }

    /// Pins the region into physical memory.
    pub fn lock(&self) -> Result<(), ShmemError> {
        unsafe { mlock(self.ptr.as_ptr() as *const _, self.len) }
            .map_err(|source| ShmemError::Lock {
                len: self.len,
                source,
            })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Guest virtual address, as registered with the host.
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The caller must not hold the slice across a hypercall that lets the host
    /// write the region, nor alias it with a concurrent write from the guest.
    pub unsafe fn as_slice(&self) -> &[u8] {
        slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// Copies as much of `src` as fits to the start of the region.
    pub fn fill_from(&self, src: &[u8]) -> usize {
        let n = src.len().min(self.len);
        if src.as_ptr() != self.ptr.as_ptr() as *const u8 {
            unsafe { ptr::copy(src.as_ptr(), self.ptr.as_ptr(), n) };
        }
        n
    }

    /// Volatile byte store, the host observes the region asynchronously.
    pub fn set_byte(&self, offset: usize, val: u8) {
        assert!(offset < self.len, "offset {} out of region", offset);
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset), val) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_zeroed_and_aligned() {
        let region = SharedRegion::map(0x10000).unwrap();
        assert_eq!(region.len(), 0x10000);
        assert_eq!(region.addr() % 0x1000, 0);
        assert!(unsafe { region.as_slice() }.iter().all(|b| *b == 0));
    }

    #[test]
    fn map_empty() {
        assert!(matches!(SharedRegion::map(0), Err(ShmemError::Empty)));
    }

    #[test]
    fn fill_and_mark() {
        let region = SharedRegion::map(16).unwrap();
        assert_eq!(region.fill_from(&[7; 32]), 16);
        region.set_byte(0, 1);
        let data = unsafe { region.as_slice() };
        assert_eq!(data[0], 1);
        assert!(data[1..].iter().all(|b| *b == 7));
        // copying a region onto itself is a no-op
        assert_eq!(region.fill_from(data), 16);
    }

    #[test]
    fn lock_small_region() {
        let region = SharedRegion::map(0x1000).unwrap();
        // RLIMIT_MEMLOCK may be tiny in sandboxes, only the error shape is checked.
        if let Err(e) = region.lock() {
            assert!(matches!(e, ShmemError::Lock { len: 0x1000, .. }));
        }
    }
}
