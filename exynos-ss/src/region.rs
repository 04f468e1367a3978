//! Reserved memory backing for the snapshot region.
//!
//! On target hardware the region is a carve-out of physical memory that a
//! warm reset leaves intact. Here it is any byte mapping handed out by a
//! [`MemoryReserver`]: an anonymous mapping for tests, or a file mapping that
//! plays the part of the preserved physical range across process restarts.
//!
//! All access goes through [`RawRegion`], which does volatile, bounds-checked
//! reads and writes. Writers on different CPUs share the mapping without
//! locks; see the ring module for the write discipline.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;

use bytemuck::Pod;
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};

use crate::error::{Result, SnapshotError};

/// Grants a byte region standing in for `size` bytes of physical memory at `paddr`.
pub trait MemoryReserver {
    fn reserve(&mut self, paddr: u64, size: usize) -> Result<ReservedRegion>;
}

/// A granted region. Keeps the mapping alive for the lifetime of the context.
pub struct ReservedRegion {
    map: MmapMut,
    raw: RawRegion,
    paddr: u64,
}

impl ReservedRegion {
    fn new(mut map: MmapMut, paddr: u64) -> Self {
        let raw = RawRegion {
            base: map.as_mut_ptr(),
            len: map.len(),
        };
        Self { map, raw, paddr }
    }

    pub fn paddr(&self) -> u64 {
        self.paddr
    }

    /// Identity-offset virtual base.
    pub fn vaddr(&self) -> u64 {
        self.raw.base as u64
    }

    pub fn len(&self) -> usize {
        self.raw.len
    }

    pub fn is_empty(&self) -> bool {
        self.raw.len == 0
    }

    pub fn raw(&self) -> RawRegion {
        self.raw
    }

    /// Push dirty pages to the backing store. No-op for anonymous mappings.
    pub fn flush(&self) -> io::Result<()> {
        self.map.flush()
    }
}

/// Anonymous memory. Optionally refuses requests above `limit`, which models a
/// platform that cannot satisfy the carve-out.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousReserver {
    limit: Option<usize>,
}

impl AnonymousReserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

impl MemoryReserver for AnonymousReserver {
    fn reserve(&mut self, paddr: u64, size: usize) -> Result<ReservedRegion> {
        if let Some(limit) = self.limit {
            if size > limit {
                return Err(SnapshotError::Reservation {
                    paddr,
                    size,
                    reason: format!("exceeds available {limit:#x} bytes"),
                });
            }
        }
        let map = MmapOptions::new()
            .len(size)
            .map_anon()
            .map_err(|e| SnapshotError::Reservation {
                paddr,
                size,
                reason: e.to_string(),
            })?;
        debug!("anonymous region {size:#x} bytes for paddr {paddr:#x}");
        Ok(ReservedRegion::new(map, paddr))
    }
}

/// File-backed region. Reopening the same file after a restart sees whatever
/// the previous run left behind, like memory across a warm reset.
#[derive(Debug, Clone)]
pub struct FileReserver {
    path: PathBuf,
}

impl FileReserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MemoryReserver for FileReserver {
    fn reserve(&mut self, paddr: u64, size: usize) -> Result<ReservedRegion> {
        let reservation_err = |e: io::Error| SnapshotError::Reservation {
            paddr,
            size,
            reason: format!("{}: {e}", self.path.display()),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(reservation_err)?;
        let current = file.metadata().map_err(reservation_err)?.len();
        if current != size as u64 {
            info!(
                "exynos-snapshot: resizing {} from {current:#x} to {size:#x}",
                self.path.display()
            );
            file.set_len(size as u64).map_err(reservation_err)?;
        }
        // SAFETY: the file is owned by this process for the life of the
        // mapping; nothing else truncates it underneath us.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(reservation_err)?;
        Ok(ReservedRegion::new(map, paddr))
    }
}

/// Unowned view of region bytes.
///
/// Reads and writes are volatile and silently clamp to the region: an
/// out-of-range write is dropped and an out-of-range read yields zeroes.
#[derive(Debug, Clone, Copy)]
pub struct RawRegion {
    base: *mut u8,
    len: usize,
}

// SAFETY: the pointer refers to a shared mapping owned by a ReservedRegion or
// SnapshotImage that outlives every view handed out. Concurrent unsynchronised
// payload writes are an accepted best-effort property of the trace rings.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Build a view over memory owned by someone else.
    ///
    /// # Safety
    /// `base..base+len` must stay mapped while the view is in use.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn base_addr(&self) -> u64 {
        self.base as u64
    }

    #[inline(always)]
    fn fits(&self, offset: usize, size: usize) -> bool {
        offset
            .checked_add(size)
            .is_some_and(|end| end <= self.len)
    }

    /// Narrow the view to `offset..offset+len`.
    pub fn sub(&self, offset: usize, len: usize) -> Option<RawRegion> {
        if !self.fits(offset, len) {
            return None;
        }
        Some(RawRegion {
            // SAFETY: bounds checked above.
            base: unsafe { self.base.add(offset) },
            len,
        })
    }

    #[inline(always)]
    pub fn read<T: Pod>(&self, offset: usize) -> T {
        if !self.fits(offset, size_of::<T>()) {
            return T::zeroed();
        }
        let ptr = unsafe { self.base.add(offset) } as *const T;
        if ptr.is_aligned() {
            // SAFETY: in bounds and aligned.
            unsafe { core::ptr::read_volatile(ptr) }
        } else {
            // SAFETY: in bounds.
            unsafe { core::ptr::read_unaligned(ptr) }
        }
    }

    #[inline(always)]
    pub fn write<T: Pod>(&self, offset: usize, value: T) {
        if !self.fits(offset, size_of::<T>()) {
            return;
        }
        let ptr = unsafe { self.base.add(offset) } as *mut T;
        if ptr.is_aligned() {
            // SAFETY: in bounds and aligned.
            unsafe { core::ptr::write_volatile(ptr, value) }
        } else {
            // SAFETY: in bounds.
            unsafe { core::ptr::write_unaligned(ptr, value) }
        }
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.read::<u32>(offset)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write::<u32>(offset, value)
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        self.read::<u64>(offset)
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write::<u64>(offset, value)
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) {
        if !self.fits(offset, len) {
            return;
        }
        // SAFETY: bounds checked above.
        unsafe { core::ptr::write_bytes(self.base.add(offset), byte, len) }
    }

    pub fn copy_from(&self, offset: usize, src: &[u8]) {
        if !self.fits(offset, src.len()) {
            return;
        }
        // SAFETY: bounds checked above; src cannot alias the mapping mutably.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(offset), src.len()) }
    }

    pub fn copy_to(&self, offset: usize, dst: &mut [u8]) {
        if !self.fits(offset, dst.len()) {
            dst.fill(0);
            return;
        }
        // SAFETY: bounds checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base.add(offset), dst.as_mut_ptr(), dst.len())
        }
    }

    /// Shared atomic living at `offset`. `None` if out of range or misaligned.
    pub fn atomic_i64(&self, offset: usize) -> Option<&AtomicI64> {
        if !self.fits(offset, size_of::<AtomicI64>()) {
            return None;
        }
        let ptr = unsafe { self.base.add(offset) };
        if (ptr as usize) % align_of::<AtomicI64>() != 0 {
            return None;
        }
        // SAFETY: in bounds, aligned, and the mapping outlives the view.
        Some(unsafe { &*(ptr as *const AtomicI64) })
    }
}
