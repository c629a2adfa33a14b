//! Aligned, non-relocatable memory regions backing field buffers.
//!
//! Regions are anonymous `mmap` mappings where possible and aligned heap
//! allocations otherwise. Either way the base address never moves for the
//! lifetime of the region, which is what lets a native engine keep writing
//! through a descriptor captured at allocation time.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

use crate::error::{SmemError, SmemResult};

/// Specifies how memory in a [`SharedRegion`] should be initialised.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionInit {
    /// Zero the entire region after allocation.
    Zeroed,
    /// Fill every byte with the given value.
    Filled(u8),
}

#[derive(Debug)]
enum Backing {
    Mapped(memmap2::MmapMut),
    Owned { ptr: NonNull<u8>, layout: Layout },
}

impl Backing {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Backing::Mapped(map) => map.as_mut_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }

    fn as_ptr(&self) -> *const u8 {
        match self {
            Backing::Mapped(map) => map.as_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Contiguous block of memory with a stable base address.
#[derive(Debug)]
pub struct SharedRegion {
    len: usize,
    alignment: usize,
    pinned: bool,
    backing: Backing,
}

// SAFETY: the region exclusively owns its mapping/allocation; concurrent access
// to the bytes is coordinated by the wait/step protocol of the owner.
unsafe impl Send for SharedRegion {}
// SAFETY: shared references only hand out `&[u8]`; mutation requires `&mut`.
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocates a new region of `len` bytes aligned to `alignment`.
    ///
    /// An anonymous mapping is tried first. If its address does not satisfy
    /// the alignment, the heap path is used instead.
    pub fn new_aligned(len: usize, alignment: usize, init: RegionInit) -> SmemResult<Self> {
        if len == 0 {
            return Err(SmemError::InvalidCapacity {
                requested: 0,
                minimum: 1,
            });
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(SmemError::AllocationFailed {
                size: len,
                alignment,
            });
        }

        let mut region = match Self::mmap_backed(len, alignment)? {
            Some(backing) => Self {
                len,
                alignment,
                pinned: false,
                backing,
            },
            None => Self::heap_backed(len, alignment)?,
        };
        region.initialise(init);
        Ok(region)
    }

    fn heap_backed(len: usize, alignment: usize) -> SmemResult<Self> {
        let layout = Layout::from_size_align(len, alignment)
            .map_err(|_| SmemError::AllocationFailed {
                size: len,
                alignment,
            })?;

        // SAFETY: `layout` has a non-zero size, checked in `new_aligned`.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(SmemError::AllocationFailed {
            size: len,
            alignment,
        })?;
        Ok(Self {
            len,
            alignment,
            pinned: false,
            backing: Backing::Owned { ptr, layout },
        })
    }

    fn mmap_backed(len: usize, alignment: usize) -> SmemResult<Option<Backing>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|_| SmemError::AllocationFailed {
                size: len,
                alignment,
            })?;

        if map.as_mut_ptr() as usize % alignment != 0 {
            return Ok(None);
        }
        Ok(Some(Backing::Mapped(map)))
    }

    fn initialise(&mut self, init: RegionInit) {
        let byte = match init {
            // Anonymous mappings and `alloc_zeroed` already hand out zeroes.
            RegionInit::Zeroed => return,
            RegionInit::Filled(byte) => byte,
        };
        let len = self.len;
        let ptr = self.as_mut_ptr();
        // SAFETY: `ptr` addresses `len` writable bytes owned by this region.
        unsafe { ptr::write_bytes(ptr, byte, len) };
    }

    /// Locks the region's pages in physical memory.
    ///
    /// Only mapped regions can be locked. Returns whether the region is pinned
    /// afterwards; failure (e.g. `RLIMIT_MEMLOCK`) leaves it unpinned.
    pub fn pin(&mut self) -> bool {
        if self.pinned {
            return true;
        }
        #[cfg(unix)]
        if let Backing::Mapped(map) = &self.backing {
            self.pinned = map.lock().is_ok();
        }
        self.pinned
    }

    /// Whether [`SharedRegion::pin`] succeeded.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Total number of bytes managed by this region.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true when the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the alignment the region was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Base address of the region.
    pub fn as_ptr(&self) -> *const u8 {
        self.backing.as_ptr()
    }

    /// Mutable base address of the region.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.backing.as_mut_ptr()
    }

    /// View the full region as an immutable slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the backing covers `len` initialised bytes for the region's lifetime.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.len) }
    }

    /// View the full region as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), self.len) }
    }

    /// Mutable view for an owner that shares the region with descriptors.
    ///
    /// # Safety
    ///
    /// No other slice of the region may be live while the returned one is,
    /// and no descriptor access may overlap with it in time.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn shared_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr().cast_mut(), self.len)
    }

    /// Whether `[addr, addr + len)` lies inside this region.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let base = self.as_ptr() as usize;
        addr >= base
            && addr
                .checked_add(len)
                .is_some_and(|end| end <= base + self.len)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: `ptr` was returned by `alloc_zeroed` with this exact layout.
            unsafe {
                dealloc(ptr.as_ptr(), *layout);
            }
        }
    }
}
