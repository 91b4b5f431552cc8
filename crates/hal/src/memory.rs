// Frame allocator front end: the lock around the buddy allocator plus the
// physical-to-virtual direct map used to touch frame contents.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::IrqSafeLock;
use crate::allocator::slab::{Slab, SlabCache};
use crate::allocator::{BuddyAllocator, FrameError, FrameState, Page};
use crate::layout::{PAGE_SIZE, order_size};
use crate::traits::PageAllocator;

/// Frame counts at one instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frames handed to the allocator at boot.
    pub managed: usize,
    /// Frames on the free lists.
    pub free: usize,
    /// Descriptors never handed to the allocator.
    pub reserved: usize,
}

impl FrameStats {
    pub fn allocated(&self) -> usize {
        self.managed - self.free
    }
}

/// Thread-safe frame allocator.
pub struct FrameAllocator {
    buddy: IrqSafeLock<BuddyAllocator>,
    /// `va = pa + phys_offset` (wrapping) for every managed frame.
    phys_offset: AtomicUsize,
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            buddy: IrqSafeLock::new(BuddyAllocator::new()),
            phys_offset: AtomicUsize::new(0),
        }
    }

    /// Attach the descriptor array and the direct-map offset.
    ///
    /// # Safety
    /// `mem_map` must describe the frames from `phys_base`, and
    /// `pa.wrapping_add(phys_offset)` must be a valid mapping of every frame later
    /// passed to [`add_range`](Self::add_range).
    pub unsafe fn init(&self, mem_map: &'static mut [Page], phys_base: usize, phys_offset: usize) {
        self.phys_offset.store(phys_offset, Ordering::Release);
        self.buddy.lock().init(mem_map, phys_base);
        log::debug!(
            "[BUDDY] memory map: {} frames from {:#x}",
            self.buddy.lock().managed_frames(),
            phys_base
        );
    }

    /// Make `[start_pa, end_pa)` allocatable.
    ///
    /// # Safety
    /// See [`BuddyAllocator::add_range`].
    pub unsafe fn add_range(&self, start_pa: usize, end_pa: usize) {
        let mut buddy = self.buddy.lock();
        let before = buddy.managed_frames();
        buddy.add_range(start_pa, end_pa);
        log::debug!(
            "[BUDDY] added {:#x}..{:#x} ({} frames)",
            start_pa,
            end_pa,
            buddy.managed_frames() - before
        );
    }

    pub fn alloc(&self, order: usize) -> Result<usize, FrameError> {
        let result = self.buddy.lock().alloc(order);
        if result.is_err() {
            log::warn!("[BUDDY] alloc(order={order}) failed");
        }
        result
    }

    /// Allocate and clear a block.
    pub fn alloc_zeroed(&self, order: usize) -> Result<usize, FrameError> {
        let pa = self.alloc(order)?;
        // SAFETY: freshly allocated block, reachable through the direct map
        unsafe { core::ptr::write_bytes(self.phys_to_virt(pa) as *mut u8, 0, order_size(order)) };
        Ok(pa)
    }

    /// Allocate a naturally aligned block lying below `1 << addr_bits`.
    pub fn alloc_aligned(&self, order: usize, addr_bits: u32) -> Result<usize, FrameError> {
        self.buddy.lock().alloc_aligned(order, addr_bits)
    }

    pub fn free(&self, pa: usize, order: usize) -> Result<(), FrameError> {
        let result = self.buddy.lock().free(pa, order);
        if let Err(e) = result {
            log::error!("[BUDDY] free({pa:#x}, order={order}) rejected: {e}");
        }
        result
    }

    /// Add an owner to the block at `pa`.
    pub fn share(&self, pa: usize) -> Result<u16, FrameError> {
        self.buddy.lock().share(pa)
    }

    pub fn state(&self, pa: usize) -> Option<FrameState> {
        self.buddy.lock().state(pa)
    }

    pub fn refcount(&self, pa: usize) -> Option<u16> {
        self.buddy.lock().refcount(pa)
    }

    pub fn stats(&self) -> FrameStats {
        let buddy = self.buddy.lock();
        FrameStats {
            managed: buddy.managed_frames(),
            free: buddy.free_frames(),
            reserved: buddy.descriptors() - buddy.managed_frames(),
        }
    }

    /// Number of free blocks of exactly `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.buddy.lock().free_blocks(order)
    }

    #[inline]
    pub fn phys_to_virt(&self, pa: usize) -> usize {
        pa.wrapping_add(self.phys_offset.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn virt_to_phys(&self, va: usize) -> usize {
        va.wrapping_sub(self.phys_offset.load(Ordering::Relaxed))
    }

    /// Slab and cache owning the direct-mapped address `va`, if any.
    pub fn slab_owner(&self, va: usize) -> Option<(NonNull<Slab>, NonNull<SlabCache>)> {
        let pa = self.virt_to_phys(va) & !(PAGE_SIZE - 1);
        match self.state(pa)? {
            FrameState::SlabOwned { slab, cache } => Some((slab, cache)),
            _ => None,
        }
    }

    pub(crate) fn assign_slab(
        &self,
        pa: usize,
        order: usize,
        slab: NonNull<Slab>,
        cache: NonNull<SlabCache>,
    ) -> Result<(), FrameError> {
        self.buddy.lock().assign_slab(pa, order, slab, cache)
    }

    pub(crate) fn release_slab(&self, pa: usize, order: usize) -> Result<(), FrameError> {
        self.buddy.lock().release_slab(pa, order)
    }
}

impl PageAllocator for FrameAllocator {
    fn alloc_page(&self) -> Option<usize> {
        self.alloc_zeroed(0).ok()
    }

    fn free_page(&self, pa: usize) {
        // Failures are logged by free()
        let _ = self.free(pa, 0);
    }

    fn phys_to_virt(&self, pa: usize) -> usize {
        FrameAllocator::phys_to_virt(self, pa)
    }
}

/// Global frame allocator instance, initialised once at boot.
pub static FRAME_ALLOCATOR: FrameAllocator = FrameAllocator::new();
