use core::ptr::NonNull;

use kmem_error::define_kernel_error;

use super::intrusive_list::IntrusiveList;
use super::page::{FrameState, Page};
use super::slab::{Slab, SlabCache};
use crate::layout::{MAX_ORDER, PAGE_SIZE, order_size};

// Buddy allocator: physical frame allocation and freeing with coalescing.
// Behavior IDs [B1]-[B12] are referenced by the tests below.
//
// Buddies are located by frame index relative to `phys_base`, so the pairing of
// blocks never depends on allocation history.

define_kernel_error! {
    /// Errors reported by the frame allocator.
    pub enum FrameError(0x01) {
        /// No free block of the requested order (or alignment) exists
        OutOfMemory = 0x01 => "Out of physical frames",
        /// The frame is reserved and never handed out
        PermissionDenied = 0x02 => "Frame is reserved",
        /// The address is outside the memory map or not a block head
        InvalidFrame = 0x03 => "Not the head of a managed block",
        InvalidOrder = 0x04 => "Order exceeds MAX_ORDER",
        DoubleFree = 0x05 => "Block is already free",
        OrderMismatch = 0x06 => "Order differs from the allocation",
        /// Slab frames go back through the slab layer
        SlabOwned = 0x07 => "Frame belongs to a slab",
        RefcountOverflow = 0x08 => "Too many owners for one frame",
    }
}

/// [B1] Buddy Allocator for physical frame management.
/// Allocator starts with empty free lists.
pub struct BuddyAllocator {
    /// free_lists[i] links the heads of free blocks of order i.
    free_lists: [IntrusiveList<Page>; MAX_ORDER],

    /// One descriptor per frame, indexed by `(pa - phys_base) / PAGE_SIZE`.
    mem_map: Option<&'static mut [Page]>,

    /// Physical address corresponding to the first entry in mem_map.
    phys_base: usize,

    /// Frames handed to the allocator through `add_range`.
    managed: usize,
    /// Frames currently sitting on a free list.
    free: usize,
}

// SAFETY: BuddyAllocator is managed via IrqSafeLock in the FrameAllocator
unsafe impl Send for BuddyAllocator {}
unsafe impl Sync for BuddyAllocator {}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    /// Create a new, uninitialized Buddy Allocator.
    pub const fn new() -> Self {
        Self {
            free_lists: [const { IntrusiveList::new() }; MAX_ORDER],
            mem_map: None,
            phys_base: 0,
            managed: 0,
            free: 0,
        }
    }

    /// Initialize the allocator with a memory map and physical base address.
    ///
    /// Every descriptor starts out `Reserved`; only ranges passed to
    /// [`add_range`](Self::add_range) become allocatable.
    ///
    /// # Safety
    /// `mem_map` must describe the frames starting at `phys_base` and must not be
    /// touched by anyone else afterwards.
    pub unsafe fn init(&mut self, mem_map: &'static mut [Page], phys_base: usize) {
        for page in mem_map.iter_mut() {
            *page = Page::new();
        }
        self.free_lists = [const { IntrusiveList::new() }; MAX_ORDER];
        self.mem_map = Some(mem_map);
        self.phys_base = phys_base;
        self.managed = 0;
        self.free = 0;
    }

    /// Add a range of physical memory to the allocator.
    ///
    /// The range is carved into the largest naturally aligned blocks that fit.
    /// Parts of the range outside the memory map are ignored.
    ///
    /// # Safety
    /// The range must be usable RAM and must not overlap a range added earlier.
    pub unsafe fn add_range(&mut self, start_pa: usize, end_pa: usize) {
        let Some(len) = self.mem_map.as_ref().map(|m| m.len()) else {
            return;
        };
        let start_pa = start_pa.max(self.phys_base).next_multiple_of(PAGE_SIZE);
        let end_pa = end_pa & !(PAGE_SIZE - 1);
        if end_pa <= start_pa {
            return;
        }
        let mut idx = (start_pa - self.phys_base) / PAGE_SIZE;
        let end = ((end_pa - self.phys_base) / PAGE_SIZE).min(len);

        while idx < end {
            // Find the largest order that fits and is aligned
            let mut order = MAX_ORDER - 1;
            while order > 0 {
                let frames = 1 << order;
                if idx + frames <= end && idx % frames == 0 {
                    break;
                }
                order -= 1;
            }

            for tail in idx + 1..idx + (1 << order) {
                self.page_mut(tail).mark_tail();
            }
            self.free_block(idx, order);
            self.managed += 1 << order;
            self.free += 1 << order;
            idx += 1 << order;
        }
    }

    /// [B2] Allocate a block of memory of the given order.
    /// [B3] Returns OutOfMemory when the pool is exhausted.
    /// [B4] alloc(order=N) allocates 2^N contiguous pages.
    /// [B6] Block splitting creates buddy pairs.
    pub fn alloc(&mut self, order: usize) -> Result<usize, FrameError> {
        if order >= MAX_ORDER {
            return Err(FrameError::InvalidOrder);
        }

        // [B2][B4] Find the smallest free block of order >= requested
        let from = (order..MAX_ORDER)
            .find(|&i| !self.free_lists[i].is_empty())
            .ok_or(FrameError::OutOfMemory)?; // [B3]
        let head = self.free_lists[from]
            .pop_front()
            .ok_or(FrameError::OutOfMemory)?;
        let idx = self.index_of_page(head);
        Ok(self.split_and_take(idx, from, order))
    }

    /// [B9] Allocate a block of `order` that is naturally aligned in physical
    /// memory and lies entirely below `1 << addr_bits` (DMA windows).
    pub fn alloc_aligned(&mut self, order: usize, addr_bits: u32) -> Result<usize, FrameError> {
        if order >= MAX_ORDER {
            return Err(FrameError::InvalidOrder);
        }
        let size = order_size(order);
        let ceiling = 1usize.checked_shl(addr_bits).unwrap_or(usize::MAX);

        for i in order..MAX_ORDER {
            let found = self.free_lists[i].iter().find(|&page| {
                let pa = self.page_to_pa(page);
                pa % size == 0 && pa.checked_add(size).is_some_and(|end| end <= ceiling)
            });
            if let Some(mut page) = found {
                // SAFETY: page came from free_lists[i]
                self.free_lists[i].remove(unsafe { page.as_mut() });
                let idx = self.index_of_page(page);
                return Ok(self.split_and_take(idx, i, order));
            }
        }

        Err(FrameError::OutOfMemory)
    }

    /// [B7] Drop one owner of the block at `pa`; [B8] the last owner returns it to
    /// the free lists, coalescing with free buddies.
    pub fn free(&mut self, pa: usize, order: usize) -> Result<(), FrameError> {
        if order >= MAX_ORDER {
            return Err(FrameError::InvalidOrder);
        }
        let idx = self.index_of(pa).ok_or(FrameError::InvalidFrame)?;
        let page = self.page_mut(idx);

        match page.state {
            FrameState::Reserved => Err(FrameError::PermissionDenied), // [B10]
            FrameState::Free { .. } => Err(FrameError::DoubleFree),
            FrameState::Tail => Err(FrameError::InvalidFrame),
            FrameState::SlabOwned { .. } => Err(FrameError::SlabOwned),
            FrameState::InUse if page.order as usize != order => Err(FrameError::OrderMismatch),
            FrameState::InUse if page.refcount > 1 => {
                // [B11] shared frame, another owner keeps it alive
                page.refcount -= 1;
                Ok(())
            }
            FrameState::InUse => {
                self.free_block(idx, order);
                self.free += 1 << order;
                Ok(())
            }
        }
    }

    /// [B11] Add an owner to an allocated block. Returns the new owner count.
    pub fn share(&mut self, pa: usize) -> Result<u16, FrameError> {
        let idx = self.index_of(pa).ok_or(FrameError::InvalidFrame)?;
        let page = self.page_mut(idx);
        if page.state != FrameState::InUse {
            return Err(FrameError::InvalidFrame);
        }
        page.refcount = page
            .refcount
            .checked_add(1)
            .ok_or(FrameError::RefcountOverflow)?;
        Ok(page.refcount)
    }

    /// Descriptor state of the frame at `pa`.
    pub fn state(&self, pa: usize) -> Option<FrameState> {
        let idx = self.index_of(pa)?;
        self.mem_map.as_ref().map(|m| m[idx].state)
    }

    /// Owner count of the frame at `pa`.
    pub fn refcount(&self, pa: usize) -> Option<u16> {
        let idx = self.index_of(pa)?;
        self.mem_map.as_ref().map(|m| m[idx].refcount)
    }

    /// Hand every frame of the allocated block at `pa` to a slab.
    pub(crate) fn assign_slab(
        &mut self,
        pa: usize,
        order: usize,
        slab: NonNull<Slab>,
        cache: NonNull<SlabCache>,
    ) -> Result<(), FrameError> {
        let idx = self.index_of(pa).ok_or(FrameError::InvalidFrame)?;
        let head = self.page_mut(idx);
        if head.state != FrameState::InUse || head.order as usize != order {
            return Err(FrameError::InvalidFrame);
        }
        for i in idx..idx + (1 << order) {
            self.page_mut(i).state = FrameState::SlabOwned { slab, cache };
        }
        Ok(())
    }

    /// Take a slab's frames back and free them as an ordinary block.
    pub(crate) fn release_slab(&mut self, pa: usize, order: usize) -> Result<(), FrameError> {
        let idx = self.index_of(pa).ok_or(FrameError::InvalidFrame)?;
        if !matches!(self.page_mut(idx).state, FrameState::SlabOwned { .. }) {
            return Err(FrameError::InvalidFrame);
        }
        for i in idx + 1..idx + (1 << order) {
            self.page_mut(i).mark_tail();
        }
        self.page_mut(idx).mark_allocated(order);
        self.free(pa, order)
    }

    /// Length of the memory map, managed or not.
    pub fn descriptors(&self) -> usize {
        self.mem_map.as_ref().map_or(0, |m| m.len())
    }

    pub fn managed_frames(&self) -> usize {
        self.managed
    }

    pub fn free_frames(&self) -> usize {
        self.free
    }

    /// Number of blocks on the free list of `order`.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, IntrusiveList::len)
    }

    /// [B6] Split the block at `idx` (taken off list `from`) down to `order`,
    /// pushing the upper halves onto the intermediate lists.
    fn split_and_take(&mut self, idx: usize, from: usize, order: usize) -> usize {
        for j in (order..from).rev() {
            let buddy = self.page_mut(idx + (1 << j));
            buddy.mark_free(j);
            self.free_lists[j].push_front(buddy);
        }
        self.page_mut(idx).mark_allocated(order);
        self.free -= 1 << order;
        self.phys_base + idx * PAGE_SIZE // [B2][B5] lowest address of the block
    }

    /// [B8] Free blocks are coalesced with buddies.
    fn free_block(&mut self, idx: usize, order: usize) {
        let len = self.mem_map.as_ref().map_or(0, |m| m.len());
        let mut idx = idx;
        let mut order = order;

        while order < MAX_ORDER - 1 {
            let buddy_idx = idx ^ (1 << order);
            if buddy_idx >= len {
                break;
            }
            let buddy = self.page_mut(buddy_idx);
            // Buddy must be a free block head of the same order
            if buddy.free_order() != Some(order) {
                break;
            }
            self.free_lists[order].remove(buddy);

            let (head, tail) = if buddy_idx < idx {
                (buddy_idx, idx)
            } else {
                (idx, buddy_idx)
            };
            self.page_mut(tail).mark_tail();
            idx = head;
            order += 1; // [B8] merged into larger block
        }

        let page = self.page_mut(idx);
        page.mark_free(order);
        self.free_lists[order].push_front(page);
    }

    fn index_of(&self, pa: usize) -> Option<usize> {
        let mem_map = self.mem_map.as_ref()?;
        if pa < self.phys_base || pa % PAGE_SIZE != 0 {
            return None;
        }
        let idx = (pa - self.phys_base) / PAGE_SIZE;
        (idx < mem_map.len()).then_some(idx)
    }

    fn index_of_page(&self, page: NonNull<Page>) -> usize {
        let base = self.mem_map.as_ref().map_or(0, |m| m.as_ptr() as usize);
        (page.as_ptr() as usize - base) / core::mem::size_of::<Page>()
    }

    fn page_to_pa(&self, page: NonNull<Page>) -> usize {
        self.phys_base + self.index_of_page(page) * PAGE_SIZE
    }

    // Descriptors are handed out with an unbounded lifetime so one can be linked
    // into a free list while `self` is borrowed. Callers pass indices derived from
    // `index_of` or from arithmetic on blocks inside the map.
    fn page_mut(&mut self, idx: usize) -> &'static mut Page {
        let mem_map = self
            .mem_map
            .as_mut()
            .map_or(core::ptr::null_mut(), |m| m.as_mut_ptr());
        debug_assert!(!mem_map.is_null());
        // SAFETY: idx is inside the 'static memory map, access is serialised by the
        // FrameAllocator lock
        unsafe { &mut *mem_map.add(idx) }
    }
}
