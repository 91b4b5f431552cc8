use core::ptr::NonNull;

use super::intrusive_list::ListNode;
use super::slab::{Slab, SlabCache};

/// Ownership state of one physical frame.
///
/// Exactly one variant holds at a time, so a frame can never sit on a free list
/// and belong to a slab at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Not managed by the allocator (firmware, kernel image, MMIO holes).
    Reserved,
    /// Head of a block handed out by `alloc`.
    InUse,
    /// Interior frame of a larger block (free or allocated); only heads carry state.
    Tail,
    /// Head of a block linked on the free list of `order`.
    Free { order: u8 },
    /// Part of a slab; points back at the slab header and the cache owning it.
    SlabOwned {
        slab: NonNull<Slab>,
        cache: NonNull<SlabCache>,
    },
}

/// A descriptor for a physical page frame.
///
/// Each physical frame has one `Page` descriptor in a flat array indexed by
/// frame number. This allows tracking ownership and buddy state without touching
/// the physical memory itself (safe for device memory or uncached regions).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Page {
    pub state: FrameState,
    /// Order of the block this frame heads (valid for `InUse` and `SlabOwned` heads)
    pub order: u8,
    /// Number of live owners; the block returns to the buddy lists at zero.
    pub refcount: u16,
    /// Free-list links, only meaningful while `state` is `Free`.
    next: Option<NonNull<Page>>,
    prev: Option<NonNull<Page>>,
}

// SAFETY: Page is just a descriptor, access is serialised by the FrameAllocator lock
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl Page {
    /// A descriptor for a frame the allocator does not manage yet.
    pub const fn new() -> Self {
        Self {
            state: FrameState::Reserved,
            order: 0,
            refcount: 0,
            next: None,
            prev: None,
        }
    }

    /// Order of the free block this frame heads, if any.
    pub fn free_order(&self) -> Option<usize> {
        match self.state {
            FrameState::Free { order } => Some(order as usize),
            _ => None,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.state == FrameState::Reserved
    }

    /// Turn this frame into the head of a free block of `order`.
    pub fn mark_free(&mut self, order: usize) {
        self.state = FrameState::Free { order: order as u8 };
        self.order = order as u8;
        self.refcount = 0;
    }

    /// Turn this frame into the head of an allocated block of `order`.
    pub fn mark_allocated(&mut self, order: usize) {
        self.state = FrameState::InUse;
        self.order = order as u8;
        self.refcount = 1;
    }

    /// Fold this frame into an enclosing block.
    pub fn mark_tail(&mut self) {
        self.state = FrameState::Tail;
        self.order = 0;
        self.refcount = 0;
    }
}

impl ListNode for Page {
    #[inline]
    fn next(&self) -> Option<NonNull<Self>> {
        self.next
    }

    #[inline]
    fn prev(&self) -> Option<NonNull<Self>> {
        self.prev
    }

    #[inline]
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }

    #[inline]
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.prev = prev;
    }
}
