//! Host-side frame pools for tests.
//!
//! A pool is a leaked, page-aligned heap buffer presented to the frame allocator
//! as physical memory at a fictitious base address. The direct-map offset is
//! chosen so `phys_to_virt` lands inside the buffer, which lets every layer above
//! (slabs, page tables, demand paging) run unmodified on the host.

use std::alloc::{Layout, alloc_zeroed};
use std::boxed::Box;

use crate::allocator::Page;
use crate::layout::{MAX_ORDER, PAGE_SIZE, order_size};
use crate::memory::FrameAllocator;

/// Physical base used by [`frame_pool`]; aligned to the largest block size.
pub const TEST_PHYS_BASE: usize = 0x4000_0000;

/// A fresh allocator managing `frames` frames at [`TEST_PHYS_BASE`].
pub fn frame_pool(frames: usize) -> &'static FrameAllocator {
    frame_pool_at(TEST_PHYS_BASE, frames)
}

/// A fresh allocator managing `frames` frames starting at `phys_base`.
///
/// # Panics
/// When `phys_base` is not aligned to the largest block, or the host allocation fails.
#[allow(clippy::panic)]
pub fn frame_pool_at(phys_base: usize, frames: usize) -> &'static FrameAllocator {
    assert_eq!(phys_base % order_size(MAX_ORDER - 1), 0, "pool base must be block aligned");
    assert!(frames > 0);

    let layout = match Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE) {
        Ok(layout) => layout,
        Err(e) => panic!("bad pool layout: {e}"),
    };
    // SAFETY: non-zero size
    let buffer = unsafe { alloc_zeroed(layout) };
    assert!(!buffer.is_null(), "host allocation of {frames} frames failed");

    let mem_map: &'static mut [Page] = std::vec![Page::new(); frames].leak();
    let allocator: &'static FrameAllocator = Box::leak(Box::new(FrameAllocator::new()));
    let phys_offset = (buffer as usize).wrapping_sub(phys_base);

    // SAFETY: the buffer is leaked, so every frame in the range stays mapped at
    // pa + phys_offset for the rest of the process
    unsafe {
        allocator.init(mem_map, phys_base, phys_offset);
        allocator.add_range(phys_base, phys_base + frames * PAGE_SIZE);
    }
    allocator
}
