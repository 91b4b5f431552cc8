// General allocator: routes byte-size requests to a fixed table of object caches.
// Behavior IDs [GA1]-[GA6] are referenced by the tests below.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use super::slab::{SlabCache, SlabError, SlabLayout};
use crate::memory::FrameAllocator;

/// [GA1] Object sizes served, ascending. Requests above the last class fail.
pub const SIZE_CLASSES: [usize; 12] = [8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096];

const CLASS_COUNT: usize = SIZE_CLASSES.len();

/// Natural alignment of a class (largest power of two dividing it), capped at a
/// cache line.
const fn class_align(size: usize) -> usize {
    let align = 1 << size.trailing_zeros();
    if align > 64 { 64 } else { align }
}

const CLASS_LAYOUTS: [SlabLayout; CLASS_COUNT] = {
    let mut layouts = [SlabLayout::EMPTY; CLASS_COUNT];
    let mut i = 0;
    while i < CLASS_COUNT {
        layouts[i] = match SlabLayout::compute(SIZE_CLASSES[i], class_align(SIZE_CLASSES[i])) {
            Some(layout) => layout,
            None => SlabLayout::EMPTY,
        };
        i += 1;
    }
    layouts
};

// Every class must fit a slab.
const _: () = {
    let mut i = 0;
    while i < CLASS_COUNT {
        assert!(CLASS_LAYOUTS[i].objects > 0);
        i += 1;
    }
};

/// [GA2] Size-class router over one `SlabCache` per class.
///
/// Like a single cache, the allocator must not move once it has handed out
/// memory; keep it in a `static` or another fixed location.
pub struct GeneralAllocator<'f> {
    frames: &'f FrameAllocator,
    caches: [SlabCache; CLASS_COUNT],
}

impl<'f> GeneralAllocator<'f> {
    pub const fn new(frames: &'f FrameAllocator) -> Self {
        Self {
            frames,
            caches: [
                SlabCache::from_layout(CLASS_LAYOUTS[0]),
                SlabCache::from_layout(CLASS_LAYOUTS[1]),
                SlabCache::from_layout(CLASS_LAYOUTS[2]),
                SlabCache::from_layout(CLASS_LAYOUTS[3]),
                SlabCache::from_layout(CLASS_LAYOUTS[4]),
                SlabCache::from_layout(CLASS_LAYOUTS[5]),
                SlabCache::from_layout(CLASS_LAYOUTS[6]),
                SlabCache::from_layout(CLASS_LAYOUTS[7]),
                SlabCache::from_layout(CLASS_LAYOUTS[8]),
                SlabCache::from_layout(CLASS_LAYOUTS[9]),
                SlabCache::from_layout(CLASS_LAYOUTS[10]),
                SlabCache::from_layout(CLASS_LAYOUTS[11]),
            ],
        }
    }

    /// Frame allocator backing every cache.
    pub fn frames(&self) -> &'f FrameAllocator {
        self.frames
    }

    /// [GA3] First cache whose object size covers `size`.
    pub fn cache_for(&self, size: usize) -> Option<&SlabCache> {
        self.caches.iter().find(|c| c.object_size() >= size)
    }

    /// [GA3] Allocate `size` bytes. `None` when no class is large enough or memory
    /// ran out.
    pub fn alloc(&self, size: usize) -> Option<NonNull<u8>> {
        let cache = self.cache_for(size)?;
        cache.alloc(self.frames).ok()
    }

    /// [GA4] Allocate honouring `layout.align()` as well as its size.
    pub fn alloc_layout(&self, layout: Layout) -> Option<NonNull<u8>> {
        let cache = self
            .caches
            .iter()
            .find(|c| c.object_size() >= layout.size() && c.align() >= layout.align())?;
        cache.alloc(self.frames).ok()
    }

    /// [GA5] Free memory obtained from this allocator.
    ///
    /// The owning cache is found through the frame descriptor of the page holding
    /// `ptr`. A frame without a cache back-reference means a double free or a
    /// pointer this allocator never handed out.
    ///
    /// # Safety
    /// `ptr` must not be used after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) -> Result<(), SlabError> {
        let addr = ptr.as_ptr() as usize;
        let Some((_, cache)) = self.frames.slab_owner(addr) else {
            log::error!("[HEAP] free({addr:#x}): no slab owns this frame (double free or foreign pointer)");
            return Err(SlabError::NotSlabOwned);
        };
        if !self.caches.iter().any(|c| core::ptr::eq(c, cache.as_ptr())) {
            log::error!("[HEAP] free({addr:#x}): slab belongs to a cache outside this allocator");
            return Err(SlabError::ForeignObject);
        }
        // SAFETY: cache is one of ours and the descriptor says it owns ptr
        cache.as_ref().free(self.frames, ptr)
    }

    /// [GA6] Flush every magazine and release every empty slab.
    pub fn shrink(&self) -> Result<(), SlabError> {
        self.caches
            .iter()
            .try_for_each(|cache| cache.shrink(self.frames))
    }

    pub fn caches(&self) -> &[SlabCache] {
        &self.caches
    }
}

// SAFETY: alloc returns memory from slab caches sized and aligned per the layout;
// dealloc routes through the frame descriptor lookup.
unsafe impl GlobalAlloc for GeneralAllocator<'_> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc_layout(layout)
            .map_or(core::ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            if let Err(e) = self.free(ptr) {
                log::error!("[HEAP] dealloc({:p}) failed: {e}", ptr.as_ptr());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::frame_pool;
    use std::boxed::Box;
    use std::vec::Vec;

    fn heap(frames: usize) -> &'static GeneralAllocator<'static> {
        Box::leak(Box::new(GeneralAllocator::new(frame_pool(frames))))
    }

    /// Tests: [GA1] classes ascending, each with a valid slab layout
    #[test]
    fn test_size_classes() {
        assert!(SIZE_CLASSES.windows(2).all(|w| w[0] < w[1]));
        for (layout, &size) in CLASS_LAYOUTS.iter().zip(SIZE_CLASSES.iter()) {
            assert_eq!(layout.object_size, size);
            assert!(layout.objects > 0);
        }
        assert_eq!(class_align(96), 32);
        assert_eq!(class_align(4096), 64);
    }

    /// Tests: [GA3] requests route to the smallest fitting class
    #[test]
    fn test_routing() {
        let heap = heap(64);
        assert_eq!(heap.cache_for(1).unwrap().object_size(), 8);
        assert_eq!(heap.cache_for(65).unwrap().object_size(), 96);
        assert_eq!(heap.cache_for(4096).unwrap().object_size(), 4096);
        assert!(heap.cache_for(4097).is_none());
        assert!(heap.alloc(8192).is_none());
    }

    /// Tests: [GA3][GA5] alloc/free through the descriptor back-reference
    #[test]
    fn test_alloc_free_roundtrip() {
        let heap = heap(128);
        let frames = heap.frames();
        let before = frames.stats().free;

        let ptrs: Vec<NonNull<u8>> = [24, 100, 700, 3000]
            .iter()
            .map(|&size| heap.alloc(size).unwrap())
            .collect();
        for ptr in ptrs {
            unsafe { heap.free(ptr).unwrap() };
        }

        heap.shrink().unwrap();
        assert_eq!(frames.stats().free, before);
    }

    /// Tests: [GA3][GA5] objects stay private to their owner under contention
    /// and every frame comes back once the caches shrink
    #[test]
    fn test_concurrent_alloc_free_conserves_frames() {
        let heap = heap(256);
        let frames = heap.frames();
        let before = frames.stats().free;

        std::thread::scope(|s| {
            for t in 0..4usize {
                s.spawn(move || {
                    let tag = t as u8 + 1;
                    let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
                    for i in 0..400 {
                        let size = SIZE_CLASSES[(i * 7 + t) % 8];
                        let ptr = heap.alloc(size).unwrap();
                        unsafe { ptr.as_ptr().write_bytes(tag, size) };
                        live.push((ptr, size));
                        if live.len() > 32 {
                            let (ptr, size) = live.swap_remove(i % live.len());
                            let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), size) };
                            assert!(bytes.iter().all(|&b| b == tag));
                            unsafe { heap.free(ptr).unwrap() };
                        }
                    }
                    for (ptr, _) in live {
                        unsafe { heap.free(ptr).unwrap() };
                    }
                });
            }
        });

        heap.shrink().unwrap();
        assert_eq!(frames.stats().free, before);
    }

    /// Tests: [GA5] pointers without a cache back-reference are rejected
    #[test]
    fn test_free_foreign_pointer() {
        let heap = heap(16);
        let frames = heap.frames();

        let pa = frames.alloc(0).unwrap();
        let va = NonNull::new(frames.phys_to_virt(pa) as *mut u8).unwrap();
        assert_eq!(unsafe { heap.free(va) }, Err(SlabError::NotSlabOwned));

        // A slab of a standalone cache is not ours either
        let other = Box::leak(Box::new(SlabCache::new(64, 0).unwrap()));
        let obj = other.alloc(frames).unwrap();
        assert_eq!(unsafe { heap.free(obj) }, Err(SlabError::ForeignObject));
    }

    /// Tests: [GA4] alignment is honoured
    #[test]
    fn test_alloc_layout_alignment() {
        let heap = heap(64);
        let layout = Layout::from_size_align(40, 32).unwrap();
        let ptr = heap.alloc_layout(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 32, 0);

        let too_aligned = Layout::from_size_align(64, 4096).unwrap();
        assert!(heap.alloc_layout(too_aligned).is_none());

        unsafe { GlobalAlloc::dealloc(heap, ptr.as_ptr(), layout) };
    }
}
