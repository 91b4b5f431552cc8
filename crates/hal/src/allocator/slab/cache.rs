// Object cache: fixed-size objects carved out of multi-frame slabs.
// Behavior IDs [S1]-[S10] are referenced by the tests below.

use core::ptr::NonNull;

use super::super::intrusive_list::IntrusiveList;
use super::SlabError;
use super::magazine::Magazine;
use super::page::{Slab, SlabLayout};
use crate::IrqSafeLock;
use crate::layout::{MAGAZINE_BATCH, MAGAZINE_CAPACITY, SLAB_FREE_LIMIT_SLABS};
use crate::memory::FrameAllocator;

/// Lock-protected part of a cache.
///
/// # Lists
/// - `partial`: slabs with some objects handed out (refill target)
/// - `full`: slabs with every object handed out
/// - `free`: slabs with no live objects (destruction candidates)
struct CacheInner {
    free: IntrusiveList<Slab>,
    partial: IntrusiveList<Slab>,
    full: IntrusiveList<Slab>,
    /// Objects sitting free inside slabs (the magazine is not counted).
    free_objects: usize,
    slabs: usize,
    magazine: Magazine,
    total_allocs: usize,
    total_frees: usize,
}

/// Counters exposed for diagnostics and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub slabs: usize,
    pub free_objects: usize,
    pub magazine: usize,
    pub total_allocs: usize,
    pub total_frees: usize,
}

/// A cache of equally sized objects.
///
/// Slab frames record a pointer back to their cache, so a cache must stay at one
/// address from its first allocation until [`destroy`](Self::destroy).
pub struct SlabCache {
    layout: SlabLayout,
    /// Empty slabs are released while the cache holds more free objects than this.
    free_limit: usize,
    inner: IrqSafeLock<CacheInner>,
}

impl SlabCache {
    /// [S1] Create a cache for objects of `object_size` bytes aligned to `align`
    /// (0 = word alignment). No frames are taken until the first allocation.
    pub fn new(object_size: usize, align: usize) -> Result<Self, SlabError> {
        SlabLayout::compute(object_size, align)
            .map(Self::from_layout)
            .ok_or(SlabError::InvalidSize)
    }

    pub(crate) const fn from_layout(layout: SlabLayout) -> Self {
        Self {
            layout,
            free_limit: SLAB_FREE_LIMIT_SLABS * layout.objects,
            inner: IrqSafeLock::new(CacheInner {
                free: IntrusiveList::new(),
                partial: IntrusiveList::new(),
                full: IntrusiveList::new(),
                free_objects: 0,
                slabs: 0,
                magazine: Magazine::new(),
                total_allocs: 0,
                total_frees: 0,
            }),
        }
    }

    /// Allocate one object.
    ///
    /// # Behavior
    /// [S2] Pop from the magazine
    /// [S3] Refill it from partial slabs, then free slabs
    /// [S4] Grow by one slab only when both lists are empty, then retry once
    pub fn alloc(&self, frames: &FrameAllocator) -> Result<NonNull<u8>, SlabError> {
        let mut inner = self.inner.lock();

        if let Some(obj) = inner.magazine.pop() {
            inner.total_allocs += 1;
            return Ok(obj); // [S2]
        }

        self.fill_magazine(&mut inner); // [S3]
        if inner.magazine.is_empty() {
            self.grow(&mut inner, frames)?; // [S4]
            self.fill_magazine(&mut inner);
        }

        let obj = inner.magazine.pop().ok_or(SlabError::OutOfMemory)?;
        inner.total_allocs += 1;
        Ok(obj)
    }

    /// Free one object.
    ///
    /// # Behavior
    /// [S5] Push onto the magazine
    /// [S6] When full, flush the oldest batch back into the owning slabs first
    /// [S10] Pointers that are not the start of a live object of this cache are
    /// rejected before they reach the magazine
    ///
    /// # Safety
    /// `ptr` must have come from [`alloc`](Self::alloc) on this cache and must not
    /// be used afterwards.
    pub unsafe fn free(&self, frames: &FrameAllocator, ptr: NonNull<u8>) -> Result<(), SlabError> {
        let addr = ptr.as_ptr() as usize;
        let mut inner = self.inner.lock();
        if let Err(e) = self.check_live(&inner, frames, addr) {
            log::error!("[SLAB] free({addr:#x}) rejected: {e}");
            return Err(e);
        }
        inner.total_frees += 1;

        let flushed = if inner.magazine.is_full() {
            self.flush(&mut inner, frames, MAGAZINE_BATCH) // [S6]
        } else {
            Ok(())
        };

        inner.magazine.push(ptr); // [S5]
        flushed
    }

    /// [S8] Flush the magazine and give every empty slab back to the frame allocator.
    pub fn shrink(&self, frames: &FrameAllocator) -> Result<(), SlabError> {
        let mut inner = self.inner.lock();
        let held = inner.magazine.len();
        let flushed = self.flush(&mut inner, frames, held);

        while let Some(mut slab) = inner.free.pop_front() {
            // SAFETY: slab was linked on our free list
            self.destroy_slab(&mut inner, frames, unsafe { slab.as_mut() })?;
        }
        flushed
    }

    /// [S9] Tear the cache down. Fails with `InUse` while objects are still live;
    /// the cache stays usable in that case.
    pub fn destroy(&self, frames: &FrameAllocator) -> Result<(), SlabError> {
        self.shrink(frames)?;
        let inner = self.inner.lock();
        if !inner.partial.is_empty() || !inner.full.is_empty() {
            return Err(SlabError::InUse);
        }
        Ok(())
    }

    pub fn object_size(&self) -> usize {
        self.layout.object_size
    }

    pub fn align(&self) -> usize {
        self.layout.align
    }

    /// Frame order of one slab.
    pub fn order(&self) -> usize {
        self.layout.order
    }

    pub fn objects_per_slab(&self) -> usize {
        self.layout.objects
    }

    pub fn free_limit(&self) -> usize {
        self.free_limit
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            slabs: inner.slabs,
            free_objects: inner.free_objects,
            magazine: inner.magazine.len(),
            total_allocs: inner.total_allocs,
            total_frees: inner.total_frees,
        }
    }

    /// Move objects from slabs into the magazine until a batch is ready or the
    /// slabs run dry. Partial slabs are drained before free ones.
    fn fill_magazine(&self, inner: &mut CacheInner) {
        while inner.magazine.len() < MAGAZINE_BATCH {
            let Some(mut slab_ptr) = inner.partial.head().or_else(|| inner.free.head()) else {
                break;
            };
            // SAFETY: slab_ptr is linked on one of our lists
            let slab = unsafe { slab_ptr.as_mut() };
            let was_empty = slab.is_empty();
            let Some(obj) = slab.take(self.layout.object_size) else {
                break;
            };
            inner.free_objects -= 1;

            if was_empty {
                inner.free.remove(slab);
                if slab.is_full() {
                    inner.full.push_front(slab);
                } else {
                    inner.partial.push_front(slab);
                }
            } else if slab.is_full() {
                inner.partial.remove(slab);
                inner.full.push_front(slab);
            }

            inner.magazine.push_addr(obj);
        }
    }

    fn grow(&self, inner: &mut CacheInner, frames: &FrameAllocator) -> Result<(), SlabError> {
        let order = self.layout.order;
        let pa = frames.alloc(order).map_err(|_| {
            log::warn!("[SLAB] out of frames growing {}-byte cache", self.layout.object_size);
            SlabError::OutOfMemory
        })?;

        // SAFETY: the block was just allocated and is mapped through the direct map
        let mut slab = unsafe { Slab::init(frames.phys_to_virt(pa), pa, &self.layout) };
        if let Err(e) = frames.assign_slab(pa, order, slab, NonNull::from(self)) {
            // free() logs its own rejection
            if frames.free(pa, order).is_err() {
                log::error!("[SLAB] slab block {pa:#x} leaked after failed assignment");
            }
            return Err(SlabError::Frame(e));
        }

        // SAFETY: freshly initialised header, not on any list yet
        inner.free.push_front(unsafe { slab.as_mut() });
        inner.free_objects += self.layout.objects;
        inner.slabs += 1;
        log::trace!(
            "[SLAB] grow {}-byte cache: slab {:#x} order {} ({} objects)",
            self.layout.object_size,
            pa,
            order,
            self.layout.objects
        );
        Ok(())
    }

    /// Return up to `count` of the oldest magazine entries to their slabs.
    /// Every entry is processed; the first error is reported.
    fn flush(&self, inner: &mut CacheInner, frames: &FrameAllocator, count: usize) -> Result<(), SlabError> {
        let mut batch = [0usize; MAGAZINE_CAPACITY];
        let n = inner.magazine.take_oldest(count, &mut batch);

        let mut result = Ok(());
        for &addr in &batch[..n] {
            if let Err(e) = self.return_object(inner, frames, addr) {
                log::error!("[SLAB] flush of {addr:#x} failed: {e}");
                result = result.and(Err(e));
            }
        }

        // [S7] Keep the free-object count under the ceiling where empty slabs allow it
        while inner.free_objects > self.free_limit {
            let Some(mut slab) = inner.free.pop_front() else {
                break;
            };
            // SAFETY: slab was linked on our free list
            self.destroy_slab(inner, frames, unsafe { slab.as_mut() })?;
        }
        result
    }

    /// `addr` must start an object of one of our slabs that is neither in the
    /// magazine nor on its slab's free chain.
    fn check_live(&self, inner: &CacheInner, frames: &FrameAllocator, addr: usize) -> Result<(), SlabError> {
        let (slab_ptr, cache) = frames.slab_owner(addr).ok_or(SlabError::NotSlabOwned)?;
        if cache != NonNull::from(self) {
            return Err(SlabError::ForeignObject);
        }
        // SAFETY: the frame descriptor points at a live slab of this cache, and
        // the cache lock is held
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let idx = slab.object_index(addr, self.layout.object_size)?;
        if inner.magazine.contains(addr) || slab.is_free(idx) {
            return Err(SlabError::DoubleFree);
        }
        Ok(())
    }

    /// Put one object back into its slab and move the slab between lists.
    fn return_object(&self, inner: &mut CacheInner, frames: &FrameAllocator, addr: usize) -> Result<(), SlabError> {
        let (slab_ptr, cache) = frames.slab_owner(addr).ok_or(SlabError::NotSlabOwned)?;
        if cache != NonNull::from(self) {
            return Err(SlabError::ForeignObject);
        }
        // SAFETY: the frame descriptor points at a live slab of this cache
        let slab = unsafe { &mut *slab_ptr.as_ptr() };

        let was_full = slab.is_full();
        slab.put(addr, self.layout.object_size)?;
        inner.free_objects += 1;

        if slab.is_empty() {
            if was_full {
                inner.full.remove(slab);
            } else {
                inner.partial.remove(slab);
            }
            // [S7] release empty slabs while above the free ceiling
            if inner.free_objects > self.free_limit {
                self.destroy_slab(inner, frames, slab)?;
            } else {
                inner.free.push_front(slab);
            }
        } else if was_full {
            inner.full.remove(slab);
            inner.partial.push_front(slab);
        }
        Ok(())
    }

    /// Hand an unlinked, empty slab back to the frame allocator.
    fn destroy_slab(&self, inner: &mut CacheInner, frames: &FrameAllocator, slab: &mut Slab) -> Result<(), SlabError> {
        inner.free_objects -= slab.capacity();
        inner.slabs -= 1;
        let pa = slab.pa();
        log::trace!("[SLAB] release {}-byte slab {:#x}", self.layout.object_size, pa);
        frames.release_slab(pa, self.layout.order).map_err(SlabError::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SLAB_MIN_OBJECTS;
    use crate::testing::frame_pool;
    use std::vec::Vec;

    /// Tests: [S1] layout recorded, no frames taken on creation
    #[test]
    fn test_create_cache() {
        let frames = frame_pool(16);
        let before = frames.stats().free;
        let cache = SlabCache::new(64, 0).unwrap();

        assert_eq!(cache.object_size(), 64);
        assert_eq!(cache.order(), 0);
        assert!(cache.objects_per_slab() >= SLAB_MIN_OBJECTS);
        assert_eq!(cache.free_limit(), 2 * cache.objects_per_slab());
        assert_eq!(frames.stats().free, before);
        assert_eq!(SlabCache::new(0, 0).err(), Some(SlabError::InvalidSize));
    }

    /// Tests: [S2][S5] free then alloc on an idle cache returns the same address
    #[test]
    fn test_slab_identity() {
        let frames = frame_pool(16);
        let cache = SlabCache::new(48, 16).unwrap();

        let a = cache.alloc(frames).unwrap();
        let _b = cache.alloc(frames).unwrap();
        unsafe { cache.free(frames, a).unwrap() };
        assert_eq!(cache.alloc(frames).unwrap(), a);
        assert_eq!(a.as_ptr() as usize % 16, 0);
    }

    /// Tests: [S3][S4] objects are distinct and carry their slab back-reference
    #[test]
    fn test_objects_are_distinct() {
        let frames = frame_pool(32);
        let cache = SlabCache::new(256, 0).unwrap();
        let count = cache.objects_per_slab() * 2 + 3;

        let mut seen: Vec<usize> = (0..count)
            .map(|_| cache.alloc(frames).unwrap().as_ptr() as usize)
            .collect();
        for &addr in &seen {
            let (_, owner) = frames.slab_owner(addr).unwrap();
            assert_eq!(owner, NonNull::from(&cache));
            // Writable
            unsafe { core::ptr::write_bytes(addr as *mut u8, 0xAB, 256) };
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), count);
        assert_eq!(cache.stats().slabs, 3);
    }

    /// Tests: [S6][S7] 300 objects allocated and freed leave at most `free_limit`
    /// free objects in slabs; [S8] shrink returns every frame
    #[test]
    fn test_free_limit_releases_slabs() {
        let frames = frame_pool(64);
        let before = frames.stats().free;
        let cache = SlabCache::new(64, 0).unwrap();

        let objs: Vec<NonNull<u8>> = (0..300).map(|_| cache.alloc(frames).unwrap()).collect();
        let peak = cache.stats().slabs;
        assert!(peak * cache.objects_per_slab() >= 300);

        for obj in objs {
            unsafe { cache.free(frames, obj).unwrap() };
        }

        let stats = cache.stats();
        assert!(stats.free_objects <= cache.free_limit());
        assert!(stats.slabs < peak);
        assert!(stats.magazine <= MAGAZINE_CAPACITY);

        cache.shrink(frames).unwrap();
        assert_eq!(cache.stats().slabs, 0);
        assert_eq!(frames.stats().free, before);
    }

    /// Tests: [S10] interior pointers and double frees never reach the magazine
    #[test]
    fn test_free_rejects_bad_pointers() {
        let frames = frame_pool(16);
        let cache = SlabCache::new(64, 0).unwrap();
        let other = SlabCache::new(64, 0).unwrap();

        let a = cache.alloc(frames).unwrap();
        let b = cache.alloc(frames).unwrap();
        let stranger = other.alloc(frames).unwrap();
        let held = cache.stats().magazine;

        let interior = NonNull::new(a.as_ptr().wrapping_add(8)).unwrap();
        assert_eq!(unsafe { cache.free(frames, interior) }, Err(SlabError::Misaligned));
        assert_eq!(unsafe { cache.free(frames, stranger) }, Err(SlabError::ForeignObject));
        assert_eq!(cache.stats().magazine, held);

        // Second free while the object still sits in the magazine
        unsafe { cache.free(frames, a).unwrap() };
        assert_eq!(unsafe { cache.free(frames, a) }, Err(SlabError::DoubleFree));
        assert_eq!(cache.stats().magazine, held + 1);

        // Second free after the object went back to its slab
        cache.shrink(frames).unwrap();
        assert_eq!(unsafe { cache.free(frames, a) }, Err(SlabError::DoubleFree));

        // The rejected frees handed nothing out twice
        let again = cache.alloc(frames).unwrap();
        let next = cache.alloc(frames).unwrap();
        assert_ne!(again, next);
        assert_ne!(again, b);
        assert_ne!(next, b);

        unsafe {
            cache.free(frames, b).unwrap();
            cache.free(frames, again).unwrap();
            cache.free(frames, next).unwrap();
            other.free(frames, stranger).unwrap();
        }
    }

    /// Tests: [S4] growth failure surfaces as OutOfMemory
    #[test]
    fn test_grow_out_of_memory() {
        let frames = frame_pool(1);
        let cache = SlabCache::new(2048, 0).unwrap();
        assert!(cache.order() > 0);
        assert_eq!(cache.alloc(frames), Err(SlabError::OutOfMemory));
    }

    /// Tests: [S9] destroy refuses while objects are live
    #[test]
    fn test_destroy() {
        let frames = frame_pool(16);
        let before = frames.stats().free;
        let cache = SlabCache::new(128, 0).unwrap();

        let obj = cache.alloc(frames).unwrap();
        assert_eq!(cache.destroy(frames), Err(SlabError::InUse));
        unsafe { cache.free(frames, obj).unwrap() };
        cache.destroy(frames).unwrap();
        assert_eq!(frames.stats().free, before);
    }
}
