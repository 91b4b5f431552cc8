// Slab layer: object caches built on multi-frame slabs.
// Behavior IDs for the cache itself live in cache.rs.

mod cache;
mod magazine;
mod page;

pub use cache::{CacheStats, SlabCache};
pub use magazine::Magazine;
pub use page::{Slab, SlabLayout};

use kmem_error::define_kernel_error;

use super::buddy::FrameError;

define_kernel_error! {
    /// Errors reported by the object caches and the general allocator.
    pub enum SlabError(0x02) {
        /// No frames left to grow a cache
        OutOfMemory = 0x01 => "Out of memory for slab growth",
        /// Zero size, bad alignment, or too large for any slab
        InvalidSize = 0x02 => "Object size not supported",
        /// Pointer's frame carries no cache back-reference (double free or foreign pointer)
        NotSlabOwned = 0x03 => "Pointer not owned by any slab",
        /// Pointer belongs to a slab of a different cache
        ForeignObject = 0x04 => "Pointer belongs to another cache",
        /// Pointer is not on an object boundary of its slab
        Misaligned = 0x05 => "Pointer is not a live object",
        /// Teardown requested while objects are still allocated
        InUse = 0x06 => "Cache still has live objects",
        Frame(FrameError) = 0x07 => "Frame allocator rejected slab frames",
        /// Object is already free (in the magazine or its slab)
        DoubleFree = 0x08 => "Object freed twice",
    }
}

/// Create a cache for `object_size`-byte objects with the given alignment
/// (0 selects word alignment).
pub fn create_cache(object_size: usize, alignment: usize) -> Result<SlabCache, SlabError> {
    SlabCache::new(object_size, alignment)
}
