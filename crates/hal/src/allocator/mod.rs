// Allocator stack, leaves first:
// buddy (frames) -> slab (object caches) -> general (size classes) -> KBox.

pub mod buddy;
pub mod general;
pub mod intrusive_list;
pub mod kbox;
pub mod page;
pub mod slab;

pub use buddy::{BuddyAllocator, FrameError};
pub use general::{GeneralAllocator, SIZE_CLASSES};
pub use kbox::KBox;
pub use page::{FrameState, Page};
pub use slab::{CacheStats, SlabCache, SlabError, create_cache};
