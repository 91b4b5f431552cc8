//! Compile-time memory layout constants.

/// Size of one physical frame and of one leaf mapping.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// Number of buddy orders. The largest block is `2^(MAX_ORDER - 1)` frames (4 MiB).
pub const MAX_ORDER: usize = 11;

/// Largest frame order a slab may span.
pub const SLAB_MAX_ORDER: usize = 3;
/// A slab layout is accepted at the first order that holds this many objects.
pub const SLAB_MIN_OBJECTS: usize = 8;
/// Empty slabs are released once a cache holds more than this many slabs' worth
/// of free objects.
pub const SLAB_FREE_LIMIT_SLABS: usize = 2;

/// Object pointers a cache keeps ready without touching slab metadata.
pub const MAGAZINE_CAPACITY: usize = 16;
/// Objects moved per refill from / flush to the slabs.
pub const MAGAZINE_BATCH: usize = MAGAZINE_CAPACITY / 2;

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Bytes covered by a block of `order`.
#[inline]
pub const fn order_size(order: usize) -> usize {
    PAGE_SIZE << order
}
