// User address-space layout.

use kmem_hal::mmu::{TOP_SLOT_SPAN, USER_TOP_SLOTS};

pub use kmem_hal::layout::PAGE_SIZE;

/// Lowest address handed out by the region search. Explicit hints below it are
/// still honoured.
pub const MMAP_BASE: usize = 0x0040_0000;

/// End of the user range: everything reachable through the per-space top-level
/// slots (512GB).
pub const USER_SPACE_END: usize = USER_TOP_SLOTS * TOP_SLOT_SPAN;
