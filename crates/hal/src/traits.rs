//! Architecture-independent traits used across the memory core.

/// Trait for physical page allocation, used by the MMU for dynamic page tables.
///
/// Page tables only ever need single frames, and they need them zeroed, so the
/// MMU code goes through this narrow interface instead of the full frame allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocate a zeroed 4KB physical page.
    fn alloc_page(&self) -> Option<usize>;
    /// Free a 4KB physical page.
    fn free_page(&self, pa: usize);
    /// Virtual address through which the kernel reaches `pa`.
    fn phys_to_virt(&self, pa: usize) -> usize;
}
