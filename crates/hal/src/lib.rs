#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Memory core: frame allocator, object caches, general allocator and the
// page-table format. Everything above (address spaces, faults) lives in kmem_vm.

pub mod allocator;
pub mod interrupts;
pub mod layout;
pub mod memory;
pub mod mmu;
pub mod traits;

#[cfg(any(test, feature = "std"))]
pub mod testing;

pub use allocator::{FrameError, GeneralAllocator, KBox, SlabCache, SlabError};
pub use memory::{FRAME_ALLOCATOR, FrameAllocator, FrameStats};
pub use mmu::MmuError;
pub use traits::PageAllocator;

use core::mem::ManuallyDrop;
use kmem_utils::{Mutex, MutexGuard};

/// IRQ-safe lock that disables interrupts while held.
/// Behaviors: [L1]-[L4] interrupt-safe locking
pub struct IrqSafeLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSafeLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    /// [L1] Disables interrupts before acquiring, [L4] data accessible through guard
    pub fn lock(&self) -> IrqSafeLockGuard<'_, T> {
        let state = interrupts::disable(); // [L1] disable before acquire
        let guard = self.inner.lock();
        IrqSafeLockGuard {
            guard: ManuallyDrop::new(guard), // [L4] data access
            state,
        }
    }
}

pub struct IrqSafeLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    state: u64,
}

impl<T> core::ops::Deref for IrqSafeLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for IrqSafeLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IrqSafeLockGuard<'_, T> {
    /// [L2] Restores interrupts after releasing
    fn drop(&mut self) {
        // SAFETY: guard is only dropped once, here in Drop, before restoring interrupts
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        interrupts::restore(self.state); // [L2] restore on drop
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
