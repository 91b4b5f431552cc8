use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use super::general::GeneralAllocator;
use super::slab::SlabError;
use core::alloc::Layout;

/// Owning pointer to a `T` stored in general-allocator memory.
///
/// Kernel records (VMAs, address spaces) live here instead of the global heap so
/// their memory is accounted to the same frame pool as everything else and an
/// allocation failure comes back as an error instead of an abort.
pub struct KBox<'h, T> {
    ptr: NonNull<T>,
    heap: &'h GeneralAllocator<'h>,
}

// SAFETY: KBox owns its T exclusively, like Box
unsafe impl<T: Send> Send for KBox<'_, T> {}
unsafe impl<T: Sync> Sync for KBox<'_, T> {}

impl<'h, T> KBox<'h, T> {
    /// Move `value` into a fresh object from `heap`.
    pub fn try_new(value: T, heap: &'h GeneralAllocator<'h>) -> Result<Self, SlabError> {
        let layout = Layout::new::<T>();
        let ptr = heap
            .alloc_layout(layout)
            .ok_or(SlabError::OutOfMemory)?
            .cast::<T>();
        // SAFETY: fresh allocation, sized and aligned for T
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self { ptr, heap })
    }

    /// Give up ownership without dropping; pair with [`from_raw`](Self::from_raw).
    pub fn into_raw(this: Self) -> NonNull<T> {
        let this = ManuallyDrop::new(this);
        this.ptr
    }

    /// Re-own a pointer produced by [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` on a box allocated from `heap`, and must not
    /// be re-owned twice.
    pub unsafe fn from_raw(ptr: NonNull<T>, heap: &'h GeneralAllocator<'h>) -> Self {
        Self { ptr, heap }
    }

    pub fn as_ptr(this: &Self) -> NonNull<T> {
        this.ptr
    }
}

impl<T> Deref for KBox<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and owned for the lifetime of the box
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for KBox<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: ptr is valid and uniquely owned
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for KBox<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the value is initialised and dropped exactly once, then its
        // storage goes back to the allocator it came from
        unsafe {
            core::ptr::drop_in_place(self.ptr.as_ptr());
            if let Err(e) = self.heap.free(self.ptr.cast()) {
                log::error!("[HEAP] KBox storage at {:p} not returned: {e}", self.ptr);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for KBox<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
