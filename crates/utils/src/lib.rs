#![cfg_attr(not(any(test, feature = "std")), no_std)]

// Re-export spin crate types as our lock API.
pub use spin::{Mutex, MutexGuard};

/// Fixed-capacity LIFO stack with bulk removal of its oldest entries.
///
/// Backs the per-cache object magazine: the hot end is popped and pushed on every
/// call, and the cold end is drained in batches when the stack fills up.
pub struct BoundedStack<T: Copy, const N: usize> {
    buffer: [T; N],
    len: usize,
}

impl<T: Copy + Default, const N: usize> Default for BoundedStack<T, N> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy, const N: usize> BoundedStack<T, N> {
    /// [K1] New stack is empty
    #[must_use]
    pub const fn new(default_val: T) -> Self {
        Self {
            buffer: [default_val; N],
            len: 0,
        }
    }

    /// [K2] Push adds on top, [K4] returns false when full
    pub fn push(&mut self, item: T) -> bool {
        if self.len == N {
            return false; // [K4]
        }
        self.buffer[self.len] = item;
        self.len += 1;
        true
    }

    /// [K3] Pop removes newest (LIFO), [K5] returns None when empty
    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None; // [K5]
        }
        self.len -= 1;
        Some(self.buffer[self.len])
    }

    /// [K6] Removes up to `count` of the oldest entries, handing each to `f`
    /// oldest-first. The remaining entries keep their relative order.
    pub fn drain_oldest(&mut self, count: usize, mut f: impl FnMut(T)) -> usize {
        let count = count.min(self.len);
        for &item in &self.buffer[..count] {
            f(item);
        }
        self.buffer.copy_within(count..self.len, 0);
        self.len -= count;
        count
    }

    pub fn contains(&self, item: &T) -> bool
    where
        T: PartialEq,
    {
        self.buffer[..self.len].contains(item)
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn is_full(&self) -> bool {
        self.len == N
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
