use core::ptr::NonNull;

use kmem_utils::BoundedStack;

use crate::layout::MAGAZINE_CAPACITY;

/// Per-cache stack of ready object pointers.
///
/// Allocation pops the most recently freed object, so a free followed by an
/// allocation on an idle cache hands back the same address. When the stack is
/// full, the oldest entries are the ones flushed back to their slabs.
pub struct Magazine {
    stack: BoundedStack<usize, MAGAZINE_CAPACITY>,
}

impl Default for Magazine {
    fn default() -> Self {
        Self::new()
    }
}

impl Magazine {
    pub const fn new() -> Self {
        Self {
            stack: BoundedStack::new(0),
        }
    }

    pub fn pop(&mut self) -> Option<NonNull<u8>> {
        self.stack.pop().and_then(|addr| NonNull::new(addr as *mut u8))
    }

    /// Returns false (and drops nothing) when full.
    pub fn push(&mut self, ptr: NonNull<u8>) -> bool {
        self.stack.push(ptr.as_ptr() as usize)
    }

    pub(super) fn push_addr(&mut self, addr: usize) -> bool {
        self.stack.push(addr)
    }

    /// Move up to `count` of the oldest objects into `out`, returning how many.
    pub fn take_oldest(&mut self, count: usize, out: &mut [usize; MAGAZINE_CAPACITY]) -> usize {
        let mut n = 0;
        self.stack.drain_oldest(count.min(MAGAZINE_CAPACITY), |addr| {
            out[n] = addr;
            n += 1;
        });
        n
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.stack.contains(&addr)
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.stack.is_full()
    }
}
