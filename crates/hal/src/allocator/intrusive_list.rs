// Intrusive doubly-linked list shared by the buddy free lists and the slab lists.

use core::ptr::NonNull;

/// Intrusive list node trait.
/// Types stored in an `IntrusiveList` must implement this to provide list pointers.
pub trait ListNode: Sized {
    fn next(&self) -> Option<NonNull<Self>>;
    fn prev(&self) -> Option<NonNull<Self>>;
    fn set_next(&mut self, next: Option<NonNull<Self>>);
    fn set_prev(&mut self, prev: Option<NonNull<Self>>);
}

/// Intrusive doubly-linked list.
///
/// The list never owns its nodes; frame descriptors and slab headers live in
/// memory managed elsewhere and only lend their link fields.
///
/// # Invariants
/// - All nodes maintain valid prev/next pointers
/// - head.prev is None
/// - Empty list has head = None and count = 0
pub struct IntrusiveList<T: ListNode> {
    head: Option<NonNull<T>>,
    count: usize,
}

// SAFETY: the list is only reachable through the lock of the allocator that owns it
unsafe impl<T: ListNode> Send for IntrusiveList<T> {}

impl<T: ListNode> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ListNode> IntrusiveList<T> {
    /// Create an empty list.
    pub const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    /// Insert node at the front of the list. O(1).
    ///
    /// `node` must not already be in this or another list.
    pub fn push_front(&mut self, node: &mut T) {
        let new_node = NonNull::from(&mut *node);

        node.set_next(self.head);
        node.set_prev(None);

        if let Some(mut old_head) = self.head {
            // SAFETY: old_head is a live member of this list
            unsafe {
                old_head.as_mut().set_prev(Some(new_node));
            }
        }

        self.head = Some(new_node);
        self.count += 1;
    }

    /// Remove a specific node from the list. O(1).
    ///
    /// `node` must be in this list.
    pub fn remove(&mut self, node: &mut T) {
        let prev = node.prev();
        let next = node.next();

        match prev {
            // SAFETY: prev_node is valid and within this list
            Some(mut prev_node) => unsafe { prev_node.as_mut().set_next(next) },
            None => self.head = next,
        }

        if let Some(mut next_node) = next {
            // SAFETY: next_node is valid and within this list
            unsafe { next_node.as_mut().set_prev(prev) };
        }

        node.set_next(None);
        node.set_prev(None);

        self.count -= 1;
    }

    /// Remove and return the node at the front of the list. O(1).
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let mut head = self.head?;
        // SAFETY: head is a live member of this list
        self.remove(unsafe { head.as_mut() });
        Some(head)
    }

    /// Head of the list without removing it.
    pub fn head(&self) -> Option<NonNull<T>> {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Walk the list front to back.
    ///
    /// The list must not be modified while the iterator is alive.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _list: core::marker::PhantomData,
        }
    }
}

pub struct Iter<'a, T: ListNode> {
    next: Option<NonNull<T>>,
    _list: core::marker::PhantomData<&'a IntrusiveList<T>>,
}

impl<T: ListNode> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    fn next(&mut self) -> Option<NonNull<T>> {
        let node = self.next?;
        // SAFETY: nodes stay linked while the list is borrowed
        self.next = unsafe { node.as_ref().next() };
        Some(node)
    }
}
