// Slab header and layout.
//
// A slab occupies `2^order` contiguous frames. The first bytes hold the `Slab`
// record followed by the free-index array (one u16 per object, the index of the
// next free object). Objects start at the first suitably aligned offset after it.

use core::mem::size_of;
use core::ptr::NonNull;

use super::super::intrusive_list::ListNode;
use super::SlabError;
use crate::layout::{SLAB_MAX_ORDER, SLAB_MIN_OBJECTS, align_up, order_size};

/// End-of-chain marker in the free-index array.
const NO_FREE: u16 = u16::MAX;

/// Geometry shared by every slab of one cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlabLayout {
    /// Object size after rounding up to `align`.
    pub object_size: usize,
    pub align: usize,
    /// Frame order of one slab.
    pub order: usize,
    /// Objects per slab.
    pub objects: usize,
    /// Offset of the first object from the start of the slab.
    pub data_offset: usize,
}

impl SlabLayout {
    /// Pick the smallest slab order that holds `SLAB_MIN_OBJECTS` objects, falling
    /// back to the largest order when objects are too big for that.
    ///
    /// `align == 0` selects word alignment. Returns `None` for zero-sized objects,
    /// non power-of-two alignment, or objects that do not fit any slab.
    pub const fn compute(object_size: usize, align: usize) -> Option<Self> {
        let align = if align == 0 { size_of::<usize>() } else { align };
        if object_size == 0 || !align.is_power_of_two() {
            return None;
        }
        let object_size = align_up(object_size, align);

        let mut best = None;
        let mut order = 0;
        while order <= SLAB_MAX_ORDER {
            let objects = Self::objects_fitting(order_size(order), object_size, align);
            if objects > 0 {
                let layout = Self {
                    object_size,
                    align,
                    order,
                    objects,
                    data_offset: Self::data_offset(objects, align),
                };
                if objects >= SLAB_MIN_OBJECTS {
                    return Some(layout);
                }
                best = Some(layout);
            }
            order += 1;
        }
        best
    }

    /// Placeholder for tables filled in at compile time.
    pub(crate) const EMPTY: Self = Self {
        object_size: 0,
        align: 0,
        order: 0,
        objects: 0,
        data_offset: 0,
    };

    /// Bytes of header plus free-index array for `objects`, rounded to `align`.
    const fn data_offset(objects: usize, align: usize) -> usize {
        align_up(size_of::<Slab>() + objects * size_of::<u16>(), align)
    }

    const fn objects_fitting(bytes: usize, object_size: usize, align: usize) -> usize {
        let header = size_of::<Slab>();
        if bytes <= header {
            return 0;
        }
        let mut objects = (bytes - header) / (object_size + size_of::<u16>());
        if objects >= NO_FREE as usize {
            objects = NO_FREE as usize - 1;
        }
        while objects > 0 && Self::data_offset(objects, align) + objects * object_size > bytes {
            objects -= 1;
        }
        objects
    }
}

/// Header at the start of every slab.
///
/// Linked into exactly one of its cache's free/partial/full lists.
#[repr(C)]
pub struct Slab {
    next: Option<NonNull<Slab>>,
    prev: Option<NonNull<Slab>>,
    /// Physical address of the first frame, for returning the slab.
    pa: usize,
    /// Virtual address of object 0.
    base: usize,
    capacity: u16,
    used: u16,
    /// Head of the free-index chain.
    next_free: u16,
}

impl Slab {
    /// Write a fresh header (all objects free) at `va`.
    ///
    /// # Safety
    /// `va` must map `order_size(layout.order)` writable bytes owned by the caller.
    pub(super) unsafe fn init(va: usize, pa: usize, layout: &SlabLayout) -> NonNull<Slab> {
        let slab = va as *mut Slab;
        slab.write(Slab {
            next: None,
            prev: None,
            pa,
            base: va + layout.data_offset,
            capacity: layout.objects as u16,
            used: 0,
            next_free: 0,
        });

        let chain = slab.add(1).cast::<u16>();
        for i in 0..layout.objects {
            let next = if i + 1 == layout.objects { NO_FREE } else { (i + 1) as u16 };
            chain.add(i).write(next);
        }

        NonNull::new_unchecked(slab)
    }

    fn chain(&mut self) -> *mut u16 {
        // SAFETY: the free-index array directly follows the header
        unsafe { (self as *mut Slab).add(1).cast::<u16>() }
    }

    /// Take the next free object, returning its address.
    pub(super) fn take(&mut self, object_size: usize) -> Option<usize> {
        if self.next_free == NO_FREE {
            return None;
        }
        let idx = self.next_free;
        // SAFETY: idx < capacity, so it indexes the free-index array
        self.next_free = unsafe { self.chain().add(usize::from(idx)).read() };
        self.used += 1;
        Some(self.base + usize::from(idx) * object_size)
    }

    /// Index of the object starting at `addr`; interior and out-of-slab
    /// addresses are rejected.
    pub(super) fn object_index(&self, addr: usize, object_size: usize) -> Result<usize, SlabError> {
        let offset = addr.checked_sub(self.base).ok_or(SlabError::Misaligned)?;
        let idx = offset / object_size;
        if offset % object_size != 0 || idx >= usize::from(self.capacity) {
            return Err(SlabError::Misaligned);
        }
        Ok(idx)
    }

    /// Whether object `idx` is on the free chain.
    pub(super) fn is_free(&mut self, idx: usize) -> bool {
        let chain = self.chain();
        let mut cursor = self.next_free;
        // Bounded by capacity even if the chain were corrupted into a cycle
        for _ in 0..self.capacity {
            if cursor == NO_FREE {
                return false;
            }
            if usize::from(cursor) == idx {
                return true;
            }
            // SAFETY: chain entries are indices below capacity or NO_FREE
            cursor = unsafe { chain.add(usize::from(cursor)).read() };
        }
        false
    }

    /// Return the object at `addr` to the free chain.
    pub(super) fn put(&mut self, addr: usize, object_size: usize) -> Result<(), SlabError> {
        let idx = self.object_index(addr, object_size)?;
        if self.used == 0 {
            return Err(SlabError::Misaligned);
        }
        let head = self.next_free;
        // SAFETY: idx < capacity
        unsafe { self.chain().add(idx).write(head) };
        self.next_free = idx as u16;
        self.used -= 1;
        Ok(())
    }

    pub fn pa(&self) -> usize {
        self.pa
    }

    pub fn used(&self) -> usize {
        usize::from(self.used)
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.capacity)
    }

    /// No live objects.
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.capacity
    }
}

impl ListNode for Slab {
    #[inline]
    fn next(&self) -> Option<NonNull<Self>> {
        self.next
    }

    #[inline]
    fn prev(&self) -> Option<NonNull<Self>> {
        self.prev
    }

    #[inline]
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }

    #[inline]
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.prev = prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::PAGE_SIZE;

    /// Tests: [SL1] small objects fit in one frame with room for the header
    #[test]
    fn test_layout_small_objects() {
        let layout = SlabLayout::compute(64, 0).unwrap();
        assert_eq!(layout.order, 0);
        assert_eq!(layout.object_size, 64);
        assert!(layout.objects >= SLAB_MIN_OBJECTS);
        assert!(layout.data_offset + layout.objects * 64 <= PAGE_SIZE);
        assert_eq!(layout.data_offset % 8, 0);
    }

    /// Tests: [SL2] large objects move to a bigger order
    #[test]
    fn test_layout_grows_order() {
        let layout = SlabLayout::compute(1024, 64).unwrap();
        assert!(layout.order > 0);
        assert!(layout.objects >= SLAB_MIN_OBJECTS);
        assert!(layout.data_offset + layout.objects * 1024 <= order_size(layout.order));
    }

    /// Tests: [SL3] size is rounded up to the alignment
    #[test]
    fn test_layout_rounding_and_rejects() {
        let layout = SlabLayout::compute(24, 16).unwrap();
        assert_eq!(layout.object_size, 32);
        assert_eq!(layout.data_offset % 16, 0);

        assert_eq!(SlabLayout::compute(0, 8), None);
        assert_eq!(SlabLayout::compute(64, 3), None);
        assert_eq!(SlabLayout::compute(order_size(SLAB_MAX_ORDER), 8), None);
    }

    /// Tests: [SL4] take/put cycle through the free-index chain
    #[test]
    fn test_take_put() {
        let layout = SlabLayout::compute(128, 0).unwrap();
        let storage = std::vec![0u64; order_size(layout.order) / 8].leak();
        let va = storage.as_mut_ptr() as usize;
        let mut slab = unsafe { Slab::init(va, 0x1000, &layout) };
        let slab = unsafe { slab.as_mut() };

        let a = slab.take(128).unwrap();
        let b = slab.take(128).unwrap();
        assert_eq!(a, va + layout.data_offset);
        assert_eq!(b, a + 128);
        assert_eq!(slab.used(), 2);

        slab.put(a, 128).unwrap();
        assert_eq!(slab.take(128), Some(a)); // LIFO reuse
        assert_eq!(slab.put(a + 1, 128), Err(SlabError::Misaligned));

        while slab.take(128).is_some() {}
        assert!(slab.is_full());
        assert_eq!(slab.used(), layout.objects);
    }
}
