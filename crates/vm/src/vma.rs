// Virtual memory areas: an address-ordered, singly linked list of regions.

use core::fmt;

use kmem_hal::KBox;

use crate::file::FileHandle;

/// One mapped region of an address space.
pub struct Vma<'h> {
    start: usize,
    len: usize,
    file: Option<FileHandle>,
    /// File offset backing `start`.
    offset: u64,
    next: Option<KBox<'h, Vma<'h>>>,
}

impl Vma<'_> {
    pub fn new(start: usize, len: usize, file: Option<FileHandle>, offset: u64) -> Self {
        Self {
            start,
            len,
            file,
            offset,
            next: None,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First address past the region.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn file(&self) -> Option<&FileHandle> {
        self.file.as_ref()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// File offset backing `addr`, which must lie inside the region.
    pub fn file_offset(&self, addr: usize) -> u64 {
        self.offset + (addr - self.start) as u64
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end()
    }
}

impl fmt::Debug for Vma<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vma")
            .field("start", &format_args!("{:#x}", self.start))
            .field("len", &format_args!("{:#x}", self.len))
            .field("file_backed", &self.file.is_some())
            .field("offset", &self.offset)
            .finish()
    }
}

/// Regions of one address space, ascending by start, never overlapping.
pub struct VmaList<'h> {
    head: Option<KBox<'h, Vma<'h>>>,
    len: usize,
}

impl Default for VmaList<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'h> VmaList<'h> {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn iter(&self) -> Iter<'_, 'h> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// Region covering `addr`: the last region starting at or before it, if
    /// `addr` falls inside.
    pub fn find(&self, addr: usize) -> Option<&Vma<'h>> {
        self.iter()
            .take_while(|vma| vma.start <= addr)
            .last()
            .filter(|vma| vma.contains(addr))
    }

    /// Start of a free range of `len` bytes inside `[floor, ceiling)`.
    ///
    /// A non-zero `hint` is used as is when the range there is free and below
    /// `ceiling`. Otherwise the search starts at `floor` and takes the first gap
    /// before, between or after the regions that fits.
    pub fn find_gap(&self, hint: usize, len: usize, floor: usize, ceiling: usize) -> Option<usize> {
        if hint != 0 {
            let fits = hint
                .checked_add(len)
                .is_some_and(|end| end <= ceiling && !self.iter().any(|vma| vma.overlaps(hint, end)));
            if fits {
                return Some(hint);
            }
        }

        let mut candidate = floor;
        for vma in self.iter() {
            if vma.end() <= candidate {
                continue;
            }
            if candidate.checked_add(len)? <= vma.start {
                return Some(candidate);
            }
            candidate = vma.end();
        }
        (candidate.checked_add(len)? <= ceiling).then_some(candidate)
    }

    /// Link `vma` in address order. The range must be free (see
    /// [`find_gap`](Self::find_gap)).
    pub fn insert(&mut self, mut vma: KBox<'h, Vma<'h>>) {
        debug_assert!(!self.iter().any(|v| v.overlaps(vma.start, vma.end())));
        let start = vma.start;

        let mut cursor = &mut self.head;
        while cursor.as_ref().is_some_and(|node| node.start < start) {
            if let Some(node) = cursor {
                cursor = &mut node.next;
            }
        }
        vma.next = cursor.take();
        *cursor = Some(vma);
        self.len += 1;
    }

    /// Unlink every region, dropping their file handles.
    pub fn clear(&mut self) {
        let mut next = self.head.take();
        while let Some(mut vma) = next {
            next = vma.next.take();
        }
        self.len = 0;
    }
}

impl Drop for VmaList<'_> {
    // Iterative so long lists do not recurse through KBox drops
    fn drop(&mut self) {
        self.clear();
    }
}

pub struct Iter<'a, 'h> {
    next: Option<&'a Vma<'h>>,
}

impl<'a, 'h> Iterator for Iter<'a, 'h> {
    type Item = &'a Vma<'h>;

    fn next(&mut self) -> Option<Self::Item> {
        let vma = self.next?;
        self.next = vma.next.as_deref();
        Some(vma)
    }
}
