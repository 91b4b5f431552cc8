//! Four-level page tables.
//!
//! The tree format follows x86_64 long mode: four levels of 512 eight-byte
//! entries, 4KB leaves. Top-level slot 0 holds the per-address-space user range;
//! the remaining slots point at upper tables shared by every address space
//! ([`KernelMappings`]).
//!
//! Every walk here is an explicit loop over [`LEVELS`]; no function recurses.
//! Tables are reached through the frame allocator's direct map.

use core::ops::Range;

use bitflags::bitflags;
use kmem_error::define_kernel_error;

use crate::layout::PAGE_SIZE;
use crate::traits::PageAllocator;

define_kernel_error! {
    /// Page-table errors.
    pub enum MmuError(0x03) {
        /// No frame for a new table
        AllocationFailed = 0x01 => "Page table allocation failed",
        /// Leaf entry already present
        AlreadyMapped = 0x02 => "Address already mapped",
        NotMapped = 0x03 => "Address not mapped",
        /// Address or slot range outside what the tree can describe
        InvalidVirtualAddress = 0x04 => "Invalid virtual address",
        /// Huge entry found where only 4KB leaves may live
        UnexpectedHugePage = 0x05 => "Huge page in user range",
    }
}

// ============================================================================
// Constants
// ============================================================================

/// Entries per page table (512 for 4KB pages with 8-byte entries)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Top-level slots owned by each address space; the rest are kernel slots.
pub const USER_TOP_SLOTS: usize = 1;

/// Bytes covered by one top-level slot (512GB).
pub const TOP_SLOT_SPAN: usize = 1 << 39;

/// Size of a huge page at the upper level (1GB).
pub const HUGE_1GB: usize = 1 << 30;

const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags! {
    /// x86_64 page-table entry flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;

        /// Intermediate table: the leaf decides the effective permissions
        const TABLE = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER_ACCESSIBLE.bits();
        /// Demand-paged user data
        const USER_DATA = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER_ACCESSIBLE.bits();
        /// 1GB kernel identity page
        const KERNEL_HUGE = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::HUGE_PAGE.bits() | Self::GLOBAL.bits();
    }
}

// ============================================================================
// Page Table Entry
// ============================================================================

/// A 64-bit page table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    #[inline]
    pub fn is_huge(&self) -> bool {
        self.is_present() && self.flags().contains(PageFlags::HUGE_PAGE)
    }

    #[inline]
    pub fn address(&self) -> usize {
        (self.0 & ADDRESS_MASK) as usize
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn set(&mut self, addr: usize, flags: PageFlags) {
        self.0 = ((addr as u64) & ADDRESS_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Levels
// ============================================================================

/// One level of the tree, top first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Top,
    Upper,
    Middle,
    Leaf,
}

/// Walk order.
pub const LEVELS: [Level; 4] = [Level::Top, Level::Upper, Level::Middle, Level::Leaf];

impl Level {
    /// Bit position of this level's index in a virtual address.
    pub const fn shift(self) -> usize {
        match self {
            Level::Top => 39,
            Level::Upper => 30,
            Level::Middle => 21,
            Level::Leaf => 12,
        }
    }

    /// Bytes mapped by one entry at this level.
    pub const fn span(self) -> usize {
        1 << self.shift()
    }

    #[inline]
    pub const fn index(self, va: usize) -> usize {
        (va >> self.shift()) & (ENTRIES_PER_TABLE - 1)
    }

    const fn depth(self) -> usize {
        self as usize
    }
}

// ============================================================================
// Walks
// ============================================================================

/// # Safety
/// `pa` must be a page-table frame reachable through `alloc`'s direct map, and
/// the caller must not hold another reference into the same table.
unsafe fn table_at<'a, A: PageAllocator + ?Sized>(alloc: &A, pa: usize) -> &'a mut PageTable {
    &mut *(alloc.phys_to_virt(pa) as *mut PageTable)
}

/// Allocate a zeroed table frame.
pub fn alloc_table<A: PageAllocator + ?Sized>(alloc: &A) -> Result<usize, MmuError> {
    alloc.alloc_page().ok_or(MmuError::AllocationFailed)
}

/// Walk from `root` to the leaf entry for `va`.
///
/// With `create`, missing intermediate tables are allocated zeroed and linked
/// with [`PageFlags::TABLE`]. Tables created before a failure stay linked; they
/// are released with the rest of the tree.
///
/// # Safety
/// `root` must be a live top-level table reachable through `alloc`, and no other
/// reference into the tree may be live while the returned entry is.
pub unsafe fn walk_to_leaf<'a, A: PageAllocator + ?Sized>(
    alloc: &A,
    root: usize,
    va: usize,
    create: bool,
) -> Result<&'a mut PageTableEntry, MmuError> {
    let mut table_pa = root;
    for level in &LEVELS[..3] {
        let table = table_at(alloc, table_pa);
        let entry = &mut table.entries[level.index(va)];
        if !entry.is_present() {
            if !create {
                return Err(MmuError::NotMapped);
            }
            let child = alloc_table(alloc)?;
            entry.set(child, PageFlags::TABLE);
        } else if entry.is_huge() {
            return Err(MmuError::UnexpectedHugePage);
        }
        table_pa = entry.address();
    }
    Ok(&mut table_at(alloc, table_pa).entries[Level::Leaf.index(va)])
}

/// Map one 4KB page.
///
/// # Safety
/// See [`walk_to_leaf`].
pub unsafe fn map_page<A: PageAllocator + ?Sized>(
    alloc: &A,
    root: usize,
    va: usize,
    pa: usize,
    flags: PageFlags,
) -> Result<(), MmuError> {
    let entry = walk_to_leaf(alloc, root, va, true)?;
    if entry.is_present() {
        return Err(MmuError::AlreadyMapped);
    }
    entry.set(pa, flags | PageFlags::PRESENT);
    Ok(())
}

/// Remove the leaf mapping of `va`, returning the frame it pointed at.
/// Intermediate tables stay in place.
///
/// # Safety
/// See [`walk_to_leaf`].
pub unsafe fn unmap_page<A: PageAllocator + ?Sized>(alloc: &A, root: usize, va: usize) -> Result<usize, MmuError> {
    let entry = walk_to_leaf(alloc, root, va, false)?;
    if !entry.is_present() {
        return Err(MmuError::NotMapped);
    }
    let pa = entry.address();
    entry.clear();
    Ok(pa)
}

/// Translate `va` to a physical address and the flags of the entry mapping it.
/// Huge kernel pages are followed.
///
/// # Safety
/// `root` must be a live top-level table reachable through `alloc`.
pub unsafe fn translate<A: PageAllocator + ?Sized>(alloc: &A, root: usize, va: usize) -> Option<(usize, PageFlags)> {
    let mut table_pa = root;
    for level in LEVELS {
        let entry = table_at(alloc, table_pa).entries[level.index(va)];
        if !entry.is_present() {
            return None;
        }
        if level == Level::Leaf || entry.is_huge() {
            return Some((entry.address() + (va & (level.span() - 1)), entry.flags()));
        }
        table_pa = entry.address();
    }
    None
}

/// Position inside one table during an iterative tree walk.
#[derive(Clone, Copy)]
struct Cursor {
    level: Level,
    /// Table being scanned (source table for copies).
    table: usize,
    /// Destination table, copies only.
    dst: usize,
    next: usize,
    end: usize,
}

impl Cursor {
    const fn root(table: usize, dst: usize) -> Self {
        Self {
            level: Level::Top,
            table,
            dst,
            next: 0,
            end: USER_TOP_SLOTS,
        }
    }

    const fn child(level: Level, table: usize, dst: usize) -> Self {
        Self {
            level,
            table,
            dst,
            next: 0,
            end: ENTRIES_PER_TABLE,
        }
    }
}

/// Fixed-depth cursor stack; the tree is never deeper than [`LEVELS`].
struct WalkStack {
    cursors: [Option<Cursor>; LEVELS.len()],
    depth: usize,
}

impl WalkStack {
    const fn new(first: Cursor) -> Self {
        let mut cursors = [None; LEVELS.len()];
        cursors[0] = Some(first);
        Self { cursors, depth: 1 }
    }

    fn top(&mut self) -> Option<&mut Cursor> {
        self.depth.checked_sub(1).and_then(|i| self.cursors[i].as_mut())
    }

    fn push(&mut self, cursor: Cursor) {
        self.cursors[cursor.level.depth()] = Some(cursor);
        self.depth = cursor.level.depth() + 1;
    }

    fn pop(&mut self) -> Option<Cursor> {
        let i = self.depth.checked_sub(1)?;
        self.depth = i;
        self.cursors[i].take()
    }
}

fn next_level(level: Level) -> Level {
    LEVELS[(level.depth() + 1).min(LEVELS.len() - 1)]
}

/// Duplicate the user range of `src_root` into `dst_root`.
///
/// Every present table is recreated and every present leaf gets a fresh frame
/// holding a full copy of the source page; nothing is shared. On failure the
/// entries copied so far remain linked under `dst_root`, so releasing it with
/// [`free_user_tree`] leaves nothing behind.
///
/// # Safety
/// Both roots must be live top-level tables reachable through `alloc`, with no
/// concurrent mutation of either tree.
pub unsafe fn copy_user_tree<A: PageAllocator + ?Sized>(
    alloc: &A,
    src_root: usize,
    dst_root: usize,
) -> Result<(), MmuError> {
    let mut stack = WalkStack::new(Cursor::root(src_root, dst_root));

    while let Some(cursor) = stack.top() {
        if cursor.next == cursor.end {
            stack.pop();
            continue;
        }
        let index = cursor.next;
        cursor.next += 1;
        let cursor = *cursor;

        let entry = table_at(alloc, cursor.table).entries[index];
        if !entry.is_present() {
            continue;
        }
        if entry.is_huge() {
            return Err(MmuError::UnexpectedHugePage);
        }

        let frame = alloc.alloc_page().ok_or(MmuError::AllocationFailed)?;
        table_at(alloc, cursor.dst).entries[index].set(frame, entry.flags());

        if cursor.level == Level::Leaf {
            core::ptr::copy_nonoverlapping(
                alloc.phys_to_virt(entry.address()) as *const u8,
                alloc.phys_to_virt(frame) as *mut u8,
                PAGE_SIZE,
            );
        } else {
            stack.push(Cursor::child(next_level(cursor.level), entry.address(), frame));
        }
    }
    Ok(())
}

/// Release the user range of `root`: data frames, the tables holding them and
/// finally `root` itself. Kernel slots are left alone since they are shared.
///
/// Returns the number of frames released.
///
/// # Safety
/// `root` must be a live top-level table reachable through `alloc` that no CPU
/// has loaded and nothing references afterwards.
pub unsafe fn free_user_tree<A: PageAllocator + ?Sized>(alloc: &A, root: usize) -> usize {
    let mut released = 0;
    let mut stack = WalkStack::new(Cursor::root(root, 0));

    while let Some(cursor) = stack.top() {
        if cursor.next == cursor.end {
            if let Some(done) = stack.pop() {
                alloc.free_page(done.table);
                released += 1;
            }
            continue;
        }
        let index = cursor.next;
        cursor.next += 1;
        let cursor = *cursor;

        let entry = &mut table_at(alloc, cursor.table).entries[index];
        if !entry.is_present() {
            continue;
        }
        let child = entry.address();
        let huge = entry.is_huge();
        entry.clear();

        if cursor.level == Level::Leaf || huge {
            alloc.free_page(child);
            released += 1;
        } else {
            stack.push(Cursor::child(next_level(cursor.level), child, 0));
        }
    }
    released
}

// ============================================================================
// Kernel mappings
// ============================================================================

/// Upper-level tables shared by every address space.
///
/// Slot `s` of the range maps physical memory from `(s - range.start) * 512GB`
/// with 1GB global pages. The tables live in a template top-level table whose
/// kernel slots are copied into each new root.
pub struct KernelMappings {
    template: usize,
    slots: Range<usize>,
}

impl KernelMappings {
    /// Build the shared tables for the top-level `slots`.
    ///
    /// Slots below [`USER_TOP_SLOTS`] belong to user space and are refused. On
    /// allocation failure every frame taken so far is returned.
    pub fn new<A: PageAllocator + ?Sized>(alloc: &A, slots: Range<usize>) -> Result<Self, MmuError> {
        if slots.start < USER_TOP_SLOTS || slots.end > ENTRIES_PER_TABLE {
            return Err(MmuError::InvalidVirtualAddress);
        }

        let template = alloc_table(alloc)?;
        let mappings = Self {
            template,
            slots: slots.clone(),
        };

        for slot in slots {
            let Some(upper) = alloc.alloc_page() else {
                mappings.release(alloc);
                log::warn!("[MMU] out of frames building kernel mappings");
                return Err(MmuError::AllocationFailed);
            };
            // SAFETY: both tables were just allocated and are reachable through alloc
            unsafe {
                let phys_start = (slot - mappings.slots.start) * TOP_SLOT_SPAN;
                let table = table_at(alloc, upper);
                for (i, entry) in table.entries.iter_mut().enumerate() {
                    entry.set(phys_start + i * HUGE_1GB, PageFlags::KERNEL_HUGE);
                }
                table_at(alloc, template).entries[slot].set(upper, PageFlags::PRESENT | PageFlags::WRITABLE);
            }
        }

        log::debug!(
            "[MMU] kernel mappings in top-level slots {}..{}",
            mappings.slots.start,
            mappings.slots.end
        );
        Ok(mappings)
    }

    /// Copy the kernel slots into a new top-level table.
    ///
    /// # Safety
    /// `root` must be a top-level table reachable through `alloc`.
    pub unsafe fn install<A: PageAllocator + ?Sized>(&self, alloc: &A, root: usize) {
        let template = table_at(alloc, self.template);
        let table = table_at(alloc, root);
        table.entries[USER_TOP_SLOTS..].copy_from_slice(&template.entries[USER_TOP_SLOTS..]);
    }

    /// Top-level table with only the kernel slots populated, usable as a root
    /// when no user address space is active.
    pub fn template_root(&self) -> usize {
        self.template
    }

    pub fn slots(&self) -> Range<usize> {
        self.slots.clone()
    }

    /// Virtual address of physical `pa` through the shared mapping, if covered.
    pub fn virt_of(&self, pa: usize) -> Option<usize> {
        let covered = (self.slots.end - self.slots.start).checked_mul(TOP_SLOT_SPAN)?;
        if pa >= covered {
            return None;
        }
        let va = self.slots.start * TOP_SLOT_SPAN + pa;
        // Canonical form: sign-extend bit 47
        Some(if va & (1 << 47) != 0 { va | 0xffff_0000_0000_0000 } else { va })
    }

    /// Return every frame to `alloc`. Roots that installed these mappings must
    /// no longer be in use.
    pub fn release<A: PageAllocator + ?Sized>(self, alloc: &A) {
        // SAFETY: the template is ours and only kernel slots are populated
        let template = unsafe { table_at(alloc, self.template) };
        for entry in &mut template.entries[self.slots.clone()] {
            if entry.is_present() {
                alloc.free_page(entry.address());
                entry.clear();
            }
        }
        alloc.free_page(self.template);
    }
}

// ============================================================================
// Root switching and translation caches
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod hw {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;
    use x86_64::{PhysAddr, VirtAddr};

    pub fn switch_root(pa: usize) {
        let frame = PhysFrame::containing_address(PhysAddr::new(pa as u64));
        // SAFETY: callers pass a top-level table carrying the kernel slots
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }

    pub fn current_root() -> usize {
        Cr3::read().0.start_address().as_u64() as usize
    }

    pub fn flush_page(va: usize) {
        x86_64::instructions::tlb::flush(VirtAddr::new_truncate(va as u64));
    }

    pub fn flush_all() {
        x86_64::instructions::tlb::flush_all();
    }
}

// Without hardware the installed root and the flush count live in atomics so
// tests can observe them.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hw {
    use core::sync::atomic::{AtomicUsize, Ordering};

    static ROOT: AtomicUsize = AtomicUsize::new(0);
    static FLUSHES: AtomicUsize = AtomicUsize::new(0);

    pub fn switch_root(pa: usize) {
        ROOT.store(pa, Ordering::SeqCst);
        FLUSHES.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current_root() -> usize {
        ROOT.load(Ordering::SeqCst)
    }

    pub fn flush_page(_va: usize) {
        FLUSHES.fetch_add(1, Ordering::SeqCst);
    }

    pub fn flush_all() {
        FLUSHES.fetch_add(1, Ordering::SeqCst);
    }

    pub fn flush_count() -> usize {
        FLUSHES.load(Ordering::SeqCst)
    }
}

/// Install `root` as the active top-level table. Loading the root also drops
/// every non-global translation.
pub fn switch_root(root: usize) {
    log::trace!("[MMU] switch root -> {root:#x}");
    hw::switch_root(root);
}

/// Top-level table currently installed.
pub fn current_root() -> usize {
    hw::current_root()
}

pub fn flush_page(va: usize) {
    hw::flush_page(va);
}

pub fn flush_all() {
    hw::flush_all();
}

/// Translation-cache flushes issued so far (host builds only).
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn flush_count() -> usize {
    hw::flush_count()
}
