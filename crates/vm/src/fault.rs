// Demand paging and kernel-side access to user memory.

use kmem_hal::layout::align_down;
use kmem_hal::mmu::{self, MmuError, PageFlags};

use crate::file::{File, FileError};
use crate::layout::{PAGE_SIZE, USER_SPACE_END};
use crate::{AddressSpaceHandle, FaultError, Vm};

impl<'a> Vm<'a> {
    /// Resolve a fault at `addr` in `space`.
    ///
    /// Finds the covering region, allocates a zeroed frame and, for file-backed
    /// regions, reads the page from the file. Bytes past end of file stay zero.
    /// The space is unlocked during the read, so other tasks sharing it keep
    /// running; the tables are walked (and built) only once the page is ready.
    ///
    /// # Errors
    /// - `Unmapped` (EFAULT): no region covers `addr`
    /// - `OutOfMemory` (ENOMEM): no frame for a table or the page
    /// - `Io` (EIO): the file read failed; the frame is released
    /// - `AlreadyMapped` (EBUSY): the page is present, from an earlier fault or
    ///   one that finished during the read; the frame is released
    pub fn handle_fault(&self, space: &AddressSpaceHandle<'a>, addr: usize) -> Result<(), FaultError> {
        let page = align_down(addr, PAGE_SIZE);
        let backing = {
            let inner = space.lock();
            let Some(vma) = inner.vmas.find(addr) else {
                log::debug!("[FAULT] {addr:#x}: no region");
                return Err(FaultError::Unmapped);
            };
            vma.file().cloned().map(|file| (file, vma.file_offset(page)))
        };

        let frames = self.frames();
        let frame = frames.alloc_zeroed(0).map_err(|_| {
            log::warn!("[FAULT] {addr:#x}: out of frames");
            FaultError::OutOfMemory
        })?;
        // free() logs its own failures
        let release = |e: FaultError| {
            let _ = frames.free(frame, 0);
            e
        };

        if let Some((file, offset)) = backing {
            // SAFETY: the frame was just allocated and is reachable through the direct map
            let buf = unsafe { core::slice::from_raw_parts_mut(frames.phys_to_virt(frame) as *mut u8, PAGE_SIZE) };
            if let Err(e) = fill_from_file(&*file, offset, buf) {
                log::warn!("[FAULT] {addr:#x}: read at offset {offset:#x} failed: {e}");
                return Err(release(FaultError::Io));
            }
        }

        let mut inner = space.lock();
        let root = self
            .ensure_root(&mut inner)
            .map_err(|_| release(FaultError::OutOfMemory))?;

        // SAFETY: root is live and the space is locked
        let leaf = unsafe { mmu::walk_to_leaf(frames, root, page, true) }.map_err(|e| {
            release(match e {
                MmuError::AllocationFailed => FaultError::OutOfMemory,
                _ => FaultError::Unmapped,
            })
        })?;
        if leaf.is_present() {
            return Err(release(FaultError::AlreadyMapped));
        }
        leaf.set(frame, PageFlags::USER_DATA);
        mmu::flush_page(page);

        log::trace!("[FAULT] {page:#x} -> {frame:#x}");
        Ok(())
    }

    /// Physical address backing user address `va` in `space`, if a region covers
    /// it and its page is populated. Kernel addresses never translate.
    pub fn translate(&self, space: &AddressSpaceHandle<'a>, va: usize) -> Option<usize> {
        if va >= USER_SPACE_END {
            return None;
        }
        let inner = space.lock();
        inner.vmas.find(va)?;
        let root = inner.root?;
        // SAFETY: root is live while the space is locked
        let (pa, flags) = unsafe { mmu::translate(self.frames(), root, va) }?;
        flags.contains(PageFlags::USER_ACCESSIBLE).then_some(pa)
    }

    /// Copy bytes out of `space` starting at `va`, faulting pages in as needed.
    pub fn read_bytes(&self, space: &AddressSpaceHandle<'a>, va: usize, buf: &mut [u8]) -> Result<(), FaultError> {
        let mut done = 0;
        while done < buf.len() {
            let addr = va.checked_add(done).ok_or(FaultError::Unmapped)?;
            let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(buf.len() - done);
            let src = self.direct_address(space, addr)?;
            // SAFETY: src maps at least `chunk` bytes of the same page
            unsafe { core::ptr::copy_nonoverlapping(src as *const u8, buf[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Copy `data` into `space` starting at `va`, faulting pages in as needed.
    pub fn write_bytes(&self, space: &AddressSpaceHandle<'a>, va: usize, data: &[u8]) -> Result<(), FaultError> {
        let mut done = 0;
        while done < data.len() {
            let addr = va.checked_add(done).ok_or(FaultError::Unmapped)?;
            let chunk = (PAGE_SIZE - addr % PAGE_SIZE).min(data.len() - done);
            let dst = self.direct_address(space, addr)?;
            // SAFETY: dst maps at least `chunk` bytes of the same page
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst as *mut u8, chunk) };
            done += chunk;
        }
        Ok(())
    }

    /// Kernel address of user `addr`, faulting its page in first if needed.
    /// Only addresses inside a region of the user range are reachable.
    fn direct_address(&self, space: &AddressSpaceHandle<'a>, addr: usize) -> Result<usize, FaultError> {
        if addr >= USER_SPACE_END {
            return Err(FaultError::Unmapped);
        }
        let pa = match self.translate(space, addr) {
            Some(pa) => pa,
            None => {
                match self.handle_fault(space, addr) {
                    // Another task sharing the space populated it first
                    Ok(()) | Err(FaultError::AlreadyMapped) => {}
                    Err(e) => return Err(e),
                }
                self.translate(space, addr).ok_or(FaultError::Unmapped)?
            }
        };
        Ok(self.frames().phys_to_virt(pa))
    }
}

/// Read one page worth of `file` from `offset` into `buf`, stopping early at end
/// of file.
fn fill_from_file(file: &dyn File, offset: u64, buf: &mut [u8]) -> Result<usize, FileError> {
    file.seek(offset)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
