use kmem_hal::KBox;
use kmem_hal::layout::align_up;

use crate::file::FileHandle;
use crate::layout::{MMAP_BASE, PAGE_SIZE, USER_SPACE_END};
use crate::vma::Vma;
use crate::{AddressSpaceHandle, Vm, VmError};

impl<'a> Vm<'a> {
    /// Map `len` bytes into `space`, backed by `file` from `offset` or anonymous.
    ///
    /// A non-zero `addr` is used when the range there is free; otherwise the
    /// first gap at or above [`MMAP_BASE`] is taken. The length is rounded up to
    /// whole pages. Nothing is populated until the pages fault.
    ///
    /// Fails with `InvalidArgument` for an empty or over-ceiling length or a
    /// misaligned address or offset, and with `OutOfMemory` when no gap fits.
    pub fn map_region(
        &self,
        space: &AddressSpaceHandle<'a>,
        file: Option<FileHandle>,
        offset: u64,
        addr: usize,
        len: usize,
    ) -> Result<usize, VmError> {
        if len == 0 || len > USER_SPACE_END - MMAP_BASE {
            return Err(VmError::InvalidArgument);
        }
        if addr % PAGE_SIZE != 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::InvalidArgument);
        }
        let len = align_up(len, PAGE_SIZE);

        let mut inner = space.lock();
        let start = inner
            .vmas
            .find_gap(addr, len, MMAP_BASE, USER_SPACE_END)
            .ok_or(VmError::OutOfMemory)?;
        self.ensure_root(&mut inner)?;

        let vma = KBox::try_new(Vma::new(start, len, file, offset), self.heap).map_err(|_| VmError::OutOfMemory)?;
        inner.vmas.insert(vma);
        log::trace!("[VM] map {start:#x}..{:#x} offset {offset:#x}", start + len);
        Ok(start)
    }
}
