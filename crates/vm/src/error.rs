use kmem_error::define_kernel_error;
use kmem_hal::MmuError;
use linux_raw_sys::errno::{EBUSY, EFAULT, EINVAL, EIO, ENOMEM};

use crate::file::FileError;

define_kernel_error! {
    /// Errors from address-space management (map, fork, activate).
    pub enum VmError(0x04) {
        /// No frame, record or address range left
        OutOfMemory = 0x01 as ENOMEM => "Out of memory",
        /// Length beyond the user ceiling, misaligned address or offset, or a
        /// request that needs a source space without one
        InvalidArgument = 0x02 as EINVAL => "Invalid argument",
        Mmu(MmuError) = 0x03 => "Page table operation failed",
        /// Duplicating a backing file handle failed
        File(FileError) = 0x04 as EIO => "File handle operation failed",
    }
}

impl From<MmuError> for VmError {
    fn from(e: MmuError) -> Self {
        match e {
            MmuError::AllocationFailed => VmError::OutOfMemory,
            other => VmError::Mmu(other),
        }
    }
}

define_kernel_error! {
    /// Outcome of a page fault that could not be resolved. The trap layer
    /// reports these to the faulting task by errno.
    pub enum FaultError(0x05) {
        /// Address outside every mapped region
        Unmapped = 0x01 as EFAULT => "Address outside any mapped region",
        OutOfMemory = 0x02 as ENOMEM => "No frame for page or page table",
        /// Reading the backing file failed
        Io = 0x03 as EIO => "Backing file read failed",
        /// A mapping already exists at the faulting page
        AlreadyMapped = 0x04 as EBUSY => "Page already mapped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FaultError::Unmapped.errno(), Some(14));
        assert_eq!(FaultError::OutOfMemory.errno(), Some(12));
        assert_eq!(FaultError::Io.errno(), Some(5));
        assert_eq!(FaultError::AlreadyMapped.errno(), Some(16));
        assert_eq!(VmError::InvalidArgument.errno(), Some(22));
        assert_eq!(VmError::Mmu(MmuError::NotMapped).errno(), None);
    }

    #[test]
    fn test_mmu_allocation_failure_is_oom() {
        assert_eq!(VmError::from(MmuError::AllocationFailed), VmError::OutOfMemory);
        assert_eq!(
            VmError::from(MmuError::UnexpectedHugePage),
            VmError::Mmu(MmuError::UnexpectedHugePage)
        );
        assert_eq!(VmError::OutOfMemory.code(), 0x0401);
        assert_eq!(FaultError::Io.code(), 0x0503);
    }
}
