//! Collaborators consumed by the VM subsystem: backing files and vfork waiters.

use alloc::sync::Arc;

use kmem_error::define_kernel_error;
use linux_raw_sys::errno::{EINVAL, EIO};

define_kernel_error! {
    /// Errors reported by a backing file.
    pub enum FileError(0x06) {
        Io = 0x01 as EIO => "I/O error",
        /// Offset not representable by the file
        InvalidOffset = 0x02 as EINVAL => "Invalid file offset",
        /// Handle cannot be duplicated
        NotClonable = 0x03 => "Handle cannot be cloned",
    }
}

/// A file as seen by demand paging.
///
/// Each handle has its own position; `seek` and `read` act on it. Handles are
/// shared through [`FileHandle`] and closed when the last clone of the `Arc` is
/// dropped.
pub trait File: Send + Sync {
    /// Move the position to `offset` bytes from the start.
    fn seek(&self, offset: u64) -> Result<(), FileError>;

    /// Read from the current position into `buf`, advancing it. Returns the
    /// number of bytes read; 0 means end of file.
    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Open an independent handle on the same file.
    fn try_clone(&self) -> Result<FileHandle, FileError>;
}

pub type FileHandle = Arc<dyn File>;

/// Parent side of a vfork: woken once the child drops its reference to the
/// shared address space.
pub trait VforkWaiter: Send + Sync {
    fn signal(&self);
}
