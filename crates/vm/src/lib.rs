#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Per-task virtual memory: regions, demand paging, fork and teardown.
//!
//! Page tables come from the frame allocator, records (address spaces, regions)
//! from the general allocator, page contents of file-backed regions from the
//! [`File`] collaborator. The scheduler decides when to call
//! [`Vm::activate`]; the trap layer delivers faults to [`Vm::handle_fault`].

extern crate alloc;

mod error;
mod fault;
pub mod file;
pub mod layout;
mod region;
mod space;
pub mod vma;

pub use error::{FaultError, VmError};
pub use file::{File, FileError, FileHandle, VforkWaiter};
pub use space::{AddressSpace, AddressSpaceHandle, ForkMode, Region};

use kmem_hal::mmu::KernelMappings;
use kmem_hal::{FrameAllocator, GeneralAllocator};

/// The virtual memory subsystem.
///
/// Holds the allocators every address space draws from and the kernel mappings
/// installed into each of them.
pub struct Vm<'a> {
    heap: &'a GeneralAllocator<'a>,
    kernel: KernelMappings,
}

impl<'a> Vm<'a> {
    /// `kernel` must have been built from the same frame allocator that backs `heap`.
    pub fn new(heap: &'a GeneralAllocator<'a>, kernel: KernelMappings) -> Self {
        Self { heap, kernel }
    }

    pub fn frames(&self) -> &'a FrameAllocator {
        self.heap.frames()
    }

    pub fn heap(&self) -> &'a GeneralAllocator<'a> {
        self.heap
    }

    pub fn kernel_mappings(&self) -> &KernelMappings {
        &self.kernel
    }
}
