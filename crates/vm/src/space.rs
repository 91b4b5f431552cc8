// Address spaces: lifecycle (create, fork, destroy) and the switch primitive.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use kmem_hal::KBox;
use kmem_hal::mmu;
use kmem_utils::{Mutex, MutexGuard};

use crate::file::{FileHandle, VforkWaiter};
use crate::vma::{Vma, VmaList};
use crate::{Vm, VmError};

/// How `fork_address_space` treats the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkMode {
    /// Hand out another reference to the same space (vfork, threads).
    Share,
    /// Eagerly duplicate tables, data pages and regions.
    Copy,
}

/// Snapshot of one region, for listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub start: usize,
    pub len: usize,
    pub file_backed: bool,
    pub offset: u64,
}

pub(crate) struct SpaceInner<'a> {
    /// Top-level table, allocated on first map or fault.
    pub(crate) root: Option<usize>,
    pub(crate) vmas: VmaList<'a>,
    /// File the task was executed from.
    pub(crate) exe: Option<FileHandle>,
}

/// Virtual memory state shared by the tasks holding a handle to it.
pub struct AddressSpace<'a> {
    refs: AtomicUsize,
    inner: Mutex<SpaceInner<'a>>,
    waiter: Mutex<Option<Arc<dyn VforkWaiter>>>,
}

impl<'a> AddressSpace<'a> {
    fn new(exe: Option<FileHandle>) -> Self {
        Self {
            refs: AtomicUsize::new(1),
            inner: Mutex::new(SpaceInner {
                root: None,
                vmas: VmaList::new(),
                exe,
            }),
            waiter: Mutex::new(None),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SpaceInner<'a>> {
        self.inner.lock()
    }

    pub fn refcount(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// Top-level table, if one has been allocated yet.
    pub fn root(&self) -> Option<usize> {
        self.lock().root
    }

    pub fn exe(&self) -> Option<FileHandle> {
        self.lock().exe.clone()
    }

    /// Register (or clear) the handle signalled when the reference count falls
    /// back to one.
    pub fn set_vfork_waiter(&self, waiter: Option<Arc<dyn VforkWaiter>>) {
        *self.waiter.lock() = waiter;
    }

    /// Regions in address order.
    pub fn regions(&self) -> Vec<Region> {
        self.lock()
            .vmas
            .iter()
            .map(|vma| Region {
                start: vma.start(),
                len: vma.len(),
                file_backed: vma.file().is_some(),
                offset: vma.offset(),
            })
            .collect()
    }
}

/// Counted reference to an [`AddressSpace`].
///
/// Every handle owns one reference and must be given back through
/// [`Vm::destroy_address_space`]; the last one tears the space down.
#[must_use = "address space references are released with Vm::destroy_address_space"]
pub struct AddressSpaceHandle<'a> {
    ptr: NonNull<AddressSpace<'a>>,
}

// SAFETY: the record is Sync (atomics and spin locks) and outlives every handle
unsafe impl Send for AddressSpaceHandle<'_> {}
unsafe impl Sync for AddressSpaceHandle<'_> {}

impl AddressSpaceHandle<'_> {
    /// Whether both handles refer to the same address space.
    pub fn same_space(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<'a> Deref for AddressSpaceHandle<'a> {
    type Target = AddressSpace<'a>;

    fn deref(&self) -> &AddressSpace<'a> {
        // SAFETY: this handle holds a reference, so the record is alive
        unsafe { self.ptr.as_ref() }
    }
}

impl fmt::Debug for AddressSpaceHandle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("at", &self.ptr)
            .field("refs", &self.refcount())
            .finish()
    }
}

impl<'a> Vm<'a> {
    /// New empty address space for a task executed from `exe`. No frames are
    /// taken until the first map or fault.
    pub fn create_address_space(&self, exe: Option<FileHandle>) -> Result<AddressSpaceHandle<'a>, VmError> {
        let record = KBox::try_new(AddressSpace::new(exe), self.heap).map_err(|_| VmError::OutOfMemory)?;
        Ok(AddressSpaceHandle {
            ptr: KBox::into_raw(record),
        })
    }

    /// Top-level table of `inner`, allocating it with the kernel slots installed
    /// on first use.
    pub(crate) fn ensure_root(&self, inner: &mut SpaceInner<'a>) -> Result<usize, VmError> {
        if let Some(root) = inner.root {
            return Ok(root);
        }
        let frames = self.frames();
        let root = mmu::alloc_table(frames)?;
        // SAFETY: root was just allocated zeroed and is reachable through the direct map
        unsafe { self.kernel.install(frames, root) };
        inner.root = Some(root);
        Ok(root)
    }

    /// Derive an address space for a new task.
    ///
    /// [`ForkMode::Share`] adds a reference to `source`. [`ForkMode::Copy`]
    /// builds a new space: with a source, every present page is duplicated into a
    /// fresh frame and every region is copied, with backing handles cloned; the
    /// region that mapped the source's executable is re-pointed at the child's
    /// own clone of it. A failure part way releases everything built so far.
    pub fn fork_address_space(
        &self,
        source: Option<&AddressSpaceHandle<'a>>,
        mode: ForkMode,
    ) -> Result<AddressSpaceHandle<'a>, VmError> {
        if mode == ForkMode::Share {
            let source = source.ok_or(VmError::InvalidArgument)?;
            source.refs.fetch_add(1, Ordering::AcqRel);
            return Ok(AddressSpaceHandle { ptr: source.ptr });
        }

        let child = self.create_address_space(None)?;
        if let Err(e) = self.populate(&child, source) {
            log::warn!("[VM] fork failed ({e}), rolling back");
            self.destroy_address_space(child);
            return Err(e);
        }
        log::trace!("[VM] fork -> {child:?}");
        Ok(child)
    }

    fn populate(&self, child: &AddressSpace<'a>, source: Option<&AddressSpaceHandle<'a>>) -> Result<(), VmError> {
        let mut dst = child.lock();
        let dst_root = self.ensure_root(&mut dst)?;
        let Some(source) = source else {
            return Ok(());
        };
        let src = source.lock();

        dst.exe = src.exe.as_ref().map(|exe| exe.try_clone()).transpose().map_err(VmError::File)?;

        if let Some(src_root) = src.root {
            // SAFETY: both roots are live and both spaces are locked
            unsafe { mmu::copy_user_tree(self.frames(), src_root, dst_root) }?;
        }

        for vma in src.vmas.iter() {
            let file = match (vma.file(), &src.exe, &dst.exe) {
                (Some(file), Some(src_exe), Some(dst_exe)) if Arc::ptr_eq(file, src_exe) => Some(dst_exe.clone()),
                (Some(file), _, _) => Some(file.try_clone().map_err(VmError::File)?),
                (None, _, _) => None,
            };
            let copy = Vma::new(vma.start(), vma.len(), file, vma.offset());
            let copy = KBox::try_new(copy, self.heap).map_err(|_| VmError::OutOfMemory)?;
            dst.vmas.insert(copy);
        }
        Ok(())
    }

    /// Give back one reference to `space`.
    ///
    /// The last reference frees every table and data frame of the user range,
    /// closes the backing files and the executable, and releases the record. When
    /// the count drops to one instead, a registered vfork waiter is signalled.
    pub fn destroy_address_space(&self, space: AddressSpaceHandle<'a>) {
        let previous = space.refs.fetch_sub(1, Ordering::AcqRel);
        match previous {
            1 => self.teardown(space),
            2 => {
                let waiter = space.waiter.lock().take();
                if let Some(waiter) = waiter {
                    log::trace!("[VM] vfork waiter released by {space:?}");
                    waiter.signal();
                }
            }
            _ => {}
        }
    }

    fn teardown(&self, space: AddressSpaceHandle<'a>) {
        // SAFETY: the last reference is gone; the record came from KBox::into_raw
        let record = unsafe { KBox::from_raw(space.ptr, self.heap) };
        let released = {
            let mut inner = record.lock();
            let released = inner.root.take().map_or(0, |root| {
                if mmu::current_root() == root {
                    mmu::switch_root(self.kernel.template_root());
                }
                // SAFETY: no CPU has this root loaded and nothing references it
                unsafe { mmu::free_user_tree(self.frames(), root) }
            });
            inner.vmas.clear();
            inner.exe = None;
            released
        };
        log::trace!("[VM] destroyed address space, {released} frames released");
        drop(record);
    }

    /// Install `space` as the active address space (allocating its top-level
    /// table if it has none yet).
    pub fn activate(&self, space: &AddressSpaceHandle<'a>) -> Result<(), VmError> {
        let root = self.ensure_root(&mut space.lock())?;
        if mmu::current_root() != root {
            mmu::switch_root(root);
        }
        Ok(())
    }
}
