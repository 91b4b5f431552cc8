#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use kmem_hal::GeneralAllocator;
use kmem_hal::mmu::KernelMappings;
use kmem_hal::testing::{TEST_PHYS_BASE, frame_pool_at};
use kmem_vm::layout::PAGE_SIZE;
use kmem_vm::{File, FileError, FileHandle, VforkWaiter, Vm};

/// Shared counters for every handle opened on one [`MemFile`].
#[derive(Default)]
pub struct FileStats {
    pub seeks: Mutex<Vec<u64>>,
    pub reads: AtomicUsize,
    pub live: AtomicUsize,
    pub fail_reads: AtomicBool,
}

/// In-memory file; clones share contents and counters but not the position.
pub struct MemFile {
    data: Arc<Vec<u8>>,
    pos: AtomicU64,
    stats: Arc<FileStats>,
}

impl MemFile {
    pub fn open(data: Vec<u8>) -> (FileHandle, Arc<FileStats>) {
        let stats = Arc::new(FileStats::default());
        let file = Self::with(Arc::new(data), stats.clone());
        (file, stats)
    }

    fn with(data: Arc<Vec<u8>>, stats: Arc<FileStats>) -> FileHandle {
        stats.live.fetch_add(1, Ordering::SeqCst);
        Arc::new(Self {
            data,
            pos: AtomicU64::new(0),
            stats,
        })
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl File for MemFile {
    fn seek(&self, offset: u64) -> Result<(), FileError> {
        self.stats.seeks.lock().unwrap().push(offset);
        self.pos.store(offset, Ordering::SeqCst);
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, FileError> {
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_reads.load(Ordering::SeqCst) {
            return Err(FileError::Io);
        }
        let pos = self.pos.load(Ordering::SeqCst) as usize;
        let available = self.data.len().saturating_sub(pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.data[pos..pos + n]);
        self.pos.store((pos + n) as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn try_clone(&self) -> Result<FileHandle, FileError> {
        Ok(Self::with(self.data.clone(), self.stats.clone()))
    }
}

/// File of `pages` pages where every byte of page `i` is `i + 1`.
pub fn patterned(pages: usize) -> Vec<u8> {
    (0..pages)
        .flat_map(|i| std::iter::repeat_n((i + 1) as u8, PAGE_SIZE))
        .collect()
}

#[derive(Default)]
pub struct Waiter {
    pub signals: AtomicUsize,
}

impl VforkWaiter for Waiter {
    fn signal(&self) {
        self.signals.fetch_add(1, Ordering::SeqCst);
    }
}

/// A subsystem over a fresh pool of `frames` frames.
pub fn vm(frames: usize) -> &'static Vm<'static> {
    vm_at(TEST_PHYS_BASE, frames)
}

/// Like [`vm`], with the pool at `phys_base`. Tests that switch roots use their
/// own base so their table addresses cannot collide with other pools'.
pub fn vm_at(phys_base: usize, frames: usize) -> &'static Vm<'static> {
    let pool = frame_pool_at(phys_base, frames);
    let heap: &'static GeneralAllocator<'static> = Box::leak(Box::new(GeneralAllocator::new(pool)));
    let kernel = KernelMappings::new(pool, 256..257).unwrap();
    Box::leak(Box::new(Vm::new(heap, kernel)))
}

/// Free frames once every cache has returned its empty slabs.
pub fn settled_free(vm: &Vm<'_>) -> usize {
    vm.heap().shrink().unwrap();
    vm.frames().stats().free
}
