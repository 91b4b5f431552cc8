//! Address-space lifecycle: fork in both modes, destroy, vfork wake-up, switch.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{MemFile, Waiter, patterned, settled_free, vm, vm_at};
use kmem_hal::mmu;
use kmem_vm::layout::PAGE_SIZE;
use kmem_vm::{ForkMode, VforkWaiter, VmError};

/// References taken and dropped from many threads at once: the waiter fires
/// once, the executable is closed once, and every frame comes back.
#[test]
fn test_concurrent_share_and_destroy() {
    let vm = vm(64);
    let before = settled_free(vm);
    let (exe, stats) = MemFile::open(patterned(1));
    let space = vm.create_address_space(Some(exe)).unwrap();
    let start = vm.map_region(&space, None, 0, 0, PAGE_SIZE).unwrap();
    vm.write_bytes(&space, start, &[7]).unwrap();

    let waiter = Arc::new(Waiter::default());
    space.set_vfork_waiter(Some(waiter.clone() as Arc<dyn VforkWaiter>));

    let handles: Vec<_> = (0..8)
        .map(|_| vm.fork_address_space(Some(&space), ForkMode::Share).unwrap())
        .collect();
    std::thread::scope(|s| {
        for handle in handles {
            s.spawn(move || {
                for _ in 0..200 {
                    let extra = vm.fork_address_space(Some(&handle), ForkMode::Share).unwrap();
                    let mut byte = [0u8];
                    vm.read_bytes(&extra, start, &mut byte).unwrap();
                    assert_eq!(byte, [7]);
                    vm.destroy_address_space(extra);
                }
                vm.destroy_address_space(handle);
            });
        }
    });

    assert_eq!(space.refcount(), 1);
    assert_eq!(waiter.signals.load(Ordering::SeqCst), 1);
    assert_eq!(stats.live.load(Ordering::SeqCst), 1);

    vm.destroy_address_space(space);
    assert_eq!(stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(settled_free(vm), before);
}

/// Writes after a copying fork stay private to the side that made them.
#[test]
fn test_fork_isolation() {
    let vm = vm(128);
    let parent = vm.create_address_space(None).unwrap();
    let start = vm.map_region(&parent, None, 0, 0, 2 * PAGE_SIZE).unwrap();
    vm.write_bytes(&parent, start + 10, b"parent").unwrap();

    let child = vm.fork_address_space(Some(&parent), ForkMode::Copy).unwrap();
    assert!(!child.same_space(&parent));
    assert_eq!(child.regions(), parent.regions());

    let mut buf = [0u8; 6];
    vm.read_bytes(&child, start + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");
    assert_ne!(vm.translate(&child, start), vm.translate(&parent, start));

    vm.write_bytes(&child, start + 10, b"child!").unwrap();
    vm.read_bytes(&parent, start + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"parent");

    vm.write_bytes(&parent, start + 10, b"PARENT").unwrap();
    vm.read_bytes(&child, start + 10, &mut buf).unwrap();
    assert_eq!(&buf, b"child!");

    vm.destroy_address_space(child);
    vm.destroy_address_space(parent);
}

/// Fork without a source gives an empty space that already has kernel slots.
#[test]
fn test_fork_without_source() {
    let vm = vm(64);
    let space = vm.fork_address_space(None, ForkMode::Copy).unwrap();
    assert!(space.regions().is_empty());
    let root = space.root().unwrap();

    let kernel_va = vm.kernel_mappings().virt_of(0x1000).unwrap();
    let mapped = unsafe { mmu::translate(vm.frames(), root, kernel_va) };
    assert_eq!(mapped.map(|(pa, _)| pa), Some(0x1000));

    assert_eq!(
        vm.fork_address_space(None, ForkMode::Share).unwrap_err(),
        VmError::InvalidArgument
    );
    vm.destroy_address_space(space);
}

/// Sharing hands out the same space and only the last reference tears it down.
#[test]
fn test_share_mode_counts_references() {
    let vm = vm(64);
    let space = vm.create_address_space(None).unwrap();
    let start = vm.map_region(&space, None, 0, 0, PAGE_SIZE).unwrap();
    vm.write_bytes(&space, start, &[7]).unwrap();

    let shared = vm.fork_address_space(Some(&space), ForkMode::Share).unwrap();
    assert!(shared.same_space(&space));
    assert_eq!(space.refcount(), 2);

    vm.write_bytes(&shared, start, &[9]).unwrap();
    let mut byte = [0u8];
    vm.read_bytes(&space, start, &mut byte).unwrap();
    assert_eq!(byte, [9]);

    vm.destroy_address_space(shared);
    assert_eq!(space.refcount(), 1);
    assert!(vm.translate(&space, start).is_some());
    vm.destroy_address_space(space);
}

/// The waiter fires when the count drops to one, not at teardown.
#[test]
fn test_vfork_waiter_signalled_at_one() {
    let vm = vm(64);
    let parent = vm.create_address_space(None).unwrap();
    let waiter = Arc::new(Waiter::default());

    let child = vm.fork_address_space(Some(&parent), ForkMode::Share).unwrap();
    let extra = vm.fork_address_space(Some(&parent), ForkMode::Share).unwrap();
    parent.set_vfork_waiter(Some(waiter.clone() as Arc<dyn VforkWaiter>));

    vm.destroy_address_space(extra);
    assert_eq!(waiter.signals.load(Ordering::SeqCst), 0);

    vm.destroy_address_space(child);
    assert_eq!(waiter.signals.load(Ordering::SeqCst), 1);
    assert_eq!(parent.refcount(), 1);

    // Consumed by the signal
    let again = vm.fork_address_space(Some(&parent), ForkMode::Share).unwrap();
    vm.destroy_address_space(again);
    assert_eq!(waiter.signals.load(Ordering::SeqCst), 1);

    vm.destroy_address_space(parent);
}

/// Destroying the last reference returns every frame and closes every handle.
#[test]
fn test_destroy_releases_everything() {
    let vm = vm(128);
    let before = settled_free(vm);
    let (exe, exe_stats) = MemFile::open(patterned(4));
    let (data, data_stats) = MemFile::open(patterned(2));

    let space = vm.create_address_space(Some(exe.clone())).unwrap();
    let text = vm.map_region(&space, Some(exe.clone()), 0, 0, 4 * PAGE_SIZE).unwrap();
    let file = vm.map_region(&space, Some(data), 0, 0, 2 * PAGE_SIZE).unwrap();
    drop(exe);
    vm.handle_fault(&space, text).unwrap();
    vm.handle_fault(&space, text + 3 * PAGE_SIZE).unwrap();
    vm.handle_fault(&space, file + PAGE_SIZE).unwrap();
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 1);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 1);

    vm.destroy_address_space(space);
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(settled_free(vm), before);
}

/// The child's executable region points at the child's own executable clone;
/// other backing files are cloned independently.
#[test]
fn test_fork_clones_file_handles() {
    let vm = vm(128);
    let (exe, exe_stats) = MemFile::open(patterned(2));
    let (data, data_stats) = MemFile::open(patterned(1));

    let parent = vm.create_address_space(Some(exe.clone())).unwrap();
    vm.map_region(&parent, Some(exe), 0, 0, 2 * PAGE_SIZE).unwrap();
    vm.map_region(&parent, Some(data), 0, 0, PAGE_SIZE).unwrap();
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 1);

    let child = vm.fork_address_space(Some(&parent), ForkMode::Copy).unwrap();
    // One new handle for the child's executable, shared with its text region
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 2);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 2);
    assert!(!Arc::ptr_eq(&child.exe().unwrap(), &parent.exe().unwrap()));

    vm.destroy_address_space(parent);
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 1);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 1);

    // Demand paging in the child reads through its own handles
    let text = child.regions()[0].start;
    vm.handle_fault(&child, text + PAGE_SIZE).unwrap();
    assert_eq!(*exe_stats.seeks.lock().unwrap(), [PAGE_SIZE as u64]);

    vm.destroy_address_space(child);
    assert_eq!(exe_stats.live.load(Ordering::SeqCst), 0);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 0);
}

/// Running out of frames part way through a copy leaves the pool as it was.
#[test]
fn test_fork_failure_leaks_nothing() {
    let vm = vm(64);
    let (data, data_stats) = MemFile::open(patterned(1));
    let parent = vm.create_address_space(None).unwrap();
    let start = vm.map_region(&parent, None, 0, 0, 4 * PAGE_SIZE).unwrap();
    vm.map_region(&parent, Some(data), 0, 0, PAGE_SIZE).unwrap();
    for page in 0..4 {
        vm.write_bytes(&parent, start + page * PAGE_SIZE, &[page as u8 + 1]).unwrap();
    }

    let baseline = settled_free(vm);
    let mut held = Vec::new();
    while vm.frames().stats().free > 3 {
        held.push(vm.frames().alloc(0).unwrap());
    }
    let free = vm.frames().stats().free;

    let err = vm.fork_address_space(Some(&parent), ForkMode::Copy).unwrap_err();
    assert_eq!(err, VmError::OutOfMemory);
    assert_eq!(vm.frames().stats().free, free);
    assert_eq!(data_stats.live.load(Ordering::SeqCst), 1);

    for pa in held {
        vm.frames().free(pa, 0).unwrap();
    }
    assert_eq!(settled_free(vm), baseline);

    // The parent is untouched
    let mut byte = [0u8];
    vm.read_bytes(&parent, start + 3 * PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte, [4]);
    vm.destroy_address_space(parent);
}

/// Activation installs the space's root; destroying the active space falls
/// back to the kernel-only root.
#[test]
fn test_activate_switches_root() {
    let vm = vm_at(0x1_0000_0000, 64);
    let space = vm.create_address_space(None).unwrap();
    assert!(space.root().is_none());

    vm.activate(&space).unwrap();
    let root = space.root().unwrap();
    assert_eq!(mmu::current_root(), root);

    vm.destroy_address_space(space);
    assert_eq!(mmu::current_root(), vm.kernel_mappings().template_root());
}
