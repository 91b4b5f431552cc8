//! Region placement through `Vm::map_region`.

mod common;

use common::{MemFile, patterned, vm};
use kmem_vm::layout::{MMAP_BASE, PAGE_SIZE, USER_SPACE_END};
use kmem_vm::{Region, VmError};
use proptest::prelude::*;

#[test]
fn test_regions_placed_in_first_gap() {
    let vm = vm(64);
    let space = vm.create_address_space(None).unwrap();
    assert!(space.root().is_none());

    let a = vm.map_region(&space, None, 0, 0, PAGE_SIZE).unwrap();
    let b = vm.map_region(&space, None, 0, 0, 100).unwrap();
    assert_eq!(a, MMAP_BASE);
    // Lengths are rounded up to whole pages
    assert_eq!(b, MMAP_BASE + PAGE_SIZE);
    assert!(space.root().is_some());

    let c = vm.map_region(&space, None, 0, 0, 3 * PAGE_SIZE).unwrap();
    assert_eq!(c, MMAP_BASE + 2 * PAGE_SIZE);

    vm.destroy_address_space(space);
}

#[test]
fn test_hint_is_honoured_when_free() {
    let vm = vm(64);
    let (file, _) = MemFile::open(patterned(4));
    let space = vm.create_address_space(None).unwrap();

    let hint = 0x1000_0000;
    let at = vm.map_region(&space, Some(file), 2 * PAGE_SIZE as u64, hint, 2 * PAGE_SIZE).unwrap();
    assert_eq!(at, hint);

    // Occupied hint falls back to the search
    let again = vm.map_region(&space, None, 0, hint + PAGE_SIZE, PAGE_SIZE).unwrap();
    assert_eq!(again, MMAP_BASE);

    // Hints below the search floor are still allowed
    let low = vm.map_region(&space, None, 0, 0x1000, PAGE_SIZE).unwrap();
    assert_eq!(low, 0x1000);

    assert_eq!(
        space.regions(),
        [
            Region { start: 0x1000, len: PAGE_SIZE, file_backed: false, offset: 0 },
            Region { start: MMAP_BASE, len: PAGE_SIZE, file_backed: false, offset: 0 },
            Region { start: hint, len: 2 * PAGE_SIZE, file_backed: true, offset: 2 * PAGE_SIZE as u64 },
        ]
    );

    vm.destroy_address_space(space);
}

#[test]
fn test_invalid_arguments() {
    let vm = vm(64);
    let space = vm.create_address_space(None).unwrap();

    let err = vm.map_region(&space, None, 0, 0, 0).unwrap_err();
    assert_eq!(err, VmError::InvalidArgument);
    assert_eq!(err.errno(), Some(22));
    assert_eq!(vm.map_region(&space, None, 0, 0x1234, PAGE_SIZE), Err(VmError::InvalidArgument));
    assert_eq!(vm.map_region(&space, None, 7, 0, PAGE_SIZE), Err(VmError::InvalidArgument));
    assert_eq!(vm.map_region(&space, None, 0, 0, USER_SPACE_END), Err(VmError::InvalidArgument));

    // Nothing was recorded and no table was built
    assert!(space.regions().is_empty());
    assert!(space.root().is_none());
    vm.destroy_address_space(space);
}

#[test]
fn test_no_gap_is_out_of_memory() {
    let vm = vm(64);
    let space = vm.create_address_space(None).unwrap();

    let whole = USER_SPACE_END - MMAP_BASE;
    assert_eq!(vm.map_region(&space, None, 0, 0, whole), Ok(MMAP_BASE));

    let err = vm.map_region(&space, None, 0, 0, PAGE_SIZE).unwrap_err();
    assert_eq!(err, VmError::OutOfMemory);
    assert_eq!(err.errno(), Some(12));

    // Below the floor is still reachable by hint
    assert_eq!(vm.map_region(&space, None, 0, 0x2000, PAGE_SIZE), Ok(0x2000));
    vm.destroy_address_space(space);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the sequence of requests, regions stay ascending, disjoint and
    /// inside the user range, and each one lands where the call said it did.
    #[test]
    fn prop_regions_ordered_and_disjoint(
        requests in prop::collection::vec((0usize..48, 1usize..6 * PAGE_SIZE), 1..24)
    ) {
        let vm = vm(64);
        let space = vm.create_address_space(None).unwrap();

        let mut placed = Vec::new();
        for (slot, len) in requests {
            let hint = slot * 4 * PAGE_SIZE;
            let start = vm.map_region(&space, None, 0, hint, len).unwrap();
            prop_assert!(start == hint || start >= MMAP_BASE);
            placed.push((start, len.next_multiple_of(PAGE_SIZE)));
        }

        let regions = space.regions();
        prop_assert_eq!(regions.len(), placed.len());
        for pair in regions.windows(2) {
            prop_assert!(pair[0].start + pair[0].len <= pair[1].start);
        }
        for region in &regions {
            prop_assert!(region.start + region.len <= USER_SPACE_END);
            prop_assert!(placed.contains(&(region.start, region.len)));
        }

        vm.destroy_address_space(space);
    }
}
