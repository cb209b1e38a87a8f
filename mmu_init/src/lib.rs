//! LoongArch64 MMU Init
//!
//! MMU bring-up for the boot firmware: builds the identity mapped page
//! tables described by the platform memory table, installs the TLB refill
//! handler and turns address translation on.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod tlb_refill;

use loongarch_paging::geometry::PageWalkConfig;
use loongarch_paging::page_allocator::PageAllocator;
use loongarch_paging::structs::{PAGE_SHIFT, PAGE_SIZE};
use loongarch_paging::{reg, LoongArch64PageTable, MemoryAttributes, PageTable, PtError};
use r_efi::efi;

/// One entry of the platform memory table. A zero `page_count` entry
/// terminates the table early, for callers that hand over a fixed capacity
/// array that is only partially filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Page aligned first address of the region. Regions are identity
    /// mapped in this firmware phase.
    pub virtual_start: efi::VirtualAddress,
    /// Length of the region in 4 KiB pages.
    pub page_count: u64,
    /// Attributes every page of the region is mapped with.
    pub attributes: MemoryAttributes,
}

/// Configures address translation from the platform memory table: derives
/// the walk geometry from the advertised virtual address width, builds the
/// page table hierarchy, installs the TLB refill handler into the vector
/// window at `vector_base` and enables translation.
///
/// Regions are applied in table order, so later entries override earlier
/// ones where they overlap. When translation is already on, the installed
/// root is updated in place and changed translations are invalidated
/// point-wise; committed state is left intact if a later region fails.
/// When translation is off, any failure tears the fresh hierarchy down
/// again before the error is reported and translation stays off.
///
/// ## Errors
///
/// Returns `INVALID_PARAMETER` for an empty memory table, `UNSUPPORTED`
/// for any failure while bringing up a fresh hierarchy.
pub fn configure_memory_management_unit<A: PageAllocator>(
    page_allocator: A,
    vector_base: u64,
    memory_table: &[MemoryRegion],
) -> Result<(), efi::Status> {
    if memory_table.is_empty() {
        return Err(efi::Status::INVALID_PARAMETER);
    }

    let config = PageWalkConfig::from_va_bits(reg::read_va_bits());

    if reg::is_mmu_enabled() {
        // SAFETY: translation is on, so the root register holds the
        // hierarchy this firmware installed earlier with this geometry.
        let mut table = unsafe { LoongArch64PageTable::from_existing(reg::read_root_base(), page_allocator, config) }
            .map_err(paging_err_to_efi_status)?;
        return apply_memory_table(&mut table, memory_table).map_err(paging_err_to_efi_status);
    }

    let Ok(mut table) = LoongArch64PageTable::new(page_allocator, config) else {
        return Err(efi::Status::UNSUPPORTED);
    };

    if apply_memory_table(&mut table, memory_table).is_err() {
        table.release();
        return Err(efi::Status::UNSUPPORTED);
    }

    if tlb_refill::install_tlb_refill_handler(vector_base).is_err() {
        table.release();
        return Err(efi::Status::UNSUPPORTED);
    }

    if table.install_page_table().is_err() {
        table.release();
        return Err(efi::Status::UNSUPPORTED);
    }

    log::info!("mmu configured, {} bit virtual addressing, {} levels", config.va_bits(), config.levels());
    Ok(())
}

/// Adjusts `[base_address, base_address + length)` to carry `attributes`
/// in the attribute fields selected by `attributes_mask`, growing the
/// hierarchy as needed.
///
/// An empty `root` handle bootstraps first: the geometry registers are
/// programmed and a fresh root allocated, and the handle is filled in only
/// once the whole update has succeeded, so a part way failure never
/// exposes a partially wired root.
pub fn memory_region_map<A: PageAllocator>(
    root: &mut Option<u64>,
    config: PageWalkConfig,
    page_allocator: A,
    base_address: u64,
    length: u64,
    attributes: MemoryAttributes,
    attributes_mask: MemoryAttributes,
) -> Result<(), efi::Status> {
    match *root {
        Some(base) => {
            // SAFETY: the handle is a root produced by an earlier
            // successful call with the same geometry.
            let mut table = unsafe { LoongArch64PageTable::from_existing(base, page_allocator, config) }
                .map_err(paging_err_to_efi_status)?;
            table
                .update_memory_region(base_address, length, attributes, attributes_mask)
                .map_err(paging_err_to_efi_status)
        }
        None => {
            let mut table = LoongArch64PageTable::new(page_allocator, config).map_err(paging_err_to_efi_status)?;
            reg::write_page_size(PAGE_SHIFT);
            reg::write_page_walk_config(config.pwcl(), config.pwch());

            match table.update_memory_region(base_address, length, attributes, attributes_mask) {
                Ok(()) => {
                    *root = Some(table.base().raw());
                    Ok(())
                }
                Err(error) => {
                    table.release();
                    Err(paging_err_to_efi_status(error))
                }
            }
        }
    }
}

fn apply_memory_table<A: PageAllocator>(
    table: &mut LoongArch64PageTable<A>,
    memory_table: &[MemoryRegion],
) -> Result<(), PtError> {
    for region in memory_table {
        if region.page_count == 0 {
            break;
        }
        table.map_memory_region(region.virtual_start, region.page_count * PAGE_SIZE, region.attributes)?;
    }
    Ok(())
}

fn paging_err_to_efi_status(err: PtError) -> efi::Status {
    match err {
        PtError::InvalidParameter => efi::Status::INVALID_PARAMETER,
        PtError::OutOfResources => efi::Status::OUT_OF_RESOURCES,
        PtError::NoMapping => efi::Status::NO_MAPPING,
        PtError::IncompatibleMemoryAttributes => efi::Status::INVALID_PARAMETER,
        PtError::UnalignedAddress => efi::Status::INVALID_PARAMETER,
        PtError::UnalignedMemoryRange => efi::Status::INVALID_PARAMETER,
        PtError::InvalidMemoryRange => efi::Status::INVALID_PARAMETER,
        PtError::Unsupported => efi::Status::UNSUPPORTED,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_registers;
    use loongarch_paging::structs::{SIZE_1GB, SIZE_2MB, SIZE_64KB};
    use loongarch_paging::PtResult;
    use mockall::mock;
    use std::alloc::{alloc, dealloc, Layout};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::ptr::write_bytes;
    use std::rc::Rc;

    mock! {
        Allocator {}
        impl PageAllocator for Allocator {
            fn allocate_pages(&mut self, count: u64) -> PtResult<u64>;
            fn free_pages(&mut self, address: u64, count: u64);
        }
    }

    #[derive(Default)]
    struct ArenaState {
        outstanding: HashMap<u64, u64>,
        allocations: usize,
        fail_after: Option<usize>,
    }

    /// Heap backed page pool with bookkeeping, shared between the test and
    /// the table it hands pages to.
    #[derive(Clone, Default)]
    struct TestAllocator {
        state: Rc<RefCell<ArenaState>>,
    }

    impl TestAllocator {
        fn new() -> Self {
            Self::default()
        }

        fn failing_after(allocations: usize) -> Self {
            let allocator = Self::new();
            allocator.state.borrow_mut().fail_after = Some(allocations);
            allocator
        }

        fn outstanding(&self) -> usize {
            self.state.borrow().outstanding.len()
        }
    }

    impl PageAllocator for TestAllocator {
        fn allocate_pages(&mut self, count: u64) -> PtResult<u64> {
            let mut state = self.state.borrow_mut();
            if state.fail_after.is_some_and(|limit| state.allocations >= limit) {
                return Err(PtError::OutOfResources);
            }

            let layout = Layout::from_size_align((count * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
            // SAFETY: the layout has a non zero size.
            let base = unsafe { alloc(layout) };
            assert!(!base.is_null());
            unsafe { write_bytes(base, 0xa5, layout.size()) };

            state.allocations += 1;
            state.outstanding.insert(base as u64, count);
            Ok(base as u64)
        }

        fn free_pages(&mut self, address: u64, count: u64) {
            let mut state = self.state.borrow_mut();
            assert_eq!(state.outstanding.remove(&address), Some(count), "freed a page that was never allocated");
            let layout = Layout::from_size_align((count * PAGE_SIZE) as usize, PAGE_SIZE as usize).unwrap();
            // SAFETY: the address came from alloc with this same layout.
            unsafe { dealloc(address as *mut u8, layout) };
        }
    }

    #[repr(align(4096))]
    struct VectorWindow([u8; SIZE_64KB as usize]);

    impl VectorWindow {
        fn new() -> Box<Self> {
            Box::new(VectorWindow([0; SIZE_64KB as usize]))
        }
    }

    fn boot_memory_table() -> Vec<MemoryRegion> {
        vec![
            MemoryRegion {
                virtual_start: 0,
                page_count: SIZE_1GB / PAGE_SIZE,
                attributes: MemoryAttributes::Writeback,
            },
            MemoryRegion {
                virtual_start: SIZE_1GB,
                page_count: 16 * SIZE_2MB / PAGE_SIZE,
                attributes: MemoryAttributes::Uncacheable,
            },
        ]
    }

    #[test]
    fn test_empty_memory_table_is_rejected() {
        with_registers(|| {
            // the allocator is never consulted before the parameter check
            let allocator = MockAllocator::new();
            assert_eq!(
                configure_memory_management_unit(allocator, 0, &[]),
                Err(efi::Status::INVALID_PARAMETER)
            );
            assert!(!reg::is_mmu_enabled());
        });
    }

    #[test]
    fn test_cold_bring_up_enables_translation() {
        with_registers(|| {
            let allocator = TestAllocator::new();
            let window = VectorWindow::new();

            configure_memory_management_unit(allocator, window.0.as_ptr() as u64, &boot_memory_table()).unwrap();

            assert!(reg::is_mmu_enabled());
            assert_ne!(reg::read_root_base(), 0);
            assert_eq!(reg::read_page_size(), PAGE_SHIFT);

            let config = PageWalkConfig::from_va_bits(48);
            assert_eq!(reg::read_page_walk_config(), (config.pwcl(), config.pwch()));
            assert_eq!(
                reg::read_tlb_refill_base(),
                window.0.as_ptr() as u64 + tlb_refill::refill_handler_offset()
            );
        });
    }

    #[test]
    fn test_memory_table_stops_at_sentinel() {
        with_registers(|| {
            let allocator = TestAllocator::new();
            let window = VectorWindow::new();
            let table = [
                MemoryRegion {
                    virtual_start: 0,
                    page_count: SIZE_2MB / PAGE_SIZE,
                    attributes: MemoryAttributes::Writeback,
                },
                MemoryRegion { virtual_start: 0, page_count: 0, attributes: MemoryAttributes::empty() },
                // past the sentinel: a region that would otherwise fail
                MemoryRegion { virtual_start: 0x800, page_count: 1, attributes: MemoryAttributes::Writeback },
            ];

            configure_memory_management_unit(allocator.clone(), window.0.as_ptr() as u64, &table).unwrap();
            assert!(reg::is_mmu_enabled());

            // SAFETY: the root was installed by the call above.
            let installed = unsafe {
                LoongArch64PageTable::from_existing(reg::read_root_base(), allocator, PageWalkConfig::from_va_bits(48))
            }
            .unwrap();
            assert_eq!(installed.query_memory_region(0, SIZE_2MB), Ok(MemoryAttributes::Writeback));
            assert_eq!(installed.query_memory_region(SIZE_2MB, SIZE_2MB), Err(PtError::NoMapping));
        });
    }

    #[test]
    fn test_warm_reconfigure_updates_live_root() {
        with_registers(|| {
            let allocator = TestAllocator::new();
            let window = VectorWindow::new();
            let base = window.0.as_ptr() as u64;

            configure_memory_management_unit(allocator.clone(), base, &boot_memory_table()).unwrap();
            let root = reg::read_root_base();
            let invalidations = reg::tlb_invalidation_count();

            // second call while translation is on: same table, one region
            // now execute protected
            let mut table = boot_memory_table();
            table[1].attributes = MemoryAttributes::Uncacheable | MemoryAttributes::ExecuteProtect;
            configure_memory_management_unit(allocator.clone(), base, &table).unwrap();

            // the installed root was updated in place, with live
            // invalidation for the rewritten entries
            assert_eq!(reg::read_root_base(), root);
            assert!(reg::tlb_invalidation_count() > invalidations);

            // SAFETY: the root was installed by the calls above.
            let installed =
                unsafe { LoongArch64PageTable::from_existing(root, allocator, PageWalkConfig::from_va_bits(48)) }
                    .unwrap();
            assert_eq!(
                installed.query_memory_region(SIZE_1GB, 16 * SIZE_2MB),
                Ok(MemoryAttributes::Uncacheable | MemoryAttributes::ExecuteProtect)
            );
            assert_eq!(installed.query_memory_region(0, SIZE_1GB), Ok(MemoryAttributes::Writeback));
        });
    }

    #[test]
    fn test_unaligned_vector_window_tears_down_cold_bring_up() {
        with_registers(|| {
            let allocator = TestAllocator::new();
            let window = VectorWindow::new();

            assert_eq!(
                configure_memory_management_unit(
                    allocator.clone(),
                    window.0.as_ptr() as u64 + 0x800,
                    &boot_memory_table()
                ),
                Err(efi::Status::UNSUPPORTED)
            );

            // translation stays off and the whole hierarchy went back
            assert!(!reg::is_mmu_enabled());
            assert_eq!(allocator.outstanding(), 0);
        });
    }

    #[test]
    fn test_allocation_failure_tears_down_cold_bring_up() {
        with_registers(|| {
            let allocator = TestAllocator::failing_after(3);
            let window = VectorWindow::new();

            assert_eq!(
                configure_memory_management_unit(allocator.clone(), window.0.as_ptr() as u64, &boot_memory_table()),
                Err(efi::Status::UNSUPPORTED)
            );

            assert!(!reg::is_mmu_enabled());
            assert_eq!(allocator.outstanding(), 0);
        });
    }

    #[test]
    fn test_mock_allocator_failure_surfaces_as_unsupported() {
        with_registers(|| {
            let mut allocator = MockAllocator::new();
            // root comes through, the first child table does not
            let layout = Layout::from_size_align(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
            let root = unsafe { alloc(layout) } as u64;
            allocator.expect_allocate_pages().times(1).returning(move |_| Ok(root));
            allocator.expect_allocate_pages().returning(|_| Err(PtError::OutOfResources));
            allocator.expect_free_pages().times(1).withf(move |address, count| *address == root && *count == 1).return_const(());

            let window = VectorWindow::new();
            assert_eq!(
                configure_memory_management_unit(allocator, window.0.as_ptr() as u64, &boot_memory_table()),
                Err(efi::Status::UNSUPPORTED)
            );
            unsafe { dealloc(root as *mut u8, layout) };
        });
    }

    #[test]
    fn test_memory_region_map_bootstraps_root() {
        with_registers(|| {
            let allocator = TestAllocator::new();
            let config = PageWalkConfig::from_va_bits(48);
            let mut root = None;

            memory_region_map(
                &mut root,
                config,
                allocator.clone(),
                0,
                SIZE_2MB,
                MemoryAttributes::Writeback,
                MemoryAttributes::all(),
            )
            .unwrap();

            let base = root.expect("bootstrap fills in the root handle");
            assert_eq!(reg::read_page_walk_config(), (config.pwcl(), config.pwch()));

            // a later call through the same handle edits the same hierarchy
            memory_region_map(
                &mut root,
                config,
                allocator.clone(),
                0x1000,
                PAGE_SIZE,
                MemoryAttributes::ExecuteProtect,
                MemoryAttributes::ExecuteProtect,
            )
            .unwrap();
            assert_eq!(root, Some(base));

            // SAFETY: the root was built by the calls above.
            let table = unsafe { LoongArch64PageTable::from_existing(base, allocator, config) }.unwrap();
            assert_eq!(
                table.query_memory_region(0x1000, PAGE_SIZE),
                Ok(MemoryAttributes::Writeback | MemoryAttributes::ExecuteProtect)
            );
            assert_eq!(table.query_memory_region(0, PAGE_SIZE), Ok(MemoryAttributes::Writeback));
        });
    }

    #[test]
    fn test_memory_region_map_failure_keeps_handle_empty() {
        with_registers(|| {
            // enough for the root and one table level, not the full chain
            let allocator = TestAllocator::failing_after(2);
            let mut root = None;

            assert_eq!(
                memory_region_map(
                    &mut root,
                    PageWalkConfig::from_va_bits(48),
                    allocator.clone(),
                    0x1000,
                    PAGE_SIZE,
                    MemoryAttributes::Writeback,
                    MemoryAttributes::all(),
                ),
                Err(efi::Status::OUT_OF_RESOURCES)
            );

            assert_eq!(root, None);
            assert_eq!(allocator.outstanding(), 0);
        });
    }

    #[test]
    fn test_status_conversion() {
        assert_eq!(paging_err_to_efi_status(PtError::InvalidParameter), efi::Status::INVALID_PARAMETER);
        assert_eq!(paging_err_to_efi_status(PtError::OutOfResources), efi::Status::OUT_OF_RESOURCES);
        assert_eq!(paging_err_to_efi_status(PtError::NoMapping), efi::Status::NO_MAPPING);
        assert_eq!(paging_err_to_efi_status(PtError::UnalignedAddress), efi::Status::INVALID_PARAMETER);
        assert_eq!(paging_err_to_efi_status(PtError::Unsupported), efi::Status::UNSUPPORTED);
    }
}
