//! TLB Refill Handler
//!
//! Installs the TLB refill trampoline into the platform reserved exception
//! vector window and points the hardware at it. The handler body is a
//! fixed, pre-assembled blob; this module only places it and publishes its
//! address.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use loongarch_paging::reg;
use loongarch_paging::structs::{PAGE_SIZE, SIZE_64KB};
use r_efi::efi;

/// Exception types the vector region reserves a slot for.
pub const MAX_EXCEPTION_TYPES: u64 = 64;

/// Interrupt types the vector region reserves a slot for.
pub const MAX_INTERRUPT_TYPES: u64 = 13;

/// Bytes of vector region each exception or interrupt type occupies.
const VECTOR_SLOT_SIZE: u64 = 512;

/// Size of the platform reserved vector window the handler must fit in.
const VECTOR_REGION_SIZE: u64 = SIZE_64KB;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "loongarch64")] {
        // The refill walk itself: reload the faulting translation from the
        // page tables and return. The hardware requires the entry point to
        // be page aligned, which the installer checks before copying.
        core::arch::global_asm!(
            ".section .text",
            ".balign 4",
            ".global handle_tlb_refill_start",
            ".global handle_tlb_refill_end",
            "handle_tlb_refill_start:",
            "csrwr   $t0, 0x8b",
            "csrrd   $t0, 0x1b",
            "lddir   $t0, $t0, 3",
            "lddir   $t0, $t0, 2",
            "lddir   $t0, $t0, 1",
            "ldpte   $t0, 0",
            "ldpte   $t0, 1",
            "tlbfill",
            "csrrd   $t0, 0x8b",
            "ertn",
            "handle_tlb_refill_end:",
        );

        extern "C" {
            static handle_tlb_refill_start: u8;
            static handle_tlb_refill_end: u8;
        }

        fn handler_blob() -> (*const u8, usize) {
            // SAFETY: both symbols bracket the assembled handler above.
            unsafe {
                let start = core::ptr::addr_of!(handle_tlb_refill_start);
                let end = core::ptr::addr_of!(handle_tlb_refill_end);
                (start, end as usize - start as usize)
            }
        }
    } else {
        /// Stands in for the assembled handler so the placement and copy
        /// logic is exercisable on a host.
        static HANDLER_BLOB: [u8; 40] = [0x5a; 40];

        fn handler_blob() -> (*const u8, usize) {
            (HANDLER_BLOB.as_ptr(), HANDLER_BLOB.len())
        }
    }
}

/// Byte offset of the refill handler slot within the vector window: past
/// every per-type vector slot, rounded up to the next page boundary.
pub fn refill_handler_offset() -> u64 {
    let vectors_end = (MAX_EXCEPTION_TYPES + MAX_INTERRUPT_TYPES) * VECTOR_SLOT_SIZE;
    (vectors_end + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn placement_fits(offset: u64, length: u64) -> bool {
    offset.checked_add(length).is_some_and(|end| end <= VECTOR_REGION_SIZE)
}

/// Copies the refill handler into the vector window at `vector_base` and
/// programs the hardware entry point register with its address.
///
/// Idempotent: calling again re-copies identical bytes. The instruction
/// cache is invalidated over the copied range before the address is
/// published, so the core never fetches stale bytes on a refill.
///
/// ## Errors
///
/// Returns `UNSUPPORTED` when the handler does not fit the reserved
/// window or the destination is not page aligned.
pub fn install_tlb_refill_handler(vector_base: u64) -> Result<(), efi::Status> {
    let (blob, length) = handler_blob();
    let offset = refill_handler_offset();

    if !placement_fits(offset, length as u64) {
        return Err(efi::Status::UNSUPPORTED);
    }

    let destination = vector_base + offset;
    if destination & (PAGE_SIZE - 1) != 0 {
        return Err(efi::Status::UNSUPPORTED);
    }

    // SAFETY: the destination lies inside the vector window the caller
    // reserved for exactly this purpose, and the blob does not overlap it.
    unsafe { core::ptr::copy_nonoverlapping(blob, destination as *mut u8, length) };
    reg::invalidate_instruction_cache_range(destination, length as u64);
    reg::set_tlb_refill_base(destination);

    log::info!("tlb refill handler at {:#x}, {} bytes", destination, length);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_registers;

    #[repr(align(4096))]
    struct VectorWindow([u8; VECTOR_REGION_SIZE as usize]);

    impl VectorWindow {
        fn new() -> Box<Self> {
            Box::new(VectorWindow([0; VECTOR_REGION_SIZE as usize]))
        }
    }

    #[test]
    fn test_refill_handler_offset() {
        // 77 slots of 512 bytes end at 0x9a00; the next page boundary is
        // 0xa000
        assert_eq!(refill_handler_offset(), 0xa000);
        assert_eq!(refill_handler_offset() & (PAGE_SIZE - 1), 0);
    }

    #[test]
    fn test_handler_fits_reserved_window() {
        let (_, length) = handler_blob();
        assert!(placement_fits(refill_handler_offset(), length as u64));
    }

    #[test]
    fn test_placement_boundary_check() {
        assert!(placement_fits(0, VECTOR_REGION_SIZE));
        assert!(!placement_fits(PAGE_SIZE, VECTOR_REGION_SIZE));
        assert!(!placement_fits(0xf000, 0x2000));
        assert!(!placement_fits(u64::MAX, 1));
    }

    #[test]
    fn test_install_copies_blob_and_programs_entry_point() {
        with_registers(|| {
            let window = VectorWindow::new();
            let base = window.0.as_ptr() as u64;

            install_tlb_refill_handler(base).unwrap();

            let (blob, length) = handler_blob();
            let offset = refill_handler_offset() as usize;
            let copied = &window.0[offset..offset + length];
            let expected = unsafe { core::slice::from_raw_parts(blob, length) };
            assert_eq!(copied, expected);

            assert_eq!(reg::read_tlb_refill_base(), base + refill_handler_offset());
            assert_eq!(reg::icache_invalidation_count(), 1);

            // reinstalling lands the same bytes at the same place
            install_tlb_refill_handler(base).unwrap();
            assert_eq!(reg::read_tlb_refill_base(), base + refill_handler_offset());
        });
    }

    #[test]
    fn test_unaligned_destination_is_unsupported() {
        with_registers(|| {
            let window = VectorWindow::new();
            let base = window.0.as_ptr() as u64 + 0x800;

            assert_eq!(install_tlb_refill_handler(base), Err(efi::Status::UNSUPPORTED));
            // nothing was published to the hardware
            assert_eq!(reg::read_tlb_refill_base(), 0);
            assert_eq!(reg::icache_invalidation_count(), 0);
        });
    }
}
