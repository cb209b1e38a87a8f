//! Translation Registers
//!
//! Access to the CSRs that drive address translation: page walk
//! configuration, page size, root table base, the translation enable and
//! TLB invalidation. On targets other than LoongArch64 the same interface
//! is backed by a register model so the engine and its callers can be
//! exercised on a host.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// CRMD.DA: direct address translation enable.
const CRMD_DA: u64 = 1 << 3;
/// CRMD.PG: mapped address translation enable.
const CRMD_PG: u64 = 1 << 4;
/// CRMD.DATF/DATM: fetch and load/store access type while in direct
/// translation, set to coherent cached alongside PG.
const CRMD_DATF_CC: u64 = 0b01 << 5;
const CRMD_DATM_CC: u64 = 0b01 << 7;

/// TLBREHI.PS field.
const TLBREHI_PS_MASK: u64 = 0x3f;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "loongarch64")] {
        use core::arch::asm;

        /// Reads the supported virtual address width from the capability
        /// word (CPUCFG.1, VALEN-1 in bits 19:12).
        pub fn read_va_bits() -> u64 {
            let config: u64;
            // SAFETY: cpucfg word 1 is architecturally defined and side
            // effect free.
            unsafe { asm!("cpucfg {0}, {1}", out(reg) config, in(reg) 1u64, options(nomem, nostack)) };
            ((config >> 12) & 0xff) + 1
        }

        /// Programs the two page walk configuration registers.
        pub fn write_page_walk_config(pwcl: u32, pwch: u32) {
            unsafe {
                asm!("csrwr {}, 0x1c", inout(reg) pwcl as u64 => _, options(nomem, nostack));
                asm!("csrwr {}, 0x1d", inout(reg) pwch as u64 => _, options(nomem, nostack));
            }
        }

        /// Reads back the two page walk configuration registers.
        pub fn read_page_walk_config() -> (u32, u32) {
            let (pwcl, pwch): (u64, u64);
            unsafe {
                asm!("csrrd {}, 0x1c", out(reg) pwcl, options(nomem, nostack));
                asm!("csrrd {}, 0x1d", out(reg) pwch, options(nomem, nostack));
            }
            (pwcl as u32, pwch as u32)
        }

        /// Programs the page size into STLBPS and the refill entry high
        /// register.
        pub fn write_page_size(page_shift: u64) {
            unsafe {
                asm!("csrwr {}, 0x1e", inout(reg) page_shift => _, options(nomem, nostack));
            }
            let tlbrehi: u64;
            unsafe { asm!("csrrd {}, 0x8e", out(reg) tlbrehi, options(nomem, nostack)) };
            let tlbrehi = (tlbrehi & !TLBREHI_PS_MASK) | (page_shift & TLBREHI_PS_MASK);
            unsafe { asm!("csrwr {}, 0x8e", inout(reg) tlbrehi => _, options(nomem, nostack)) };
        }

        /// Writes the lower half address space root table base (PGDL).
        pub fn set_root_base(base: u64) {
            unsafe { asm!("csrwr {}, 0x19", inout(reg) base => _, options(nomem, nostack)) };
        }

        /// Reads the lower half address space root table base.
        pub fn read_root_base() -> u64 {
            let base: u64;
            unsafe { asm!("csrrd {}, 0x19", out(reg) base, options(nomem, nostack)) };
            base
        }

        /// Turns mapped translation on: set CRMD.PG, clear CRMD.DA, and
        /// leave the direct windows cache coherent.
        pub fn enable_mmu() {
            let crmd: u64;
            unsafe { asm!("csrrd {}, 0x0", out(reg) crmd, options(nomem, nostack)) };
            let crmd = (crmd & !CRMD_DA) | CRMD_PG | CRMD_DATF_CC | CRMD_DATM_CC;
            unsafe { asm!("csrwr {}, 0x0", inout(reg) crmd => _, options(nomem, nostack)) };
        }

        /// Whether mapped translation is on.
        pub fn is_mmu_enabled() -> bool {
            let crmd: u64;
            unsafe { asm!("csrrd {}, 0x0", out(reg) crmd, options(nomem, nostack)) };
            crmd & CRMD_PG != 0
        }

        /// Drops any cached translation for `address` on this core. The
        /// barrier orders the preceding entry store against the
        /// invalidation.
        pub fn invalidate_tlb_entry(address: u64) {
            unsafe {
                asm!("dbar 0", "invtlb 0x05, $r0, {}", in(reg) address, options(nostack));
            }
        }

        /// Drops every cached translation on this core.
        pub fn invalidate_tlb_all() {
            unsafe {
                asm!("dbar 0", "invtlb 0x00, $r0, $r0", options(nostack));
            }
        }

        /// Writes the TLB refill handler entry point (TLBRENTRY).
        pub fn set_tlb_refill_base(base: u64) {
            unsafe { asm!("csrwr {}, 0x88", inout(reg) base => _, options(nomem, nostack)) };
        }

        /// Reads the TLB refill handler entry point.
        pub fn read_tlb_refill_base() -> u64 {
            let base: u64;
            unsafe { asm!("csrrd {}, 0x88", out(reg) base, options(nomem, nostack)) };
            base
        }

        /// Makes code stored to `[address, address + length)` visible to
        /// instruction fetch on this core.
        pub fn invalidate_instruction_cache_range(_address: u64, _length: u64) {
            unsafe { asm!("dbar 0", "ibar 0", options(nostack)) };
        }
    } else {
        use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

        // Host side register model. Each cell mirrors one CSR; the
        // invalidation counter stands in for the TLB.
        static CRMD: AtomicU64 = AtomicU64::new(CRMD_DA);
        static PGDL: AtomicU64 = AtomicU64::new(0);
        static PWCL: AtomicU64 = AtomicU64::new(0);
        static PWCH: AtomicU64 = AtomicU64::new(0);
        static STLBPS: AtomicU64 = AtomicU64::new(0);
        static TLBREHI: AtomicU64 = AtomicU64::new(0);
        static TLBRENTRY: AtomicU64 = AtomicU64::new(0);
        static VA_BITS: AtomicU64 = AtomicU64::new(48);
        static TLB_INVALIDATIONS: AtomicUsize = AtomicUsize::new(0);
        static ICACHE_INVALIDATIONS: AtomicUsize = AtomicUsize::new(0);

        pub fn read_va_bits() -> u64 {
            VA_BITS.load(Ordering::Relaxed)
        }

        pub fn write_page_walk_config(pwcl: u32, pwch: u32) {
            PWCL.store(pwcl as u64, Ordering::Relaxed);
            PWCH.store(pwch as u64, Ordering::Relaxed);
        }

        pub fn read_page_walk_config() -> (u32, u32) {
            (PWCL.load(Ordering::Relaxed) as u32, PWCH.load(Ordering::Relaxed) as u32)
        }

        pub fn write_page_size(page_shift: u64) {
            STLBPS.store(page_shift, Ordering::Relaxed);
            TLBREHI.store(page_shift & TLBREHI_PS_MASK, Ordering::Relaxed);
        }

        pub fn set_root_base(base: u64) {
            PGDL.store(base, Ordering::Relaxed);
        }

        pub fn read_root_base() -> u64 {
            PGDL.load(Ordering::Relaxed)
        }

        pub fn enable_mmu() {
            let crmd = CRMD.load(Ordering::Relaxed);
            CRMD.store((crmd & !CRMD_DA) | CRMD_PG | CRMD_DATF_CC | CRMD_DATM_CC, Ordering::Relaxed);
        }

        pub fn is_mmu_enabled() -> bool {
            CRMD.load(Ordering::Relaxed) & CRMD_PG != 0
        }

        pub fn invalidate_tlb_entry(_address: u64) {
            TLB_INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
        }

        pub fn invalidate_tlb_all() {
            TLB_INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
        }

        pub fn set_tlb_refill_base(base: u64) {
            TLBRENTRY.store(base, Ordering::Relaxed);
        }

        pub fn read_tlb_refill_base() -> u64 {
            TLBRENTRY.load(Ordering::Relaxed)
        }

        pub fn invalidate_instruction_cache_range(_address: u64, _length: u64) {
            ICACHE_INVALIDATIONS.fetch_add(1, Ordering::Relaxed);
        }

        /// Page size as last programmed into the model.
        pub fn read_page_size() -> u64 {
            STLBPS.load(Ordering::Relaxed)
        }

        /// Point invalidations observed by the model.
        pub fn tlb_invalidation_count() -> usize {
            TLB_INVALIDATIONS.load(Ordering::Relaxed)
        }

        /// Instruction cache invalidations observed by the model.
        pub fn icache_invalidation_count() -> usize {
            ICACHE_INVALIDATIONS.load(Ordering::Relaxed)
        }

        /// Overrides the advertised virtual address width.
        pub fn set_va_bits(bits: u64) {
            VA_BITS.store(bits, Ordering::Relaxed);
        }

        /// Returns the model to its power-on state.
        pub fn reset() {
            CRMD.store(CRMD_DA, Ordering::Relaxed);
            PGDL.store(0, Ordering::Relaxed);
            PWCL.store(0, Ordering::Relaxed);
            PWCH.store(0, Ordering::Relaxed);
            STLBPS.store(0, Ordering::Relaxed);
            TLBREHI.store(0, Ordering::Relaxed);
            TLBRENTRY.store(0, Ordering::Relaxed);
            VA_BITS.store(48, Ordering::Relaxed);
            TLB_INVALIDATIONS.store(0, Ordering::Relaxed);
            ICACHE_INVALIDATIONS.store(0, Ordering::Relaxed);
        }
    }
}
