//! LoongArch64 Paging
//!
//! This crate provides page table management for the LoongArch64
//! architecture: page walk geometry, page table entry encoding, and a
//! recursive region mapping engine used to build and maintain the
//! identity-mapped page tables of the boot firmware.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

pub mod geometry;
pub mod loongarch64;
pub mod page_allocator;
pub mod pagetablestore;
pub mod pte;
pub mod reg;
pub mod structs;

pub use geometry::PageWalkConfig;
pub use loongarch64::LoongArch64PageTable;
pub use structs::{PhysicalAddress, VirtualAddress};

use bitflags::bitflags;

bitflags! {
    /// Architecture neutral memory attributes, using the UEFI memory
    /// attribute bit values. Cache attributes and access attributes may be
    /// "Ored" together; bits outside these masks are ignored by the
    /// translation into page table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAttributes: u64 {
        /// Uncacheable, strongly ordered.
        const Uncacheable = 0x0000000000000001;
        /// Write combining.
        const WriteCombining = 0x0000000000000002;
        /// Write through.
        const WriteThrough = 0x0000000000000004;
        /// Write back.
        const Writeback = 0x0000000000000008;
        /// Uncacheable, exported and "fetch and add" capable.
        const UncacheableExport = 0x0000000000000010;
        /// Cacheable, write protected.
        const WriteProtect = 0x0000000000001000;
        /// Read protected.
        const ReadProtect = 0x0000000000002000;
        /// Execute protected.
        const ExecuteProtect = 0x0000000000004000;
        /// Read only.
        const ReadOnly = 0x0000000000020000;
    }
}

/// Mask of the cacheability attributes.
pub const CACHE_ATTRIBUTE_MASK: u64 = 0x000000000000101F;

/// Mask of the access attributes.
pub const ACCESS_ATTRIBUTE_MASK: u64 = 0x0000000000026000;

/// Errors returned by the page table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtError {
    /// A required argument is malformed.
    InvalidParameter,
    /// Page allocation failed while growing the table hierarchy.
    OutOfResources,
    /// The queried region contains no valid mapping.
    NoMapping,
    /// The queried region is mapped with differing attributes.
    IncompatibleMemoryAttributes,
    /// The region base is not page aligned.
    UnalignedAddress,
    /// The region length is not page aligned.
    UnalignedMemoryRange,
    /// The region falls outside the supported address space.
    InvalidMemoryRange,
    /// The request cannot be satisfied on this configuration.
    Unsupported,
}

/// Result alias for the page table operations.
pub type PtResult<T> = Result<T, PtError>;

/// Accumulator threaded through the query walk to detect mixed or partial
/// mappings across a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMappingState {
    /// No entry inspected yet.
    Uninitialized,
    /// All entries so far carry these attributes.
    Mapped(MemoryAttributes),
    /// Only invalid entries found so far.
    Unmapped,
}

/// The page table abstraction consumed by the MMU bring-up layer.
pub trait PageTable {
    /// Maps the region with the provided attributes, regardless of the
    /// current mapping state of the region.
    fn map_memory_region(&mut self, address: u64, size: u64, attributes: MemoryAttributes) -> PtResult<()>;

    /// Applies `(old & !attributes_mask) | attributes` to every page of the
    /// region, mapping it first if necessary.
    fn update_memory_region(
        &mut self,
        address: u64,
        size: u64,
        attributes: MemoryAttributes,
        attributes_mask: MemoryAttributes,
    ) -> PtResult<()>;

    /// Returns the attributes of the region if it is mapped uniformly.
    fn query_memory_region(&self, address: u64, size: u64) -> PtResult<MemoryAttributes>;

    /// Programs the page walk registers and enables translation on this
    /// page table.
    fn install_page_table(&mut self) -> PtResult<()>;

    /// Logs the table hierarchy covering the region.
    fn dump_page_tables(&self, address: u64, size: u64);
}
