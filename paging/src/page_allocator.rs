//! Page Allocator
//!
//! The allocation seam between the page table engine and the host
//! firmware's boot time page pool.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::PtResult;

/// Provides page granular physical memory for page table nodes.
///
/// Allocation is synchronous: it either returns immediately or fails
/// immediately with [`PtError::OutOfResources`](crate::PtError). The
/// engine zeroes every fresh table itself; the contract does not require
/// zeroed pages.
pub trait PageAllocator {
    /// Allocates `count` contiguous 4 KiB pages and returns the physical
    /// base address, which must be 4 KiB aligned.
    fn allocate_pages(&mut self, count: u64) -> PtResult<u64>;

    /// Returns `count` pages starting at `address` to the pool.
    fn free_pages(&mut self, address: u64, count: u64);
}
