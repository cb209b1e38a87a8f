//! Page Table Entry Encoding
//!
//! LoongArch64 page table entry bit fields, the three way entry
//! classification, and the translation between the architecture neutral
//! memory attributes and the entry bits.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::structs::PhysicalAddress;
use crate::MemoryAttributes;

pub const PAGE_VALID: u64 = 1 << 0;
pub const PAGE_DIRTY: u64 = 1 << 1;

pub const PLV_SHIFT: u64 = 2;
pub const PLV_MASK: u64 = 0x3 << PLV_SHIFT;
/// Privilege level 0, the only level firmware executes at.
pub const PLV_KERNEL: u64 = 0 << PLV_SHIFT;

pub const MAT_SHIFT: u64 = 4;
pub const MAT_MASK: u64 = 0x3 << MAT_SHIFT;
/// Strongly ordered uncached.
pub const CACHE_SUC: u64 = 0 << MAT_SHIFT;
/// Coherent cached.
pub const CACHE_CC: u64 = 1 << MAT_SHIFT;
/// Weakly ordered uncached.
pub const CACHE_WUC: u64 = 2 << MAT_SHIFT;

pub const PAGE_GLOBAL: u64 = 1 << 6;
/// Same bit as [`PAGE_GLOBAL`]; marks a huge leaf in a directory entry.
pub const PAGE_HUGE: u64 = 1 << 6;
/// Global flag of a huge leaf, displaced because bit 6 tags the leaf.
pub const PAGE_HGLOBAL: u64 = 1 << 12;

pub const PAGE_NO_READ: u64 = 1 << 61;
pub const PAGE_NO_EXEC: u64 = 1 << 62;
pub const PAGE_RPLV: u64 = 1 << 63;

/// Physical frame bits of an entry.
pub const PFN_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// The attribute bits of a page granular leaf; the canonical form all
/// attribute arithmetic is done in. Block leaves are converted to and from
/// this form so that splits and queries see one encoding.
pub const PAGE_ATTRIBUTES_MASK: u64 =
    PAGE_VALID | PAGE_DIRTY | PLV_MASK | MAT_MASK | PAGE_GLOBAL | PAGE_NO_READ | PAGE_NO_EXEC | PAGE_RPLV;

/// What a page table entry is, at a given level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Nothing mapped.
    Invalid,
    /// Points at a table one level down.
    Table,
    /// A leaf: a page at the last level, a huge leaf above it.
    Leaf,
}

/// One page table entry. The tag bits are level dependent, so every
/// inspection takes the level the entry was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const INVALID: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Classifies the entry. The last level never holds table entries and
    /// its valid entries are always page leaves.
    pub fn kind(self, level: u64, last_level: u64) -> EntryKind {
        if self.0 == 0 {
            EntryKind::Invalid
        } else if level == last_level {
            if self.0 & PAGE_VALID != 0 { EntryKind::Leaf } else { EntryKind::Invalid }
        } else if self.0 & PAGE_HUGE != 0 {
            EntryKind::Leaf
        } else {
            EntryKind::Table
        }
    }

    /// A table entry: the child table base, tagged valid only. Cache and
    /// permission bits live at the leaves.
    pub fn new_table(child: PhysicalAddress) -> Self {
        debug_assert!(child.is_4kb_aligned());
        Self(child.raw() | PAGE_VALID)
    }

    /// The child table base of a table entry.
    pub fn table_base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & PFN_MASK)
    }

    /// A leaf entry for `address` carrying the canonical attribute bits,
    /// retagged for the level: huge leaves move the global flag aside and
    /// tag bit 6 as huge.
    pub fn new_leaf(attributes: u64, address: u64, level: u64, last_level: u64) -> Self {
        let frame = address & PFN_MASK;
        if level == last_level {
            Self((attributes & PAGE_ATTRIBUTES_MASK) | frame | PAGE_VALID)
        } else {
            let mut raw = (attributes & (PAGE_ATTRIBUTES_MASK & !PAGE_GLOBAL)) | frame;
            if attributes & PAGE_GLOBAL != 0 {
                raw |= PAGE_HGLOBAL;
            }
            Self(raw | PAGE_HUGE | PAGE_VALID)
        }
    }

    /// The attribute bits of a leaf in canonical (page leaf) form.
    pub fn canonical_attributes(self, level: u64, last_level: u64) -> u64 {
        if level == last_level {
            self.0 & PAGE_ATTRIBUTES_MASK
        } else {
            let mut attributes = self.0 & (PAGE_ATTRIBUTES_MASK & !PAGE_GLOBAL);
            if self.0 & PAGE_HGLOBAL != 0 {
                attributes |= PAGE_GLOBAL;
            }
            attributes
        }
    }
}

/// Translates the architecture neutral attributes into canonical entry
/// bits. Total: unknown or empty masks fall back to the cacheable
/// read-write-execute baseline.
pub fn attributes_to_pte(attributes: MemoryAttributes) -> u64 {
    let mut pte = PAGE_VALID | PAGE_DIRTY | PLV_KERNEL | PAGE_GLOBAL | CACHE_CC;

    if attributes.intersects(MemoryAttributes::Uncacheable | MemoryAttributes::UncacheableExport) {
        pte = (pte & !MAT_MASK) | CACHE_SUC;
    } else if attributes.contains(MemoryAttributes::WriteCombining) {
        pte = (pte & !MAT_MASK) | CACHE_WUC;
    }

    // Stores through a clean entry raise a page modify exception; a
    // cleared dirty bit is the only write protection the format has.
    if attributes.intersects(MemoryAttributes::ReadOnly | MemoryAttributes::WriteProtect) {
        pte &= !PAGE_DIRTY;
    }

    if attributes.contains(MemoryAttributes::ReadProtect) {
        pte |= PAGE_NO_READ;
    }

    if attributes.contains(MemoryAttributes::ExecuteProtect) {
        pte |= PAGE_NO_EXEC;
    }

    pte
}

/// The entry bits a set of architecture neutral attributes governs; the
/// clear mask companion of [`attributes_to_pte`] for masked updates.
pub fn attributes_mask_to_pte(mask: MemoryAttributes) -> u64 {
    let mut bits = 0;

    if mask.intersects(
        MemoryAttributes::Uncacheable
            | MemoryAttributes::WriteCombining
            | MemoryAttributes::WriteThrough
            | MemoryAttributes::Writeback
            | MemoryAttributes::UncacheableExport,
    ) {
        bits |= MAT_MASK;
    }

    if mask.intersects(MemoryAttributes::ReadOnly | MemoryAttributes::WriteProtect) {
        bits |= PAGE_DIRTY;
    }

    if mask.contains(MemoryAttributes::ReadProtect) {
        bits |= PAGE_NO_READ;
    }

    if mask.contains(MemoryAttributes::ExecuteProtect) {
        bits |= PAGE_NO_EXEC;
    }

    bits
}

/// The inverse of [`attributes_to_pte`], reporting the effective
/// attributes of a leaf: write through reads back as write back, and both
/// write protection inputs read back as read only.
pub fn pte_to_attributes(pte: u64) -> MemoryAttributes {
    let mut attributes = match pte & MAT_MASK {
        CACHE_SUC => MemoryAttributes::Uncacheable,
        CACHE_WUC => MemoryAttributes::WriteCombining,
        _ => MemoryAttributes::Writeback,
    };

    if pte & PAGE_DIRTY == 0 {
        attributes |= MemoryAttributes::ReadOnly;
    }

    if pte & PAGE_NO_READ != 0 {
        attributes |= MemoryAttributes::ReadProtect;
    }

    if pte & PAGE_NO_EXEC != 0 {
        attributes |= MemoryAttributes::ExecuteProtect;
    }

    attributes
}
