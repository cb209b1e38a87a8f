//! LoongArch64 Page Table
//!
//! The region mapping engine. Manages the page table hierarchy rooted at a
//! single physical page: walks a requested region level by level, splits
//! block leaves into tables when a finer granularity is needed, creates
//! child tables on demand and rewrites leaf entries with the requested
//! attribute transformation.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use crate::geometry::PageWalkConfig;
use crate::page_allocator::PageAllocator;
use crate::pagetablestore::PageTableStore;
use crate::pte::{attributes_mask_to_pte, attributes_to_pte, pte_to_attributes};
use crate::pte::{EntryKind, PageTableEntry, PAGE_ATTRIBUTES_MASK};
use crate::reg;
use crate::structs::{PhysicalAddress, VirtualAddress, PAGE_SHIFT};
use crate::{MemoryAttributes, PageTable, PtError, PtResult, RangeMappingState};

/// Manages the page table hierarchy. Keeps the root base, the allocator
/// used to grow the hierarchy and the walk geometry; [`PageTableStore`] is
/// used to interpret the table pages themselves.
pub struct LoongArch64PageTable<A: PageAllocator> {
    // Points to the base of the top level page table
    base: PhysicalAddress,
    page_allocator: A,
    config: PageWalkConfig,
}

impl<A: PageAllocator> LoongArch64PageTable<A> {
    /// Allocates a zeroed root for a fresh hierarchy. Nothing is written to
    /// the hardware until [`PageTable::install_page_table`].
    pub fn new(mut page_allocator: A, config: PageWalkConfig) -> PtResult<Self> {
        let base = PhysicalAddress::new(page_allocator.allocate_pages(1)?);
        assert!(base.is_4kb_aligned(), "page allocator returned an unaligned page");

        // The allocator contract does not promise zeroed pages; stale data
        // would read back as entries.
        PageTableStore::new(base, config.entries(0)).zero();

        Ok(Self { base, page_allocator, config })
    }

    /// Adopts an existing root, to parse or edit a hierarchy built earlier.
    ///
    /// # Safety
    ///
    /// `base` must be the root of a well formed page table built with the
    /// same geometry. Entries reachable from it will be parsed and followed
    /// as table pointers.
    pub unsafe fn from_existing(base: u64, page_allocator: A, config: PageWalkConfig) -> PtResult<Self> {
        let base = PhysicalAddress::new(base);
        if !base.is_4kb_aligned() {
            return Err(PtError::InvalidParameter);
        }

        Ok(Self { base, page_allocator, config })
    }

    /// The root table base.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// The walk geometry this hierarchy was built with.
    pub fn config(&self) -> PageWalkConfig {
        self.config
    }

    pub fn borrow_allocator(&mut self) -> &mut A {
        &mut self.page_allocator
    }

    /// Returns every node of the hierarchy to the allocator. Must not be
    /// called while the hardware can still walk this root.
    pub fn release(mut self) {
        debug_assert!(!self.is_live(), "releasing a live page table");
        self.free_subtree(self.base, 0);
    }

    /// Whether hardware walkers can observe this hierarchy right now:
    /// translation is on and the root register points at our root.
    fn is_live(&self) -> bool {
        reg::is_mmu_enabled() && reg::read_root_base() == self.base.raw()
    }

    /// The single entry replacement primitive. Entries observable by a live
    /// walker are point invalidated after the write; entries of tables
    /// still under construction are not, no walker can hold them yet.
    fn replace_entry(store: &PageTableStore, index: u64, entry: PageTableEntry, address: u64, table_is_live: bool) {
        store.write_entry(index, entry);
        if table_is_live && reg::is_mmu_enabled() {
            reg::invalidate_tlb_entry(address);
        }
    }

    /// Applies `(old & !clear_mask) | set_mask` to every leaf covering
    /// `[region_start, region_end)` within the table at `base`, recursing a
    /// level at a time and never crossing a block boundary in one step.
    ///
    /// `table_is_live` tracks whether the table at `base` is reachable from
    /// the installed root. Fresh child tables are walked dead and only
    /// wired into their parent once fully built, so a failure part way
    /// frees exactly the new subtree; a failure below a pre-existing table
    /// entry must not tear down the already committed state it descended
    /// into.
    fn update_region_mapping(
        &mut self,
        mut region_start: u64,
        region_end: u64,
        set_mask: u64,
        clear_mask: u64,
        base: PhysicalAddress,
        level: u64,
        table_is_live: bool,
    ) -> PtResult<()> {
        let config = self.config;
        let last_level = config.last_level();
        let block_mask = config.block_mask(level);
        let table = PageTableStore::new(base, config.entries(level));

        while region_start < region_end {
            let block_end = region_end.min((region_start | block_mask) + 1);
            let index = config.index(region_start, level);
            let entry = table.read_entry(index);
            let kind = entry.kind(level, last_level);

            let block_aligned = region_start & block_mask == 0 && block_end & block_mask == 0;

            if level != last_level
                && (!config.supports_block_entry(level) || !block_aligned || kind == EntryKind::Table)
            {
                let (child, child_is_live) = match kind {
                    EntryKind::Table => (entry.table_base(), table_is_live),
                    _ => (self.populate_child_table(entry, region_start, level)?, false),
                };

                let result = self.update_region_mapping(
                    region_start,
                    block_end,
                    set_mask,
                    clear_mask,
                    child,
                    level + 1,
                    child_is_live,
                );

                if kind == EntryKind::Table {
                    result?;
                } else {
                    match result {
                        // wire the finished child into this table
                        Ok(()) => Self::replace_entry(
                            &table,
                            index,
                            PageTableEntry::new_table(child),
                            region_start,
                            table_is_live,
                        ),
                        Err(error) => {
                            // nothing can reach the new subtree, reclaim it whole
                            self.free_subtree(child, level + 1);
                            return Err(error);
                        }
                    }
                }
            } else {
                // Unconditional leaf rewrite. The frame is always recomputed
                // from the region cursor, which repurposes stale entries.
                let old_attributes = match kind {
                    EntryKind::Leaf => entry.canonical_attributes(level, last_level),
                    _ => 0,
                };
                let attributes = (old_attributes & !clear_mask) | set_mask;
                let leaf = PageTableEntry::new_leaf(attributes, region_start, level, last_level);
                Self::replace_entry(&table, index, leaf, region_start, table_is_live);
            }

            region_start = block_end;
        }

        Ok(())
    }

    /// Allocates a zeroed child table for a slot one level below `level`.
    /// If the slot held a block leaf, the child is first populated with the
    /// block's attributes over its whole span, so that splitting preserves
    /// what the block mapped.
    fn populate_child_table(&mut self, entry: PageTableEntry, region_start: u64, level: u64) -> PtResult<PhysicalAddress> {
        let config = self.config;
        let child = PhysicalAddress::new(self.page_allocator.allocate_pages(1)?);
        assert!(child.is_4kb_aligned(), "page allocator returned an unaligned page");
        PageTableStore::new(child, config.entries(level + 1)).zero();

        if entry.kind(level, config.last_level()) == EntryKind::Leaf {
            let attributes = entry.canonical_attributes(level, config.last_level());
            let block_mask = config.block_mask(level);
            let block_base = region_start & !block_mask;
            if let Err(error) = self.update_region_mapping(
                block_base,
                block_base + block_mask + 1,
                attributes,
                PAGE_ATTRIBUTES_MASK,
                child,
                level + 1,
                false,
            ) {
                self.free_subtree(child, level + 1);
                return Err(error);
            }
        }

        Ok(child)
    }

    /// Frees the subtree rooted at `base`. Only called for subtrees no
    /// walker can reach: rollback of a fresh subtree, or release of a
    /// hierarchy that was never installed or is no longer installed.
    fn free_subtree(&mut self, base: PhysicalAddress, level: u64) {
        let config = self.config;
        if level != config.last_level() {
            let table = PageTableStore::new(base, config.entries(level));
            for index in 0..table.entry_count() {
                let entry = table.read_entry(index);
                if entry.kind(level, config.last_level()) == EntryKind::Table {
                    self.free_subtree(entry.table_base(), level + 1);
                }
            }
        }
        self.page_allocator.free_pages(base.raw(), 1);
    }

    fn query_region_internal(
        &self,
        mut region_start: u64,
        region_end: u64,
        base: PhysicalAddress,
        level: u64,
        state: &mut RangeMappingState,
    ) -> PtResult<()> {
        let config = self.config;
        let last_level = config.last_level();
        let block_mask = config.block_mask(level);
        let table = PageTableStore::new(base, config.entries(level));

        while region_start < region_end {
            let block_end = region_end.min((region_start | block_mask) + 1);
            let entry = table.read_entry(config.index(region_start, level));

            match entry.kind(level, last_level) {
                EntryKind::Invalid => match state {
                    RangeMappingState::Uninitialized => *state = RangeMappingState::Unmapped,
                    // a hole after mapped entries: the region is not uniform
                    RangeMappingState::Mapped(_) => return Err(PtError::IncompatibleMemoryAttributes),
                    RangeMappingState::Unmapped => {}
                },
                EntryKind::Leaf => {
                    let attributes = pte_to_attributes(entry.canonical_attributes(level, last_level));
                    match state {
                        RangeMappingState::Uninitialized => *state = RangeMappingState::Mapped(attributes),
                        RangeMappingState::Unmapped => return Err(PtError::IncompatibleMemoryAttributes),
                        RangeMappingState::Mapped(previous) => {
                            if *previous != attributes {
                                return Err(PtError::IncompatibleMemoryAttributes);
                            }
                        }
                    }
                }
                EntryKind::Table => {
                    self.query_region_internal(region_start, block_end, entry.table_base(), level + 1, state)?;
                }
            }

            region_start = block_end;
        }

        Ok(())
    }

    fn dump_page_tables_internal(&self, mut region_start: u64, region_end: u64, base: PhysicalAddress, level: u64) {
        let config = self.config;
        let block_mask = config.block_mask(level);
        let table = PageTableStore::new(base, config.entries(level));

        while region_start < region_end {
            let block_end = region_end.min((region_start | block_mask) + 1);
            let entry = table.read_entry(config.index(region_start, level));

            match entry.kind(level, config.last_level()) {
                EntryKind::Invalid => {}
                EntryKind::Leaf => {
                    log::info!(
                        "{:indent$}L{} [{:#014x}..{:#014x}) leaf  {:#018x}",
                        "",
                        level,
                        region_start,
                        block_end,
                        entry.raw(),
                        indent = (level * 2) as usize
                    );
                }
                EntryKind::Table => {
                    log::info!(
                        "{:indent$}L{} [{:#014x}..{:#014x}) table {}",
                        "",
                        level,
                        region_start,
                        block_end,
                        entry.table_base(),
                        indent = (level * 2) as usize
                    );
                    self.dump_page_tables_internal(region_start, block_end, entry.table_base(), level + 1);
                }
            }

            region_start = block_end;
        }
    }

    fn validate_address_range(&self, address: u64, size: u64) -> PtResult<()> {
        if !VirtualAddress::new(address).is_4kb_aligned() {
            return Err(PtError::UnalignedAddress);
        }
        if !VirtualAddress::new(size).is_4kb_aligned() {
            return Err(PtError::UnalignedMemoryRange);
        }

        let span = 1u64 << self.config.va_bits();
        if address >= span || size > span - address {
            return Err(PtError::InvalidMemoryRange);
        }

        Ok(())
    }

    /// Common front of the mutating operations: a zero length region is a
    /// successful no-op, everything else is validated before any mutation.
    fn update_region(&mut self, address: u64, size: u64, set_mask: u64, clear_mask: u64) -> PtResult<()> {
        if size == 0 {
            return Ok(());
        }
        self.validate_address_range(address, size)?;

        let live = self.is_live();
        self.update_region_mapping(address, address + size, set_mask, clear_mask, self.base, 0, live)
    }
}

impl<A: PageAllocator> PageTable for LoongArch64PageTable<A> {
    fn map_memory_region(&mut self, address: u64, size: u64, attributes: MemoryAttributes) -> PtResult<()> {
        self.update_region(address, size, attributes_to_pte(attributes), PAGE_ATTRIBUTES_MASK)
    }

    fn update_memory_region(
        &mut self,
        address: u64,
        size: u64,
        attributes: MemoryAttributes,
        attributes_mask: MemoryAttributes,
    ) -> PtResult<()> {
        let clear_mask = attributes_mask_to_pte(attributes_mask);
        let set_mask = attributes_to_pte(attributes) & clear_mask;
        self.update_region(address, size, set_mask, clear_mask)
    }

    fn query_memory_region(&self, address: u64, size: u64) -> PtResult<MemoryAttributes> {
        if size == 0 {
            return Err(PtError::InvalidMemoryRange);
        }
        self.validate_address_range(address, size)?;

        let mut state = RangeMappingState::Uninitialized;
        self.query_region_internal(address, address + size, self.base, 0, &mut state)?;
        match state {
            RangeMappingState::Mapped(attributes) => Ok(attributes),
            _ => Err(PtError::NoMapping),
        }
    }

    fn install_page_table(&mut self) -> PtResult<()> {
        reg::write_page_size(PAGE_SHIFT);
        reg::write_page_walk_config(self.config.pwcl(), self.config.pwch());
        reg::set_root_base(self.base.raw());

        if !reg::is_mmu_enabled() {
            // no stale translation may survive the first enable
            reg::invalidate_tlb_all();
            reg::enable_mmu();
            log::info!("translation enabled, root {}", self.base);
        }

        Ok(())
    }

    fn dump_page_tables(&self, address: u64, size: u64) {
        log::info!("page tables at {} covering [{:#014x}..{:#014x})", self.base, address, address + size);
        self.dump_page_tables_internal(address, address + size, self.base, 0);
    }
}
