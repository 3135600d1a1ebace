//! Per-process page tables.
//!
//! A [`PageTable`] couples the block partition of an address space with its translation
//! directory. Every mutating operation takes the table lock, checks the state of every block it
//! is about to touch and only then commits, so a failed operation leaves the table untouched.
//!
//! Operations spanning two processes lock both tables through [`PageTable::lock_pair`], which
//! always acquires the lower [`AddressSpaceId`] first.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::{
    AddressSpaceLayout, BlockInfoManager, Error, FrameProvider, KernelPermission,
    MemoryAttribute, MemoryBlock, MemoryBlockManager, MemoryInfo, MemoryPermission, MemoryState,
    MemoryStateFlags, PAGE_SIZE, PageDirectory, PageGroup, PhysicalAddress, Result,
    VirtualAddress,
};

/// Identifies an address space. Cross-table locks are taken in ascending id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Instruction cache maintenance hooks.
pub trait InstructionCache: Send + Sync {
    /// Invalidates cached instructions for `[address, address + size)`.
    fn invalidate_range(&self, address: VirtualAddress, size: u64);

    /// Invalidates every cached instruction.
    fn invalidate_all(&self);
}

/// An instruction cache that ignores every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstructionCache;

impl InstructionCache for NoopInstructionCache {
    fn invalidate_range(&self, _address: VirtualAddress, _size: u64) {}

    fn invalidate_all(&self) {}
}

/// How the instruction cache is invalidated after code is unmapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ICacheInvalidationStrategy {
    /// Invalidate only the unmapped range.
    InvalidateRange,
    /// Invalidate the whole cache.
    #[default]
    InvalidateAll,
}

/// Which states a [`MemoryCheck`] accepts.
#[derive(Debug, Clone, Copy)]
pub enum StateMatch {
    Exactly(MemoryState),
    HasFlags(MemoryStateFlags),
    Predicate(fn(MemoryState) -> bool),
}

impl StateMatch {
    fn matches(self, state: MemoryState) -> bool {
        match self {
            Self::Exactly(expected) => state == expected,
            Self::HasFlags(flags) => state.has(flags),
            Self::Predicate(predicate) => predicate(state),
        }
    }
}

/// A requirement every block of a range must meet before an operation may touch it.
///
/// Permission and attribute are compared under a mask: `(block & mask) == value`. Unless
/// overridden, the attribute must be empty.
#[derive(Debug, Clone, Copy)]
pub struct MemoryCheck {
    state: StateMatch,
    permission_mask: KernelPermission,
    permission: KernelPermission,
    attribute_mask: MemoryAttribute,
    attribute: MemoryAttribute,
}

impl MemoryCheck {
    pub const fn new(state: StateMatch) -> Self {
        Self {
            state,
            permission_mask: KernelPermission::empty(),
            permission: KernelPermission::empty(),
            attribute_mask: MemoryAttribute::all(),
            attribute: MemoryAttribute::empty(),
        }
    }

    pub const fn state(state: MemoryState) -> Self {
        Self::new(StateMatch::Exactly(state))
    }

    pub const fn flags(flags: MemoryStateFlags) -> Self {
        Self::new(StateMatch::HasFlags(flags))
    }

    pub const fn with_permission(mut self, mask: KernelPermission, value: KernelPermission) -> Self {
        self.permission_mask = mask;
        self.permission = value;
        self
    }

    pub const fn with_attribute(mut self, mask: MemoryAttribute, value: MemoryAttribute) -> Self {
        self.attribute_mask = mask;
        self.attribute = value;
        self
    }

    /// Returns true if `block` meets the requirement.
    pub fn matches(&self, block: &MemoryBlock) -> bool {
        self.state.matches(block.state())
            && block.permission() & self.permission_mask == self.permission
            && block.attribute() & self.attribute_mask == self.attribute
    }
}

/// Mutable state of a page table, guarded by its lock.
#[derive(Debug)]
struct PageTableState {
    blocks: MemoryBlockManager,
    directory: PageDirectory,
}

/// The address space of one guest process.
///
/// # Thread Safety
///
/// Block bookkeeping and translations live behind one `spin::Mutex`. The layout is fixed at
/// construction and can be queried without locking.
pub struct PageTable {
    id: AddressSpaceId,
    layout: AddressSpaceLayout,
    state: spin::Mutex<PageTableState>,
    block_infos: Arc<BlockInfoManager>,
    frames: Arc<dyn FrameProvider>,
    icache: Arc<dyn InstructionCache>,
}

impl PageTable {
    /// Creates an address space with a single free block spanning the whole layout.
    pub fn new(
        id: AddressSpaceId,
        layout: AddressSpaceLayout,
        block_infos: Arc<BlockInfoManager>,
        frames: Arc<dyn FrameProvider>,
        icache: Arc<dyn InstructionCache>,
    ) -> Self {
        Self {
            id,
            layout,
            state: spin::Mutex::new(PageTableState {
                blocks: MemoryBlockManager::new(layout.address_space),
                directory: PageDirectory::new(),
            }),
            block_infos,
            frames,
            icache,
        }
    }

    pub const fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub const fn layout(&self) -> &AddressSpaceLayout {
        &self.layout
    }

    pub fn contains(&self, address: VirtualAddress, size: u64) -> bool {
        self.layout.contains(address, size)
    }

    pub fn can_contain(&self, address: VirtualAddress, size: u64, state: MemoryState) -> bool {
        self.layout.can_contain(address, size, state)
    }

    pub fn is_inside_address_space(&self, address: VirtualAddress, size: u64) -> bool {
        self.layout.is_inside_address_space(address, size)
    }

    pub fn is_inside_aslr_region(&self, address: VirtualAddress, size: u64) -> bool {
        self.layout.is_inside_aslr_region(address, size)
    }

    /// Locks the table.
    pub fn lock(&self) -> LockedPageTable<'_> {
        LockedPageTable {
            table: self,
            state: self.state.lock(),
        }
    }

    /// Locks a destination and a source table in ascending id order.
    ///
    /// When both arguments are the same table only one lock is taken and
    /// [`LockedPair::src`] hands out the destination guard.
    pub fn lock_pair<'a>(dst: &'a PageTable, src: &'a PageTable) -> LockedPair<'a> {
        if core::ptr::eq(dst, src) {
            return LockedPair {
                dst: dst.lock(),
                src: None,
            };
        }

        if dst.id <= src.id {
            let dst = dst.lock();
            let src = src.lock();
            LockedPair {
                dst,
                src: Some(src),
            }
        } else {
            let src = src.lock();
            let dst = dst.lock();
            LockedPair {
                dst,
                src: Some(src),
            }
        }
    }

    /// Runs `f` against the block partition.
    pub fn with_blocks<R>(&self, f: impl FnOnce(&MemoryBlockManager) -> R) -> R {
        f(&self.state.lock().blocks)
    }

    /// Returns the physical address backing `address`, if it is mapped.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        let entry = self.state.lock().directory.translate(address)?;
        Some(entry.address() + (address.as_u64() & (PAGE_SIZE - 1)))
    }

    /// Describes the block containing `address`, or `None` outside the address space.
    pub fn query_memory(&self, address: VirtualAddress) -> Option<MemoryInfo> {
        self.state.lock().blocks.find(address).map(MemoryBlock::info)
    }

    /// Allocates fresh frames and maps them at `address` in `state`.
    ///
    /// The range must be able to hold `state` and must currently be free.
    ///
    /// # Panics
    ///
    /// Panics if `state` is not a mapped state.
    pub fn map_pages(
        &self,
        address: VirtualAddress,
        num_pages: u64,
        state: MemoryState,
        permission: MemoryPermission,
    ) -> Result<()> {
        assert!(
            state.has(MemoryStateFlags::MAPPED),
            "map_pages requires a mapped state, got {state}"
        );
        let size = range_size(address, num_pages)?;
        if !self.layout.can_contain(address, size, state) {
            return Err(Error::InvalidMemoryRegion);
        }

        let mut table = self.lock();
        table.check_range(address, size, MemoryCheck::state(MemoryState::Free))?;

        let physical = self.frames.allocate(num_pages)?;
        let permission = permission.to_kernel();
        table.state.directory.map(address, physical, num_pages, permission);
        table
            .state
            .blocks
            .update(address, num_pages, state, permission, MemoryAttribute::empty());

        table.log_commit("map_pages", address, num_pages);
        Ok(())
    }

    /// Unmaps pages created by [`map_pages`](Self::map_pages), dropping their frame references.
    ///
    /// Every block in the range must be in `state` with no attribute set.
    pub fn unmap_pages(&self, address: VirtualAddress, num_pages: u64, state: MemoryState) -> Result<()> {
        let size = range_size(address, num_pages)?;
        if !self.layout.contains(address, size) {
            return Err(Error::InvalidCurrentMemory);
        }

        let mut table = self.lock();
        table.check_range(address, size, MemoryCheck::state(state))?;
        table.unmap_range(address, num_pages);

        table.log_commit("unmap_pages", address, num_pages);
        Ok(())
    }

    /// Changes the permission of `[address, address + num_pages)`.
    ///
    /// Every block in the range must be in a state whose permission the process may change and
    /// must have no attribute set. Code becomes writable data once it is made writable; the
    /// instruction cache is invalidated over the range when the new permission is executable.
    pub fn set_process_memory_permission(
        &self,
        address: VirtualAddress,
        num_pages: u64,
        permission: MemoryPermission,
    ) -> Result<()> {
        let size = range_size(address, num_pages)?;
        if !self.layout.contains(address, size) {
            return Err(Error::InvalidCurrentMemory);
        }

        let new_permission = permission.to_kernel();
        let mut table = self.lock();
        table.check_range(
            address,
            size,
            MemoryCheck::new(StateMatch::Predicate(MemoryState::can_set_process_permission)),
        )?;

        table.state.blocks.update_with(address, num_pages, |block| {
            block.state = block.state.after_reprotect(new_permission);
            block.permission = new_permission;
        });
        table.state.directory.protect(address, num_pages, new_permission);

        if new_permission.is_user_executable() {
            self.icache.invalidate_range(address, size);
        }

        table.log_commit("set_process_memory_permission", address, num_pages);
        Ok(())
    }

    /// Aliases the ordinary memory at `src_address` as code at `dst_address`.
    ///
    /// The source is locked and hidden from the process until the alias is removed by
    /// [`unmap_code_memory`](Self::unmap_code_memory).
    pub fn map_code_memory(
        &self,
        dst_address: VirtualAddress,
        src_address: VirtualAddress,
        size: u64,
    ) -> Result<()> {
        let num_pages = size / PAGE_SIZE;
        if !self.layout.contains(src_address, size) {
            return Err(Error::InvalidCurrentMemory);
        }
        if !self.layout.can_contain(dst_address, size, MemoryState::AliasCode) {
            return Err(Error::InvalidMemoryRegion);
        }

        let mut table = self.lock();
        table.check_range(
            src_address,
            size,
            MemoryCheck::state(MemoryState::Normal).with_permission(
                KernelPermission::all(),
                KernelPermission::USER_READ_WRITE,
            ),
        )?;
        table.check_range(dst_address, size, MemoryCheck::state(MemoryState::Free))?;
        let group = table.make_page_group(src_address, num_pages)?;

        let hidden = KernelPermission::KERNEL_READ | KernelPermission::NOT_MAPPED;
        table.state.blocks.lock(src_address, num_pages, hidden);
        table.state.directory.protect(src_address, num_pages, hidden);
        table.map_group(dst_address, &group, MemoryState::AliasCode, hidden);

        table.log_commit("map_code_memory", dst_address, num_pages);
        Ok(())
    }

    /// Removes a code alias created by [`map_code_memory`](Self::map_code_memory) and hands the
    /// source back to the process.
    pub fn unmap_code_memory(
        &self,
        dst_address: VirtualAddress,
        src_address: VirtualAddress,
        size: u64,
        strategy: ICacheInvalidationStrategy,
    ) -> Result<()> {
        let num_pages = size / PAGE_SIZE;
        if !self.layout.contains(src_address, size) {
            return Err(Error::InvalidCurrentMemory);
        }
        if !self.layout.can_contain(dst_address, size, MemoryState::AliasCode) {
            return Err(Error::InvalidMemoryRegion);
        }

        let mut table = self.lock();
        table.check_range(
            src_address,
            size,
            MemoryCheck::state(MemoryState::Normal)
                .with_attribute(MemoryAttribute::all(), MemoryAttribute::LOCKED),
        )?;
        table.check_range(
            dst_address,
            size,
            MemoryCheck::flags(MemoryStateFlags::CAN_CODE_ALIAS),
        )?;

        let group = table.make_page_group(src_address, num_pages)?;
        if !table.is_valid_page_group(&group, dst_address, num_pages) {
            return Err(Error::InvalidCurrentMemory);
        }

        let any_code = table
            .state
            .blocks
            .overlapping(dst_address, size)
            .any(|block| block.state().has(MemoryStateFlags::CODE));

        table.unmap_range(dst_address, num_pages);
        table
            .state
            .blocks
            .unlock(src_address, num_pages, KernelPermission::USER_READ_WRITE);
        table
            .state
            .directory
            .protect(src_address, num_pages, KernelPermission::USER_READ_WRITE);

        if any_code {
            match strategy {
                ICacheInvalidationStrategy::InvalidateRange => {
                    self.icache.invalidate_range(dst_address, size)
                }
                ICacheInvalidationStrategy::InvalidateAll => self.icache.invalidate_all(),
            }
        }

        table.log_commit("unmap_code_memory", dst_address, num_pages);
        Ok(())
    }

    /// Returns true if the block partition is an exact, merged partition of the address space.
    pub fn is_consistent(&self) -> bool {
        self.state.lock().blocks.is_consistent()
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Returns the size of `num_pages` pages at `address`, rejecting ranges that wrap.
fn range_size(address: VirtualAddress, num_pages: u64) -> Result<u64> {
    let size = num_pages
        .checked_mul(PAGE_SIZE)
        .ok_or(Error::InvalidCurrentMemory)?;
    address
        .checked_add(size)
        .ok_or(Error::InvalidCurrentMemory)?;
    Ok(size)
}

/// A locked [`PageTable`].
pub struct LockedPageTable<'a> {
    table: &'a PageTable,
    state: spin::MutexGuard<'a, PageTableState>,
}

impl LockedPageTable<'_> {
    pub fn id(&self) -> AddressSpaceId {
        self.table.id
    }

    /// Fails with `InvalidCurrentMemory` unless every block overlapping the range meets
    /// `check`.
    pub fn check_range(&self, address: VirtualAddress, size: u64, check: MemoryCheck) -> Result<()> {
        let mut blocks = self.state.blocks.overlapping(address, size).peekable();
        if blocks.peek().is_none() {
            return Err(Error::InvalidCurrentMemory);
        }
        for block in blocks {
            if !check.matches(block) {
                log::debug!(
                    "{}: block at {} ({:?}, {:?}, {:?}) fails {:?}",
                    self.table.id,
                    block.start(),
                    block.state(),
                    block.permission(),
                    block.attribute(),
                    check
                );
                return Err(Error::InvalidCurrentMemory);
            }
        }
        Ok(())
    }

    /// Builds a page group describing the frames currently backing the range.
    pub fn make_page_group(&self, address: VirtualAddress, num_pages: u64) -> Result<PageGroup> {
        let runs = self
            .state
            .directory
            .physical_runs(address, num_pages)
            .ok_or(Error::InvalidCurrentMemory)?;

        let mut group = PageGroup::new(self.table.block_infos.clone(), self.table.frames.clone());
        for run in runs {
            group.add_block(run.address(), run.num_pages())?;
        }
        Ok(group)
    }

    /// Checks the range against `check`, then builds and opens a page group over it.
    ///
    /// The returned group holds a reference on every frame until it is dropped.
    pub fn make_and_open_page_group(
        &self,
        address: VirtualAddress,
        num_pages: u64,
        check: MemoryCheck,
    ) -> Result<PageGroup> {
        let size = range_size(address, num_pages)?;
        self.check_range(address, size, check)?;

        let mut group = self.make_page_group(address, num_pages)?;
        group.open();
        Ok(group)
    }

    /// Returns true if the range is backed by exactly the frames of `group`, in order.
    pub fn is_valid_page_group(&self, group: &PageGroup, address: VirtualAddress, num_pages: u64) -> bool {
        if group.num_pages() != num_pages {
            return false;
        }
        match self.state.directory.physical_runs(address, num_pages) {
            Some(runs) => runs.into_iter().eq(group.iter()),
            None => false,
        }
    }

    /// Maps the frames of `group` at `address` in `state`.
    ///
    /// The range must be able to hold `state` and must currently be free. The mapping takes its
    /// own reference on every frame.
    pub fn map_page_group(
        &mut self,
        address: VirtualAddress,
        group: &PageGroup,
        state: MemoryState,
        permission: KernelPermission,
    ) -> Result<()> {
        let num_pages = group.num_pages();
        let size = range_size(address, num_pages)?;
        if !self.table.layout.can_contain(address, size, state) {
            return Err(Error::InvalidCurrentMemory);
        }
        self.check_range(address, size, MemoryCheck::state(MemoryState::Free))?;

        self.map_group(address, group, state, permission);
        self.log_commit("map_page_group", address, num_pages);
        Ok(())
    }

    /// Maps `group` at `address` without checking, opening one reference per frame.
    fn map_group(
        &mut self,
        address: VirtualAddress,
        group: &PageGroup,
        state: MemoryState,
        permission: KernelPermission,
    ) {
        let mut cursor = address;
        for run in group.iter() {
            self.table.frames.open(run.address(), run.num_pages());
            self.state
                .directory
                .map(cursor, run.address(), run.num_pages(), permission);
            cursor = cursor + run.size();
        }
        self.state.blocks.update(
            address,
            group.num_pages(),
            state,
            permission,
            MemoryAttribute::empty(),
        );
    }

    /// Unmaps the range without checking, closing one reference per frame and freeing the
    /// blocks.
    fn unmap_range(&mut self, address: VirtualAddress, num_pages: u64) {
        let runs: Vec<_> = self
            .state
            .directory
            .physical_runs(address, num_pages)
            .unwrap_or_default();
        self.state.directory.unmap(address, num_pages);
        for run in runs {
            self.table.frames.close(run.address(), run.num_pages());
        }
        self.state.blocks.update(
            address,
            num_pages,
            MemoryState::Free,
            KernelPermission::empty(),
            MemoryAttribute::empty(),
        );
    }

    fn log_commit(&self, operation: &str, address: VirtualAddress, num_pages: u64) {
        log::debug!(
            "{}: {} at {} ({} pages), {} blocks",
            self.table.id,
            operation,
            address,
            num_pages,
            self.state.blocks.len()
        );
        #[cfg(feature = "detailed-logging")]
        self.state.blocks.dump();
    }
}

/// Two page tables locked for a cross-process operation.
pub struct LockedPair<'a> {
    dst: LockedPageTable<'a>,
    src: Option<LockedPageTable<'a>>,
}

impl<'a> LockedPair<'a> {
    pub fn dst(&self) -> &LockedPageTable<'a> {
        &self.dst
    }

    pub fn dst_mut(&mut self) -> &mut LockedPageTable<'a> {
        &mut self.dst
    }

    pub fn src(&self) -> &LockedPageTable<'a> {
        self.src.as_ref().unwrap_or(&self.dst)
    }

    /// Removes a mapping of the source range created through
    /// [`LockedPageTable::map_page_group`] from the destination.
    ///
    /// The destination must still be shared memory mapped read-write, the source must still be
    /// mappable, and the destination must be backed by exactly the frames currently backing
    /// the source.
    pub fn unmap_process_memory(
        &mut self,
        dst_address: VirtualAddress,
        size: u64,
        src_address: VirtualAddress,
    ) -> Result<()> {
        let num_pages = size / PAGE_SIZE;

        self.dst().check_range(
            dst_address,
            size,
            MemoryCheck::state(MemoryState::SharedCode).with_permission(
                KernelPermission::USER_READ_WRITE,
                KernelPermission::USER_READ_WRITE,
            ),
        )?;
        self.src().check_range(
            src_address,
            size,
            MemoryCheck::flags(MemoryStateFlags::CAN_MAP_PROCESS),
        )?;

        let group = self.src().make_page_group(src_address, num_pages)?;
        if !self.dst().is_valid_page_group(&group, dst_address, num_pages) {
            return Err(Error::InvalidCurrentMemory);
        }

        self.dst.unmap_range(dst_address, num_pages);
        self.dst
            .log_commit("unmap_process_memory", dst_address, num_pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FramePool, layout::Region};
    use core::sync::atomic::{AtomicUsize, Ordering};

    const HEAP: u64 = 0x10_0000_0000;
    const CODE: u64 = 0x0800_0000;
    const ALIAS: u64 = 0x1_0000_0000;

    #[derive(Default)]
    struct RecordingCache {
        ranges: AtomicUsize,
        all: AtomicUsize,
    }

    impl InstructionCache for RecordingCache {
        fn invalidate_range(&self, _address: VirtualAddress, _size: u64) {
            self.ranges.fetch_add(1, Ordering::Relaxed);
        }

        fn invalidate_all(&self) {
            self.all.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Fixture {
        frames: Arc<FramePool>,
        infos: Arc<BlockInfoManager>,
        icache: Arc<RecordingCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                frames: Arc::new(FramePool::new(PhysicalAddress::new(0x8000_0000), 256)),
                infos: Arc::new(BlockInfoManager::new(64)),
                icache: Arc::new(RecordingCache::default()),
            }
        }

        fn table(&self, id: u64) -> PageTable {
            PageTable::new(
                AddressSpaceId::new(id),
                AddressSpaceLayout::default(),
                self.infos.clone(),
                self.frames.clone(),
                self.icache.clone(),
            )
        }
    }

    fn va(address: u64) -> VirtualAddress {
        VirtualAddress::new(address)
    }

    #[test]
    fn new_table_is_one_free_block() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        assert!(table.is_consistent());
        assert_eq!(table.with_blocks(|blocks| blocks.len()), 1);
        let info = table.query_memory(va(HEAP)).unwrap();
        assert_eq!(info.state, MemoryState::Free);
        assert!(table.query_memory(va(0)).is_none());
    }

    #[test]
    fn map_and_unmap_pages() {
        let fixture = Fixture::new();
        let table = fixture.table(1);

        table
            .map_pages(va(HEAP), 4, MemoryState::Normal, MemoryPermission::ReadWrite)
            .unwrap();
        let info = table.query_memory(va(HEAP + PAGE_SIZE)).unwrap();
        assert_eq!(info.base_address, va(HEAP));
        assert_eq!(info.size, 4 * PAGE_SIZE);
        assert_eq!(info.permission, MemoryPermission::ReadWrite);
        assert_eq!(fixture.frames.free_pages(), 252);

        assert_eq!(
            table.map_pages(va(HEAP + PAGE_SIZE), 1, MemoryState::Normal, MemoryPermission::Read),
            Err(Error::InvalidCurrentMemory)
        );

        table.unmap_pages(va(HEAP), 4, MemoryState::Normal).unwrap();
        assert_eq!(fixture.frames.free_pages(), 256);
        assert_eq!(table.with_blocks(|blocks| blocks.len()), 1);
    }

    #[test]
    fn map_pages_respects_layout() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        assert_eq!(
            table.map_pages(va(ALIAS), 1, MemoryState::Normal, MemoryPermission::ReadWrite),
            Err(Error::InvalidMemoryRegion)
        );
    }

    #[test]
    fn permission_change_splits_and_merges() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        table
            .map_pages(va(HEAP), 8, MemoryState::Normal, MemoryPermission::ReadWrite)
            .unwrap();

        table
            .set_process_memory_permission(va(HEAP + 2 * PAGE_SIZE), 2, MemoryPermission::Read)
            .unwrap();
        assert_eq!(table.with_blocks(|blocks| blocks.len()), 5);
        assert!(table.is_consistent());

        table
            .set_process_memory_permission(va(HEAP + 2 * PAGE_SIZE), 2, MemoryPermission::ReadWrite)
            .unwrap();
        assert_eq!(table.with_blocks(|blocks| blocks.len()), 3);
    }

    #[test]
    fn writable_code_becomes_data_and_executable_invalidates() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        table
            .map_pages(va(CODE), 2, MemoryState::Code, MemoryPermission::ReadExecute)
            .unwrap();

        table
            .set_process_memory_permission(va(CODE), 2, MemoryPermission::ReadWrite)
            .unwrap();
        assert_eq!(table.query_memory(va(CODE)).unwrap().state, MemoryState::CodeData);
        assert_eq!(fixture.icache.ranges.load(Ordering::Relaxed), 0);

        table
            .set_process_memory_permission(va(CODE), 2, MemoryPermission::ReadExecute)
            .unwrap();
        assert_eq!(table.query_memory(va(CODE)).unwrap().state, MemoryState::CodeData);
        assert_eq!(fixture.icache.ranges.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn permission_change_rejects_ineligible_state_without_mutation() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        table
            .map_pages(va(HEAP), 2, MemoryState::Normal, MemoryPermission::ReadWrite)
            .unwrap();
        table
            .map_pages(va(HEAP + 2 * PAGE_SIZE), 2, MemoryState::Heap, MemoryPermission::ReadWrite)
            .unwrap();

        assert_eq!(
            table.set_process_memory_permission(va(HEAP), 4, MemoryPermission::Read),
            Err(Error::InvalidCurrentMemory)
        );
        assert_eq!(
            table.query_memory(va(HEAP)).unwrap().permission,
            MemoryPermission::ReadWrite
        );
        assert_eq!(
            table.set_process_memory_permission(va(ALIAS), 1, MemoryPermission::Read),
            Err(Error::InvalidCurrentMemory)
        );
    }

    #[test]
    fn code_memory_round_trip() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        table
            .map_pages(va(HEAP), 2, MemoryState::Normal, MemoryPermission::ReadWrite)
            .unwrap();
        let backing = table.translate(va(HEAP)).unwrap();

        table.map_code_memory(va(ALIAS), va(HEAP), 2 * PAGE_SIZE).unwrap();
        let src = table.query_memory(va(HEAP)).unwrap();
        assert_eq!(src.attribute, MemoryAttribute::LOCKED);
        assert_eq!(src.lock_count, 1);
        assert_eq!(src.permission, MemoryPermission::None);
        let dst = table.query_memory(va(ALIAS)).unwrap();
        assert_eq!(dst.state, MemoryState::AliasCode);
        assert_eq!(table.translate(va(ALIAS)), Some(backing));
        assert_eq!(fixture.frames.reference_count(backing), 2);
        assert_eq!(fixture.infos.in_use(), 0);

        table
            .unmap_code_memory(
                va(ALIAS),
                va(HEAP),
                2 * PAGE_SIZE,
                ICacheInvalidationStrategy::InvalidateAll,
            )
            .unwrap();
        let src = table.query_memory(va(HEAP)).unwrap();
        assert_eq!(src.attribute, MemoryAttribute::empty());
        assert_eq!(src.lock_count, 0);
        assert_eq!(src.permission, MemoryPermission::ReadWrite);
        assert_eq!(table.query_memory(va(ALIAS)).unwrap().state, MemoryState::Free);
        assert_eq!(fixture.frames.reference_count(backing), 1);
        assert_eq!(fixture.icache.all.load(Ordering::Relaxed), 1);
        assert!(table.is_consistent());
    }

    #[test]
    fn code_memory_rejects_bad_source_and_destination() {
        let fixture = Fixture::new();
        let table = fixture.table(1);
        table
            .map_pages(va(HEAP), 2, MemoryState::Normal, MemoryPermission::Read)
            .unwrap();

        assert_eq!(
            table.map_code_memory(va(ALIAS), va(HEAP), 2 * PAGE_SIZE),
            Err(Error::InvalidCurrentMemory)
        );
        assert_eq!(
            table.map_code_memory(va(HEAP + 0x1_0000), va(HEAP), 2 * PAGE_SIZE),
            Err(Error::InvalidMemoryRegion)
        );
        assert_eq!(
            table.unmap_code_memory(
                va(ALIAS),
                va(HEAP),
                2 * PAGE_SIZE,
                ICacheInvalidationStrategy::InvalidateRange
            ),
            Err(Error::InvalidCurrentMemory)
        );
    }

    #[test]
    fn page_group_maps_across_tables() {
        let fixture = Fixture::new();
        let src = fixture.table(1);
        let dst = fixture.table(2);
        src.map_pages(va(HEAP), 3, MemoryState::Normal, MemoryPermission::ReadWrite)
            .unwrap();
        let backing = src.translate(va(HEAP)).unwrap();

        {
            let mut pair = PageTable::lock_pair(&dst, &src);
            let group = pair
                .src()
                .make_and_open_page_group(
                    va(HEAP),
                    3,
                    MemoryCheck::flags(MemoryStateFlags::CAN_MAP_PROCESS),
                )
                .unwrap();
            assert_eq!(fixture.frames.reference_count(backing), 2);
            pair.dst_mut()
                .map_page_group(
                    va(ALIAS),
                    &group,
                    MemoryState::SharedCode,
                    KernelPermission::USER_READ_WRITE,
                )
                .unwrap();
            assert_eq!(fixture.frames.reference_count(backing), 3);
        }
        assert_eq!(fixture.frames.reference_count(backing), 2);
        assert_eq!(dst.translate(va(ALIAS)), Some(backing));

        PageTable::lock_pair(&dst, &src)
            .unmap_process_memory(va(ALIAS), 3 * PAGE_SIZE, va(HEAP))
            .unwrap();
        assert_eq!(fixture.frames.reference_count(backing), 1);
        assert_eq!(dst.with_blocks(|blocks| blocks.len()), 1);
        assert_eq!(fixture.infos.in_use(), 0);
    }

    #[test]
    fn same_table_pair_takes_one_lock() {
        let fixture = Fixture::new();
        let table = fixture.table(7);
        let pair = PageTable::lock_pair(&table, &table);
        assert_eq!(pair.src().id(), pair.dst().id());
    }

    #[test]
    fn custom_layout_bounds_partition() {
        let fixture = Fixture::new();
        let region = Region::new(0x10_0000, 0x10_0000);
        let layout = AddressSpaceLayout {
            address_space: region,
            code: region,
            alias_code: region,
            heap: region,
            alias: Region::new(0, 0),
            stack: Region::new(0, 0),
        };
        let table = PageTable::new(
            AddressSpaceId::new(3),
            layout,
            fixture.infos.clone(),
            fixture.frames.clone(),
            fixture.icache.clone(),
        );
        assert!(table.query_memory(va(0x20_0000)).is_none());
        assert_eq!(
            table.query_memory(va(0x10_0000)).unwrap().size,
            0x10_0000
        );
    }
}
