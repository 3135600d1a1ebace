//! Block bookkeeping for one address space.
//!
//! The blocks of an address space form an exact partition of it: every address belongs to
//! exactly one block, blocks are keyed by their start address, and no two neighbours carry the
//! same metadata. Mutations split blocks at the edges of the affected range, rewrite the blocks
//! inside it and merge equal neighbours back together.

use alloc::collections::BTreeMap;

use crate::{
    KernelPermission, MemoryAttribute, MemoryBlock, MemoryState, PAGE_SIZE, VirtualAddress,
    layout::Region,
};

/// Splits the block containing `address` so that a block starts exactly at `address`.
///
/// Does nothing if `address` already starts a block or lies outside the partition.
pub(crate) fn split_at(blocks: &mut BTreeMap<VirtualAddress, MemoryBlock>, address: VirtualAddress) {
    let Some((_, block)) = blocks.range_mut(..address).next_back() else {
        return;
    };
    if address >= block.end() {
        return;
    }

    let head_pages = (address - block.start) / PAGE_SIZE;
    let mut tail = *block;
    tail.start = address;
    tail.num_pages = block.num_pages - head_pages;
    block.num_pages = head_pages;

    blocks.insert(address, tail);
}

/// Merges equal neighbours among the blocks overlapping `[start, end]`, including the block
/// just before `start` and the one starting at `end`.
pub(crate) fn merge_adjacent(
    blocks: &mut BTreeMap<VirtualAddress, MemoryBlock>,
    start: VirtualAddress,
    end: VirtualAddress,
) {
    let mut cursor = match blocks.range(..start).next_back() {
        Some((&address, _)) => address,
        None => start,
    };

    loop {
        let Some((&current, block)) = blocks.range(cursor..).next() else {
            return;
        };
        if current > end {
            return;
        }
        let block = *block;

        match blocks.get(&block.end()) {
            Some(next) if block.has_same_properties(next) => {
                let absorbed = next.num_pages;
                if let Some(merged) = blocks.get_mut(&current) {
                    merged.num_pages += absorbed;
                }
                blocks.remove(&block.end());
                cursor = current;
            }
            _ => cursor = block.end(),
        }
    }
}

/// The ordered block partition of one address space.
#[derive(Debug, Clone)]
pub struct MemoryBlockManager {
    blocks: BTreeMap<VirtualAddress, MemoryBlock>,
    region: Region,
}

impl MemoryBlockManager {
    /// Creates a partition covering `region` with a single free block.
    pub fn new(region: Region) -> Self {
        let mut blocks = BTreeMap::new();
        blocks.insert(
            region.base(),
            MemoryBlock::new(
                region.base(),
                region.size() / PAGE_SIZE,
                MemoryState::Free,
                KernelPermission::empty(),
            ),
        );
        Self { blocks, region }
    }

    /// Returns the block containing `address`.
    pub fn find(&self, address: VirtualAddress) -> Option<&MemoryBlock> {
        self.blocks
            .range(..=address)
            .next_back()
            .map(|(_, block)| block)
            .filter(|block| address < block.end())
    }

    /// Returns every block overlapping `[address, address + size)` in address order.
    pub fn overlapping(
        &self,
        address: VirtualAddress,
        size: u64,
    ) -> impl Iterator<Item = &MemoryBlock> + '_ {
        let end = VirtualAddress::new(address.as_u64().saturating_add(size));
        let first = self
            .find(address)
            .map(MemoryBlock::start)
            .unwrap_or(address);
        self.blocks
            .range(first..end)
            .map(|(_, block)| block)
    }

    /// Returns every block in address order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryBlock> + '_ {
        self.blocks.values()
    }

    /// Returns the number of blocks in the partition.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the partition holds no blocks, which never happens for a live table.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Applies `update` to every block inside `[address, address + num_pages * PAGE_SIZE)`,
    /// splitting blocks at the range edges first and merging equal neighbours afterwards.
    pub fn update_with(
        &mut self,
        address: VirtualAddress,
        num_pages: u64,
        mut update: impl FnMut(&mut MemoryBlock),
    ) {
        let end = address + num_pages * PAGE_SIZE;
        debug_assert!(
            self.region.contains(address, num_pages * PAGE_SIZE),
            "update outside the managed region"
        );

        split_at(&mut self.blocks, address);
        split_at(&mut self.blocks, end);
        for (_, block) in self.blocks.range_mut(address..end) {
            update(block);
        }
        merge_adjacent(&mut self.blocks, address, end);
    }

    /// Sets the state, permission and attribute of every block in the range.
    pub fn update(
        &mut self,
        address: VirtualAddress,
        num_pages: u64,
        state: MemoryState,
        permission: KernelPermission,
        attribute: MemoryAttribute,
    ) {
        self.update_with(address, num_pages, |block| {
            block.state = state;
            block.permission = permission;
            block.attribute = attribute;
        });
    }

    /// Takes a lock on every block in the range, marking it [`MemoryAttribute::LOCKED`].
    pub fn lock(&mut self, address: VirtualAddress, num_pages: u64, permission: KernelPermission) {
        self.update_with(address, num_pages, |block| {
            block.lock_count += 1;
            block.attribute |= MemoryAttribute::LOCKED;
            block.permission = permission;
        });
    }

    /// Releases a lock taken by [`lock`](Self::lock), clearing the attribute once the last lock
    /// is gone.
    pub fn unlock(&mut self, address: VirtualAddress, num_pages: u64, permission: KernelPermission) {
        self.update_with(address, num_pages, |block| {
            debug_assert!(block.lock_count > 0, "unlocking a block that is not locked");
            block.lock_count = block.lock_count.saturating_sub(1);
            if block.lock_count == 0 {
                block.attribute.remove(MemoryAttribute::LOCKED);
            }
            block.permission = permission;
        });
    }

    /// Returns true if the blocks exactly partition the managed region with no two equal
    /// neighbours.
    pub fn is_consistent(&self) -> bool {
        let mut expected = self.region.base();
        let mut previous: Option<&MemoryBlock> = None;

        for (&key, block) in &self.blocks {
            if key != block.start || block.start != expected || block.num_pages == 0 {
                return false;
            }
            if previous.is_some_and(|prev| prev.has_same_properties(block)) {
                return false;
            }
            expected = block.end();
            previous = Some(block);
        }

        expected == self.region.end()
    }

    /// Logs every block at trace level.
    #[cfg(feature = "detailed-logging")]
    pub fn dump(&self) {
        for block in self.blocks.values() {
            log::trace!(
                "  [{}, {}) {:?} {:?} {:?} locks={}",
                block.start,
                block.end(),
                block.state,
                block.permission,
                block.attribute,
                block.lock_count
            );
        }
    }
}
