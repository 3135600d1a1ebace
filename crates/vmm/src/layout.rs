//! Fixed layout of a guest address space.
//!
//! A layout is chosen when a process is created and never changes afterwards, so checks
//! against it can run without holding the page table lock.

use crate::{MemoryState, VirtualAddress};

/// A contiguous range of guest virtual memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    size: u64,
}

impl Region {
    /// Creates a new region.
    pub const fn new(base: u64, size: u64) -> Self {
        Self {
            base: VirtualAddress::new(base),
            size,
        }
    }

    /// Returns the base address of this region.
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    /// Returns true if `[address, address + size)` lies entirely inside this region.
    ///
    /// Ranges that are empty or wrap around the top of the address space are never contained.
    pub const fn contains(&self, address: VirtualAddress, size: u64) -> bool {
        let Some(end) = address.as_u64().checked_add(size) else {
            return false;
        };
        self.size != 0
            && address.as_u64() < end
            && self.base.as_u64() <= address.as_u64()
            && end - 1 <= self.end().as_u64() - 1
    }

    /// Returns true if `[address, address + size)` shares at least one byte with this region.
    pub const fn overlaps(&self, address: VirtualAddress, size: u64) -> bool {
        let end = address.as_u64().saturating_add(size);
        self.size != 0
            && address.as_u64() < self.end().as_u64()
            && self.base.as_u64() < end
    }
}

/// Address-space layout of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceLayout {
    /// Every address the process may ever map.
    pub address_space: Region,
    /// Where the process's own modules are loaded.
    pub code: Region,
    /// The randomized region that receives code aliases and memory of other processes.
    pub alias_code: Region,
    /// Where heap memory lives.
    pub heap: Region,
    /// Where IPC aliases live.
    pub alias: Region,
    /// Where thread stacks live.
    pub stack: Region,
}

impl AddressSpaceLayout {
    /// Returns true if `[address, address + size)` is a nonempty range inside the address space.
    pub const fn contains(&self, address: VirtualAddress, size: u64) -> bool {
        self.address_space.contains(address, size)
    }

    /// Returns true if `[address, address + size)` lies inside the address space.
    pub const fn is_inside_address_space(&self, address: VirtualAddress, size: u64) -> bool {
        self.address_space.contains(address, size)
    }

    /// Returns true if `[address, address + size)` lies inside the randomized code region.
    pub const fn is_inside_aslr_region(&self, address: VirtualAddress, size: u64) -> bool {
        self.alias_code.contains(address, size)
    }

    /// Returns the region blocks of `state` must be placed in.
    pub const fn region_for(&self, state: MemoryState) -> Region {
        match state {
            MemoryState::Free => self.address_space,
            MemoryState::Normal | MemoryState::Heap => self.heap,
            MemoryState::Code | MemoryState::CodeData => self.code,
            MemoryState::Stack => self.stack,
            MemoryState::Shared
            | MemoryState::AliasCode
            | MemoryState::AliasCodeData
            | MemoryState::SharedCode => self.alias_code,
        }
    }

    /// Returns true if a block of `state` could be created at `[address, address + size)`.
    ///
    /// The range must sit inside the region for `state` and, except for heap states, must not
    /// touch the heap or alias regions.
    pub const fn can_contain(&self, address: VirtualAddress, size: u64, state: MemoryState) -> bool {
        let in_region = self.region_for(state).contains(address, size);
        let in_heap = self.heap.overlaps(address, size);
        let in_alias = self.alias.overlaps(address, size);

        match state {
            MemoryState::Free => in_region,
            MemoryState::Normal | MemoryState::Heap => in_region && !in_alias,
            _ => in_region && !in_heap && !in_alias,
        }
    }
}

impl Default for AddressSpaceLayout {
    /// A 39-bit address space.
    fn default() -> Self {
        Self {
            address_space: Region::new(0x0000_0000_0800_0000, 0x0000_007F_F800_0000),
            code: Region::new(0x0000_0000_0800_0000, 0x0000_0000_4000_0000),
            alias_code: Region::new(0x0000_0000_0800_0000, 0x0000_000F_F800_0000),
            heap: Region::new(0x0000_0010_0000_0000, 0x0000_0002_0000_0000),
            alias: Region::new(0x0000_0020_0000_0000, 0x0000_0010_0000_0000),
            stack: Region::new(0x0000_0030_0000_0000, 0x0000_0000_8000_0000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: u64) -> VirtualAddress {
        VirtualAddress::new(value)
    }

    #[test]
    fn region_contains() {
        let region = Region::new(0x1000, 0x3000);
        assert!(region.contains(addr(0x1000), 0x3000));
        assert!(region.contains(addr(0x2000), 0x1000));
        assert!(!region.contains(addr(0x0000), 0x2000));
        assert!(!region.contains(addr(0x3000), 0x2000));
        assert!(!region.contains(addr(0x2000), 0));
        assert!(!region.contains(addr(u64::MAX - 0xFFF), 0x2000));
    }

    #[test]
    fn region_overlaps() {
        let region = Region::new(0x1000, 0x1000);
        assert!(region.overlaps(addr(0x0000), 0x2000));
        assert!(region.overlaps(addr(0x1800), 0x100));
        assert!(!region.overlaps(addr(0x0000), 0x1000));
        assert!(!region.overlaps(addr(0x2000), 0x1000));
    }

    #[test]
    fn default_layout_is_39_bit() {
        let layout = AddressSpaceLayout::default();
        assert_eq!(layout.address_space.end().as_u64(), 1 << 39);
        assert!(layout.contains(addr(0x0800_0000), 0x1000));
        assert!(!layout.contains(addr(0x0), 0x1000));
        assert!(!layout.contains(addr((1 << 39) - 0x1000), 0x2000));
    }

    #[test]
    fn aslr_region_excludes_heap() {
        let layout = AddressSpaceLayout::default();
        assert!(layout.is_inside_aslr_region(addr(0x1_0000_0000), 0x1000));
        assert!(!layout.is_inside_aslr_region(layout.heap.base(), 0x1000));
    }

    #[test]
    fn can_contain_by_state() {
        let layout = AddressSpaceLayout::default();
        let heap = layout.heap.base();
        let aslr = addr(0x1_0000_0000);

        assert!(layout.can_contain(heap, 0x1000, MemoryState::Normal));
        assert!(!layout.can_contain(aslr, 0x1000, MemoryState::Normal));
        assert!(layout.can_contain(aslr, 0x1000, MemoryState::SharedCode));
        assert!(layout.can_contain(aslr, 0x1000, MemoryState::AliasCode));
        assert!(!layout.can_contain(heap, 0x1000, MemoryState::SharedCode));
        assert!(layout.can_contain(heap, 0x1000, MemoryState::Free));
    }
}
