//! Software translation directory.
//!
//! This module provides the `PageDirectory` type, which records which physical frame backs
//! each mapped virtual page of a guest address space, together with the permission the page is
//! mapped with. It plays the role a hardware page table plays for a native kernel.

use alloc::collections::BTreeMap;

use crate::{BlockInfo, KernelPermission, PAGE_SIZE, PageNumber, PhysicalAddress, VirtualAddress};

/// A single translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    address: PhysicalAddress,
    permission: KernelPermission,
}

impl PageEntry {
    /// Returns the physical frame backing the page.
    pub const fn address(&self) -> PhysicalAddress {
        self.address
    }

    /// Returns the permission the page is mapped with.
    pub const fn permission(&self) -> KernelPermission {
        self.permission
    }
}

/// Virtual page to physical frame translations of one address space.
#[derive(Debug, Clone, Default)]
pub struct PageDirectory {
    entries: BTreeMap<PageNumber, PageEntry>,
}

impl PageDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `num_pages` consecutive pages starting at `virt` to the frames starting at `phys`.
    ///
    /// # Panics
    /// Panics if either address is not page-aligned or if any page is already mapped.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        num_pages: u64,
        permission: KernelPermission,
    ) {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");
        assert!(phys.is_page_aligned(), "physical address must be page-aligned");

        let first = virt.page_number();
        for i in 0..num_pages {
            let entry = PageEntry {
                address: phys + i * PAGE_SIZE,
                permission,
            };
            let previous = self.entries.insert(first + i, entry);
            assert!(previous.is_none(), "page {:?} mapped twice", first + i);
        }
    }

    /// Unmaps `num_pages` consecutive pages starting at `virt`.
    ///
    /// Pages that were not mapped are skipped.
    pub fn unmap(&mut self, virt: VirtualAddress, num_pages: u64) {
        assert!(virt.is_page_aligned(), "virtual address must be page-aligned");

        let first = virt.page_number();
        for i in 0..num_pages {
            self.entries.remove(&(first + i));
        }
    }

    /// Changes the permission of every mapped page in the range.
    pub fn protect(&mut self, virt: VirtualAddress, num_pages: u64, permission: KernelPermission) {
        let first = virt.page_number();
        for (_, entry) in self.entries.range_mut(first..first + num_pages) {
            entry.permission = permission;
        }
    }

    /// Returns the translation of the page containing `virt`.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PageEntry> {
        self.entries.get(&virt.page_number()).copied()
    }

    /// Returns the physically contiguous runs backing the range, in virtual order.
    ///
    /// Consecutive pages backed by consecutive frames are reported as one run. Returns `None`
    /// if any page in the range is not mapped.
    pub fn physical_runs(
        &self,
        virt: VirtualAddress,
        num_pages: u64,
    ) -> Option<alloc::vec::Vec<BlockInfo>> {
        let first = virt.page_number();
        let mut runs: alloc::vec::Vec<BlockInfo> = alloc::vec::Vec::new();

        for i in 0..num_pages {
            let entry = self.entries.get(&(first + i))?;
            match runs.last_mut() {
                Some(last) if last.is_followed_by(entry.address) => {
                    *last = BlockInfo::new(last.address(), last.num_pages() + 1);
                }
                _ => runs.push(BlockInfo::new(entry.address, 1)),
            }
        }

        Some(runs)
    }

    /// Returns the number of mapped pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no page is mapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIRT: u64 = 0x10_0000;
    const PHYS: u64 = 0x8000_0000;

    #[test]
    fn map_single_page() {
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(VIRT);
        let phys = PhysicalAddress::new(PHYS);

        dir.map(virt, phys, 1, KernelPermission::USER_READ);

        let entry = dir.translate(virt + 0x123).unwrap();
        assert_eq!(entry.address(), phys);
        assert_eq!(entry.permission(), KernelPermission::USER_READ);
        assert!(dir.translate(virt + PAGE_SIZE).is_none());
    }

    #[test]
    fn unmap_mapped_pages() {
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(VIRT);
        dir.map(virt, PhysicalAddress::new(PHYS), 4, KernelPermission::USER_READ);

        dir.unmap(virt + PAGE_SIZE, 2);
        assert_eq!(dir.len(), 2);
        assert!(dir.translate(virt).is_some());
        assert!(dir.translate(virt + PAGE_SIZE).is_none());
        assert!(dir.translate(virt + 3 * PAGE_SIZE).is_some());
    }

    #[test]
    fn protect_changes_permission() {
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(VIRT);
        dir.map(virt, PhysicalAddress::new(PHYS), 2, KernelPermission::USER_READ_WRITE);

        dir.protect(virt, 1, KernelPermission::USER_READ_EXECUTE);
        assert_eq!(
            dir.translate(virt).unwrap().permission(),
            KernelPermission::USER_READ_EXECUTE
        );
        assert_eq!(
            dir.translate(virt + PAGE_SIZE).unwrap().permission(),
            KernelPermission::USER_READ_WRITE
        );
    }

    #[test]
    fn physical_runs_coalesce() {
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(VIRT);
        let perm = KernelPermission::USER_READ;
        dir.map(virt, PhysicalAddress::new(PHYS), 2, perm);
        dir.map(virt + 2 * PAGE_SIZE, PhysicalAddress::new(PHYS + 0x10_0000), 1, perm);

        let runs = dir.physical_runs(virt, 3).unwrap();
        assert_eq!(
            runs,
            alloc::vec![
                BlockInfo::new(PhysicalAddress::new(PHYS), 2),
                BlockInfo::new(PhysicalAddress::new(PHYS + 0x10_0000), 1),
            ]
        );
        assert!(dir.physical_runs(virt, 4).is_none());
    }

    #[test]
    #[should_panic(expected = "mapped twice")]
    fn double_map_panics() {
        let mut dir = PageDirectory::new();
        let virt = VirtualAddress::new(VIRT);
        dir.map(virt, PhysicalAddress::new(PHYS), 1, KernelPermission::USER_READ);
        dir.map(virt, PhysicalAddress::new(PHYS), 1, KernelPermission::USER_READ);
    }
}
