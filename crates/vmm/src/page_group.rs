//! Descriptions of the physical backing of a virtual range.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{BlockInfo, BlockInfoId, BlockInfoManager, FrameProvider, PhysicalAddress, Result};

/// An ordered list of physical runs backing some virtual range.
///
/// A page group is built from a page table snapshot and can then be *opened*, which adds one
/// reference to every frame it names, so the frames stay alive while the group is handed to
/// another address space. Every open is paired with a close: outstanding opens are closed when
/// the group is dropped, and its run descriptors go back to the [`BlockInfoManager`].
pub struct PageGroup {
    manager: Arc<BlockInfoManager>,
    frames: Arc<dyn FrameProvider>,
    blocks: Vec<BlockInfoId>,
    open_count: u32,
}

impl PageGroup {
    /// Creates an empty group whose descriptors come from `manager`.
    pub fn new(manager: Arc<BlockInfoManager>, frames: Arc<dyn FrameProvider>) -> Self {
        Self {
            manager,
            frames,
            blocks: Vec::new(),
            open_count: 0,
        }
    }

    /// Appends a run to the group.
    ///
    /// A run that directly follows the last one extends it instead of taking a new
    /// descriptor.
    pub fn add_block(&mut self, address: PhysicalAddress, num_pages: u64) -> Result<()> {
        assert_eq!(self.open_count, 0, "cannot grow an open page group");
        if num_pages == 0 {
            return Ok(());
        }

        if let Some(&last_id) = self.blocks.last() {
            let last = self.manager.get(last_id);
            if last.is_followed_by(address) {
                self.manager.set(
                    last_id,
                    BlockInfo::new(last.address(), last.num_pages() + num_pages),
                );
                return Ok(());
            }
        }

        let id = self.manager.allocate(BlockInfo::new(address, num_pages))?;
        self.blocks.push(id);
        Ok(())
    }

    /// Adds a reference to every frame in the group.
    pub fn open(&mut self) {
        for block in self.iter() {
            self.frames.open(block.address(), block.num_pages());
        }
        self.open_count += 1;
    }

    /// Drops a reference previously added by [`open`](Self::open).
    ///
    /// # Panics
    ///
    /// Panics if the group is not open.
    pub fn close(&mut self) {
        assert!(self.open_count > 0, "closed a page group that is not open");
        for block in self.iter() {
            self.frames.close(block.address(), block.num_pages());
        }
        self.open_count -= 1;
    }

    /// Returns how many opens are outstanding.
    pub const fn open_count(&self) -> u32 {
        self.open_count
    }

    /// Returns the runs of the group in order.
    pub fn iter(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.blocks.iter().map(|&id| self.manager.get(id))
    }

    /// Returns the number of runs in the group.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Returns true if the group names no frames.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Returns the total number of frames in the group.
    pub fn num_pages(&self) -> u64 {
        self.iter().map(|block| block.num_pages()).sum()
    }
}

impl Drop for PageGroup {
    fn drop(&mut self) {
        while self.open_count > 0 {
            self.close();
        }
        for id in self.blocks.drain(..) {
            self.manager.free(id);
        }
    }
}

impl core::fmt::Debug for PageGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageGroup")
            .field("blocks", &self.iter().collect::<Vec<_>>())
            .field("open_count", &self.open_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, FramePool, PAGE_SIZE};

    fn setup(capacity: usize) -> (Arc<BlockInfoManager>, Arc<FramePool>) {
        (
            Arc::new(BlockInfoManager::new(capacity)),
            Arc::new(FramePool::new(PhysicalAddress::new(0x8000_0000), 64)),
        )
    }

    #[test]
    fn contiguous_runs_coalesce() {
        let (manager, frames) = setup(8);
        let mut group = PageGroup::new(manager.clone(), frames);

        group.add_block(PhysicalAddress::new(0x8000_0000), 2).unwrap();
        group.add_block(PhysicalAddress::new(0x8000_2000), 1).unwrap();
        group.add_block(PhysicalAddress::new(0x8001_0000), 1).unwrap();

        assert_eq!(group.len(), 2);
        assert_eq!(group.num_pages(), 4);
        assert_eq!(manager.in_use(), 2);

        let runs: Vec<_> = group.iter().collect();
        assert_eq!(runs[0], BlockInfo::new(PhysicalAddress::new(0x8000_0000), 3));
        assert_eq!(runs[1], BlockInfo::new(PhysicalAddress::new(0x8001_0000), 1));
    }

    #[test]
    fn open_and_close_track_frame_references() {
        let (manager, frames) = setup(8);
        let address = frames.allocate(2).unwrap();
        let mut group = PageGroup::new(manager, frames.clone());
        group.add_block(address, 2).unwrap();

        group.open();
        assert_eq!(group.open_count(), 1);
        assert_eq!(frames.reference_count(address), 2);
        assert_eq!(frames.reference_count(address + PAGE_SIZE), 2);

        group.close();
        assert_eq!(group.open_count(), 0);
        assert_eq!(frames.reference_count(address), 1);
    }

    #[test]
    fn drop_closes_and_releases_nodes() {
        let (manager, frames) = setup(8);
        let address = frames.allocate(1).unwrap();
        {
            let mut group = PageGroup::new(manager.clone(), frames.clone());
            group.add_block(address, 1).unwrap();
            group.open();
            group.open();
            assert_eq!(frames.reference_count(address), 3);
            assert_eq!(manager.in_use(), 1);
        }
        assert_eq!(frames.reference_count(address), 1);
        assert_eq!(manager.in_use(), 0);
    }

    #[test]
    fn split_additions_describe_the_same_runs() {
        let (manager, frames) = setup(8);
        let mut a = PageGroup::new(manager.clone(), frames.clone());
        let mut b = PageGroup::new(manager.clone(), frames.clone());

        a.add_block(PhysicalAddress::new(0x8000_0000), 2).unwrap();
        b.add_block(PhysicalAddress::new(0x8000_0000), 1).unwrap();
        b.add_block(PhysicalAddress::new(0x8000_1000), 1).unwrap();
        assert_eq!(b.len(), 1);
        assert!(a.iter().eq(b.iter()));

        b.add_block(PhysicalAddress::new(0x8000_4000), 1).unwrap();
        assert!(!a.iter().eq(b.iter()));
    }

    #[test]
    fn exhausted_pool_fails_add() {
        let (manager, frames) = setup(1);
        let mut group = PageGroup::new(manager, frames);
        group.add_block(PhysicalAddress::new(0x8000_0000), 1).unwrap();
        assert_eq!(
            group.add_block(PhysicalAddress::new(0x8000_4000), 1),
            Err(Error::OutOfResource)
        );
    }
}
