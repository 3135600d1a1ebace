//! Pooled allocation of physical run descriptors.
//!
//! A [`BlockInfoManager`] owns a fixed number of [`BlockInfo`] nodes. Page groups borrow nodes
//! from the pool while they describe a range and return them when dropped, so the number of
//! page groups alive at once is bounded by the pool's capacity rather than by the host heap.

use alloc::vec::Vec;

use crate::{Error, PAGE_SIZE, PhysicalAddress, Result};

/// Describes a run of physically contiguous frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    address: PhysicalAddress,
    num_pages: u64,
}

impl BlockInfo {
    /// Creates a new run descriptor.
    pub const fn new(address: PhysicalAddress, num_pages: u64) -> Self {
        Self { address, num_pages }
    }

    /// Returns the first frame's address.
    pub const fn address(&self) -> PhysicalAddress {
        self.address
    }

    /// Returns the number of frames in the run.
    pub const fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Returns the size of the run in bytes.
    pub const fn size(&self) -> u64 {
        self.num_pages * PAGE_SIZE
    }

    /// Returns the address just past the run.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.address.as_u64() + self.size())
    }

    /// Returns true if `address` directly follows this run.
    pub const fn is_followed_by(&self, address: PhysicalAddress) -> bool {
        self.end().as_u64() == address.as_u64()
    }
}

/// Index of a node inside a [`BlockInfoManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfoId(u32);

/// Fixed-capacity storage behind the manager's lock.
#[derive(Debug)]
struct Pool {
    nodes: Vec<Option<BlockInfo>>,
    free: Vec<u32>,
}

/// A pool of [`BlockInfo`] nodes shared by all page groups of a kernel.
///
/// # Thread Safety
///
/// The pool uses `spin::Mutex` for interior mutability; page groups of different processes
/// allocate from the same pool concurrently.
#[derive(Debug)]
pub struct BlockInfoManager {
    pool: spin::Mutex<Pool>,
    capacity: usize,
}

impl BlockInfoManager {
    /// Creates a pool holding at most `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        nodes.resize(capacity, None);
        // Hand out low indices first.
        let free = (0..capacity as u32).rev().collect();

        Self {
            pool: spin::Mutex::new(Pool { nodes, free }),
            capacity,
        }
    }

    /// Takes a node from the pool and stores `info` in it.
    pub fn allocate(&self, info: BlockInfo) -> Result<BlockInfoId> {
        let mut pool = self.pool.lock();
        let Some(index) = pool.free.pop() else {
            log::error!("block info pool exhausted ({} nodes)", self.capacity);
            return Err(Error::OutOfResource);
        };
        pool.nodes[index as usize] = Some(info);
        Ok(BlockInfoId(index))
    }

    /// Returns the contents of a live node.
    ///
    /// # Panics
    ///
    /// Panics if the node has been freed.
    pub fn get(&self, id: BlockInfoId) -> BlockInfo {
        self.pool.lock().nodes[id.0 as usize].expect("block info node is not allocated")
    }

    /// Replaces the contents of a live node.
    pub fn set(&self, id: BlockInfoId, info: BlockInfo) {
        let mut pool = self.pool.lock();
        let node = &mut pool.nodes[id.0 as usize];
        assert!(node.is_some(), "block info node is not allocated");
        *node = Some(info);
    }

    /// Returns a node to the pool.
    pub fn free(&self, id: BlockInfoId) {
        let mut pool = self.pool.lock();
        let node = pool.nodes[id.0 as usize].take();
        assert!(node.is_some(), "block info node freed twice");
        pool.free.push(id.0);
    }

    /// Returns the total number of nodes in the pool.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of nodes currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity - self.pool.lock().free.len()
    }
}
