//! Physical frame ownership.
//!
//! Page tables never own physical memory themselves. Every mapped page holds one reference on
//! its frame through a [`FrameProvider`]; a frame returns to the provider once the last
//! reference is closed.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::{BlockInfo, Error, FrameNumber, PhysicalAddress, Result};

/// Source of reference-counted physical frames.
pub trait FrameProvider: Send + Sync {
    /// Allocates `num_pages` contiguous frames, each holding a single reference owned by the
    /// caller.
    fn allocate(&self, num_pages: u64) -> Result<PhysicalAddress>;

    /// Adds a reference to every frame in the run.
    fn open(&self, address: PhysicalAddress, num_pages: u64);

    /// Drops a reference from every frame in the run, releasing frames that reach zero.
    fn close(&self, address: PhysicalAddress, num_pages: u64);
}

/// Mutable state of a [`FramePool`].
#[derive(Debug)]
struct FramePoolState {
    /// Free runs, sorted by address, never adjacent.
    free: Vec<BlockInfo>,
    /// Reference count of every allocated frame.
    references: BTreeMap<FrameNumber, u32>,
}

impl FramePoolState {
    /// Returns a run to the free list, merging with its neighbours.
    fn release(&mut self, run: BlockInfo) {
        let index = self
            .free
            .partition_point(|free| free.address() < run.address());
        let mut merged = run;

        if let Some(next) = self.free.get(index) {
            if merged.is_followed_by(next.address()) {
                merged = BlockInfo::new(merged.address(), merged.num_pages() + next.num_pages());
                self.free.remove(index);
            }
        }

        if index > 0 {
            let previous = self.free[index - 1];
            if previous.is_followed_by(merged.address()) {
                self.free[index - 1] =
                    BlockInfo::new(previous.address(), previous.num_pages() + merged.num_pages());
                return;
            }
        }

        self.free.insert(index, merged);
    }

    /// Carves `num_pages` frames out of the first free run large enough to hold them.
    fn take_first_fit(&mut self, num_pages: u64) -> Option<PhysicalAddress> {
        let index = self.free.iter().position(|run| run.num_pages() >= num_pages)?;
        let run = self.free[index];

        if run.num_pages() == num_pages {
            self.free.remove(index);
        } else {
            self.free[index] = BlockInfo::new(
                PhysicalAddress::new(run.address().as_u64() + num_pages * crate::PAGE_SIZE),
                run.num_pages() - num_pages,
            );
        }

        Some(run.address())
    }
}

/// A software frame provider over a fixed range of guest physical memory.
///
/// Allocation is first-fit over the free runs; frames are handed back once their reference
/// count drops to zero.
#[derive(Debug)]
pub struct FramePool {
    base: PhysicalAddress,
    num_pages: u64,
    state: spin::Mutex<FramePoolState>,
}

impl FramePool {
    /// Creates a pool managing `num_pages` frames starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned.
    pub fn new(base: PhysicalAddress, num_pages: u64) -> Self {
        assert!(base.is_page_aligned(), "frame pool base must be page-aligned");

        let mut free = Vec::new();
        if num_pages != 0 {
            free.push(BlockInfo::new(base, num_pages));
        }

        Self {
            base,
            num_pages,
            state: spin::Mutex::new(FramePoolState {
                free,
                references: BTreeMap::new(),
            }),
        }
    }

    /// Returns the first frame managed by the pool.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the number of frames managed by the pool.
    pub const fn total_pages(&self) -> u64 {
        self.num_pages
    }

    /// Returns the number of frames not currently allocated.
    pub fn free_pages(&self) -> u64 {
        self.state.lock().free.iter().map(BlockInfo::num_pages).sum()
    }

    /// Returns the reference count of the frame containing `address`, or zero if it is free.
    pub fn reference_count(&self, address: PhysicalAddress) -> u32 {
        self.state
            .lock()
            .references
            .get(&address.frame_number())
            .copied()
            .unwrap_or(0)
    }
}

impl FrameProvider for FramePool {
    fn allocate(&self, num_pages: u64) -> Result<PhysicalAddress> {
        if num_pages == 0 {
            return Err(Error::OutOfMemory);
        }

        let mut state = self.state.lock();
        let Some(address) = state.take_first_fit(num_pages) else {
            log::error!("frame pool out of memory: failed to allocate {} pages", num_pages);
            return Err(Error::OutOfMemory);
        };

        let first = address.frame_number();
        for i in 0..num_pages {
            state.references.insert(first + i, 1);
        }

        Ok(address)
    }

    fn open(&self, address: PhysicalAddress, num_pages: u64) {
        let mut state = self.state.lock();
        let first = address.frame_number();
        for i in 0..num_pages {
            let count = state
                .references
                .get_mut(&(first + i))
                .expect("opened a frame that is not allocated");
            *count += 1;
        }
    }

    fn close(&self, address: PhysicalAddress, num_pages: u64) {
        let mut state = self.state.lock();
        let first = address.frame_number();
        for i in 0..num_pages {
            let frame = first + i;
            let count = state
                .references
                .get_mut(&frame)
                .expect("closed a frame that is not allocated");
            *count -= 1;
            if *count == 0 {
                state.references.remove(&frame);
                state.release(BlockInfo::new(frame.start(), 1));
            }
        }
    }
}
