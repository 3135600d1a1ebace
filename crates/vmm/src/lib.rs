#![cfg_attr(not(test), no_std)]

//! # Guest Virtual Memory Manager (VMM)
//!
//! The VMM tracks and mutates the address spaces of emulated guest processes. It provides:
//!
//! - Per-process page tables: an exact partition of the address space into memory blocks plus a
//!   software translation directory.
//! - Page groups describing the physical backing of a range, so one process's memory can be
//!   aliased into another process without copying.
//! - A pooled allocator for page group run descriptors and a reference-counted software frame
//!   pool.
//!
//! Result codes follow the guest kernel's encoding; see [`Error`] and [`ResultCode`].

extern crate alloc;

mod address;
mod block_info;
mod block_manager;
mod error;
mod frame;
mod layout;
mod memory;
mod numbers;
mod page_directory;
mod page_group;
mod page_table;

pub use address::{PAGE_BITS, PAGE_SIZE, PhysicalAddress, VirtualAddress, is_page_aligned};
pub use block_info::{BlockInfo, BlockInfoId, BlockInfoManager};
pub use block_manager::MemoryBlockManager;
pub use error::{Error, Result, ResultCode};
pub use frame::{FramePool, FrameProvider};
pub use layout::{AddressSpaceLayout, Region};
pub use memory::{
    KernelPermission, MemoryAttribute, MemoryBlock, MemoryInfo, MemoryPermission, MemoryState,
    MemoryStateFlags,
};
pub use numbers::{FrameNumber, PageNumber};
pub use page_directory::{PageDirectory, PageEntry};
pub use page_group::PageGroup;
pub use page_table::{
    AddressSpaceId, ICacheInvalidationStrategy, InstructionCache, LockedPageTable, LockedPair,
    MemoryCheck, NoopInstructionCache, PageTable, StateMatch,
};
