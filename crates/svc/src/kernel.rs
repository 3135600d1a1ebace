//! Kernel-wide resources shared by every process.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use vmm::{
    AddressSpaceId, AddressSpaceLayout, BlockInfoManager, FramePool, ICacheInvalidationStrategy,
    InstructionCache, NoopInstructionCache, PageTable, PhysicalAddress,
};

use crate::handle_table::HandleTable;
use crate::process::Process;

/// Tunables of the emulated kernel.
#[derive(Debug, Clone, Copy)]
pub struct KernelConfig {
    /// Number of page group run descriptors shared by all processes.
    pub block_info_capacity: usize,
    /// First frame of guest physical memory.
    pub frame_base: PhysicalAddress,
    /// Number of frames of guest physical memory.
    pub frame_pages: u64,
    /// Handle slots per process.
    pub handle_capacity: usize,
    /// Layout given to processes created without an explicit one.
    pub layout: AddressSpaceLayout,
    /// How `UnmapProcessCodeMemory` invalidates the instruction cache.
    pub code_unmap_icache_strategy: ICacheInvalidationStrategy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            block_info_capacity: 4096,
            frame_base: PhysicalAddress::new(0x8000_0000),
            frame_pages: 0x1_0000,
            handle_capacity: 1024,
            layout: AddressSpaceLayout::default(),
            code_unmap_icache_strategy: ICacheInvalidationStrategy::InvalidateAll,
        }
    }
}

/// Owner of the resources every process draws from.
pub struct Kernel {
    config: KernelConfig,
    block_infos: Arc<BlockInfoManager>,
    frames: Arc<FramePool>,
    icache: Arc<dyn InstructionCache>,
    next_process_id: AtomicU64,
}

impl Kernel {
    /// Creates a kernel that ignores instruction cache maintenance.
    pub fn new(config: KernelConfig) -> Self {
        Self::with_instruction_cache(config, Arc::new(NoopInstructionCache))
    }

    pub fn with_instruction_cache(config: KernelConfig, icache: Arc<dyn InstructionCache>) -> Self {
        log::info!(
            "kernel: {} frames at {}, {} block infos",
            config.frame_pages,
            config.frame_base,
            config.block_info_capacity
        );
        Self {
            block_infos: Arc::new(BlockInfoManager::new(config.block_info_capacity)),
            frames: Arc::new(FramePool::new(config.frame_base, config.frame_pages)),
            icache,
            next_process_id: AtomicU64::new(1),
            config,
        }
    }

    pub const fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn frames(&self) -> &Arc<FramePool> {
        &self.frames
    }

    pub fn block_infos(&self) -> &Arc<BlockInfoManager> {
        &self.block_infos
    }

    /// Creates a process with the default layout.
    pub fn create_process(&self) -> Arc<Process> {
        self.create_process_with_layout(self.config.layout)
    }

    /// Creates a process with an empty address space shaped by `layout`.
    pub fn create_process_with_layout(&self, layout: AddressSpaceLayout) -> Arc<Process> {
        let id = self.next_process_id.fetch_add(1, Ordering::Relaxed);
        let page_table = PageTable::new(
            AddressSpaceId::new(id),
            layout,
            self.block_infos.clone(),
            self.frames.clone(),
            self.icache.clone(),
        );
        log::debug!("created process {}", id);
        Arc::new(Process::new(
            id,
            page_table,
            HandleTable::new(self.config.handle_capacity),
        ))
    }
}

impl core::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}
