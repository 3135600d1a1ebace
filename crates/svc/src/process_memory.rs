//! Process memory supervisor calls.
//!
//! Each call validates its raw arguments in a fixed order and reports the first violated
//! requirement; the guest observes that order through the returned result code. Nothing is
//! mutated until every check has passed.

use alloc::sync::Arc;

use vmm::{
    Error, KernelPermission, MemoryCheck, MemoryPermission, MemoryState, MemoryStateFlags,
    PAGE_SIZE, PageTable, Result, VirtualAddress, is_page_aligned,
};

use crate::handle_table::Handle;
use crate::kernel::Kernel;
use crate::process::Process;

/// Returns true if `[address, address + size)` wraps around the top of the address space.
fn overflows(address: u64, size: u64) -> bool {
    address.checked_add(size).is_none()
}

/// Changes the permission of memory owned by `process_handle`.
///
/// `permission` must be one of none, read, read-write or read-execute.
pub fn set_process_memory_permission(
    current: &Arc<Process>,
    process_handle: Handle,
    address: u64,
    size: u64,
    permission: u32,
) -> Result<()> {
    log::trace!(
        "set_process_memory_permission(process={:?}, address={:#x}, size={:#x}, permission={:#x})",
        process_handle,
        address,
        size,
        permission
    );

    if !is_page_aligned(address) {
        return Err(Error::InvalidAddress);
    }
    if !is_page_aligned(size) {
        return Err(Error::InvalidSize);
    }
    if size == 0 {
        return Err(Error::InvalidSize);
    }
    if overflows(address, size) {
        return Err(Error::InvalidCurrentMemory);
    }
    let permission =
        MemoryPermission::from_raw(permission).ok_or(Error::InvalidNewMemoryPermission)?;

    let process = current
        .get_process(process_handle)
        .ok_or(Error::InvalidHandle)?;
    let page_table = process.page_table();
    let address = VirtualAddress::new(address);
    if !page_table.contains(address, size) {
        return Err(Error::InvalidCurrentMemory);
    }

    page_table.set_process_memory_permission(address, size / PAGE_SIZE, permission)
}

/// Validation shared by the inter-process mapping calls. Returns the source process.
fn check_process_memory_arguments(
    current: &Arc<Process>,
    dst_address: u64,
    process_handle: Handle,
    src_address: u64,
    size: u64,
) -> Result<Arc<Process>> {
    if !is_page_aligned(dst_address) {
        return Err(Error::InvalidAddress);
    }
    if !is_page_aligned(src_address) {
        return Err(Error::InvalidAddress);
    }
    if size == 0 || !is_page_aligned(size) {
        return Err(Error::InvalidSize);
    }
    if overflows(dst_address, size) {
        return Err(Error::InvalidCurrentMemory);
    }
    if overflows(src_address, size) {
        return Err(Error::InvalidCurrentMemory);
    }

    let src_process = current
        .get_process_without_pseudo_handle(process_handle)
        .ok_or(Error::InvalidHandle)?;

    if !src_process
        .page_table()
        .contains(VirtualAddress::new(src_address), size)
    {
        return Err(Error::InvalidCurrentMemory);
    }
    if !current
        .page_table()
        .can_contain(VirtualAddress::new(dst_address), size, MemoryState::SharedCode)
    {
        return Err(Error::InvalidMemoryRegion);
    }

    Ok(src_process)
}

/// Maps memory of the process named by `process_handle` into the current process.
///
/// The destination shares the source's frames and is mapped read-write as shared code.
pub fn map_process_memory(
    current: &Arc<Process>,
    dst_address: u64,
    process_handle: Handle,
    src_address: u64,
    size: u64,
) -> Result<()> {
    log::trace!(
        "map_process_memory(dst_address={:#x}, process={:?}, src_address={:#x}, size={:#x})",
        dst_address,
        process_handle,
        src_address,
        size
    );

    let src_process =
        check_process_memory_arguments(current, dst_address, process_handle, src_address, size)?;

    let mut tables = PageTable::lock_pair(current.page_table(), src_process.page_table());
    let group = tables.src().make_and_open_page_group(
        VirtualAddress::new(src_address),
        size / PAGE_SIZE,
        MemoryCheck::flags(MemoryStateFlags::CAN_MAP_PROCESS),
    )?;

    tables.dst_mut().map_page_group(
        VirtualAddress::new(dst_address),
        &group,
        MemoryState::SharedCode,
        KernelPermission::USER_READ_WRITE,
    )
}

/// Removes a mapping created by [`map_process_memory`] from the current process.
pub fn unmap_process_memory(
    current: &Arc<Process>,
    dst_address: u64,
    process_handle: Handle,
    src_address: u64,
    size: u64,
) -> Result<()> {
    log::trace!(
        "unmap_process_memory(dst_address={:#x}, process={:?}, src_address={:#x}, size={:#x})",
        dst_address,
        process_handle,
        src_address,
        size
    );

    let src_process =
        check_process_memory_arguments(current, dst_address, process_handle, src_address, size)?;

    let mut tables = PageTable::lock_pair(current.page_table(), src_process.page_table());
    tables.unmap_process_memory(
        VirtualAddress::new(dst_address),
        size,
        VirtualAddress::new(src_address),
    )
}

/// Which end of a code memory call is validated first.
#[derive(Clone, Copy)]
enum AlignmentOrder {
    SourceFirst,
    DestinationFirst,
}

/// Validation shared by the code memory calls. Returns the target process.
fn check_code_memory_arguments(
    operation: &str,
    current: &Arc<Process>,
    process_handle: Handle,
    dst_address: u64,
    src_address: u64,
    size: u64,
    order: AlignmentOrder,
) -> Result<Arc<Process>> {
    let (first, second) = match order {
        AlignmentOrder::SourceFirst => (("src_address", src_address), ("dst_address", dst_address)),
        AlignmentOrder::DestinationFirst => {
            (("dst_address", dst_address), ("src_address", src_address))
        }
    };
    for (name, address) in [first, second] {
        if !is_page_aligned(address) {
            log::error!("{}: {} is not page-aligned ({:#x})", operation, name, address);
            return Err(Error::InvalidAddress);
        }
    }

    if size == 0 || !is_page_aligned(size) {
        log::error!("{}: size is zero or not page-aligned ({:#x})", operation, size);
        return Err(Error::InvalidSize);
    }
    if overflows(dst_address, size) {
        log::error!(
            "{}: destination address range overflows the address space (dst_address={:#x}, size={:#x})",
            operation,
            dst_address,
            size
        );
        return Err(Error::InvalidCurrentMemory);
    }
    if overflows(src_address, size) {
        log::error!(
            "{}: source address range overflows the address space (src_address={:#x}, size={:#x})",
            operation,
            src_address,
            size
        );
        return Err(Error::InvalidCurrentMemory);
    }

    let Some(process) = current.get_process(process_handle) else {
        log::error!("{}: invalid process handle {:?}", operation, process_handle);
        return Err(Error::InvalidHandle);
    };
    let page_table = process.page_table();

    if !page_table.is_inside_address_space(VirtualAddress::new(src_address), size) {
        log::error!(
            "{}: source address range is not within the address space (src_address={:#x}, size={:#x})",
            operation,
            src_address,
            size
        );
        return Err(Error::InvalidCurrentMemory);
    }
    if !page_table.is_inside_aslr_region(VirtualAddress::new(dst_address), size) {
        log::error!(
            "{}: destination address range is not within the ASLR region (dst_address={:#x}, size={:#x})",
            operation,
            dst_address,
            size
        );
        return Err(Error::InvalidMemoryRegion);
    }

    Ok(process)
}

/// Aliases ordinary memory of a process as code inside its ASLR region.
pub fn map_process_code_memory(
    current: &Arc<Process>,
    process_handle: Handle,
    dst_address: u64,
    src_address: u64,
    size: u64,
) -> Result<()> {
    log::trace!(
        "map_process_code_memory(process={:?}, dst_address={:#x}, src_address={:#x}, size={:#x})",
        process_handle,
        dst_address,
        src_address,
        size
    );

    let process = check_code_memory_arguments(
        "map_process_code_memory",
        current,
        process_handle,
        dst_address,
        src_address,
        size,
        AlignmentOrder::SourceFirst,
    )?;

    process.page_table().map_code_memory(
        VirtualAddress::new(dst_address),
        VirtualAddress::new(src_address),
        size,
    )
}

/// Removes a code alias created by [`map_process_code_memory`].
pub fn unmap_process_code_memory(
    kernel: &Kernel,
    current: &Arc<Process>,
    process_handle: Handle,
    dst_address: u64,
    src_address: u64,
    size: u64,
) -> Result<()> {
    log::trace!(
        "unmap_process_code_memory(process={:?}, dst_address={:#x}, src_address={:#x}, size={:#x})",
        process_handle,
        dst_address,
        src_address,
        size
    );

    let process = check_code_memory_arguments(
        "unmap_process_code_memory",
        current,
        process_handle,
        dst_address,
        src_address,
        size,
        AlignmentOrder::DestinationFirst,
    )?;

    process.page_table().unmap_code_memory(
        VirtualAddress::new(dst_address),
        VirtualAddress::new(src_address),
        size,
        kernel.config().code_unmap_icache_strategy,
    )
}
