#![cfg_attr(not(test), no_std)]

//! Supervisor calls operating on guest process memory.
//!
//! This crate is the guest-facing surface over [`vmm`]: it owns the kernel-wide resources
//! ([`Kernel`]), processes and their handle tables, and the five process memory calls. Every
//! call takes raw guest arguments, validates them in the order the guest kernel does and
//! returns a [`Result`] that converts into the raw [`ResultCode`] handed back to the guest.

extern crate alloc;

mod handle_table;
mod kernel;
mod process;
mod process_memory;

pub use handle_table::{Handle, HandleTable, KernelObject, MAX_HANDLES};
pub use kernel::{Kernel, KernelConfig};
pub use process::Process;
pub use process_memory::{
    map_process_code_memory, map_process_memory, set_process_memory_permission,
    unmap_process_code_memory, unmap_process_memory,
};

pub use vmm::{Error, Result, ResultCode};
