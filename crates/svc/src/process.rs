//! Guest processes.

use alloc::sync::Arc;
use core::any::Any;
use core::fmt;

use vmm::{PageTable, Result};

use crate::handle_table::{Handle, HandleTable};

/// A guest process: one address space and one handle table.
pub struct Process {
    id: u64,
    page_table: PageTable,
    handles: spin::Mutex<HandleTable>,
}

impl Process {
    pub fn new(id: u64, page_table: PageTable, handles: HandleTable) -> Self {
        Self {
            id,
            page_table,
            handles: spin::Mutex::new(handles),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn handle_table(&self) -> &spin::Mutex<HandleTable> {
        &self.handles
    }

    /// Adds `object` to this process's handle table.
    pub fn open_handle<T: Any + Send + Sync>(&self, object: Arc<T>) -> Result<Handle> {
        self.handles.lock().add(object)
    }

    pub fn close_handle(&self, handle: Handle) -> bool {
        self.handles.lock().remove(handle)
    }

    /// Resolves `handle` to a process, accepting the current-process pseudo handle.
    pub fn get_process(self: &Arc<Self>, handle: Handle) -> Option<Arc<Process>> {
        if handle == Handle::CURRENT_PROCESS {
            return Some(self.clone());
        }
        self.get_process_without_pseudo_handle(handle)
    }

    /// Resolves `handle` to a process through the handle table only.
    pub fn get_process_without_pseudo_handle(&self, handle: Handle) -> Option<Arc<Process>> {
        self.handles.lock().get_object::<Process>(handle)
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("id", &self.id)
            .field("page_table", &self.page_table)
            .finish_non_exhaustive()
    }
}
