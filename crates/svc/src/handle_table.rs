//! Per-process handle tables.
//!
//! Handles name kernel objects on behalf of a process. A handle packs a slot index in its low
//! 15 bits and the slot's generation above it, so a handle to a closed object never resolves to
//! whatever later reuses the slot.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

use vmm::{Error, Result};

/// Number of bits holding the slot index.
const INDEX_BITS: u32 = 15;
const INDEX_MASK: u32 = (1 << INDEX_BITS) - 1;
/// Generations are kept to 15 bits so real handles never collide with pseudo handles.
const GENERATION_MASK: u32 = (1 << 15) - 1;

/// Largest number of slots a table may have.
pub const MAX_HANDLES: usize = 1 << INDEX_BITS;

/// A kernel object handle as seen by the guest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The invalid handle.
    pub const INVALID: Self = Self(0);
    /// Pseudo handle naming the calling thread.
    pub const CURRENT_THREAD: Self = Self(0xFFFF_8000);
    /// Pseudo handle naming the calling process.
    pub const CURRENT_PROCESS: Self = Self(0xFFFF_8001);

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true for handles that name "the caller" rather than a table slot.
    pub const fn is_pseudo(self) -> bool {
        self.0 == Self::CURRENT_THREAD.0 || self.0 == Self::CURRENT_PROCESS.0
    }

    const fn new(index: u32, generation: u32) -> Self {
        Self((generation << INDEX_BITS) | index)
    }

    const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    const fn generation(self) -> u32 {
        self.0 >> INDEX_BITS
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:#x})", self.0)
    }
}

/// A kernel object stored in a handle table.
pub type KernelObject = Arc<dyn Any + Send + Sync>;

#[derive(Default)]
struct Slot {
    generation: u32,
    object: Option<KernelObject>,
}

/// Generational slot storage for the handles of one process.
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    capacity: usize,
    next_generation: u32,
}

impl HandleTable {
    /// Creates an empty table holding at most `capacity` handles.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`MAX_HANDLES`].
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= MAX_HANDLES, "handle table capacity {capacity} too large");
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            next_generation: 1,
        }
    }

    /// Stores `object` and returns a fresh handle to it.
    pub fn add(&mut self, object: KernelObject) -> Result<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
            None => {
                log::error!("handle table full ({} handles)", self.capacity);
                return Err(Error::OutOfHandles);
            }
        };

        let generation = self.next_generation;
        self.next_generation = (self.next_generation % GENERATION_MASK) + 1;

        let slot = &mut self.slots[index as usize];
        slot.generation = generation;
        slot.object = Some(object);
        Ok(Handle::new(index, generation))
    }

    /// Closes `handle`. Returns false if it did not name a live object.
    pub fn remove(&mut self, handle: Handle) -> bool {
        let Some(slot) = self.slot_mut(handle) else {
            return false;
        };
        slot.object = None;
        self.free.push(handle.index() as u32);
        true
    }

    /// Returns the object behind `handle`, whatever its type.
    pub fn get(&self, handle: Handle) -> Option<KernelObject> {
        if handle.is_pseudo() {
            return None;
        }
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.object.clone()
    }

    /// Returns the object behind `handle` if it is a `T`.
    pub fn get_object<T: Any + Send + Sync>(&self, handle: Handle) -> Option<Arc<T>> {
        self.get(handle)?.downcast::<T>().ok()
    }

    /// Returns the number of live handles.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_mut(&mut self, handle: Handle) -> Option<&mut Slot> {
        if handle.is_pseudo() {
            return None;
        }
        let slot = self.slots.get_mut(handle.index())?;
        (slot.generation == handle.generation() && slot.object.is_some()).then_some(slot)
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
