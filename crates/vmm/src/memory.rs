//! Memory block metadata: states, permissions and attributes.

use core::fmt;

use bitflags::bitflags;

use crate::{PAGE_SIZE, VirtualAddress};

bitflags! {
    /// Capabilities carried by a [`MemoryState`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryStateFlags: u32 {
        /// Pages may be reprotected by the owning process.
        const CAN_REPROTECT = 1 << 8;
        /// Pages may be sent over IPC.
        const CAN_USE_IPC = 1 << 10;
        /// Pages are backed by physical frames.
        const MAPPED = 1 << 13;
        /// Pages hold executable code.
        const CODE = 1 << 14;
        /// Pages may be aliased inside the same process.
        const CAN_ALIAS = 1 << 15;
        /// Pages may be the destination of a code alias.
        const CAN_CODE_ALIAS = 1 << 16;
        /// Pages hold a frame reference for as long as they are mapped.
        const REFERENCE_COUNTED = 1 << 22;
        /// Pages may be mapped into another process.
        const CAN_MAP_PROCESS = 1 << 23;
        /// Pages may have their attributes changed.
        const CAN_CHANGE_ATTRIBUTE = 1 << 24;
        /// Pages may be lent out as the source of a code alias.
        const CAN_CODE_MEMORY = 1 << 25;

        const DATA = Self::CAN_REPROTECT.bits()
            | Self::CAN_USE_IPC.bits()
            | Self::MAPPED.bits()
            | Self::CAN_ALIAS.bits()
            | Self::REFERENCE_COUNTED.bits()
            | Self::CAN_CHANGE_ATTRIBUTE.bits();

        const CODE_FLAGS = Self::CAN_USE_IPC.bits()
            | Self::MAPPED.bits()
            | Self::CODE.bits()
            | Self::REFERENCE_COUNTED.bits();
    }
}

/// The role a block of memory plays in its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryState {
    /// Unused address space.
    Free = 0x00,
    /// Executable code of a loaded module.
    Code = 0x03,
    /// Writable data of a loaded module.
    CodeData = 0x04,
    /// Ordinary process memory.
    Normal = 0x05,
    /// Memory handed out by the process heap.
    Heap = 0x06,
    /// Shared memory mapped from a shared-memory object.
    Shared = 0x07,
    /// Executable alias of another range of the same process.
    AliasCode = 0x08,
    /// Writable alias of another range of the same process.
    AliasCodeData = 0x09,
    /// Thread stack memory.
    Stack = 0x0B,
    /// Memory of another process mapped into this one.
    SharedCode = 0x0F,
}

impl MemoryState {
    /// Returns the capability flags of this state.
    pub const fn flags(self) -> MemoryStateFlags {
        use MemoryStateFlags as F;

        let bits = match self {
            Self::Free => 0,
            Self::Code => F::CODE_FLAGS.bits() | F::CAN_MAP_PROCESS.bits(),
            Self::CodeData => {
                F::DATA.bits() | F::CAN_MAP_PROCESS.bits() | F::CAN_CODE_MEMORY.bits()
            }
            Self::Normal => {
                F::DATA.bits() | F::CAN_MAP_PROCESS.bits() | F::CAN_CODE_MEMORY.bits()
            }
            Self::Heap => F::DATA.bits(),
            Self::Shared => F::MAPPED.bits() | F::REFERENCE_COUNTED.bits(),
            Self::AliasCode => {
                F::CODE_FLAGS.bits() | F::CAN_MAP_PROCESS.bits() | F::CAN_CODE_ALIAS.bits()
            }
            Self::AliasCodeData => {
                F::DATA.bits()
                    | F::CAN_MAP_PROCESS.bits()
                    | F::CAN_CODE_ALIAS.bits()
                    | F::CAN_CODE_MEMORY.bits()
            }
            Self::Stack => {
                F::MAPPED.bits()
                    | F::CAN_USE_IPC.bits()
                    | F::REFERENCE_COUNTED.bits()
                    | F::CAN_CHANGE_ATTRIBUTE.bits()
            }
            Self::SharedCode => {
                F::MAPPED.bits() | F::REFERENCE_COUNTED.bits() | F::CAN_USE_IPC.bits()
            }
        };
        MemoryStateFlags::from_bits_retain(bits)
    }

    /// Returns true if the state carries every flag in `flags`.
    #[inline]
    pub const fn has(self, flags: MemoryStateFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Returns true if the owning process may change the permission of blocks in this state
    /// through `SetProcessMemoryPermission`.
    pub const fn can_set_process_permission(self) -> bool {
        matches!(
            self,
            Self::Normal | Self::Code | Self::CodeData | Self::AliasCode | Self::AliasCodeData
        )
    }

    /// Returns the state a block moves to when its permission changes to `permission`.
    ///
    /// Executable states become their data counterpart once they are made writable.
    pub const fn after_reprotect(self, permission: KernelPermission) -> Self {
        if !permission.contains(KernelPermission::USER_WRITE) {
            return self;
        }
        match self {
            Self::Code => Self::CodeData,
            Self::AliasCode => Self::AliasCodeData,
            other => other,
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A permission requested by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MemoryPermission {
    None = 0,
    Read = 1,
    ReadWrite = 3,
    ReadExecute = 5,
}

impl MemoryPermission {
    /// Parses a raw guest permission value, accepting only the four values a process may
    /// apply to its own memory.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Read),
            3 => Some(Self::ReadWrite),
            5 => Some(Self::ReadExecute),
            _ => None,
        }
    }

    /// Converts the guest permission into the permission stored on memory blocks.
    ///
    /// The kernel may always read user memory; memory with no user permission is marked
    /// not-mapped.
    pub const fn to_kernel(self) -> KernelPermission {
        match self {
            Self::None => KernelPermission::KERNEL_READ.union(KernelPermission::NOT_MAPPED),
            Self::Read => KernelPermission::USER_READ,
            Self::ReadWrite => KernelPermission::USER_READ_WRITE,
            Self::ReadExecute => KernelPermission::USER_READ_EXECUTE,
        }
    }
}

bitflags! {
    /// Permission bits stored on a memory block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct KernelPermission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const KERNEL_READ = 1 << 3;
        const KERNEL_WRITE = 1 << 4;
        const KERNEL_EXECUTE = 1 << 5;
        const NOT_MAPPED = 1 << 6;

        const USER_MASK = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
        const USER_READ = Self::READ.bits() | Self::KERNEL_READ.bits();
        const USER_WRITE = Self::WRITE.bits() | Self::KERNEL_WRITE.bits();
        const USER_EXECUTE = Self::EXECUTE.bits();
        const USER_READ_WRITE = Self::USER_READ.bits() | Self::USER_WRITE.bits();
        const USER_READ_EXECUTE = Self::USER_READ.bits() | Self::USER_EXECUTE.bits();
    }
}

impl KernelPermission {
    /// Returns the permission as seen by the guest, or `None` if the user bits do not form one
    /// of the guest permission values.
    pub const fn to_user(self) -> Option<MemoryPermission> {
        MemoryPermission::from_raw((self.bits() & Self::USER_MASK.bits()) as u32)
    }

    /// Returns true if user code may execute these pages.
    #[inline]
    pub const fn is_user_executable(self) -> bool {
        self.contains(Self::USER_EXECUTE)
    }
}

bitflags! {
    /// Attributes layered on top of a block's state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryAttribute: u8 {
        /// The block is lent out and may not be changed independently.
        const LOCKED = 1 << 0;
        /// The block is locked by an in-flight IPC transfer.
        const IPC_LOCKED = 1 << 1;
        /// The block is shared with a device.
        const DEVICE_SHARED = 1 << 2;
        /// The block is mapped uncached.
        const UNCACHED = 1 << 3;
    }
}

/// A maximal run of pages with uniform metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryBlock {
    pub(crate) start: VirtualAddress,
    pub(crate) num_pages: u64,
    pub(crate) state: MemoryState,
    pub(crate) permission: KernelPermission,
    pub(crate) attribute: MemoryAttribute,
    pub(crate) lock_count: u16,
}

impl MemoryBlock {
    /// Creates a block with no attributes set.
    pub const fn new(
        start: VirtualAddress,
        num_pages: u64,
        state: MemoryState,
        permission: KernelPermission,
    ) -> Self {
        Self {
            start,
            num_pages,
            state,
            permission,
            attribute: MemoryAttribute::empty(),
            lock_count: 0,
        }
    }

    /// Returns the first address of the block.
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    /// Returns the address just past the block.
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.start.as_u64() + self.size())
    }

    /// Returns the last address inside the block.
    pub const fn last(&self) -> VirtualAddress {
        VirtualAddress::new(self.end().as_u64() - 1)
    }

    /// Returns the number of pages in the block.
    pub const fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// Returns the size of the block in bytes.
    pub const fn size(&self) -> u64 {
        self.num_pages * PAGE_SIZE
    }

    pub const fn state(&self) -> MemoryState {
        self.state
    }

    pub const fn permission(&self) -> KernelPermission {
        self.permission
    }

    pub const fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    pub const fn lock_count(&self) -> u16 {
        self.lock_count
    }

    /// Returns true if both blocks carry identical metadata and may be merged when adjacent.
    pub fn has_same_properties(&self, other: &MemoryBlock) -> bool {
        self.state == other.state
            && self.permission == other.permission
            && self.attribute == other.attribute
            && self.lock_count == other.lock_count
    }

    /// Returns a guest-visible snapshot of this block.
    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            base_address: self.start,
            size: self.size(),
            state: self.state,
            permission: self.permission.to_user().unwrap_or(MemoryPermission::None),
            attribute: self.attribute,
            lock_count: self.lock_count,
        }
    }
}

/// Snapshot of one block, as returned by [`PageTable::query_memory`](crate::PageTable::query_memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub base_address: VirtualAddress,
    pub size: u64,
    pub state: MemoryState,
    pub permission: MemoryPermission,
    pub attribute: MemoryAttribute,
    pub lock_count: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_from_raw_accepts_only_process_values() {
        assert_eq!(MemoryPermission::from_raw(0), Some(MemoryPermission::None));
        assert_eq!(MemoryPermission::from_raw(1), Some(MemoryPermission::Read));
        assert_eq!(MemoryPermission::from_raw(3), Some(MemoryPermission::ReadWrite));
        assert_eq!(MemoryPermission::from_raw(5), Some(MemoryPermission::ReadExecute));
        for raw in [2, 4, 6, 7, 0x1000_0000, u32::MAX] {
            assert_eq!(MemoryPermission::from_raw(raw), None, "raw {raw:#x}");
        }
    }

    #[test]
    fn kernel_permission_round_trip() {
        for perm in [
            MemoryPermission::None,
            MemoryPermission::Read,
            MemoryPermission::ReadWrite,
            MemoryPermission::ReadExecute,
        ] {
            assert_eq!(perm.to_kernel().to_user(), Some(perm));
        }
        assert!(MemoryPermission::None.to_kernel().contains(KernelPermission::NOT_MAPPED));
    }

    #[test]
    fn state_capabilities() {
        assert!(MemoryState::Normal.has(MemoryStateFlags::CAN_MAP_PROCESS));
        assert!(MemoryState::Normal.has(MemoryStateFlags::CAN_CODE_MEMORY));
        assert!(!MemoryState::Heap.has(MemoryStateFlags::CAN_MAP_PROCESS));
        assert!(MemoryState::AliasCode.has(MemoryStateFlags::CAN_CODE_ALIAS));
        assert!(MemoryState::AliasCode.has(MemoryStateFlags::CODE));
        assert!(!MemoryState::SharedCode.has(MemoryStateFlags::CAN_MAP_PROCESS));
        assert!(MemoryState::Free.flags().is_empty());
    }

    #[test]
    fn reprotect_transitions() {
        let rw = MemoryPermission::ReadWrite.to_kernel();
        let rx = MemoryPermission::ReadExecute.to_kernel();
        assert_eq!(MemoryState::Code.after_reprotect(rw), MemoryState::CodeData);
        assert_eq!(MemoryState::AliasCode.after_reprotect(rw), MemoryState::AliasCodeData);
        assert_eq!(MemoryState::AliasCode.after_reprotect(rx), MemoryState::AliasCode);
        assert_eq!(MemoryState::Normal.after_reprotect(rw), MemoryState::Normal);
    }

    #[test]
    fn permission_eligibility() {
        assert!(MemoryState::Normal.can_set_process_permission());
        assert!(MemoryState::AliasCode.can_set_process_permission());
        assert!(!MemoryState::Free.can_set_process_permission());
        assert!(!MemoryState::Heap.can_set_process_permission());
        assert!(!MemoryState::SharedCode.can_set_process_permission());
    }

    #[test]
    fn block_geometry() {
        let block = MemoryBlock::new(
            VirtualAddress::new(0x1000),
            2,
            MemoryState::Normal,
            KernelPermission::USER_READ,
        );
        assert_eq!(block.end().as_u64(), 0x3000);
        assert_eq!(block.last().as_u64(), 0x2FFF);
        assert_eq!(block.info().permission, MemoryPermission::Read);
    }
}
