//! Result codes reported to the guest.

use core::fmt;

/// Module identifier of kernel result codes.
const KERNEL_MODULE: u32 = 1;

/// Errors reported by address-space operations.
///
/// Each variant maps onto one guest-visible kernel result code. Validation chains return the
/// first failing check, so the variant a caller sees is part of the guest ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// The size is misaligned, zero, or otherwise nonsensical.
    InvalidSize,
    /// The address is misaligned or nonsensical.
    InvalidAddress,
    /// The block info pool is exhausted.
    OutOfResource,
    /// The frame provider has no free frames left.
    OutOfMemory,
    /// The handle table has no free slots left.
    OutOfHandles,
    /// The current state or backing of the range does not allow the operation.
    InvalidCurrentMemory,
    /// The requested permission is not one of the allowed values.
    InvalidNewMemoryPermission,
    /// The range lies outside the region class the operation requires.
    InvalidMemoryRegion,
    /// The handle does not resolve to a live object of the required type.
    InvalidHandle,
}

impl Error {
    /// Returns the description field of the kernel result code.
    pub const fn description(self) -> u32 {
        match self {
            Self::InvalidSize => 101,
            Self::InvalidAddress => 102,
            Self::OutOfResource => 103,
            Self::OutOfMemory => 104,
            Self::OutOfHandles => 105,
            Self::InvalidCurrentMemory => 106,
            Self::InvalidNewMemoryPermission => 108,
            Self::InvalidMemoryRegion => 110,
            Self::InvalidHandle => 114,
        }
    }

    /// Returns the raw result code for this error.
    pub const fn code(self) -> ResultCode {
        ResultCode::new(KERNEL_MODULE, self.description())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSize => write!(f, "invalid size"),
            Self::InvalidAddress => write!(f, "invalid address"),
            Self::OutOfResource => write!(f, "out of block info resources"),
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::OutOfHandles => write!(f, "out of handles"),
            Self::InvalidCurrentMemory => write!(f, "invalid current memory"),
            Self::InvalidNewMemoryPermission => write!(f, "invalid new memory permission"),
            Self::InvalidMemoryRegion => write!(f, "invalid memory region"),
            Self::InvalidHandle => write!(f, "invalid handle"),
        }
    }
}

impl core::error::Error for Error {}

/// Result alias for address-space operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A raw guest result code: the module in the low 9 bits, the description above it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ResultCode(u32);

impl ResultCode {
    /// The success code.
    pub const SUCCESS: Self = Self(0);

    /// Builds a result code from its module and description.
    pub const fn new(module: u32, description: u32) -> Self {
        Self((module & 0x1FF) | ((description & 0x1FFF) << 9))
    }

    /// Returns the raw value handed back to the guest.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true if this is the success code.
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl<T> From<Result<T>> for ResultCode {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(_) => Self::SUCCESS,
            Err(error) => error.code(),
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResultCode({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codes_match_kernel_values() {
        assert_eq!(Error::InvalidSize.code().raw(), 0xCA01);
        assert_eq!(Error::InvalidAddress.code().raw(), 0xCC01);
        assert_eq!(Error::InvalidCurrentMemory.code().raw(), 0xD401);
        assert_eq!(Error::InvalidNewMemoryPermission.code().raw(), 0xD801);
        assert_eq!(Error::InvalidMemoryRegion.code().raw(), 0xDC01);
        assert_eq!(Error::InvalidHandle.code().raw(), 0xE401);
    }

    #[test]
    fn result_conversion() {
        assert!(ResultCode::from(Ok::<(), Error>(())).is_success());
        assert_eq!(
            ResultCode::from(Err::<(), Error>(Error::InvalidHandle)),
            Error::InvalidHandle.code()
        );
    }

    #[test]
    fn display() {
        assert_eq!(format!("{}", Error::InvalidMemoryRegion), "invalid memory region");
    }
}
