//! Address types for guest virtual and physical memory.
//!
//! Guest addresses are always 64 bits wide regardless of the host, so these wrappers store a
//! `u64` rather than a `usize`.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, PageNumber};

/// Number of bits in a page offset.
pub const PAGE_BITS: u32 = 12;

/// Size of a guest page in bytes (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_BITS;

/// Returns true if `value` is a multiple of [`PAGE_SIZE`].
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: u64) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Returns true if the address sits on a page boundary.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                is_page_aligned(self.0)
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: u64) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Adds `size` bytes, returning `None` if the result wraps past the end of the
            /// 64-bit address space.
            #[inline]
            pub const fn checked_add(self, size: u64) -> Option<Self> {
                match self.0.checked_add(size) {
                    Some(end) => Some(Self(end)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#018x}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<u64> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: u64) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A guest physical memory address.\n\n\
     Physical addresses name frames handed out by a [`FrameProvider`](crate::FrameProvider)."
);

impl PhysicalAddress {
    /// Returns the frame containing this physical address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> PAGE_BITS)
    }
}

impl_address_common!(
    VirtualAddress,
    "A guest virtual memory address.\n\n\
     Virtual addresses are private to one process's [`PageTable`](crate::PageTable)."
);

impl VirtualAddress {
    /// Returns the page containing this virtual address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 >> PAGE_BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE));
        assert!(!is_page_aligned(PAGE_SIZE + 1));
        assert!(!is_page_aligned(0x800));

        assert!(VirtualAddress::new(0x1000).is_page_aligned());
        assert!(!VirtualAddress::new(0x1001).is_page_aligned());
    }

    #[test]
    fn align_down() {
        let addr = VirtualAddress::new(0x1234);
        assert_eq!(addr.align_down(PAGE_SIZE).as_u64(), 0x1000);
        assert_eq!(addr.align_down(0x10).as_u64(), 0x1230);
    }

    #[test]
    fn checked_add_detects_wrap() {
        let addr = VirtualAddress::new(u64::MAX - 0xFFF);
        assert_eq!(addr.checked_add(0xFFF), Some(VirtualAddress::new(u64::MAX)));
        assert_eq!(addr.checked_add(0x1000), None);
    }

    #[test]
    fn operators() {
        let a = VirtualAddress::new(0x3000);
        assert_eq!((a + 0x1000).as_u64(), 0x4000);
        assert_eq!((a - 0x1000).as_u64(), 0x2000);
        assert_eq!(a - VirtualAddress::new(0x1000), 0x2000);
        assert!(VirtualAddress::new(0x1000) < a);
    }

    #[test]
    fn page_and_frame_numbers() {
        assert_eq!(VirtualAddress::new(0x5123).page_number(), PageNumber::new(5));
        assert_eq!(PhysicalAddress::new(0x8000_2000).frame_number(), FrameNumber::new(0x80002));
    }

    #[test]
    fn formatting() {
        let addr = PhysicalAddress::new(0x1000);
        assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
        assert_eq!(format!("{}", addr), "0x0000000000001000");
        assert_eq!(format!("{:x}", addr), "1000");
    }
}
