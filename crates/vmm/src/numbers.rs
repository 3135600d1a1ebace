//! Page and frame number types.
//!
//! Frame numbers index physical frames in a [`FramePool`](crate::FramePool); page numbers key
//! the software translation directory of a [`PageTable`](crate::PageTable).

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::address::{PAGE_BITS, PhysicalAddress, VirtualAddress};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: u64) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
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

impl_page_number_common!(
    FrameNumber,
    "A guest physical frame number (physical address divided by the page size)."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_BITS)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_page_number_common!(
    PageNumber,
    "A guest virtual page number (virtual address divided by the page size)."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 << PAGE_BITS)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn frame_start_address() {
        assert_eq!(FrameNumber::new(3).start().as_u64(), 3 * PAGE_SIZE);
    }

    #[test]
    fn page_round_trip() {
        let page = PageNumber::new(42);
        assert_eq!(PageNumber::from(page.start()), page);
    }

    #[test]
    fn from_unaligned_address() {
        let addr = VirtualAddress::new(PAGE_SIZE * 3 + 10);
        assert_eq!(PageNumber::from(addr).as_u64(), 3);
    }

    #[test]
    fn arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!((frame + 5).as_u64(), 15);
        assert_eq!(FrameNumber::new(10) - FrameNumber::new(3), 7);
        assert!(FrameNumber::new(5) < FrameNumber::new(10));
    }
}
