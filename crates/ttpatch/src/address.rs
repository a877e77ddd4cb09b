//! Address types for the firmware's physical and input (virtual) address spaces.
//!
//! Both wrappers are limited to the 48-bit range a TTBR0 descriptor can express.
//! Firmware runs with a 1:1 mapping, so a physical address can always be reinterpreted
//! as the input address that reaches it through the identity map.

use core::fmt;
use core::ops::{Add, Sub};

use crate::table::{Level, TableIndex};

/// Number of address bits a descriptor can carry (output address bits 12-47).
pub const ADDRESS_BITS: usize = 48;

/// First address past the 48-bit range.
pub(crate) const ADDRESS_LIMIT: usize = 1 << ADDRESS_BITS;

const MAX_ADDRESS: usize = ADDRESS_LIMIT - 1;

macro_rules! impl_address_common {
    ($name:ident, $doc:expr, $what:literal) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address does not fit in 48 bits.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!(addr <= MAX_ADDRESS, concat!($what, " exceeds 48 bits"));
                Self(addr)
            }

            /// Creates a new address, or `None` if it does not fit in 48 bits.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if addr <= MAX_ADDRESS {
                    Some(Self(addr))
                } else {
                    None
                }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Returns the raw address value as a 64-bit word.
            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Returns the 9-bit table index this address selects at `level`.
            #[inline]
            pub const fn table_index(self, level: Level) -> TableIndex {
                TableIndex::of(self.0, level)
            }

            /// Adds `offset` bytes, or returns `None` if the result leaves the 48-bit range.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Self::try_new(addr),
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
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(addr: $name) -> u64 {
                addr.as_u64()
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Used for table locations, scratch pages and the output address of descriptors.",
    "physical address"
);

impl_address_common!(
    VirtualAddress,
    "An input address translated through TTBR0.\n\n\
     Walks always start from one of these; physical addresses are walked through\n\
     [`VirtualAddress::identity_mapped`].",
    "virtual address"
);

impl VirtualAddress {
    /// Returns the input address that reaches `phys` through the firmware's 1:1 mapping.
    #[inline]
    pub const fn identity_mapped(phys: PhysicalAddress) -> Self {
        Self(phys.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_max_valid_address() {
            let addr = PhysicalAddress::new(MAX_ADDRESS);
            assert_eq!(addr.as_usize(), 0xFFFF_FFFF_FFFF);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds 48 bits")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1 << ADDRESS_BITS);
        }

        #[test]
        fn try_new_rejects_wide_addresses() {
            assert_eq!(PhysicalAddress::try_new(1 << ADDRESS_BITS), None);
            assert_eq!(
                PhysicalAddress::try_new(0x1000),
                Some(PhysicalAddress::new(0x1000))
            );
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(0x4000_1234);
            assert!(!addr.is_aligned(4096));
            assert_eq!(addr.align_down(4096), PhysicalAddress::new(0x4000_1000));
            assert!(addr.align_down(4096).is_aligned(4096));
        }

        #[test]
        fn checked_add_stops_at_top_of_range() {
            let top = PhysicalAddress::new(MAX_ADDRESS - 0xFFF);
            assert_eq!(top.checked_add(0x1000), None);
            assert_eq!(
                top.checked_add(0xFFF),
                Some(PhysicalAddress::new(MAX_ADDRESS))
            );
        }

        #[test]
        fn display_and_debug() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(format!("{}", addr), "0x1000");
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x1000)");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        #[should_panic(expected = "virtual address exceeds 48 bits")]
        fn upper_range_is_rejected() {
            VirtualAddress::new(0xFFFF_8000_0000_0000);
        }

        #[test]
        fn identity_mapping_keeps_the_value() {
            let phys = PhysicalAddress::new(0x8_0000_1000);
            assert_eq!(VirtualAddress::identity_mapped(phys).as_usize(), 0x8_0000_1000);
        }

        #[test]
        fn table_indices_follow_level_bit_ranges() {
            // 0b1_0000_0001 in every 9-bit field plus a page offset.
            let addr = VirtualAddress::new(
                (0x101 << 39) | (0x102 << 30) | (0x103 << 21) | (0x104 << 12) | 0x123,
            );
            assert_eq!(addr.table_index(Level::Zero).as_usize(), 0x101);
            assert_eq!(addr.table_index(Level::One).as_usize(), 0x102);
            assert_eq!(addr.table_index(Level::Two).as_usize(), 0x103);
            assert_eq!(addr.table_index(Level::Three).as_usize(), 0x104);
        }
    }
}
