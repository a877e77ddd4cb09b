//! Stage 1 translation descriptors (VMSAv8-64, 4 KiB granule).
//!
//! Bits `[1:0]` select the descriptor kind:
//!
//! | bits | levels 0-2 | level 3  |
//! |------|------------|----------|
//! | `x0` | invalid    | invalid  |
//! | `01` | block      | reserved |
//! | `11` | table      | page     |
//!
//! Bits 12-47 hold the output address (next-level table or mapped memory).

use core::fmt;

use bitflags::bitflags;

use crate::PhysicalAddress;

bitflags! {
    /// Attribute and type bits of a descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u64 {
        /// Descriptor is valid.
        const VALID = 1 << 0;
        /// Table descriptor at levels 0-2, page descriptor at level 3.
        const TABLE = 1 << 1;
        /// MAIR index (AttrIndx, bits 2-4).
        const ATTR_INDEX = 0b111 << 2;
        /// Non-secure.
        const NS = 1 << 5;
        /// AP[1]: accessible from EL0.
        const AP_EL0 = 1 << 6;
        /// AP[2]: read-only.
        const AP_READ_ONLY = 1 << 7;
        /// Shareability (bits 8-9).
        const SHAREABILITY = 0b11 << 8;
        /// Access flag. Without it the first access faults.
        const AF = 1 << 10;
        /// Not global.
        const NG = 1 << 11;
        /// Privileged execute-never.
        const PXN = 1 << 53;
        /// Unprivileged execute-never.
        const UXN = 1 << 54;
    }
}

impl DescriptorFlags {
    /// Both execute-deny bits.
    pub const EXECUTE_NEVER: DescriptorFlags = DescriptorFlags::PXN.union(DescriptorFlags::UXN);

    /// The AP[2:1] access-permission field.
    pub const ACCESS_PERMISSIONS: DescriptorFlags =
        DescriptorFlags::AP_EL0.union(DescriptorFlags::AP_READ_ONLY);

    /// Bits cleared to make a mapping read/write/execute at EL1
    /// (`0x0060_0000_0000_00C0`).
    pub const RWX_CLEAR: DescriptorFlags =
        DescriptorFlags::EXECUTE_NEVER.union(DescriptorFlags::ACCESS_PERMISSIONS);

    /// Type bits of a next-level table descriptor.
    pub const NEXT_TABLE: DescriptorFlags = DescriptorFlags::VALID.union(DescriptorFlags::TABLE);

    /// A level 3 page with the access flag pre-set, normal memory at MAIR index 0,
    /// read/write at EL1 (`0x403`).
    pub const ACCESSED_PAGE: DescriptorFlags = DescriptorFlags::VALID
        .union(DescriptorFlags::TABLE)
        .union(DescriptorFlags::AF);
}

/// A single 64-bit translation descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Descriptor(u64);

impl Descriptor {
    /// Output address mask (bits 12-47).
    pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// The all-zero, invalid descriptor.
    pub const INVALID: Descriptor = Descriptor(0);

    /// Creates a descriptor from an output address and attribute bits.
    ///
    /// The address must be page-aligned.
    #[inline]
    pub fn new(address: PhysicalAddress, flags: DescriptorFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "output address must be page-aligned"
        );
        Self((address.as_u64() & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Creates a table descriptor pointing at the next-level table at `table`.
    #[inline]
    pub fn table(table: PhysicalAddress) -> Self {
        Self::new(table, DescriptorFlags::NEXT_TABLE)
    }

    /// Creates a level 3 page descriptor for `page` with the access flag set.
    #[inline]
    pub fn accessed_page(page: PhysicalAddress) -> Self {
        Self::new(page, DescriptorFlags::ACCESSED_PAGE)
    }

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & DescriptorFlags::VALID.bits() != 0
    }

    /// Returns whether this is a valid table descriptor (levels 0-2) or page (level 3).
    #[inline]
    pub const fn is_table(self) -> bool {
        self.0 & DescriptorFlags::NEXT_TABLE.bits() == DescriptorFlags::NEXT_TABLE.bits()
    }

    /// Returns whether this is a valid block descriptor.
    ///
    /// Only meaningful above level 3, where the same encoding is reserved.
    #[inline]
    pub const fn is_block(self) -> bool {
        self.is_valid() && !self.is_table()
    }

    /// Returns the output address, whatever the valid bit says.
    #[inline]
    pub fn address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize)
    }

    /// Returns the known attribute bits. Software-defined and reserved bits are dropped.
    #[inline]
    pub fn flags(self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.0)
    }

    /// Returns whether every bit in `flags` is set.
    #[inline]
    pub fn contains(self, flags: DescriptorFlags) -> bool {
        self.0 & flags.bits() == flags.bits()
    }

    /// Returns a copy with the bits in `flags` cleared. Every other bit is preserved.
    #[inline]
    #[must_use]
    pub const fn without(self, flags: DescriptorFlags) -> Self {
        Self(self.0 & !flags.bits())
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Descriptor({:#018x})", self.0)
    }
}
