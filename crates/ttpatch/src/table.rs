//! Translation table layout for the 4 KiB granule.
//!
//! A table is one page holding 512 descriptors. Levels are numbered the way the
//! architecture numbers them: level 0 is the top of a 4-level walk and level 3 holds
//! page descriptors.

use core::fmt;

use crate::PhysicalAddress;
use crate::descriptor::Descriptor;

/// Page size in bytes (4 KiB granule).
pub const PAGE_SIZE: usize = 4096;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: usize = 12;

/// Number of descriptors in a translation table.
pub const ENTRY_COUNT: usize = 512;

/// Number of address bits consumed by each level.
const INDEX_BITS: usize = 9;

/// A level in the translation walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    /// Bits 39-47. Only present with 4-level translation.
    Zero,
    /// Bits 30-38.
    One,
    /// Bits 21-29.
    Two,
    /// Bits 12-20. Holds page descriptors.
    Three,
}

impl Level {
    /// Returns the lowest address bit this level indexes with.
    #[inline]
    pub const fn index_shift(self) -> usize {
        PAGE_SHIFT + INDEX_BITS * (3 - self.as_usize())
    }

    /// Returns the architectural level number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        match self {
            Level::Zero => 0,
            Level::One => 1,
            Level::Two => 2,
            Level::Three => 3,
        }
    }

    /// Returns the next level down, or `None` at level 3.
    #[inline]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::Zero => Some(Level::One),
            Level::One => Some(Level::Two),
            Level::Two => Some(Level::Three),
            Level::Three => None,
        }
    }

    /// Returns whether descriptors at this level are always leaves.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Level::Three)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.as_usize())
    }
}

/// A checked index into a [`TranslationTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TableIndex(u16);

impl TableIndex {
    /// Creates an index.
    ///
    /// # Panics
    ///
    /// Panics if `index >= 512`.
    #[inline]
    pub const fn new(index: usize) -> Self {
        assert!(index < ENTRY_COUNT, "table index out of bounds");
        Self(index as u16)
    }

    /// Extracts the index `address` selects at `level`.
    #[inline]
    pub const fn of(address: usize, level: Level) -> Self {
        Self(((address >> level.index_shift()) & (ENTRY_COUNT - 1)) as u16)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Byte offset of the indexed descriptor within its table.
    #[inline]
    pub const fn byte_offset(self) -> usize {
        self.as_usize() * core::mem::size_of::<Descriptor>()
    }
}

/// A page-sized, page-aligned array of 512 descriptors.
#[repr(C, align(4096))]
pub struct TranslationTable {
    entries: [Descriptor; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<TranslationTable>() == PAGE_SIZE);

impl TranslationTable {
    /// Creates a table with every descriptor invalid.
    pub const fn new() -> Self {
        Self {
            entries: [Descriptor::INVALID; ENTRY_COUNT],
        }
    }

    /// Zero-fills every descriptor.
    pub fn zero(&mut self) {
        self.entries.fill(Descriptor::INVALID);
    }

    /// Returns the descriptor at `index` by value.
    #[inline]
    pub fn entry(&self, index: TableIndex) -> Descriptor {
        self.entries[index.as_usize()]
    }

    /// Returns a mutable reference to the descriptor at `index`.
    #[inline]
    pub fn entry_mut(&mut self, index: TableIndex) -> &mut Descriptor {
        &mut self.entries[index.as_usize()]
    }

    /// Returns whether every descriptor is invalid.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| !entry.is_valid())
    }

    /// Returns the number of valid descriptors.
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_valid()).count()
    }
}

impl Default for TranslationTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Locates one descriptor: the table that holds it and its slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRef {
    table: PhysicalAddress,
    index: TableIndex,
}

impl DescriptorRef {
    /// Creates a reference to slot `index` of the table at `table`.
    ///
    /// # Panics
    ///
    /// Panics if `table` is not page-aligned.
    pub fn new(table: PhysicalAddress, index: TableIndex) -> Self {
        assert!(
            table.is_aligned(PAGE_SIZE),
            "translation table must be page-aligned"
        );
        Self { table, index }
    }

    /// Returns the physical address of the table holding the descriptor.
    #[inline]
    pub fn table(self) -> PhysicalAddress {
        self.table
    }

    #[inline]
    pub fn index(self) -> TableIndex {
        self.index
    }

    /// Returns the physical address of the descriptor itself (always 8-byte aligned).
    #[inline]
    pub fn address(self) -> PhysicalAddress {
        self.table + self.index.byte_offset()
    }
}

impl fmt::Debug for DescriptorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DescriptorRef({:#x}[{}])",
            self.table.as_usize(),
            self.index.as_usize()
        )
    }
}
