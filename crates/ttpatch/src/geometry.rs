//! Translation geometry: how many levels the walk has and where it starts.

use core::fmt;

use crate::PhysicalAddress;
use crate::table::{Level, PAGE_SIZE};

/// Number of levels in the TTBR0 walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelCount {
    /// Walk starts at level 1 (input size 31-39 bits).
    Three,
    /// Walk starts at level 0 (input size 40-48 bits).
    Four,
}

impl LevelCount {
    /// Returns the level the root table sits at.
    #[inline]
    pub const fn start_level(self) -> Level {
        match self {
            LevelCount::Three => Level::One,
            LevelCount::Four => Level::Zero,
        }
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        match self {
            LevelCount::Three => 3,
            LevelCount::Four => 4,
        }
    }

    /// Returns the first input address the walk cannot tell apart from a lower one.
    #[inline]
    pub const fn input_limit(self) -> usize {
        match self {
            LevelCount::Three => 1 << 39,
            LevelCount::Four => 1 << 48,
        }
    }
}

/// Errors decoding the translation registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    /// TG0 selects a 16 KiB or 64 KiB granule.
    UnsupportedGranule(u8),
    /// The input address size is outside 31-48 bits.
    UnsupportedInputSize(u32),
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeometryError::UnsupportedGranule(tg0) => {
                write!(f, "TG0={:#04b} is not the 4 KiB granule", tg0)
            }
            GeometryError::UnsupportedInputSize(bits) => {
                write!(f, "{}-bit input addresses need neither 3 nor 4 levels", bits)
            }
        }
    }
}

/// The shape of the live translation tables, fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationGeometry {
    levels: LevelCount,
    root: PhysicalAddress,
}

impl TranslationGeometry {
    /// TCR_ELx.T0SZ, bits 0-5.
    const T0SZ_MASK: u64 = 0x3F;
    /// TCR_ELx.TG0, bits 14-15.
    const TG0_SHIFT: u64 = 14;
    const TG0_4K: u8 = 0b00;
    /// TTBRn_ELx.BADDR for a 4 KiB aligned root. Drops CnP and the ASID.
    const TTBR_BADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

    /// Creates a geometry from already-decoded values.
    ///
    /// # Panics
    ///
    /// Panics if `root` is not page-aligned.
    pub fn new(levels: LevelCount, root: PhysicalAddress) -> Self {
        assert!(root.is_aligned(PAGE_SIZE), "root table must be page-aligned");
        Self { levels, root }
    }

    /// Decodes the geometry from raw TCR_EL1 and TTBR0_EL1 values.
    pub fn from_registers(tcr: u64, ttbr0: u64) -> Result<Self, GeometryError> {
        let tg0 = ((tcr >> Self::TG0_SHIFT) & 0b11) as u8;
        if tg0 != Self::TG0_4K {
            return Err(GeometryError::UnsupportedGranule(tg0));
        }

        let input_bits = 64 - (tcr & Self::T0SZ_MASK) as u32;
        let levels = match input_bits {
            40..=48 => LevelCount::Four,
            31..=39 => LevelCount::Three,
            other => return Err(GeometryError::UnsupportedInputSize(other)),
        };

        let root = PhysicalAddress::new((ttbr0 & Self::TTBR_BADDR_MASK) as usize);
        Ok(Self::new(levels, root))
    }

    /// Reads TCR_EL1 and TTBR0_EL1 of the running CPU.
    #[cfg(target_arch = "aarch64")]
    pub fn current() -> Result<Self, GeometryError> {
        let (tcr, ttbr0) = crate::arch::read_translation_registers();
        Self::from_registers(tcr, ttbr0)
    }

    #[inline]
    pub fn levels(&self) -> LevelCount {
        self.levels
    }

    /// Returns the physical address of the root table.
    #[inline]
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    pub fn start_level(&self) -> Level {
        self.levels.start_level()
    }

    /// Returns the first input address past what this geometry translates.
    #[inline]
    pub fn input_limit(&self) -> usize {
        self.levels.input_limit()
    }
}
