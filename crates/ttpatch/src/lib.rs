#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Translation Table Patcher (ttpatch)
//!
//! A one-shot patcher for the AArch64 translation tables a UEFI firmware leaves behind
//! in TTBR0. Before the kernel is entered it:
//!
//! - Makes the identity mapping of every runtime region read/write/executable.
//! - Maps every runtime region at the virtual address the OS asked for.
//! - Builds any missing tables from a scratch region of conventional memory.
//!
//! The walk is generic over [`PhysicalMemory`] and [`Coherency`], so the same code runs
//! on hardware and against the software emulation used by the tests.

#[cfg(any(test, feature = "software-emulation"))]
extern crate alloc;

mod address;
mod arch;
mod coherency;
mod descriptor;
#[cfg(target_arch = "aarch64")]
mod entry;
mod fixup;
mod geometry;
mod memmap;
mod memory;
mod patch;
mod scratch;
mod table;
mod walker;

pub use address::{ADDRESS_BITS, PhysicalAddress, VirtualAddress};
pub use coherency::Coherency;
pub use descriptor::{Descriptor, DescriptorFlags};
pub use fixup::{FixupError, FixupOutcome, FixupStats, find_scratch_region, run};
pub use geometry::{GeometryError, LevelCount, TranslationGeometry};
pub use memmap::{MemoryAttribute, MemoryDescriptor, MemoryMap, MemoryMapError, MemoryType};
pub use memory::{IdentityMemory, PhysicalMemory};
pub use patch::{access_mapping, relaxed};
pub use scratch::{SCRATCH_PAGES_REQUIRED, ScratchArena, ScratchError};
pub use table::{DescriptorRef, ENTRY_COUNT, Level, PAGE_SIZE, TableIndex, TranslationTable};
pub use walker::{LeafResult, Walker};

#[cfg(target_arch = "aarch64")]
pub use arch::{HardwareCoherency, read_translation_registers};
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{CoherencyEvent, EmulatedMemory, RecordingCoherency};
#[cfg(target_arch = "aarch64")]
pub use entry::ttpatch_fixup_runtime_mappings;
