//! Access to translation tables by physical address.
//!
//! The walker never dereferences raw addresses itself. It asks a [`PhysicalMemory`]
//! for the table at an address, which is the firmware's identity map on hardware and
//! an emulated address space under test.

use crate::PhysicalAddress;
use crate::descriptor::Descriptor;
use crate::table::{DescriptorRef, PAGE_SIZE, TranslationTable};

/// Provides the translation tables living in physical memory.
pub trait PhysicalMemory {
    /// Returns the table stored in the page at `address`.
    fn table(&self, address: PhysicalAddress) -> &TranslationTable;

    /// Returns the table stored in the page at `address` for modification.
    fn table_mut(&mut self, address: PhysicalAddress) -> &mut TranslationTable;

    /// Reads the descriptor `slot` refers to.
    fn read(&self, slot: DescriptorRef) -> Descriptor {
        self.table(slot.table()).entry(slot.index())
    }

    /// Overwrites the descriptor `slot` refers to.
    ///
    /// This is a plain store. Callers that touch live tables publish the write
    /// through [`Coherency`](crate::Coherency) afterwards.
    fn write(&mut self, slot: DescriptorRef, descriptor: Descriptor) {
        *self.table_mut(slot.table()).entry_mut(slot.index()) = descriptor;
    }
}

/// Physical memory seen through the firmware's 1:1 mapping.
///
/// UEFI on AArch64 runs with TTBR0 identity-mapping all of memory, so a physical
/// address is directly usable as a pointer.
pub struct IdentityMemory {
    _private: (),
}

impl IdentityMemory {
    /// Creates an accessor for identity-mapped physical memory.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that:
    /// - every physical address handed to this accessor is mapped 1:1 and writable,
    /// - no other code reads or writes the translation tables while it is in use,
    /// - the pages it is asked for really hold translation tables (or scratch memory
    ///   about to become one).
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PhysicalMemory for IdentityMemory {
    fn table(&self, address: PhysicalAddress) -> &TranslationTable {
        debug_assert!(address.is_aligned(PAGE_SIZE), "table must be page-aligned");
        // SAFETY: The constructor's contract guarantees the page is identity-mapped
        // and holds a table nobody else is mutating.
        unsafe { &*(address.as_usize() as *const TranslationTable) }
    }

    fn table_mut(&mut self, address: PhysicalAddress) -> &mut TranslationTable {
        debug_assert!(address.is_aligned(PAGE_SIZE), "table must be page-aligned");
        // SAFETY: As above; `&mut self` keeps this the only live reference we hand out.
        unsafe { &mut *(address.as_usize() as *mut TranslationTable) }
    }

    fn write(&mut self, slot: DescriptorRef, descriptor: Descriptor) {
        let ptr = slot.address().as_usize() as *mut Descriptor;
        // SAFETY: `slot` lies inside a table page covered by the constructor's contract.
        // Volatile: the hardware table walker reads this word.
        unsafe { ptr.write_volatile(descriptor) }
    }
}
