//! Rewriting resolved level 3 descriptors.

use crate::PhysicalAddress;
use crate::coherency::Coherency;
use crate::descriptor::{Descriptor, DescriptorFlags};
use crate::memory::PhysicalMemory;
use crate::table::DescriptorRef;
use crate::walker::Walker;

/// Returns `descriptor` made read/write/executable at EL1.
///
/// Clears both execute-never bits and the AP[2:1] field. Address, type and every other
/// attribute are preserved, so an invalid descriptor stays invalid.
#[inline]
pub fn relaxed(descriptor: Descriptor) -> Descriptor {
    descriptor.without(DescriptorFlags::RWX_CLEAR)
}

/// Returns a fresh level 3 page descriptor for `page` with the access flag set.
#[inline]
pub fn access_mapping(page: PhysicalAddress) -> Descriptor {
    Descriptor::accessed_page(page)
}

impl<M: PhysicalMemory, C: Coherency> Walker<'_, M, C> {
    /// Relaxes the execute protection of the leaf in `slot` and publishes the result.
    ///
    /// Returns the descriptor as written.
    pub fn relax_execute_protection(&mut self, slot: DescriptorRef) -> Descriptor {
        let descriptor = relaxed(self.read(slot));
        self.store(slot, descriptor);
        descriptor
    }

    /// Points the leaf in `slot` at `page`, replacing whatever was there, and publishes it.
    ///
    /// Returns the descriptor as written.
    pub fn install_access_mapping(
        &mut self,
        slot: DescriptorRef,
        page: PhysicalAddress,
    ) -> Descriptor {
        let descriptor = access_mapping(page);
        self.store(slot, descriptor);
        descriptor
    }
}
