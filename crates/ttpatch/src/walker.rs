//! Walking the live translation tables.
//!
//! [`Walker::resolve`] follows an input address from the root table down to its level 3
//! descriptor, allocating any missing intermediate table from the scratch arena. A
//! valid block descriptor part way down ends the walk early: the address is already
//! mapped at a coarser granularity and there is no level 3 slot to return.

use crate::VirtualAddress;
use crate::coherency::Coherency;
use crate::descriptor::Descriptor;
use crate::geometry::TranslationGeometry;
use crate::memory::PhysicalMemory;
use crate::scratch::{ScratchArena, ScratchError};
use crate::table::{DescriptorRef, Level};

/// Where a walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafResult {
    /// The level 3 slot for the address.
    Leaf(DescriptorRef),
    /// A block descriptor at `Level` already maps the address.
    BlockFound(DescriptorRef, Level),
}

impl LeafResult {
    /// Returns the slot the walk ended on.
    pub fn slot(self) -> DescriptorRef {
        match self {
            LeafResult::Leaf(slot) | LeafResult::BlockFound(slot, _) => slot,
        }
    }

    /// Returns the level 3 slot, or `None` if a block was found.
    pub fn leaf(self) -> Option<DescriptorRef> {
        match self {
            LeafResult::Leaf(slot) => Some(slot),
            LeafResult::BlockFound(..) => None,
        }
    }
}

/// Walks and edits the tables of one [`TranslationGeometry`].
///
/// The walker is the only path through which descriptors are written, and every write
/// goes through [`Walker::store`], which publishes it before returning.
pub struct Walker<'a, M: PhysicalMemory, C: Coherency> {
    geometry: TranslationGeometry,
    memory: &'a mut M,
    coherency: &'a mut C,
}

impl<'a, M: PhysicalMemory, C: Coherency> Walker<'a, M, C> {
    pub fn new(geometry: TranslationGeometry, memory: &'a mut M, coherency: &'a mut C) -> Self {
        Self {
            geometry,
            memory,
            coherency,
        }
    }

    /// Resolves `address` to its level 3 slot, creating intermediate tables as needed.
    ///
    /// Dereferences at most one table per level of the geometry. Only the index bits of
    /// each level are used, so `address` must lie below
    /// [`TranslationGeometry::input_limit`]. The only failure is running out of scratch
    /// pages while creating a table.
    pub fn resolve(
        &mut self,
        address: VirtualAddress,
        scratch: &mut ScratchArena,
    ) -> Result<LeafResult, ScratchError> {
        let mut table = self.geometry.root();
        let mut level = self.geometry.start_level();

        while let Some(next) = level.next() {
            let slot = DescriptorRef::new(table, address.table_index(level));
            let descriptor = self.memory.read(slot);

            if descriptor.is_table() {
                table = descriptor.address();
            } else if descriptor.is_block() {
                log::debug!("{} is mapped by a {} block at {:?}", address, level, slot);
                return Ok(LeafResult::BlockFound(slot, level));
            } else {
                let new_table = scratch.allocate(&mut *self.memory)?;
                self.store(slot, Descriptor::table(new_table));
                log::trace!("created {} table at {} for {}", next, new_table, address);
                table = new_table;
            }

            level = next;
        }

        Ok(LeafResult::Leaf(DescriptorRef::new(
            table,
            address.table_index(Level::Three),
        )))
    }

    /// Resolves `address` without creating anything.
    ///
    /// Returns `None` when an intermediate table is missing.
    pub fn lookup(&self, address: VirtualAddress) -> Option<LeafResult> {
        let mut table = self.geometry.root();
        let mut level = self.geometry.start_level();

        while let Some(next) = level.next() {
            let slot = DescriptorRef::new(table, address.table_index(level));
            let descriptor = self.memory.read(slot);

            if descriptor.is_table() {
                table = descriptor.address();
            } else if descriptor.is_block() {
                return Some(LeafResult::BlockFound(slot, level));
            } else {
                return None;
            }

            level = next;
        }

        Some(LeafResult::Leaf(DescriptorRef::new(
            table,
            address.table_index(Level::Three),
        )))
    }

    /// Reads the descriptor in `slot`.
    pub fn read(&self, slot: DescriptorRef) -> Descriptor {
        self.memory.read(slot)
    }

    /// Writes `descriptor` into `slot` and publishes the write.
    pub fn store(&mut self, slot: DescriptorRef, descriptor: Descriptor) {
        self.memory.write(slot, descriptor);
        self.coherency.publish(slot);
    }

    /// Invalidates every cached translation.
    pub fn invalidate_all(&mut self) {
        self.coherency.invalidate_all();
    }
}
