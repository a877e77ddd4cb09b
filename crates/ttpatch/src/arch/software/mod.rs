//! Software emulation of physical memory and cache maintenance.
//!
//! [`EmulatedMemory`] is a sparse physical address space: a page only gets backing
//! storage the first time it is written, so a test can describe a gigabyte scratch
//! region without allocating it. [`RecordingCoherency`] logs every maintenance request
//! instead of issuing it.

use core::cell::Cell;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::PhysicalAddress;
use crate::coherency::Coherency;
use crate::descriptor::Descriptor;
use crate::memory::PhysicalMemory;
use crate::table::{DescriptorRef, ENTRY_COUNT, PAGE_SIZE, TableIndex, TranslationTable};

/// Backing for pages that were never written.
static UNTOUCHED: TranslationTable = TranslationTable::new();

/// A sparse, emulated physical address space holding translation tables.
#[derive(Default)]
pub struct EmulatedMemory {
    pages: BTreeMap<usize, Box<TranslationTable>>,
    reads: Cell<usize>,
    writes: usize,
}

impl EmulatedMemory {
    /// Creates an empty address space. Every page reads as zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of pages that have backing storage.
    pub fn touched_pages(&self) -> usize {
        self.pages.len()
    }

    /// Returns the number of descriptor reads made through [`PhysicalMemory::read`].
    pub fn descriptor_reads(&self) -> usize {
        self.reads.get()
    }

    /// Returns the number of descriptor writes made through [`PhysicalMemory::write`].
    pub fn descriptor_writes(&self) -> usize {
        self.writes
    }

    /// Returns a snapshot of every backed page and its raw descriptors.
    ///
    /// Two snapshots compare equal when no descriptor changed in between.
    pub fn snapshot(&self) -> Vec<(usize, Vec<u64>)> {
        self.pages
            .iter()
            .map(|(&base, table)| {
                let words = (0..ENTRY_COUNT)
                    .map(|i| table.entry(TableIndex::new(i)).as_raw())
                    .collect();
                (base, words)
            })
            .collect()
    }
}

impl PhysicalMemory for EmulatedMemory {
    fn table(&self, address: PhysicalAddress) -> &TranslationTable {
        assert!(
            address.is_aligned(PAGE_SIZE),
            "table must be page-aligned"
        );
        self.pages
            .get(&address.as_usize())
            .map(|table| &**table)
            .unwrap_or(&UNTOUCHED)
    }

    fn table_mut(&mut self, address: PhysicalAddress) -> &mut TranslationTable {
        assert!(
            address.is_aligned(PAGE_SIZE),
            "table must be page-aligned"
        );
        self.pages
            .entry(address.as_usize())
            .or_insert_with(|| Box::new(TranslationTable::new()))
    }

    fn read(&self, slot: DescriptorRef) -> Descriptor {
        self.reads.set(self.reads.get() + 1);
        self.table(slot.table()).entry(slot.index())
    }

    fn write(&mut self, slot: DescriptorRef, descriptor: Descriptor) {
        self.writes += 1;
        *self.table_mut(slot.table()).entry_mut(slot.index()) = descriptor;
    }
}

/// A maintenance request seen by [`RecordingCoherency`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyEvent {
    /// A descriptor write was published.
    Publish(DescriptorRef),
    /// Every cached translation was invalidated.
    InvalidateAll,
}

/// Records maintenance requests in order.
#[derive(Debug, Default)]
pub struct RecordingCoherency {
    events: Vec<CoherencyEvent>,
}

impl RecordingCoherency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every request made so far, oldest first.
    pub fn events(&self) -> &[CoherencyEvent] {
        &self.events
    }

    /// Returns the number of published descriptor writes.
    pub fn publish_count(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, CoherencyEvent::Publish(_)))
            .count()
    }
}

impl Coherency for RecordingCoherency {
    fn publish(&mut self, slot: DescriptorRef) {
        self.events.push(CoherencyEvent::Publish(slot));
    }

    fn invalidate_all(&mut self) {
        self.events.push(CoherencyEvent::InvalidateAll);
    }
}
