//! The runtime mapping fixup pass.
//!
//! Firmware on some platforms installs its runtime services with execute-never set on
//! the identity mapping and without the virtual mapping the OS will later ask for.
//! [`run`] patches both in the live TTBR0 tables before the kernel takes over:
//!
//! 1. Pick the first conventional region of at least [`SCRATCH_PAGES_REQUIRED`] pages
//!    as scratch for new tables. Without one, nothing is touched.
//! 2. For every page of every runtime region, make the identity mapping
//!    read/write/executable and point the virtual address at the physical page.
//! 3. Invalidate the TLBs once more.
//!
//! The tables are transient: the kernel rebuilds its own and never reads these again.
//! The scratch region is not checked against the pages holding the live tables.
//!
//! A walk only looks at the index bits of its levels, so an address at or above
//! [`TranslationGeometry::input_limit`] would alias a lower one. Runtime regions
//! reaching that far are skipped.

use core::fmt;

use crate::coherency::Coherency;
use crate::geometry::TranslationGeometry;
use crate::memmap::{MemoryDescriptor, MemoryMap, MemoryType};
use crate::memory::PhysicalMemory;
use crate::scratch::{SCRATCH_PAGES_REQUIRED, ScratchArena, ScratchError};
use crate::table::PAGE_SIZE;
use crate::walker::{LeafResult, Walker};
use crate::{PhysicalAddress, VirtualAddress};

/// Counters collected over one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixupStats {
    /// Table pages taken from the scratch region.
    pub tables_allocated: usize,
    /// Runtime pages processed.
    pub pages_visited: usize,
    /// Identity-mapped leaves made read/write/executable.
    pub leaves_relaxed: usize,
    /// Virtual leaves pointed at their physical page.
    pub leaves_mapped: usize,
    /// Walks that ended on a block descriptor.
    pub blocks_skipped: usize,
    pub regions_patched: usize,
    /// Runtime regions reaching past the input range of the walk.
    pub regions_skipped: usize,
}

/// How a pass ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupOutcome {
    /// Every runtime region was processed.
    Completed(FixupStats),
    /// No conventional region was large enough to hold new tables; nothing was written.
    NoScratchRegion,
}

/// Errors that abort a pass part way through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupError {
    /// The scratch region ran out of pages.
    Scratch(ScratchError),
}

impl From<ScratchError> for FixupError {
    fn from(err: ScratchError) -> Self {
        FixupError::Scratch(err)
    }
}

impl fmt::Display for FixupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixupError::Scratch(err) => write!(f, "cannot create translation table: {}", err),
        }
    }
}

/// Returns an arena over the first conventional region large enough to serve as scratch.
pub fn find_scratch_region(memory_map: &MemoryMap<'_>) -> Option<ScratchArena> {
    memory_map.iter().find_map(|descriptor| {
        if descriptor.memory_type() != MemoryType::CONVENTIONAL
            || descriptor.page_count() < SCRATCH_PAGES_REQUIRED
        {
            return None;
        }
        let base = descriptor.physical_base()?;
        Some(ScratchArena::new(base, descriptor.page_count()))
    })
}

/// Patches the tables described by `geometry` for every runtime region in `runtime_map`.
///
/// Every descriptor write is published through `coherency` as it happens, and a final
/// [`Coherency::invalidate_all`] follows the last region.
pub fn run<M: PhysicalMemory, C: Coherency>(
    memory_map: &MemoryMap<'_>,
    runtime_map: &MemoryMap<'_>,
    geometry: TranslationGeometry,
    memory: &mut M,
    coherency: &mut C,
) -> Result<FixupOutcome, FixupError> {
    let Some(mut scratch) = find_scratch_region(memory_map) else {
        log::warn!(
            "no conventional region of {} pages, leaving runtime mappings alone",
            SCRATCH_PAGES_REQUIRED
        );
        return Ok(FixupOutcome::NoScratchRegion);
    };

    log::info!(
        "using {} pages at {:#x} for translation tables ({}-level, root {})",
        scratch.capacity(),
        scratch.cursor(),
        geometry.levels().as_usize(),
        geometry.root()
    );

    let mut walker = Walker::new(geometry, memory, coherency);
    let mut stats = FixupStats::default();

    for descriptor in runtime_map.iter().filter(MemoryDescriptor::is_runtime) {
        let Some((phys, virt, pages)) = runtime_range(&descriptor, geometry.input_limit()) else {
            log::warn!(
                "skipping runtime region {:#x} -> {:#x} ({} pages): outside the translated range",
                descriptor.physical_start,
                descriptor.virtual_start,
                descriptor.number_of_pages
            );
            stats.regions_skipped += 1;
            continue;
        };

        log::debug!(
            "patching {:?} region {} -> {} ({} pages)",
            descriptor.memory_type(),
            phys,
            virt,
            pages
        );

        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            patch_page(&mut walker, &mut scratch, &mut stats, phys + offset, virt + offset)?;
        }
        stats.regions_patched += 1;
    }

    walker.invalidate_all();

    stats.tables_allocated = scratch.allocated();
    log::info!(
        "runtime mappings patched: {} pages in {} regions, {} tables allocated, {} blocks skipped",
        stats.pages_visited,
        stats.regions_patched,
        stats.tables_allocated,
        stats.blocks_skipped
    );
    Ok(FixupOutcome::Completed(stats))
}

/// Returns the page-aligned bases and page count of a runtime region if both of its
/// ranges end at or below `limit`.
fn runtime_range(
    descriptor: &MemoryDescriptor,
    limit: usize,
) -> Option<(PhysicalAddress, VirtualAddress, usize)> {
    let pages = descriptor.page_count();
    let len = pages.checked_mul(PAGE_SIZE)?;

    let phys = descriptor.physical_base()?;
    let virt = usize::try_from(descriptor.virtual_start)
        .ok()
        .and_then(VirtualAddress::try_new)
        .filter(|virt| virt.is_aligned(PAGE_SIZE))?;

    let fits = |base: usize| base.checked_add(len).is_some_and(|end| end <= limit);
    if fits(phys.as_usize()) && fits(virt.as_usize()) {
        Some((phys, virt, pages))
    } else {
        None
    }
}

fn patch_page<M: PhysicalMemory, C: Coherency>(
    walker: &mut Walker<'_, M, C>,
    scratch: &mut ScratchArena,
    stats: &mut FixupStats,
    phys: PhysicalAddress,
    virt: VirtualAddress,
) -> Result<(), ScratchError> {
    stats.pages_visited += 1;

    match walker.resolve(VirtualAddress::identity_mapped(phys), scratch)? {
        LeafResult::Leaf(slot) => {
            let _written = walker.relax_execute_protection(slot);
            #[cfg(feature = "detailed-logging")]
            log::trace!("relaxed {} at {:?}: {:?}", phys, slot, _written);
            stats.leaves_relaxed += 1;
        }
        LeafResult::BlockFound(..) => stats.blocks_skipped += 1,
    }

    match walker.resolve(virt, scratch)? {
        LeafResult::Leaf(slot) => {
            let _written = walker.install_access_mapping(slot, phys);
            #[cfg(feature = "detailed-logging")]
            log::trace!("mapped {} -> {} at {:?}: {:?}", virt, phys, slot, _written);
            stats.leaves_mapped += 1;
        }
        LeafResult::BlockFound(..) => stats.blocks_skipped += 1,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{CoherencyEvent, EmulatedMemory, RecordingCoherency};
    use crate::descriptor::{Descriptor, DescriptorFlags};
    use crate::geometry::LevelCount;
    use crate::memmap::MemoryAttribute;
    use crate::table::{DescriptorRef, Level, TableIndex};

    const ROOT: usize = 0x4000_0000;
    const SCRATCH: u64 = 0x1_0000_0000;

    fn free_region(pages: usize) -> MemoryDescriptor {
        MemoryDescriptor::new(
            MemoryType::CONVENTIONAL,
            SCRATCH,
            0,
            pages as u64,
            MemoryAttribute::WB,
        )
    }

    fn runtime_region(phys: u64, virt: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor::new(
            MemoryType::RUNTIME_SERVICES_CODE,
            phys,
            virt,
            pages,
            MemoryAttribute::RUNTIME | MemoryAttribute::WB,
        )
    }

    fn geometry() -> TranslationGeometry {
        TranslationGeometry::new(LevelCount::Four, PhysicalAddress::new(ROOT))
    }

    /// Builds a 4-level chain for `address` from fixed table pages and stores `leaf` in
    /// its level 3 slot.
    fn premap(memory: &mut EmulatedMemory, address: usize, leaf: Descriptor) -> DescriptorRef {
        let tables = [ROOT, 0x4000_1000, 0x4000_2000, 0x4000_3000];
        for (i, level) in [Level::Zero, Level::One, Level::Two].into_iter().enumerate() {
            let slot = DescriptorRef::new(
                PhysicalAddress::new(tables[i]),
                TableIndex::of(address, level),
            );
            memory.write(slot, Descriptor::table(PhysicalAddress::new(tables[i + 1])));
        }
        let slot = DescriptorRef::new(
            PhysicalAddress::new(tables[3]),
            TableIndex::of(address, Level::Three),
        );
        memory.write(slot, leaf);
        slot
    }

    fn completed(outcome: FixupOutcome) -> FixupStats {
        match outcome {
            FixupOutcome::Completed(stats) => stats,
            FixupOutcome::NoScratchRegion => panic!("expected the pass to run"),
        }
    }

    #[test]
    fn scenario_single_runtime_page() {
        let mut memory = EmulatedMemory::new();
        // Read-only, PXN | UXN page mapping 0x1000 to itself.
        let phys_leaf = premap(
            &mut memory,
            0x1000,
            Descriptor::from_raw(0x0060_0000_0000_1000 | 0x4C3),
        );
        let writes_before = memory.descriptor_writes();

        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let runtime = [runtime_region(0x1000, 0x8000_0000, 1)];
        let mut coherency = RecordingCoherency::new();

        let stats = completed(
            run(
                &MemoryMap::from_descriptors(&free),
                &MemoryMap::from_descriptors(&runtime),
                geometry(),
                &mut memory,
                &mut coherency,
            )
            .unwrap(),
        );

        assert!(stats.tables_allocated <= 4);
        let relaxed = memory.read(phys_leaf);
        assert!(!relaxed.contains(DescriptorFlags::PXN));
        assert!(!relaxed.contains(DescriptorFlags::UXN));
        assert_eq!(relaxed.address(), PhysicalAddress::new(0x1000));

        let mut idle = RecordingCoherency::new();
        let walker = Walker::new(geometry(), &mut memory, &mut idle);
        let virt_leaf = walker
            .lookup(VirtualAddress::new(0x8000_0000))
            .and_then(LeafResult::leaf)
            .unwrap();
        assert_eq!(walker.read(virt_leaf).as_raw(), 0x1000 | 0x403);

        assert_eq!(stats.leaves_relaxed, 1);
        assert_eq!(stats.leaves_mapped, 1);
        // Relax + install + one table per level created under the shared root.
        assert_eq!(
            memory.descriptor_writes() - writes_before,
            2 + stats.tables_allocated
        );
        assert_eq!(coherency.events().last(), Some(&CoherencyEvent::InvalidateAll));
    }

    #[test]
    fn scenario_no_scratch_region() {
        let mut memory = EmulatedMemory::new();
        let free = [free_region(SCRATCH_PAGES_REQUIRED - 1)];
        let runtime = [runtime_region(0x1000, 0x8000_0000, 4)];
        let mut coherency = RecordingCoherency::new();

        let outcome = run(
            &MemoryMap::from_descriptors(&free),
            &MemoryMap::from_descriptors(&runtime),
            geometry(),
            &mut memory,
            &mut coherency,
        );

        assert_eq!(outcome, Ok(FixupOutcome::NoScratchRegion));
        assert_eq!(memory.descriptor_writes(), 0);
        assert_eq!(memory.touched_pages(), 0);
        assert!(coherency.events().is_empty());
    }

    #[test]
    fn scenario_block_skips_relax_but_still_maps() {
        let mut memory = EmulatedMemory::new();
        let l1 = PhysicalAddress::new(0x4000_1000);
        memory.write(
            DescriptorRef::new(PhysicalAddress::new(ROOT), TableIndex::new(0)),
            Descriptor::table(l1),
        );
        // 1 GiB block at L1 index 0 covering the physical page.
        let block = Descriptor::from_raw(0x0060_0000_0000_0401);
        let block_slot = DescriptorRef::new(l1, TableIndex::new(0));
        memory.write(block_slot, block);

        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let runtime = [runtime_region(0x1000, 0x8000_0000, 1)];
        let mut coherency = RecordingCoherency::new();

        let stats = completed(
            run(
                &MemoryMap::from_descriptors(&free),
                &MemoryMap::from_descriptors(&runtime),
                geometry(),
                &mut memory,
                &mut coherency,
            )
            .unwrap(),
        );

        assert_eq!(memory.read(block_slot), block);
        assert_eq!(stats.blocks_skipped, 1);
        assert_eq!(stats.leaves_relaxed, 0);
        assert_eq!(stats.leaves_mapped, 1);
    }

    #[test]
    fn second_pass_changes_nothing() {
        let mut memory = EmulatedMemory::new();
        premap(&mut memory, 0x1000, Descriptor::from_raw(0x0060_0000_0000_14C3));

        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let runtime = [
            runtime_region(0x1000, 0x8000_0000, 3),
            runtime_region(0x20_0000, 0x9000_0000, 2),
        ];
        let memory_map = MemoryMap::from_descriptors(&free);
        let runtime_map = MemoryMap::from_descriptors(&runtime);

        let mut coherency = RecordingCoherency::new();
        run(&memory_map, &runtime_map, geometry(), &mut memory, &mut coherency).unwrap();
        let after_first = memory.snapshot();

        let mut coherency = RecordingCoherency::new();
        let stats = completed(
            run(&memory_map, &runtime_map, geometry(), &mut memory, &mut coherency).unwrap(),
        );

        assert_eq!(memory.snapshot(), after_first);
        assert_eq!(stats.tables_allocated, 0);
    }

    #[test]
    fn empty_runtime_work_writes_nothing() {
        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let zero_pages = [runtime_region(0x1000, 0x8000_0000, 0)];
        let not_runtime = [MemoryDescriptor::new(
            MemoryType::BOOT_SERVICES_DATA,
            0x1000,
            0x8000_0000,
            8,
            MemoryAttribute::WB,
        )];

        for runtime in [&zero_pages[..], &not_runtime[..], &[][..]] {
            let mut memory = EmulatedMemory::new();
            let mut coherency = RecordingCoherency::new();

            let stats = completed(
                run(
                    &MemoryMap::from_descriptors(&free),
                    &MemoryMap::from_descriptors(runtime),
                    geometry(),
                    &mut memory,
                    &mut coherency,
                )
                .unwrap(),
            );

            assert_eq!(memory.descriptor_writes(), 0);
            assert_eq!(stats.tables_allocated, 0);
            assert_eq!(coherency.publish_count(), 0);
        }
    }

    #[test]
    fn first_large_enough_region_is_used() {
        let memory_map = [
            MemoryDescriptor::new(
                MemoryType::LOADER_DATA,
                0x2000_0000,
                0,
                1 << 20,
                MemoryAttribute::WB,
            ),
            MemoryDescriptor::new(
                MemoryType::CONVENTIONAL,
                0x3000_0000,
                0,
                16,
                MemoryAttribute::WB,
            ),
            free_region(SCRATCH_PAGES_REQUIRED),
            MemoryDescriptor::new(
                MemoryType::CONVENTIONAL,
                0x2_0000_0000,
                0,
                1 << 20,
                MemoryAttribute::WB,
            ),
        ];

        let found = find_scratch_region(&MemoryMap::from_descriptors(&memory_map)).unwrap();
        assert_eq!(found.cursor(), SCRATCH as usize);
        assert_eq!(found.capacity(), SCRATCH_PAGES_REQUIRED);
    }

    #[test]
    fn exhaustion_aborts_the_pass() {
        let mut memory = EmulatedMemory::new();
        // Only the last two pages of this region are addressable.
        let free = [MemoryDescriptor::new(
            MemoryType::CONVENTIONAL,
            0xFFFF_FFFF_E000,
            0,
            SCRATCH_PAGES_REQUIRED as u64,
            MemoryAttribute::WB,
        )];
        let runtime = [runtime_region(0x1000, 0x8000_0000, 1)];
        let mut coherency = RecordingCoherency::new();

        let result = run(
            &MemoryMap::from_descriptors(&free),
            &MemoryMap::from_descriptors(&runtime),
            geometry(),
            &mut memory,
            &mut coherency,
        );

        assert_eq!(
            result,
            Err(FixupError::Scratch(ScratchError::Exhausted { capacity: 2 }))
        );
        assert!(!coherency.events().contains(&CoherencyEvent::InvalidateAll));
    }

    #[test]
    fn pages_are_patched_in_region_order_then_ascending() {
        let mut memory = EmulatedMemory::new();
        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let runtime = [
            runtime_region(0x20_0000, 0x9000_0000, 3),
            runtime_region(0x1000, 0x8000_0000, 2),
        ];
        let mut coherency = RecordingCoherency::new();

        let stats = completed(
            run(
                &MemoryMap::from_descriptors(&free),
                &MemoryMap::from_descriptors(&runtime),
                geometry(),
                &mut memory,
                &mut coherency,
            )
            .unwrap(),
        );

        assert_eq!(stats.pages_visited, 5);
        assert_eq!(memory.descriptor_writes(), coherency.publish_count());
        assert_eq!(coherency.events().last(), Some(&CoherencyEvent::InvalidateAll));

        let mut idle = RecordingCoherency::new();
        let walker = Walker::new(geometry(), &mut memory, &mut idle);
        let leaf = |address: u64| {
            walker
                .lookup(VirtualAddress::new(address as usize))
                .and_then(LeafResult::leaf)
                .unwrap()
        };

        let mut expected = Vec::new();
        for region in &runtime {
            for page in 0..region.number_of_pages {
                let offset = page * PAGE_SIZE as u64;
                expected.push(leaf(region.physical_start + offset));
                expected.push(leaf(region.virtual_start + offset));
            }
        }

        let leaf_publishes: Vec<_> = coherency
            .events()
            .iter()
            .filter_map(|event| match event {
                CoherencyEvent::Publish(slot) if expected.contains(slot) => Some(*slot),
                _ => None,
            })
            .collect();
        assert_eq!(leaf_publishes, expected);
    }

    #[test]
    fn regions_past_the_input_range_are_skipped() {
        let mut memory = EmulatedMemory::new();
        let three_levels = TranslationGeometry::new(LevelCount::Three, PhysicalAddress::new(ROOT));
        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        // 1 << 39 has the same level 1-3 indices as 0 under a 3-level walk.
        let runtime = [
            runtime_region(0x2000, 0x0, 1),
            runtime_region(0x5000, 1 << 39, 1),
        ];
        let mut coherency = RecordingCoherency::new();

        let stats = completed(
            run(
                &MemoryMap::from_descriptors(&free),
                &MemoryMap::from_descriptors(&runtime),
                three_levels,
                &mut memory,
                &mut coherency,
            )
            .unwrap(),
        );

        assert_eq!(stats.regions_patched, 1);
        assert_eq!(stats.regions_skipped, 1);

        let mut idle = RecordingCoherency::new();
        let walker = Walker::new(three_levels, &mut memory, &mut idle);
        let low = walker
            .lookup(VirtualAddress::new(0x0))
            .and_then(LeafResult::leaf)
            .unwrap();
        assert_eq!(walker.read(low).address(), PhysicalAddress::new(0x2000));
    }

    #[test]
    fn wide_regions_are_skipped() {
        let mut memory = EmulatedMemory::new();
        let free = [free_region(SCRATCH_PAGES_REQUIRED)];
        let runtime = [
            runtime_region(0x1000, 0xFFFF_0000_0000_0000, 1),
            runtime_region(0x2000, 0x8000_2000, 1),
        ];
        let mut coherency = RecordingCoherency::new();

        let stats = completed(
            run(
                &MemoryMap::from_descriptors(&free),
                &MemoryMap::from_descriptors(&runtime),
                geometry(),
                &mut memory,
                &mut coherency,
            )
            .unwrap(),
        );

        assert_eq!(stats.regions_skipped, 1);
        assert_eq!(stats.regions_patched, 1);
        assert_eq!(stats.pages_visited, 1);
    }

    #[test]
    fn error_display() {
        let err = FixupError::from(ScratchError::Exhausted { capacity: 3 });
        assert_eq!(
            err.to_string(),
            "cannot create translation table: scratch region exhausted after 3 pages"
        );
    }
}
