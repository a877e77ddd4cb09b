//! C entry point for the firmware stub.

use core::ffi::c_int;
use core::slice;

use crate::arch::HardwareCoherency;
use crate::fixup::{self, FixupOutcome};
use crate::geometry::TranslationGeometry;
use crate::memmap::{MemoryDescriptor, MemoryMap, record_count};
use crate::memory::IdentityMemory;

/// Patches the live TTBR0 tables for the runtime regions in `vamap`.
///
/// `memmap` is the full UEFI memory map of `map_size` bytes, and `vamap` holds
/// `vamap_count` runtime records. Both use a stride of `desc_size` bytes. The count is
/// a C `int`, as in the stub's prototype, and a negative value is rejected. Returns
/// without touching the tables if the inputs are malformed, the translation regime is
/// not supported, or no scratch region exists.
///
/// # Panics
///
/// Panics if the scratch region runs out mid-pass, leaving the tables partially patched.
///
/// # Safety
///
/// Must be called at EL1 with the MMU on, TTBR0 tables identity-mapped, and no other
/// agent editing them. `memmap` must be readable for `map_size` bytes and `vamap` for
/// `vamap_count * desc_size` bytes.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn ttpatch_fixup_runtime_mappings(
    memmap: *const MemoryDescriptor,
    vamap: *const MemoryDescriptor,
    map_size: usize,
    desc_size: usize,
    vamap_count: c_int,
) {
    if memmap.is_null() || (vamap.is_null() && vamap_count != 0) {
        log::error!("runtime mapping fixup called without a memory map");
        return;
    }

    // SAFETY: the caller guarantees `map_size` readable bytes at `memmap`.
    let bytes = unsafe { slice::from_raw_parts(memmap.cast::<u8>(), map_size) };
    let memory_map = match MemoryMap::new(bytes, desc_size) {
        Ok(map) => map,
        Err(err) => {
            log::error!("invalid memory map: {}", err);
            return;
        }
    };
    let runtime_map = record_count(vamap_count).and_then(|count| {
        // SAFETY: the caller guarantees `vamap_count` records of `desc_size` bytes at `vamap`.
        unsafe { MemoryMap::from_raw_parts(vamap.cast::<u8>(), count, desc_size) }
    });
    let runtime_map = match runtime_map {
        Ok(map) => map,
        Err(err) => {
            log::error!("invalid runtime map: {}", err);
            return;
        }
    };

    let geometry = match TranslationGeometry::current() {
        Ok(geometry) => geometry,
        Err(err) => {
            log::error!("cannot patch runtime mappings: {}", err);
            return;
        }
    };

    // SAFETY: the caller guarantees identity-mapped tables at EL1 and exclusive access.
    let mut memory = unsafe { IdentityMemory::new() };
    // SAFETY: as above.
    let mut coherency = unsafe { HardwareCoherency::new() };

    match fixup::run(&memory_map, &runtime_map, geometry, &mut memory, &mut coherency) {
        Ok(FixupOutcome::Completed(stats)) => log::debug!("{:?}", stats),
        Ok(FixupOutcome::NoScratchRegion) => {}
        Err(err) => panic!("runtime mapping fixup failed: {}", err),
    }
}
