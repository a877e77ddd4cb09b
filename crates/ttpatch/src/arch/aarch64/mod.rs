//! AArch64 hardware backend.
//!
//! Assumes it runs at EL1 under firmware that identity-maps memory through TTBR0.

use core::arch::asm;

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{Readable, TCR_EL1, TTBR0_EL1};

use crate::coherency::Coherency;
use crate::table::DescriptorRef;

/// Returns the raw `(TCR_EL1, TTBR0_EL1)` values of the running CPU.
pub fn read_translation_registers() -> (u64, u64) {
    (TCR_EL1.get(), TTBR0_EL1.get())
}

/// Cache and TLB maintenance on the running CPU.
///
/// Descriptor addresses are used as virtual addresses for `dc civac`, so the tables
/// must be identity-mapped.
pub struct HardwareCoherency {
    _private: (),
}

impl HardwareCoherency {
    /// # Safety
    ///
    /// The caller must be running at EL1 with the translation tables identity-mapped.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Coherency for HardwareCoherency {
    fn publish(&mut self, slot: DescriptorRef) {
        let addr = slot.address().as_usize();
        barrier::dsb(barrier::SY);
        // SAFETY: `addr` is an identity-mapped descriptor slot (see `new`). Cleaning and
        // invalidating a line that holds live data writes it back first, so no data is lost.
        unsafe {
            asm!("dc civac, {0}", in(reg) addr, options(nostack, preserves_flags));
        }
        flush_tlb_all();
    }

    fn invalidate_all(&mut self) {
        flush_tlb_all();
    }
}

/// Invalidates every EL1&0 translation in the inner shareable domain.
fn flush_tlb_all() {
    barrier::dsb(barrier::ISHST);
    // SAFETY: TLB invalidation only drops cached translations; the next access
    // re-walks the tables.
    unsafe {
        asm!("tlbi vmalle1is", options(nostack, preserves_flags));
    }
    barrier::dsb(barrier::ISH);
    barrier::isb(barrier::SY);
}
