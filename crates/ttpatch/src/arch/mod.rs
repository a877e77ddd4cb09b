//! Backends for the [`PhysicalMemory`](crate::PhysicalMemory) and
//! [`Coherency`](crate::Coherency) seams.
//!
//! The AArch64 backend talks to the real MMU and caches. The software backend emulates
//! physical memory on the host and records coherency operations so tests can check them.

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;
