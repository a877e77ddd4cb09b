//! Bump allocation of table pages from a single-use scratch region.
//!
//! The scratch region is a run of conventional memory picked from the firmware memory
//! map. Pages are handed out in ascending order, zero-filled, and never returned: the
//! kernel that takes over discards these tables anyway.

use core::fmt;

use crate::PhysicalAddress;
use crate::memory::PhysicalMemory;
use crate::table::{ENTRY_COUNT, PAGE_SIZE};

/// Pages a scratch region needs to cover the worst case: every level 3 table under one
/// level 1 table, plus the level 1 table itself.
pub const SCRATCH_PAGES_REQUIRED: usize = ENTRY_COUNT * ENTRY_COUNT + 1;

/// Errors from the scratch arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchError {
    /// Every page of the region has been handed out.
    Exhausted {
        /// Pages the region held.
        capacity: usize,
    },
}

impl fmt::Display for ScratchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScratchError::Exhausted { capacity } => {
                write!(f, "scratch region exhausted after {} pages", capacity)
            }
        }
    }
}

/// A bounded bump allocator over one scratch region.
#[derive(Debug)]
pub struct ScratchArena {
    /// Next page to hand out. Raw so that a region ending at the top of the
    /// address range can be represented.
    next: usize,
    capacity: usize,
    allocated: usize,
}

impl ScratchArena {
    /// Creates an arena over `pages` pages starting at `base`.
    ///
    /// Pages that would extend past the 48-bit physical range are not counted.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned.
    pub fn new(base: PhysicalAddress, pages: usize) -> Self {
        assert!(
            base.is_aligned(PAGE_SIZE),
            "scratch region must be page-aligned"
        );

        let addressable = (crate::address::ADDRESS_LIMIT - base.as_usize()) / PAGE_SIZE;
        let capacity = pages.min(addressable);
        if capacity < pages {
            log::warn!(
                "scratch region at {} truncated from {} to {} pages",
                base,
                pages,
                capacity
            );
        }

        Self {
            next: base.as_usize(),
            capacity,
            allocated: 0,
        }
    }

    /// Hands out one zero-filled table page.
    pub fn allocate<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
    ) -> Result<PhysicalAddress, ScratchError> {
        if self.allocated == self.capacity {
            return Err(ScratchError::Exhausted {
                capacity: self.capacity,
            });
        }

        let page = PhysicalAddress::new(self.next);
        memory.table_mut(page).zero();

        self.next += PAGE_SIZE;
        self.allocated += 1;

        log::trace!("scratch page {} allocated at {}", self.allocated, page);
        Ok(page)
    }

    /// Returns the address the next allocation will use.
    pub fn cursor(&self) -> usize {
        self.next
    }

    /// Returns the number of pages handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Returns the number of pages still available.
    pub fn remaining(&self) -> usize {
        self.capacity - self.allocated
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
