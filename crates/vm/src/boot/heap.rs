//! Bump allocation of boot-lifetime arrays.
//!
//! The descriptor arrays and the resident hash buckets are carved from a single physical
//! range before the buddy allocator exists. Nothing allocated here is ever freed.

use super::{BootData, BootError, BootMap, MemoryRegion, RegionArray};
use crate::{HumanSize, PAGE_SIZE, PhysicalAddress};

/// Which end of the heap allocations are taken from. Fixed when the heap is carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeapMode {
    /// Allocate downward from the top of the heap.
    #[default]
    TopDown,
    /// Allocate upward from the bottom of the heap.
    BottomUp,
}

#[derive(Debug)]
pub struct BootstrapHeap {
    mode: HeapMode,
    start: u64,
    end: u64,
    /// Allocations occupy `[start, low)` bottom-up and `[high, end)` top-down.
    low: u64,
    high: u64,
}

impl BootstrapHeap {
    pub const fn new(start: u64, end: u64, mode: HeapMode) -> Self {
        Self {
            mode,
            start,
            end,
            low: start,
            high: end,
        }
    }

    /// Carves the heap from the largest range below `ceiling` that is available and holds
    /// no boot data.
    pub fn carve(
        map: &BootMap,
        data: &BootData,
        ceiling: u64,
        mode: HeapMode,
    ) -> Result<Self, BootError> {
        let mut free = RegionArray::new();
        for entry in map.available() {
            free.add(MemoryRegion::new(entry.base, entry.end))?;
        }
        for range in data.ranges() {
            free.subtract(MemoryRegion::new(range.start, range.end))?;
        }
        free.clamp(PAGE_SIZE as u64, ceiling)?;
        free.align_inward(PAGE_SIZE as u64);
        let largest = free
            .largest()
            .ok_or(BootError::HeapExhausted { requested: 0 })?;

        log::debug!(
            "bootstrap heap {:#x}..{:#x} ({} of {} free), {:?}",
            largest.base(),
            largest.end(),
            HumanSize(largest.size()),
            HumanSize(free.total_size()),
            mode
        );
        Ok(Self::new(largest.base(), largest.end(), mode))
    }

    pub fn mode(&self) -> HeapMode {
        self.mode
    }

    /// Allocates `size` bytes aligned to `align`, a power of two.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<PhysicalAddress, BootError> {
        debug_assert!(align.is_power_of_two());
        let exhausted = BootError::HeapExhausted { requested: size };
        let size = size as u64;
        let align = align as u64;

        let base = match self.mode {
            HeapMode::BottomUp => {
                let base = self.low.next_multiple_of(align);
                let end = base.checked_add(size).ok_or(exhausted)?;
                if end > self.high {
                    return Err(exhausted);
                }
                self.low = end;
                base
            }
            HeapMode::TopDown => {
                let base = self.high.checked_sub(size).ok_or(exhausted)? & !(align - 1);
                if base < self.low {
                    return Err(exhausted);
                }
                self.high = base;
                base
            }
        };
        Ok(PhysicalAddress::new(base as usize))
    }

    /// Returns the page-aligned range consumed so far.
    pub fn used(&self) -> (u64, u64) {
        let page = PAGE_SIZE as u64;
        match self.mode {
            HeapMode::BottomUp => (self.start, self.low.next_multiple_of(page)),
            HeapMode::TopDown => (self.high & !(page - 1), self.end),
        }
    }

    pub fn remaining(&self) -> u64 {
        self.high - self.low
    }
}
