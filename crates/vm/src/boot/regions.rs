//! Sorted, fixed-capacity sets of physical ranges.
//!
//! Used while booting to compute "available minus reserved" without a heap.

use super::BootError;

const MAX_REGIONS: usize = 128;

/// A half-open physical range `[base, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MemoryRegion {
    base: u64,
    end: u64,
}

impl MemoryRegion {
    pub(crate) const fn new(base: u64, end: u64) -> Self {
        Self { base, end }
    }

    pub(crate) const fn base(&self) -> u64 {
        self.base
    }

    pub(crate) const fn end(&self) -> u64 {
        self.end
    }

    pub(crate) const fn size(&self) -> u64 {
        self.end - self.base
    }

    pub(crate) const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base < other.end && other.base < self.end
    }

    /// Returns true if the two regions overlap or touch.
    const fn mergeable(&self, other: &MemoryRegion) -> bool {
        self.base <= other.end && other.base <= self.end
    }

    const fn merge(&self, other: &MemoryRegion) -> MemoryRegion {
        let base = if self.base < other.base { self.base } else { other.base };
        let end = if self.end > other.end { self.end } else { other.end };
        MemoryRegion::new(base, end)
    }
}

/// Sorted, non-overlapping regions. Touching regions are coalesced on insert.
#[derive(Debug)]
pub(crate) struct RegionArray {
    regions: [MemoryRegion; MAX_REGIONS],
    count: usize,
}

impl RegionArray {
    pub(crate) const fn new() -> Self {
        Self {
            regions: [MemoryRegion::new(0, 0); MAX_REGIONS],
            count: 0,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter()
    }

    fn insert(&mut self, index: usize, region: MemoryRegion) -> Result<(), BootError> {
        if self.count == MAX_REGIONS {
            return Err(BootError::RegionsFull);
        }
        self.regions.copy_within(index..self.count, index + 1);
        self.regions[index] = region;
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        self.regions.copy_within(index + 1..self.count, index);
        self.count -= 1;
    }

    /// Adds `region`, merging it with any region it overlaps or touches.
    pub(crate) fn add(&mut self, region: MemoryRegion) -> Result<(), BootError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut merged = region;
        let mut index = 0;
        while index < self.count {
            let existing = self.regions[index];
            if existing.end < merged.base {
                index += 1;
            } else if merged.end < existing.base {
                break;
            } else {
                debug_assert!(existing.mergeable(&merged));
                merged = merged.merge(&existing);
                self.remove(index);
            }
        }
        self.insert(index, merged)
    }

    /// Removes every byte of `region`, splitting regions it cuts through.
    pub(crate) fn subtract(&mut self, region: MemoryRegion) -> Result<(), BootError> {
        if region.size() == 0 {
            return Ok(());
        }

        let mut index = 0;
        while index < self.count {
            let existing = self.regions[index];
            if !existing.overlaps(&region) {
                index += 1;
                continue;
            }

            self.remove(index);
            if existing.base < region.base {
                self.insert(index, MemoryRegion::new(existing.base, region.base))?;
                index += 1;
            }
            if existing.end > region.end {
                self.insert(index, MemoryRegion::new(region.end, existing.end))?;
                index += 1;
            }
        }
        Ok(())
    }

    /// Keeps only the parts of each region inside `[floor, ceiling)`.
    pub(crate) fn clamp(&mut self, floor: u64, ceiling: u64) -> Result<(), BootError> {
        self.subtract(MemoryRegion::new(0, floor))?;
        self.subtract(MemoryRegion::new(ceiling, u64::MAX))
    }

    /// Shrinks every region to `align` boundaries, dropping the ones that vanish.
    pub(crate) fn align_inward(&mut self, align: u64) {
        debug_assert!(align.is_power_of_two());
        let mut kept = 0;
        for index in 0..self.count {
            let region = self.regions[index];
            let Some(base) = region.base.checked_next_multiple_of(align) else {
                continue;
            };
            let end = region.end & !(align - 1);
            if base < end {
                self.regions[kept] = MemoryRegion::new(base, end);
                kept += 1;
            }
        }
        self.count = kept;
    }

    /// The largest region, lowest first on ties.
    pub(crate) fn largest(&self) -> Option<MemoryRegion> {
        self.iter()
            .copied()
            .reduce(|best, r| if r.size() > best.size() { r } else { best })
    }

    pub(crate) fn total_size(&self) -> u64 {
        self.iter().map(MemoryRegion::size).sum()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn collect(array: &RegionArray) -> Vec<(u64, u64)> {
        array.iter().map(|r| (r.base(), r.end())).collect()
    }

    #[test]
    fn add_merges_touching_and_overlapping() {
        let mut array = RegionArray::new();
        array.add(MemoryRegion::new(0x2000, 0x3000)).expect("add");
        array.add(MemoryRegion::new(0x3000, 0x4000)).expect("add");
        assert_eq!(collect(&array), [(0x2000, 0x4000)]);

        array.add(MemoryRegion::new(0x6000, 0x7000)).expect("add");
        array.add(MemoryRegion::new(0x0, 0x1000)).expect("add");
        assert_eq!(collect(&array), [(0x0, 0x1000), (0x2000, 0x4000), (0x6000, 0x7000)]);

        array.add(MemoryRegion::new(0x3800, 0x6800)).expect("add");
        assert_eq!(collect(&array), [(0x0, 0x1000), (0x2000, 0x7000)]);
    }

    #[test]
    fn subtract_splits_regions() {
        let mut array = RegionArray::new();
        array.add(MemoryRegion::new(0x1000, 0x4000)).expect("add");
        array.subtract(MemoryRegion::new(0x2000, 0x3000)).expect("subtract");
        assert_eq!(collect(&array), [(0x1000, 0x2000), (0x3000, 0x4000)]);
        assert_eq!(array.total_size(), 0x2000);

        array.subtract(MemoryRegion::new(0x0, 0x10000)).expect("subtract");
        assert!(collect(&array).is_empty());
    }

    #[test]
    fn clamp_and_largest() {
        let mut array = RegionArray::new();
        array.add(MemoryRegion::new(0x0, 0x3000)).expect("add");
        array.add(MemoryRegion::new(0x5000, 0x9000)).expect("add");
        array.clamp(0x1000, 0x8000).expect("clamp");
        assert_eq!(collect(&array), [(0x1000, 0x3000), (0x5000, 0x8000)]);
        assert_eq!(array.largest(), Some(MemoryRegion::new(0x5000, 0x8000)));
    }

    #[test]
    fn align_inward_drops_slivers() {
        let mut array = RegionArray::new();
        array.add(MemoryRegion::new(0x800, 0x3800)).expect("add");
        array.add(MemoryRegion::new(0x4100, 0x4f00)).expect("add");
        array.add(MemoryRegion::new(0x6000, 0x8000)).expect("add");
        array.align_inward(0x1000);
        assert_eq!(collect(&array), [(0x1000, 0x3000), (0x6000, 0x8000)]);
        assert_eq!(array.total_size(), 0x4000);
        assert_eq!(array.largest(), Some(MemoryRegion::new(0x1000, 0x3000)));
    }
}
