//! The boot memory map.
//!
//! The boot loader hands over an unsorted, possibly overlapping list of typed physical
//! ranges. [`BootMap::resolve`] turns it into a sorted list of disjoint ranges in which
//! every byte carries the most restrictive type any original entry gave it.
//!
//! Implement [`BootMemoryRegion`] on the boot loader's entry type and collect with
//! [`BootMap::from_regions`]:
//!
//! ```ignore
//! impl BootMemoryRegion for MultibootMmapEntry {
//!     fn base(&self) -> u64 { self.addr }
//!     fn length(&self) -> u64 { self.len }
//!     fn memory_type(&self) -> BootMemoryType { BootMemoryType::from_raw(self.kind) }
//! }
//!
//! let mut map = BootMap::from_regions(entries)?;
//! map.resolve()?;
//! ```

use core::fmt;

use super::BootError;
use crate::{HumanSize, PAGE_SIZE};

/// Maximum number of entries the boot map can hold.
pub const BOOT_MAP_CAPACITY: usize = 128;

/// Type of a boot memory range. Higher values are more restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum BootMemoryType {
    Available = 1,
    Reserved = 2,
    Acpi = 3,
    Nvs = 4,
    Unusable = 5,
}

impl BootMemoryType {
    /// Decodes a boot loader type code. Unknown codes are treated as reserved.
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Available,
            3 => Self::Acpi,
            4 => Self::Nvs,
            5 => Self::Unusable,
            _ => Self::Reserved,
        }
    }
}

/// Represents a single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> u64;

    /// Returns the size of this region in bytes.
    fn length(&self) -> u64;

    fn memory_type(&self) -> BootMemoryType;
}

/// A typed physical range `[base, end)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BootMemoryEntry {
    pub base: u64,
    pub end: u64,
    pub memory_type: BootMemoryType,
}

impl BootMemoryEntry {
    pub const fn new(base: u64, end: u64, memory_type: BootMemoryType) -> Self {
        Self { base, end, memory_type }
    }

    pub const fn available(base: u64, end: u64) -> Self {
        Self::new(base, end, BootMemoryType::Available)
    }

    pub const fn reserved(base: u64, end: u64) -> Self {
        Self::new(base, end, BootMemoryType::Reserved)
    }

    pub const fn is_available(&self) -> bool {
        matches!(self.memory_type, BootMemoryType::Available)
    }
}

impl BootMemoryRegion for BootMemoryEntry {
    fn base(&self) -> u64 {
        self.base
    }

    fn length(&self) -> u64 {
        self.end - self.base
    }

    fn memory_type(&self) -> BootMemoryType {
        self.memory_type
    }
}

impl fmt::Debug for BootMemoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:#x}..{:#x}) {:?} ({})",
            self.base,
            self.end,
            self.memory_type,
            HumanSize(self.end - self.base)
        )
    }
}

const EMPTY_ENTRY: BootMemoryEntry = BootMemoryEntry::reserved(0, 0);

/// A fixed-capacity boot memory map.
#[derive(Clone)]
pub struct BootMap {
    entries: [BootMemoryEntry; BOOT_MAP_CAPACITY],
    len: usize,
}

impl BootMap {
    pub const fn new() -> Self {
        Self {
            entries: [EMPTY_ENTRY; BOOT_MAP_CAPACITY],
            len: 0,
        }
    }

    /// Collects boot loader entries, dropping degenerate ones.
    pub fn from_regions<R: BootMemoryRegion>(regions: &[R]) -> Result<Self, BootError> {
        let mut map = Self::new();
        for region in regions {
            map.push(region.base(), region.length(), region.memory_type())?;
        }
        Ok(map)
    }

    /// Builds the two-entry map implied by the legacy "lower/upper memory" boot fields,
    /// for boot loaders that supply no memory map.
    pub fn from_simple(lower_kib: u64, upper_kib: u64) -> Self {
        const ONE_MIB: u64 = 1 << 20;
        let mut map = Self::new();
        map.entries[0] = BootMemoryEntry::available(0, lower_kib * 1024);
        map.entries[1] = BootMemoryEntry::available(ONE_MIB, ONE_MIB + upper_kib * 1024);
        map.len = 2;
        map.retain_non_degenerate();
        map
    }

    /// Appends `[base, base + length)`. Zero-length and wrapping ranges are ignored.
    pub fn push(
        &mut self,
        base: u64,
        length: u64,
        memory_type: BootMemoryType,
    ) -> Result<(), BootError> {
        let Some(end) = base.checked_add(length) else {
            log::warn!("ignoring wrapping boot memory entry at {:#x}", base);
            return Ok(());
        };
        if length == 0 {
            return Ok(());
        }
        self.push_entry(BootMemoryEntry::new(base, end, memory_type))
    }

    fn push_entry(&mut self, entry: BootMemoryEntry) -> Result<(), BootError> {
        if self.len == BOOT_MAP_CAPACITY {
            return Err(BootError::MapFull);
        }
        self.entries[self.len] = entry;
        self.len += 1;
        Ok(())
    }

    fn retain_non_degenerate(&mut self) {
        let mut kept = 0;
        for i in 0..self.len {
            if self.entries[i].base < self.entries[i].end {
                self.entries[kept] = self.entries[i];
                kept += 1;
            }
        }
        self.len = kept;
    }

    pub fn entries(&self) -> &[BootMemoryEntry] {
        &self.entries[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sorts the map and resolves overlaps.
    ///
    /// The result is sorted and disjoint. Where entries overlapped, the overlap takes the
    /// numerically higher type; overlapping entries of equal type become one entry.
    /// Entries that merely touch are left alone, so a map that is already sorted and
    /// disjoint comes back unchanged.
    pub fn resolve(&mut self) -> Result<(), BootError> {
        self.retain_non_degenerate();
        let entries = &mut self.entries[..self.len];
        entries.sort_unstable_by_key(|e| (e.base, e.end));

        let mut bounds = [0u64; 2 * BOOT_MAP_CAPACITY];
        let mut count = 0;
        for entry in entries.iter() {
            bounds[count] = entry.base;
            bounds[count + 1] = entry.end;
            count += 2;
        }
        let bounds = &mut bounds[..count];
        bounds.sort_unstable();

        // Walk the elementary intervals between consecutive boundaries.
        let mut resolved = Self::new();
        let mut pending: Option<BootMemoryEntry> = None;
        for pair in bounds.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if lo == hi {
                continue;
            }

            let covering = entries
                .iter()
                .filter(|e| e.base <= lo && e.end >= hi)
                .map(|e| e.memory_type)
                .max();
            let Some(memory_type) = covering else {
                if let Some(piece) = pending.take() {
                    resolved.push_entry(piece)?;
                }
                continue;
            };

            // Continue the previous piece only across a boundary that lies strictly
            // inside some original entry, i.e. one created by an overlap.
            let inside = entries.iter().any(|e| e.base < lo && lo < e.end);
            match pending.as_mut() {
                Some(piece) if piece.end == lo && piece.memory_type == memory_type && inside => {
                    piece.end = hi;
                }
                _ => {
                    if let Some(piece) = pending.replace(BootMemoryEntry::new(lo, hi, memory_type)) {
                        resolved.push_entry(piece)?;
                    }
                }
            }
        }
        if let Some(piece) = pending {
            resolved.push_entry(piece)?;
        }

        *self = resolved;
        Ok(())
    }

    /// Iterates over available entries.
    pub fn available(&self) -> impl Iterator<Item = &BootMemoryEntry> {
        self.entries().iter().filter(|e| e.is_available())
    }

    /// Returns the page-aligned span from the lowest available byte to the highest
    /// available byte inside `[floor, ceiling)`, or `None` if there is none.
    ///
    /// The span may contain holes; callers keep those reserved.
    pub fn find_available(&self, floor: u64, ceiling: u64) -> Option<(u64, u64)> {
        let page = PAGE_SIZE as u64;
        let (low, high) = self
            .available()
            .filter_map(|e| {
                let start = e.base.max(floor).next_multiple_of(page);
                let end = e.end.min(ceiling) & !(page - 1);
                (start < end).then_some((start, end))
            })
            .fold((u64::MAX, 0), |(low, high), (start, end)| {
                (low.min(start), high.max(end))
            });
        (low < high).then_some((low, high))
    }

    /// Returns whether every byte of `[start, end)` is available.
    pub fn is_available(&self, start: u64, end: u64) -> bool {
        let mut cursor = start;
        for entry in self.available() {
            if entry.base <= cursor && entry.end > cursor {
                cursor = entry.end;
            }
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }
}

impl Default for BootMap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BootMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use proptest::prelude::*;

    use super::*;

    fn map(entries: &[BootMemoryEntry]) -> BootMap {
        BootMap::from_regions(entries).expect("fits")
    }

    fn resolved(entries: &[BootMemoryEntry]) -> Vec<BootMemoryEntry> {
        let mut map = map(entries);
        map.resolve().expect("resolves");
        map.entries().to_vec()
    }

    #[test]
    fn low_memory_hole_stays_out_of_available_ranges() {
        let entries = [
            BootMemoryEntry::available(0, 0x9F000),
            BootMemoryEntry::reserved(0x9F000, 0x100000),
            BootMemoryEntry::available(0x100000, 0x2000_0000),
        ];
        let map = {
            let mut map = map(&entries);
            map.resolve().expect("resolves");
            map
        };

        let available: Vec<_> = map.available().copied().collect();
        assert_eq!(available.len(), 2);
        for entry in &available {
            assert!(entry.end <= 0x9F000 || entry.base >= 0x100000, "{entry:?}");
        }
        assert!(!map.is_available(0x9F000, 0xA0000));
        assert!(map.is_available(0x100000, 0x2000_0000));
    }

    #[test]
    fn drops_degenerate_entries() {
        let mut map = BootMap::new();
        map.push(0x1000, 0, BootMemoryType::Available).expect("push");
        map.push(u64::MAX - 0xFFF, 0x2000, BootMemoryType::Available).expect("push");
        map.push(0x1000, 0x1000, BootMemoryType::Available).expect("push");
        assert_eq!(map.entries(), &[BootMemoryEntry::available(0x1000, 0x2000)]);
    }

    #[test]
    fn sorts_entries() {
        let entries = resolved(&[
            BootMemoryEntry::available(0x100000, 0x200000),
            BootMemoryEntry::reserved(0xF0000, 0x100000),
            BootMemoryEntry::available(0, 0x9F000),
        ]);
        assert_eq!(
            entries,
            [
                BootMemoryEntry::available(0, 0x9F000),
                BootMemoryEntry::reserved(0xF0000, 0x100000),
                BootMemoryEntry::available(0x100000, 0x200000),
            ]
        );
    }

    #[test]
    fn overlap_takes_the_more_restrictive_type() {
        let entries = resolved(&[
            BootMemoryEntry::available(0, 0x200000),
            BootMemoryEntry::new(0x80000, 0x90000, BootMemoryType::Acpi),
        ]);
        assert_eq!(
            entries,
            [
                BootMemoryEntry::available(0, 0x80000),
                BootMemoryEntry::new(0x80000, 0x90000, BootMemoryType::Acpi),
                BootMemoryEntry::available(0x90000, 0x200000),
            ]
        );
    }

    #[test]
    fn partial_overlap_splits_in_three() {
        let entries = resolved(&[
            BootMemoryEntry::new(0x3000, 0x8000, BootMemoryType::Nvs),
            BootMemoryEntry::reserved(0x1000, 0x5000),
        ]);
        assert_eq!(
            entries,
            [
                BootMemoryEntry::reserved(0x1000, 0x3000),
                BootMemoryEntry::new(0x3000, 0x8000, BootMemoryType::Nvs),
            ]
        );
    }

    #[test]
    fn overlapping_equal_types_merge() {
        let entries = resolved(&[
            BootMemoryEntry::available(0, 0x7000),
            BootMemoryEntry::available(0x5000, 0xA000),
            BootMemoryEntry::available(0xA000, 0xB000),
        ]);
        assert_eq!(
            entries,
            [
                BootMemoryEntry::available(0, 0xA000),
                BootMemoryEntry::available(0xA000, 0xB000),
            ]
        );
    }

    #[test]
    fn restrictive_entry_swallows_contained_available() {
        let entries = resolved(&[
            BootMemoryEntry::new(0, 0x10000, BootMemoryType::Unusable),
            BootMemoryEntry::available(0x3000, 0x5000),
        ]);
        assert_eq!(
            entries,
            [BootMemoryEntry::new(0, 0x10000, BootMemoryType::Unusable)]
        );
    }

    #[test]
    fn synthesizes_map_from_simple_sizes() {
        let map = BootMap::from_simple(640, 31 * 1024);
        assert_eq!(
            map.entries(),
            &[
                BootMemoryEntry::available(0, 0xA0000),
                BootMemoryEntry::available(0x100000, 0x2000000),
            ]
        );
    }

    #[test]
    fn find_available_spans_holes_within_ceiling() {
        let mut map = map(&[
            BootMemoryEntry::available(0x1000, 0x9F000),
            BootMemoryEntry::reserved(0x9F000, 0x100000),
            BootMemoryEntry::available(0x100000, 0x2000000),
        ]);
        map.resolve().expect("resolves");
        assert_eq!(map.find_available(0, 0x1000000), Some((0x1000, 0x1000000)));
        assert_eq!(
            map.find_available(0x1000000, 0x1_0000_0000),
            Some((0x1000000, 0x2000000))
        );
        assert_eq!(map.find_available(0x1_0000_0000, 0x40_0000_0000), None);
    }

    #[test]
    fn overflowing_the_map_is_an_error() {
        let mut map = BootMap::new();
        for i in 0..BOOT_MAP_CAPACITY as u64 {
            map.push(i * 0x2000, 0x1000, BootMemoryType::Available).expect("fits");
        }
        assert_eq!(
            map.push(0x1000_0000, 0x1000, BootMemoryType::Available),
            Err(BootError::MapFull)
        );
    }

    fn arb_type() -> impl Strategy<Value = BootMemoryType> {
        (1u32..=5).prop_map(BootMemoryType::from_raw)
    }

    proptest! {
        #[test]
        fn resolving_disjoint_sorted_maps_is_identity(
            pieces in proptest::collection::vec((0u64..4, 1u64..8, arb_type()), 1..40)
        ) {
            let mut entries = Vec::new();
            let mut cursor = 0u64;
            for (gap, length, memory_type) in pieces {
                let base = cursor + gap * 0x1000;
                let end = base + length * 0x1000;
                entries.push(BootMemoryEntry::new(base, end, memory_type));
                cursor = end;
            }
            prop_assert_eq!(resolved(&entries), entries);
        }

        #[test]
        fn resolution_is_disjoint_and_keeps_the_strictest_type(
            raw in proptest::collection::vec((0u64..64, 1u64..16, arb_type()), 1..24)
        ) {
            let entries: Vec<_> = raw
                .iter()
                .map(|&(base, length, t)| BootMemoryEntry::new(base * 0x1000, (base + length) * 0x1000, t))
                .collect();
            let out = resolved(&entries);

            for pair in out.windows(2) {
                prop_assert!(pair[0].end <= pair[1].base);
            }
            for page in 0..80u64 {
                let address = page * 0x1000;
                let expected = entries
                    .iter()
                    .filter(|e| e.base <= address && address < e.end)
                    .map(|e| e.memory_type)
                    .max();
                let actual = out
                    .iter()
                    .find(|e| e.base <= address && address < e.end)
                    .map(|e| e.memory_type);
                prop_assert_eq!(actual, expected);
            }

            let again = resolved(&out);
            prop_assert_eq!(again, out);
        }
    }
}
