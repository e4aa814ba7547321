//! Index of the unmapped ranges of a map.
//!
//! Each gap is keyed by its start address (the end of the entry before it, or the map's
//! lower bound) and also ordered by size, so a free range of a given size is found
//! without walking the entries.

use alloc::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub(crate) struct GapIndex {
    by_start: BTreeMap<usize, usize>,
    by_size: BTreeSet<(usize, usize)>,
}

impl GapIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records that the gap starting at `start` is `size` bytes. Zero removes it.
    pub(crate) fn set(&mut self, start: usize, size: usize) {
        self.remove(start);
        if size > 0 {
            self.by_start.insert(start, size);
            self.by_size.insert((size, start));
        }
    }

    pub(crate) fn remove(&mut self, start: usize) {
        if let Some(size) = self.by_start.remove(&start) {
            self.by_size.remove(&(size, start));
        }
    }

    pub(crate) fn get(&self, start: usize) -> Option<usize> {
        self.by_start.get(&start).copied()
    }

    /// Lowest unmapped address.
    pub(crate) fn first_free(&self) -> Option<usize> {
        self.by_start.keys().next().copied()
    }

    /// Finds room for `size` bytes aligned to `mask + 1`, at or above `floor`.
    ///
    /// Without a floor the smallest gap that fits wins; with one, the lowest address.
    pub(crate) fn find(&self, size: usize, mask: usize, floor: usize) -> Option<usize> {
        let fit = |start: usize, gap: usize| {
            let from = start.max(floor);
            let aligned = from.checked_add(mask)? & !mask;
            let end = aligned.checked_add(size)?;
            (end <= start + gap).then_some(aligned)
        };

        if floor == 0 {
            return self
                .by_size
                .range((size, 0)..)
                .find_map(|&(gap, start)| fit(start, gap));
        }

        let containing = self
            .by_start
            .range(..=floor)
            .next_back()
            .filter(|&(&start, &gap)| start + gap > floor)
            .map(|(&start, &gap)| (start, gap));
        containing
            .into_iter()
            .chain(self.by_start.range(floor + 1..).map(|(&s, &g)| (s, g)))
            .find_map(|(start, gap)| fit(start, gap))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_start.iter().map(|(&start, &size)| (start, size))
    }

    pub(crate) fn len(&self) -> usize {
        self.by_start.len()
    }
}
