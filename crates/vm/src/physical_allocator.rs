//! Physical page allocator over the segment chain.
//!
//! Requests name a [`Selector`]; they are served from that selector's segment first, then
//! from each lower (more restrictive) segment in turn. A request for DMA memory is
//! therefore never satisfied from high memory, while a high memory request may fall back
//! all the way down to DMA.

use crate::error::AllocError;
use crate::page::{MAX_ORDER, Page, PageUsage};
use crate::segment::{Segment, SegmentStats, Selector};
use crate::{HumanSize, PAGE_SIZE, PhysicalAddress};

pub struct PhysicalAllocator {
    segments: [Option<Segment>; 4],
}

impl PhysicalAllocator {
    pub(crate) fn new(segments: [Option<Segment>; 4]) -> Self {
        assert!(
            segments[Selector::Dma.index()].is_some(),
            "the DMA segment is mandatory"
        );
        for segment in segments.iter().flatten() {
            let stats = segment.stats();
            log::info!(
                "{:>9}: {}..{} {} free of {}",
                segment.selector(),
                segment.start(),
                segment.end(),
                HumanSize::pages(stats.free_pages),
                HumanSize::pages(stats.total_pages),
            );
        }
        Self { segments }
    }

    /// Allocates `2^order` contiguous pages reachable by `selector`, tagged with `usage`.
    ///
    /// Exhaustion is reported as [`AllocError::OutOfMemory`]; this never blocks.
    pub fn alloc(
        &self,
        order: usize,
        selector: Selector,
        usage: PageUsage,
    ) -> Result<&'static Page, AllocError> {
        if order > MAX_ORDER {
            return Err(AllocError::OrderTooLarge(order));
        }

        self.segments[..=selector.index()]
            .iter()
            .rev()
            .flatten()
            .find_map(|segment| segment.alloc(order, usage))
            .ok_or_else(|| {
                log::trace!("out of memory: order {} from {}", order, selector);
                AllocError::OutOfMemory
            })
    }

    /// Returns a block obtained from [`Self::alloc`] with the same order.
    ///
    /// # Panics
    ///
    /// Panics on the consistency violations listed on [`Segment::free`].
    pub fn free(&self, page: &'static Page, order: usize) {
        let segment = self
            .segments
            .get(page.segment_index())
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("page {} has no segment", page.phys()));
        segment.free(page, order);
    }

    /// Returns the descriptor for the page containing `address`.
    pub fn lookup(&self, address: PhysicalAddress) -> Option<&'static Page> {
        self.segments
            .iter()
            .flatten()
            .find_map(|segment| segment.page(address))
    }

    pub fn segment(&self, selector: Selector) -> Option<&Segment> {
        self.segments[selector.index()].as_ref()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().flatten()
    }

    /// Releases reserved pages in `[start, end)` in whichever segments cover them.
    pub(crate) fn release(&self, start: PhysicalAddress, end: PhysicalAddress) {
        for segment in self.segments() {
            if start < segment.end() && end > segment.start() {
                segment.release(start, end);
            }
        }
    }

    /// Sums the statistics of every segment.
    pub fn stats(&self) -> SegmentStats {
        self.segments()
            .map(Segment::stats)
            .fold(SegmentStats::default(), |acc, s| SegmentStats {
                total_pages: acc.total_pages + s.total_pages,
                free_pages: acc.free_pages + s.free_pages,
                allocated_pages: acc.allocated_pages + s.allocated_pages,
                reserved_pages: acc.reserved_pages + s.reserved_pages,
            })
    }

    pub fn free_pages(&self) -> usize {
        self.stats().free_pages
    }
}
