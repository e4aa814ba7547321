//! Read-only snapshots for the kernel debugger.
//!
//! Nothing here feeds back into allocation decisions.

use core::fmt;

use crate::page::{MAX_ORDER, ORDER_NONE, Page, PageState, PageUsage};
use crate::segment::{Segment, SegmentStats, Selector};
use crate::{HumanSize, PhysicalAddress};

/// Hash chain statistics of the resident cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketOccupancy {
    pub buckets: usize,
    pub empty: usize,
    /// Tabled pages across all chains.
    pub pages: usize,
    pub longest: usize,
}

impl fmt::Display for BucketOccupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pages in {} buckets ({} empty, longest chain {})",
            self.pages, self.buckets, self.empty, self.longest
        )
    }
}

/// A copy of every field of one page descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDump {
    /// `None` for fictitious pages.
    pub phys: Option<PhysicalAddress>,
    pub usage: PageUsage,
    pub order: Option<u8>,
    pub state: PageState,
    pub wire_count: u32,
    pub object: Option<usize>,
    pub offset: usize,
}

impl PageDump {
    pub fn of(page: &Page) -> Self {
        let order = page.order();
        Self {
            phys: (!page.is_fictitious()).then(|| page.phys()),
            usage: page.usage(),
            order: (order != ORDER_NONE).then_some(order),
            state: page.state(),
            wire_count: page.wire_count(),
            object: page.object_id(),
            offset: page.offset(),
        }
    }
}

impl fmt::Display for PageDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phys {
            Some(phys) => write!(f, "page {}", phys)?,
            None => f.write_str("fictitious page")?,
        }
        write!(f, " {:?}", self.usage)?;
        if let Some(order) = self.order {
            write!(f, " order={}", order)?;
        }
        if let Some(object) = self.object {
            write!(f, " object={} offset={:#x}", object, self.offset)?;
        }
        if self.wire_count > 0 {
            write!(f, " wired={}", self.wire_count)?;
        }
        write!(f, " [")?;
        for (i, (name, _)) in self.state.iter_names().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            f.write_str(name)?;
        }
        f.write_str("]")
    }
}

/// Bounds, accounting and free list lengths of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub selector: Selector,
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
    pub stats: SegmentStats,
    pub free_blocks: [usize; MAX_ORDER + 1],
}

impl SegmentSummary {
    pub fn of(segment: &Segment) -> Self {
        let mut free_blocks = [0; MAX_ORDER + 1];
        for (order, count) in free_blocks.iter_mut().enumerate() {
            *count = segment.free_blocks(order);
        }
        Self {
            selector: segment.selector(),
            start: segment.start(),
            end: segment.end(),
            stats: segment.stats(),
            free_blocks,
        }
    }
}

impl fmt::Display for SegmentSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {}..{}: {} free, {} allocated, {} reserved",
            self.selector,
            self.start,
            self.end,
            HumanSize::pages(self.stats.free_pages),
            HumanSize::pages(self.stats.allocated_pages),
            HumanSize::pages(self.stats.reserved_pages),
        )?;
        for (order, count) in self.free_blocks.iter().enumerate() {
            write!(f, " {}:{}", order, count)?;
        }
        Ok(())
    }
}
