//! Physical segments and their buddy free lists.
//!
//! A segment is a contiguous, page-aligned range of physical memory with one descriptor
//! per page. Free memory is kept in `MAX_ORDER + 1` lists of naturally aligned
//! `2^order`-page blocks, threaded through the descriptors of each block's first page.
//! Pages inside the segment that were never released (holes in the boot map, boot data,
//! the bootstrap heap) stay `Reserved` and never reach the free lists.

use alloc::vec::Vec;
use core::fmt;

use crate::list::{PageList, QueueLinkage};
use crate::page::{MAX_ORDER, ORDER_NONE, Page, PageUsage};
use crate::{PAGE_SIZE, PhysicalAddress, block_buddy_address};

/// Number of free lists (orders 0 through MAX_ORDER inclusive).
const NUM_FREE_LISTS: usize = MAX_ORDER + 1;

/// Physical address classes, from the most to the least restrictive.
///
/// A request for a selector may be satisfied from its own segment or from the segment of
/// any lower selector, never from a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Selector {
    /// Reachable by ISA DMA (below 16 MiB by default).
    Dma = 0,
    /// Reachable by 32-bit DMA.
    Dma32 = 1,
    /// Covered by the kernel's direct map.
    DirectMap = 2,
    /// Everything else.
    HighMem = 3,
}

impl Selector {
    pub const ALL: [Selector; 4] = [Self::Dma, Self::Dma32, Self::DirectMap, Self::HighMem];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::DirectMap => "DirectMap",
            Self::HighMem => "HighMem",
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Page accounting for one segment.
///
/// `free_pages + allocated_pages + reserved_pages == total_pages` at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentStats {
    pub total_pages: usize,
    pub free_pages: usize,
    pub allocated_pages: usize,
    pub reserved_pages: usize,
}

struct FreeArea {
    lists: [PageList<QueueLinkage>; NUM_FREE_LISTS],
    stats: SegmentStats,
}

pub struct Segment {
    selector: Selector,
    start: PhysicalAddress,
    pages: &'static [Page],
    area: spin::Mutex<FreeArea>,
}

impl Segment {
    /// Creates a segment over `pages`, which must describe contiguous physical pages.
    ///
    /// Every page starts out reserved; memory becomes allocatable through [`Self::release`].
    pub(crate) fn new(selector: Selector, pages: &'static [Page]) -> Self {
        assert!(!pages.is_empty(), "segment without pages");
        let start = pages[0].phys();
        log::debug!(
            "{} segment {}..{} ({} pages)",
            selector,
            start,
            start + pages.len() * PAGE_SIZE,
            pages.len()
        );

        Self {
            selector,
            start,
            pages,
            area: spin::Mutex::new(FreeArea {
                lists: [const { PageList::new() }; NUM_FREE_LISTS],
                stats: SegmentStats {
                    total_pages: pages.len(),
                    reserved_pages: pages.len(),
                    ..SegmentStats::default()
                },
            }),
        }
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    pub fn start(&self) -> PhysicalAddress {
        self.start
    }

    pub fn end(&self) -> PhysicalAddress {
        self.start + self.pages.len() * PAGE_SIZE
    }

    pub fn contains(&self, address: PhysicalAddress) -> bool {
        address >= self.start && address < self.end()
    }

    /// Returns the descriptor of the page containing `address`.
    pub fn page(&self, address: PhysicalAddress) -> Option<&'static Page> {
        self.contains(address)
            .then(|| &self.pages[(address - self.start) / PAGE_SIZE])
    }

    fn index_of(&self, page: &Page) -> usize {
        let address = page.phys();
        assert!(
            self.contains(address),
            "page {} does not belong to the {} segment",
            address,
            self.selector
        );
        (address - self.start) / PAGE_SIZE
    }

    /// Allocates a `2^order`-page block and tags every page in it with `usage`.
    ///
    /// Returns `None` when no block is large enough. Never blocks.
    pub fn alloc(&self, order: usize, usage: PageUsage) -> Option<&'static Page> {
        debug_assert!(order <= MAX_ORDER);
        let mut area = self.area.lock();

        let found = (order..=MAX_ORDER).find(|&o| !area.lists[o].is_empty())?;
        let head = area.lists[found].pop_front()?;
        head.set_order(ORDER_NONE);

        // Keep the lower half, return the upper halves to the lower orders.
        let index = self.index_of(head);
        for split in (order..found).rev() {
            let buddy = &self.pages[index + (1 << split)];
            buddy.set_order(split as u8);
            area.lists[split].push_front(buddy);
        }

        let count = 1 << order;
        for page in &self.pages[index..index + count] {
            page.set_usage(usage);
        }
        area.stats.free_pages -= count;
        area.stats.allocated_pages += count;

        log::trace!(
            "{}: allocated order {} block at {} (split from order {})",
            self.selector,
            order,
            head.phys(),
            found
        );
        Some(head)
    }

    /// Returns a `2^order`-page block to the free lists, merging it with free buddies.
    ///
    /// # Panics
    ///
    /// Panics on an order above `MAX_ORDER`, a block that is not aligned to its order,
    /// a page that belongs to another segment, and on freeing a page that is already free
    /// or boot-reserved.
    pub fn free(&self, page: &'static Page, order: usize) {
        assert!(order <= MAX_ORDER, "free of order {order} exceeds MAX_ORDER");
        let index = self.index_of(page);
        assert!(
            page.phys().frame_number().is_order_aligned(order),
            "free of unaligned order {} block at {}",
            order,
            page.phys()
        );
        let count = 1 << order;
        assert!(index + count <= self.pages.len(), "block extends past segment end");

        let mut area = self.area.lock();
        for page in &self.pages[index..index + count] {
            match page.usage() {
                PageUsage::Free => {
                    log::error!("double free of page {}", page.phys());
                    panic!("double free of page {}", page.phys());
                }
                PageUsage::Reserved => panic!("freeing boot-reserved page {}", page.phys()),
                _ => page.set_usage(PageUsage::Free),
            }
        }
        area.stats.allocated_pages -= count;
        area.stats.free_pages += count;
        self.insert_free_block(&mut area, index, order);
    }

    /// Makes the reserved pages of `[start, end)` allocatable.
    ///
    /// The range is clipped to the segment and shrunk to whole pages, then loaded in the
    /// largest naturally aligned blocks that fit.
    pub(crate) fn release(&self, start: PhysicalAddress, end: PhysicalAddress) {
        let mut address = start.max(self.start).align_up(PAGE_SIZE);
        let end = end.min(self.end()).align_down(PAGE_SIZE);

        let mut area = self.area.lock();
        while address < end {
            let frame = address.frame_number();
            let mut order = MAX_ORDER;
            while order > 0
                && (!frame.is_order_aligned(order) || address + (PAGE_SIZE << order) > end)
            {
                order -= 1;
            }

            let index = (address - self.start) / PAGE_SIZE;
            let count = 1 << order;
            for page in &self.pages[index..index + count] {
                assert_eq!(
                    page.usage(),
                    PageUsage::Reserved,
                    "releasing page {} that is not reserved",
                    page.phys()
                );
                page.set_usage(PageUsage::Free);
            }
            area.stats.reserved_pages -= count;
            area.stats.free_pages += count;
            self.insert_free_block(&mut area, index, order);

            address = address + (PAGE_SIZE << order);
        }
    }

    fn insert_free_block(&self, area: &mut FreeArea, mut index: usize, mut order: usize) {
        while order < MAX_ORDER {
            let address = self.pages[index].phys();
            let Some(buddy) = self.page(block_buddy_address(address, order)) else {
                break;
            };
            if buddy.usage() != PageUsage::Free || buddy.order() != order as u8 {
                break;
            }

            area.lists[order].remove(buddy);
            buddy.set_order(ORDER_NONE);
            index = index.min(self.index_of(buddy));
            order += 1;
            log::trace!("{}: merged into order {} block", self.selector, order);
        }

        let head = &self.pages[index];
        head.set_order(order as u8);
        area.lists[order].push_front(head);
    }

    pub fn stats(&self) -> SegmentStats {
        self.area.lock().stats
    }

    /// Returns the number of free blocks at a specific order.
    pub fn free_blocks(&self, order: usize) -> usize {
        self.area.lock().lists.get(order).map_or(0, |list| list.len())
    }

    /// Returns the start addresses of the free blocks at `order`, for diagnostics.
    pub fn free_block_addresses(&self, order: usize) -> Vec<PhysicalAddress> {
        let area = self.area.lock();
        area.lists
            .get(order)
            .map(|list| list.iter().map(|page| page.phys()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn pages(&self) -> &'static [Page] {
        self.pages
    }
}
