#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory (VM)
//!
//! The virtual memory core of the Polaris kernel. It provides:
//!
//! - A buddy allocator over segmented physical memory (DMA, DMA32, direct-mapped and high memory).
//! - Boot-time memory map resolution and the page descriptor pool.
//! - The resident page cache mapping `(object, offset)` pairs to pages, with reclamation queues.
//! - Task address maps with gap tracking, copy-on-write bookkeeping and copy objects.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod boot;
mod config;
mod diag;
mod error;
mod human_size;
mod list;
mod map;
mod numbers;
mod object;
mod page;
mod page_directory;
mod pageout;
mod physical_allocator;
mod pmap;
mod resident;
mod segment;
mod system;

#[cfg(test)]
mod test_support;

pub use address::{
    AddressTranslator, PhysicalAddress, VirtualAddress, block_buddy_address, round_down_to_page,
    round_up_to_page,
};
pub use boot::{
    BOOT_DATA_CAPACITY, BOOT_MAP_CAPACITY, BootData, BootDataRange, BootError, BootMap,
    BootMemoryEntry, BootMemoryRegion, BootMemoryType, BootstrapHeap, HeapMode,
};
pub use config::VmConfig;
pub use diag::{BucketOccupancy, PageDump, SegmentSummary};
pub use error::{AllocError, PmapError, Shortage, VmError};
pub use human_size::HumanSize;
pub use map::{
    CopyContents, CopyEntry, EnterRequest, EntryInfo, EntryObject, Inheritance,
    PageListContinuation, Protection, VmMap, VmMapCopy,
};
pub use numbers::FrameNumber;
pub use object::{CopyStrategy, ObjectState, VmObject};
pub use page::{MAX_ORDER, ORDER_NONE, Page, PageState, PageUsage};
pub use page_directory::PageDirectory;
pub use pageout::{IdlePageout, Pageout};
pub use physical_allocator::PhysicalAllocator;
pub use pmap::Pmap;
pub use resident::{QueueStats, ResidentCache};
pub use segment::{Segment, SegmentStats, Selector};
pub use system::VmSystem;

pub use arch::{PAGE_SHIFT, PAGE_SIZE};
