//! Boot-time memory description.
//!
//! Everything here runs before the page allocator exists, so it only uses fixed-size
//! arrays: the boot memory map and its overlap resolution, the registry of boot data
//! that must never be handed out, and the bump allocator that carves the descriptor and
//! hash bucket arrays out of physical memory.

mod data;
mod heap;
mod map;
mod regions;

pub use data::{BOOT_DATA_CAPACITY, BootData, BootDataRange};
pub use heap::{BootstrapHeap, HeapMode};
pub use map::{BOOT_MAP_CAPACITY, BootMap, BootMemoryEntry, BootMemoryRegion, BootMemoryType};
pub(crate) use regions::{MemoryRegion, RegionArray};

/// Fatal conditions during boot memory setup.
///
/// There is nobody to report these to: the kernel stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("boot memory map has more than {BOOT_MAP_CAPACITY} entries")]
    MapFull,
    #[error("more than {BOOT_DATA_CAPACITY} boot data ranges registered")]
    BootDataFull,
    #[error("region scratch array overflowed")]
    RegionsFull,
    #[error("no available memory below the DMA limit")]
    NoDmaSegment,
    #[error("bootstrap heap exhausted ({requested} bytes requested)")]
    HeapExhausted { requested: usize },
    #[error("boot data range {start:#x}..{end:#x} runs past the last page")]
    RangeOverflow { start: u64, end: u64 },
}
