//! Tunables for the virtual memory system.

use crate::boot::HeapMode;

/// Configuration consumed by [`VmSystem::bootstrap`](crate::VmSystem::bootstrap).
///
/// All values have working defaults; the builder-style `with_*` methods override them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Ceiling of the ISA DMA segment.
    pub dma_limit: u64,
    /// Ceiling of the 32-bit DMA segment, when the platform has one.
    pub dma32_limit: Option<u64>,
    /// Ceiling of the directly mapped segment.
    pub direct_map_limit: u64,
    /// Ceiling of high memory.
    pub high_mem_limit: u64,
    /// Direction of the bootstrap bump allocator.
    pub heap_mode: HeapMode,
    /// Physical pages per resident hash bucket (rounded to a power-of-two bucket count).
    pub pages_per_bucket: usize,
    /// Free page count under which allocations wake the pageout daemon.
    pub free_min: usize,
    /// Free page count the pageout daemon aims for.
    pub free_target: usize,
    /// Maximum number of pages in one page-list copy chunk.
    pub page_list_max: usize,
    /// Number of fictitious descriptors added each time the pool runs dry.
    pub fictitious_chunk: usize,
    /// Address range managed by the kernel map.
    pub kernel_map_start: usize,
    pub kernel_map_end: usize,
    /// Address range managed by task maps.
    pub user_map_start: usize,
    pub user_map_end: usize,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            dma_limit: 16 << 20,
            dma32_limit: Some(4 << 30),
            direct_map_limit: 256 << 30,
            high_mem_limit: 1 << 52,
            heap_mode: HeapMode::TopDown,
            pages_per_bucket: 1,
            free_min: 64,
            free_target: 256,
            page_list_max: 64,
            fictitious_chunk: 64,
            kernel_map_start: 0xFFFF_9000_0000_0000,
            kernel_map_end: 0xFFFF_A000_0000_0000,
            user_map_start: 0x1000,
            user_map_end: 0x0000_7FFF_FFFF_F000,
        }
    }

    pub const fn with_dma32_limit(mut self, limit: Option<u64>) -> Self {
        self.dma32_limit = limit;
        self
    }

    pub const fn with_heap_mode(mut self, mode: HeapMode) -> Self {
        self.heap_mode = mode;
        self
    }

    pub const fn with_free_min(mut self, free_min: usize) -> Self {
        self.free_min = free_min;
        self
    }

    pub const fn with_free_target(mut self, free_target: usize) -> Self {
        self.free_target = free_target;
        self
    }

    pub const fn with_page_list_max(mut self, pages: usize) -> Self {
        self.page_list_max = pages;
        self
    }

    pub const fn with_pages_per_bucket(mut self, pages: usize) -> Self {
        self.pages_per_bucket = pages;
        self
    }

    /// Returns the segment ceilings in ascending selector order.
    pub(crate) const fn ceilings(&self) -> [Option<u64>; 4] {
        [
            Some(self.dma_limit),
            self.dma32_limit,
            Some(self.direct_map_limit),
            Some(self.high_mem_limit),
        ]
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}
