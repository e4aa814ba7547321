//! Software emulation implementation for testing and development.
//!
//! Physical memory is a zeroed, page-aligned host allocation and physical addresses are
//! offsets into it. There is no TLB to maintain.

mod flags;

pub use flags::PageFlags;

use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::VirtualAddress;

use super::PAGE_SIZE;

/// Nothing to invalidate in the software model.
#[inline]
pub fn flush_tlb(_address: VirtualAddress) {}

/// Emulated physical memory.
///
/// The host allocation is made with `alloc_zeroed`, so untouched pages of a large
/// emulated machine cost nothing until they are written.
pub struct EmulatedMemory {
    base: *mut u8,
    layout: Layout,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if the size is zero or the host allocation fails.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "emulated memory must not be empty");
        let layout = Layout::from_size_align(size.next_multiple_of(PAGE_SIZE), PAGE_SIZE)
            .expect("invalid emulated memory layout");
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "failed to allocate emulated memory");
        Self { base, layout }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.layout.size(), "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base as usize);
        assert!(
            offset < self.layout.size(),
            "pointer not within emulated memory"
        );
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.base, self.layout) };
    }
}
