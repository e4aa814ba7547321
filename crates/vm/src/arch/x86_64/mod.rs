//! x86_64 hardware support.
//!
//! Entry flags are the x86_64 crate's `PageTableFlags`; TLB maintenance uses `invlpg`.

mod flags;

pub use flags::PageFlags;

use crate::VirtualAddress;

/// Invalidates the TLB entry for a single page on the current CPU.
#[inline]
pub fn flush_tlb(address: VirtualAddress) {
    ::x86_64::instructions::tlb::flush(::x86_64::VirtAddr::new(address.as_usize() as u64));
}
