//! Architecture-specific implementations for memory management.
//!
//! The page table geometry is shared: both the hardware and the software model use
//! 4 KiB pages and four levels of 512-entry tables. What differs is how entry flags are
//! encoded, how the TLB is flushed and whether physical memory is real or emulated.

use crate::PhysicalAddress;

// Use x86_64 hardware implementation when we're on x86_64 and not testing or emulating.
// NOTE: We DO include the module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of page table levels.
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Number of entries in one page table.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Returns the page table index for a given virtual address at the specified level.
///
/// Level 0 is the page table (PT), level 3 is the root (PML4).
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "page table level out of range");
    (address >> (PAGE_SHIFT + level * 9)) & (ENTRIES_PER_TABLE - 1)
}

/// Returns the number of bytes covered by one entry at the given level.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << (PAGE_SHIFT + level * 9)
}

/// Validates a physical address against the maximum physical address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= (1usize << MAX_PHYSICAL_BITS) - 1
}

/// Validates a virtual address.
///
/// Virtual addresses must be canonical (bits 48-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

/// A single page table entry.
///
/// Entries are 64-bit values holding a page-aligned physical address and flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// Bits 12-51 contain the physical address.
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

    /// Creates a new page table entry.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.is_aligned(PAGE_SIZE),
            "physical address must be page-aligned"
        );
        Self((address.as_usize() as u64 & Self::ADDRESS_MASK) | (flags.bits() & !Self::ADDRESS_MASK))
    }

    /// Returns the physical address stored in this entry, or `None` if it is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits(self.0 & !Self::ADDRESS_MASK)
    }

    /// Replaces the flags, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.bits() & !Self::ADDRESS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}
