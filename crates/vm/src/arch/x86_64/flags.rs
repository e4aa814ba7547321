//! Page table entry flags for x86_64 architecture.

use ::x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags. Bit 9 is available to software
/// and records that the mapping is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(PageTableFlags::from_bits_truncate(bits))
    }

    pub const fn bits(self) -> u64 {
        self.0.bits()
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn set_present(&mut self, present: bool) {
        self.0.set(PageTableFlags::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, no_execute);
    }

    pub fn is_wired(self) -> bool {
        self.0.contains(PageTableFlags::BIT_9)
    }

    pub fn set_wired(&mut self, wired: bool) {
        self.0.set(PageTableFlags::BIT_9, wired);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
