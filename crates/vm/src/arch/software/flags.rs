//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// The bit layout follows x86_64 so that entries look the same in a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u64);

impl PageFlags {
    const PRESENT: u64 = 1 << 0;
    const WRITABLE: u64 = 1 << 1;
    const USER: u64 = 1 << 2;
    /// Software-available bit marking a wired mapping.
    const WIRED: u64 = 1 << 9;
    const NO_EXECUTE: u64 = 1 << 63;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits & (Self::PRESENT | Self::WRITABLE | Self::USER | Self::WIRED | Self::NO_EXECUTE))
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    fn set(&mut self, mask: u64, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }

    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    pub fn set_present(&mut self, present: bool) {
        self.set(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.set(Self::WRITABLE, writable);
    }

    pub fn set_user(&mut self, user: bool) {
        self.set(Self::USER, user);
    }

    pub fn set_no_execute(&mut self, no_execute: bool) {
        self.set(Self::NO_EXECUTE, no_execute);
    }

    pub fn is_wired(self) -> bool {
        (self.0 & Self::WIRED) != 0
    }

    pub fn set_wired(&mut self, wired: bool) {
        self.set(Self::WIRED, wired);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
