//! Physical frame numbers.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PhysicalAddress, arch};

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses.
/// Segments index their descriptor arrays by frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << arch::PAGE_SHIFT)
    }

    /// Returns whether this frame starts a naturally aligned block of `2^order` frames.
    #[inline]
    pub const fn is_order_aligned(self, order: usize) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() >> arch::PAGE_SHIFT)
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<FrameNumber> for FrameNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: FrameNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_addresses() {
        let frame = FrameNumber::from(PhysicalAddress::new(0x5000));
        assert_eq!(frame.as_usize(), 5);
        assert_eq!(frame.start(), PhysicalAddress::new(0x5000));
        assert_eq!((frame + 3) - frame, 3);
    }

    #[test]
    fn order_alignment() {
        assert!(FrameNumber::new(8).is_order_aligned(3));
        assert!(!FrameNumber::new(12).is_order_aligned(3));
        assert!(FrameNumber::new(12).is_order_aligned(2));
    }
}
