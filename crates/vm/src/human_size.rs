//! Byte counts for log lines.

use core::fmt;

use crate::PAGE_SIZE;

/// A byte count shown with a binary prefix, truncated to at most two decimals.
///
/// Only integer arithmetic is used, so boot code can log sizes before the FPU is usable.
///
/// ```
/// use vm::HumanSize;
///
/// assert_eq!(HumanSize(1536).to_string(), "1.5KiB");
/// assert_eq!(HumanSize::pages(256).to_string(), "1MiB");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HumanSize(pub u64);

impl HumanSize {
    /// The size of `count` pages.
    pub const fn pages(count: usize) -> Self {
        Self((count as u64) * PAGE_SIZE as u64)
    }
}

impl From<usize> for HumanSize {
    fn from(bytes: usize) -> Self {
        Self(bytes as u64)
    }
}

const PREFIXES: [&str; 7] = ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei"];

impl fmt::Display for HumanSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        let scale = if bytes == 0 {
            0
        } else {
            (bytes.ilog2() / 10) as usize
        };
        let shift = 10 * scale as u32;

        let whole = bytes >> shift;
        let fraction = u128::from(bytes - (whole << shift));
        let cents = ((fraction * 100) >> shift) as u64;

        write!(f, "{whole}")?;
        if cents % 10 != 0 {
            write!(f, ".{cents:02}")?;
        } else if cents != 0 {
            write!(f, ".{}", cents / 10)?;
        }
        write!(f, "{}B", PREFIXES[scale])
    }
}
