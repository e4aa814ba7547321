//! Registry of physical ranges the boot loader has already consumed.
//!
//! The kernel image, command line, modules and symbol tables live in memory the boot map
//! calls available. They are registered here before the allocator is loaded so those
//! pages are never handed out. Temporary ranges can be given back once their consumer is
//! done with them.

use super::BootError;
use crate::PAGE_SIZE;

/// Maximum number of boot data ranges.
pub const BOOT_DATA_CAPACITY: usize = 32;

/// A page-aligned physical range holding boot data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootDataRange {
    pub start: u64,
    pub end: u64,
    /// Released by [`crate::VmSystem::release_temporary_boot_data`].
    pub temporary: bool,
}

#[derive(Debug, Clone)]
pub struct BootData {
    ranges: [BootDataRange; BOOT_DATA_CAPACITY],
    len: usize,
}

impl BootData {
    pub const fn new() -> Self {
        Self {
            ranges: [BootDataRange { start: 0, end: 0, temporary: false }; BOOT_DATA_CAPACITY],
            len: 0,
        }
    }

    /// Registers `[start, end)`, widened outward to whole pages.
    pub fn register(&mut self, start: u64, end: u64, temporary: bool) -> Result<(), BootError> {
        let page = PAGE_SIZE as u64;
        let Some(aligned_end) = end.checked_next_multiple_of(page) else {
            return Err(BootError::RangeOverflow { start, end });
        };
        let start = start & !(page - 1);
        let end = aligned_end;
        if start >= end {
            return Ok(());
        }
        if self.len == BOOT_DATA_CAPACITY {
            log::error!("boot data registry full registering {:#x}..{:#x}", start, end);
            return Err(BootError::BootDataFull);
        }

        log::debug!(
            "boot data {:#x}..{:#x}{}",
            start,
            end,
            if temporary { " (temporary)" } else { "" }
        );
        self.ranges[self.len] = BootDataRange { start, end, temporary };
        self.len += 1;
        Ok(())
    }

    pub fn ranges(&self) -> &[BootDataRange] {
        &self.ranges[..self.len]
    }

    /// Returns whether any registered range intersects `[start, end)`.
    pub fn overlaps(&self, start: u64, end: u64) -> bool {
        self.ranges().iter().any(|r| r.start < end && start < r.end)
    }

    /// Removes every temporary range and returns them.
    pub fn unregister_temporary(&mut self) -> BootData {
        let mut released = BootData::new();
        let mut kept = 0;
        for i in 0..self.len {
            let range = self.ranges[i];
            if range.temporary {
                released.ranges[released.len] = range;
                released.len += 1;
            } else {
                self.ranges[kept] = range;
                kept += 1;
            }
        }
        self.len = kept;
        released
    }
}

impl Default for BootData {
    fn default() -> Self {
        Self::new()
    }
}
