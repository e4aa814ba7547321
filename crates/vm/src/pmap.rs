//! The interface to the machine-dependent page tables.
//!
//! Address maps never touch a page table format directly: they describe what should be
//! mapped and a [`Pmap`] makes it so. [`PageDirectory`](crate::PageDirectory) is the
//! implementation shipped with the crate.

use crate::error::PmapError;
use crate::map::Protection;
use crate::{PhysicalAddress, VirtualAddress};

pub trait Pmap: Send + Sync {
    /// Maps the page at `va` to `pa`, replacing any existing translation.
    fn enter(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        wired: bool,
    ) -> Result<(), PmapError>;

    /// Removes every translation in `[start, end)`. Unmapped pages are skipped.
    fn remove(&self, start: VirtualAddress, end: VirtualAddress);

    /// Reduces the protection of existing translations in `[start, end)` to `prot`.
    ///
    /// Translations are never made more permissive; an empty `prot` removes them.
    fn protect(&self, start: VirtualAddress, end: VirtualAddress, prot: Protection);

    /// Returns the physical page `va` translates to.
    fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}
