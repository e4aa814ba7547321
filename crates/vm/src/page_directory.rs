//! Four-level page tables backed by the physical allocator.
//!
//! `PageDirectory` owns a root table and every intermediate table below it. Tables are
//! ordinary physical pages tagged [`PageUsage::Table`], reached through the
//! [`AddressTranslator`], and freed when the directory is dropped. Leaf entries point at
//! pages the directory does not own.

use crate::address::AddressTranslator;
use crate::arch::{self, ENTRIES_PER_TABLE, PAGE_TABLE_LEVELS, PageEntry, PageFlags};
use crate::error::PmapError;
use crate::map::Protection;
use crate::page::PageUsage;
use crate::physical_allocator::PhysicalAllocator;
use crate::pmap::Pmap;
use crate::segment::Selector;
use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

#[repr(C, align(4096))]
struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

/// Locates the table stored at `phys`.
///
/// # Safety
///
/// `phys` must hold a page table owned by the calling directory, and the directory lock
/// must be held for the lifetime of the returned reference.
unsafe fn table_at<'a>(phys: PhysicalAddress) -> &'a mut PageTable {
    unsafe { &mut *AddressTranslator::current().phys_to_ptr::<PageTable>(phys) }
}

struct Tables {
    root: PhysicalAddress,
}

impl Tables {
    /// Finds the leaf entry for `va`.
    ///
    /// When an intermediate table is missing and `allocator` is `None`, returns the span of
    /// address space the missing table would have covered.
    fn walk(
        &mut self,
        va: usize,
        allocator: Option<&PhysicalAllocator>,
    ) -> Result<&mut PageEntry, Result<usize, PmapError>> {
        // SAFETY: the root is owned by this directory and the caller holds its lock.
        let mut table = unsafe { table_at(self.root) };
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let entry = &mut table.entries[arch::page_index(va, level)];
            if !entry.is_present() {
                let Some(allocator) = allocator else {
                    return Err(Ok(arch::level_span(level)));
                };
                let page = allocator
                    .alloc(0, Selector::DirectMap, PageUsage::Table)
                    .map_err(|_| Err(PmapError::OutOfMemory))?;
                page.zero();
                let mut flags = PageFlags::empty();
                flags.set_present(true);
                flags.set_writable(true);
                flags.set_user(true);
                *entry = PageEntry::new(page.phys(), flags);
            }
            let Some(next) = entry.address() else {
                unreachable!("present entry without an address");
            };
            // SAFETY: intermediate entries only ever point at tables this directory owns.
            table = unsafe { table_at(next) };
        }
        Ok(&mut table.entries[arch::page_index(va, 0)])
    }

    /// Visits every present leaf entry in `[start, end)`.
    fn for_each_leaf(&mut self, start: usize, end: usize, mut visit: impl FnMut(usize, &mut PageEntry)) {
        let mut va = start;
        while va < end {
            match self.walk(va, None) {
                Ok(entry) => {
                    if entry.is_present() {
                        visit(va, entry);
                    }
                    va += PAGE_SIZE;
                }
                Err(Ok(span)) => va = (va & !(span - 1)) + span,
                Err(Err(_)) => unreachable!("walk without an allocator never allocates"),
            }
        }
    }
}

pub struct PageDirectory {
    allocator: &'static PhysicalAllocator,
    tables: spin::Mutex<Tables>,
    user: bool,
}

impl PageDirectory {
    /// Creates an empty directory. `user` marks its leaf translations user-accessible.
    pub fn new(allocator: &'static PhysicalAllocator, user: bool) -> Result<Self, PmapError> {
        let root = allocator
            .alloc(0, Selector::DirectMap, PageUsage::Table)
            .map_err(|_| PmapError::OutOfMemory)?;
        root.zero();
        log::trace!("page directory root at {}", root.phys());
        Ok(Self {
            allocator,
            tables: spin::Mutex::new(Tables { root: root.phys() }),
            user,
        })
    }

    /// Physical address of the root table.
    pub fn root(&self) -> PhysicalAddress {
        self.tables.lock().root
    }

    fn flags(&self, prot: Protection, wired: bool) -> PageFlags {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_writable(prot.contains(Protection::WRITE));
        flags.set_no_execute(!prot.contains(Protection::EXECUTE));
        flags.set_user(self.user);
        flags.set_wired(wired);
        flags
    }

    /// Counts present leaf translations in `[start, end)`.
    pub fn mapped_pages(&self, start: VirtualAddress, end: VirtualAddress) -> usize {
        let mut count = 0;
        self.tables
            .lock()
            .for_each_leaf(start.as_usize(), end.as_usize(), |_, _| count += 1);
        count
    }

    fn free_table(&self, phys: PhysicalAddress, level: usize) {
        if level > 0 {
            // SAFETY: called from drop, which has exclusive access to every table.
            let table = unsafe { table_at(phys) };
            for entry in table.entries.iter() {
                if let Some(child) = entry.address() {
                    self.free_table(child, level - 1);
                }
            }
        }
        match self.allocator.lookup(phys) {
            Some(page) => self.allocator.free(page, 0),
            None => log::error!("page table {} has no descriptor", phys),
        }
    }
}

impl Pmap for PageDirectory {
    fn enter(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: Protection,
        wired: bool,
    ) -> Result<(), PmapError> {
        debug_assert!(va.is_aligned(PAGE_SIZE) && pa.is_aligned(PAGE_SIZE));
        let flags = self.flags(prot, wired);
        let mut tables = self.tables.lock();
        let entry = tables
            .walk(va.as_usize(), Some(self.allocator))
            .map_err(|err| err.err().unwrap_or(PmapError::OutOfMemory))?;
        let replaced = entry.is_present();
        *entry = PageEntry::new(pa, flags);
        if replaced {
            arch::flush_tlb(va);
        }
        Ok(())
    }

    fn remove(&self, start: VirtualAddress, end: VirtualAddress) {
        self.tables
            .lock()
            .for_each_leaf(start.as_usize(), end.as_usize(), |va, entry| {
                entry.clear();
                arch::flush_tlb(VirtualAddress::new(va));
            });
    }

    fn protect(&self, start: VirtualAddress, end: VirtualAddress, prot: Protection) {
        if prot.is_empty() {
            self.remove(start, end);
            return;
        }
        self.tables
            .lock()
            .for_each_leaf(start.as_usize(), end.as_usize(), |va, entry| {
                let mut flags = entry.flags();
                flags.set_writable(flags.is_writable() && prot.contains(Protection::WRITE));
                if !prot.contains(Protection::EXECUTE) {
                    flags.set_no_execute(true);
                }
                entry.set_flags(flags);
                arch::flush_tlb(VirtualAddress::new(va));
            });
    }

    fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let mut tables = self.tables.lock();
        let entry = tables.walk(va.align_down(PAGE_SIZE).as_usize(), None).ok()?;
        entry.address().map(|page| page + va.page_offset())
    }
}

impl Drop for PageDirectory {
    fn drop(&mut self) {
        let root = self.tables.get_mut().root;
        self.free_table(root, PAGE_TABLE_LEVELS - 1);
    }
}
