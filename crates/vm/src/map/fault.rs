//! Page fault resolution.

use alloc::sync::Arc;

use super::copy::copy_object_range;
use super::{EntryObject, Protection, VmMap};
use crate::error::VmError;
use crate::object::VmObject;
use crate::page::{Page, PageState};
use crate::{PAGE_SIZE, VirtualAddress};

impl VmMap {
    /// Makes the page at `address` accessible for `access`.
    ///
    /// Anonymous entries get their object on first touch and pending copies are resolved
    /// on the first write; both need the map write lock, after which the lookup starts
    /// over. Missing pages are zero-filled. With `wiring` the page is pinned instead of
    /// activated.
    pub fn fault(&self, address: usize, access: Protection, wiring: bool) -> Result<(), VmError> {
        let va = address & !(PAGE_SIZE - 1);
        let write = access.contains(Protection::WRITE);
        loop {
            let inner = self.inner.read();
            let entry = inner
                .entry_containing(va)
                .ok_or(VmError::InvalidAddress(address))?;

            if let EntryObject::SubMap(submap) = &entry.object {
                let submap = Arc::clone(submap);
                drop(inner);
                return submap.fault(address, access, wiring);
            }
            if !entry.protection.contains(access) {
                return Err(VmError::ProtectionFailure(address));
            }

            let ready = match &entry.object {
                EntryObject::Object(object) if !(entry.needs_copy && write) => Some(Arc::clone(object)),
                _ => None,
            };
            let Some(object) = ready else {
                let start = entry.start;
                drop(inner);
                self.prepare_entry(start, write)?;
                continue;
            };

            let cache = self.vm.cache();
            let page = self.resolve_page(&object, entry.offset_of(va))?;
            if wiring {
                cache.wire(page);
            } else {
                cache.activate(page);
            }
            page.insert_state(PageState::REFERENCED);
            if let Err(err) =
                self.pmap
                    .enter(VirtualAddress::new(va), page.phys(), entry.effective_protection(), wiring)
            {
                if wiring {
                    cache.unwire(page);
                }
                return Err(err.into());
            }
            return Ok(());
        }
    }

    /// Gives the entry at `start` an object of its own, or resolves its pending copy.
    fn prepare_entry(&self, start: usize, write: bool) -> Result<(), VmError> {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&start) else {
            return Ok(());
        };

        match &entry.object {
            EntryObject::None => {
                entry.object = EntryObject::Object(self.vm.object_create(entry.size()));
                entry.offset = 0;
                entry.needs_copy = false;
                log::trace!("anonymous object created for {:#x}", start);
            }
            EntryObject::Object(source) if entry.needs_copy && write => {
                let source = Arc::clone(source);
                let copy = copy_object_range(self.vm, &source, entry.offset, entry.size())?;
                if entry.wired_count > 0 {
                    let cache = self.vm.cache();
                    for va in (entry.start..entry.end).step_by(PAGE_SIZE) {
                        if let Some(old) = source.page_at(entry.offset_of(va))
                            && old.wire_count() > 0
                        {
                            cache.unwire(old);
                        }
                        if let Some(new) = copy.page_at(va - entry.start) {
                            cache.wire(new);
                        }
                    }
                }
                entry.object = EntryObject::Object(copy);
                entry.offset = 0;
                entry.needs_copy = false;
                self.pmap
                    .remove(VirtualAddress::new(entry.start), VirtualAddress::new(entry.end));
                log::trace!("private copy made for {:#x}..{:#x}", entry.start, entry.end);
            }
            _ => {}
        }
        Ok(())
    }

    /// Finds or creates the page at `offset` of `object`.
    fn resolve_page(&self, object: &VmObject, offset: usize) -> Result<&'static Page, VmError> {
        let cache = self.vm.cache();
        let mut state = object.lock();
        match cache.lookup(&state, offset) {
            Some(placeholder) if placeholder.is_fictitious() => {
                let real = cache.grab()?;
                real.zero();
                cache.convert_fictitious(&mut state, placeholder, real);
                real.remove_state(PageState::ABSENT | PageState::BUSY);
                Ok(real)
            }
            Some(page) => Ok(page),
            None => {
                let page = cache.alloc(&mut state, offset)?;
                page.zero();
                Ok(page)
            }
        }
    }
}
