//! Copy objects: map contents in transit between address spaces.
//!
//! A [`VmMapCopy`] is produced by copying a range out of a map and consumed by mapping it
//! into another one ([`VmMap::copyout`]) or by writing it over an existing mapping
//! ([`VmMap::copy_overwrite`]). Large page-list copies are produced in chunks; each chunk
//! carries a continuation that produces the next.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::{fmt, mem};

use super::entry::MapEntry;
use super::{EnterRequest, EntryObject, Inheritance, Protection, VmMap, check_range};
use crate::error::{Shortage, VmError};
use crate::object::{CopyStrategy, VmObject};
use crate::page::Page;
use crate::resident::ResidentCache;
use crate::system::VmSystem;
use crate::{PAGE_SIZE, VirtualAddress};

/// One entry of an entry-list copy. Offsets are relative to the start of the copy.
#[derive(Debug, Clone)]
pub struct CopyEntry {
    pub offset: usize,
    pub size: usize,
    pub object: Arc<VmObject>,
    pub object_offset: usize,
    pub protection: Protection,
    pub max_protection: Protection,
    pub inheritance: Inheritance,
}

pub enum CopyContents {
    /// Copy-on-write references to the source objects.
    EntryList(Vec<CopyEntry>),
    /// A range of a single object.
    Object { object: Arc<VmObject>, offset: usize },
    /// Pages owned by the copy. `base` is the copy offset of the first page.
    PageList {
        base: usize,
        pages: Vec<&'static Page>,
        continuation: Option<PageListContinuation>,
    },
}

impl fmt::Debug for CopyContents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntryList(entries) => f.debug_tuple("EntryList").field(&entries.len()).finish(),
            Self::Object { object, offset } => f
                .debug_struct("Object")
                .field("object", &object.id())
                .field("offset", &format_args!("{:#x}", offset))
                .finish(),
            Self::PageList { base, pages, continuation } => f
                .debug_struct("PageList")
                .field("base", &format_args!("{:#x}", base))
                .field("pages", &pages.len())
                .field("continued", &continuation.is_some())
                .finish(),
        }
    }
}

/// Produces the remaining chunks of a page-list copy.
pub struct PageListContinuation {
    map: Arc<VmMap>,
    origin: usize,
    next: usize,
    end: usize,
    steal: bool,
}

impl PageListContinuation {
    /// Bytes not yet copied.
    pub fn remaining(&self) -> usize {
        self.end - self.next
    }

    /// Copies the next chunk.
    pub fn resume(self) -> Result<VmMapCopy, VmError> {
        page_list_chunk(&self.map, self.origin, self.next, self.end, self.steal)
    }
}

pub struct VmMapCopy {
    cache: &'static ResidentCache,
    size: usize,
    contents: CopyContents,
}

impl VmMapCopy {
    /// Wraps `size` bytes of `object` starting at `offset`.
    pub fn from_object(object: Arc<VmObject>, offset: usize, size: usize) -> Self {
        Self {
            cache: object.cache(),
            size,
            contents: CopyContents::Object { object, offset },
        }
    }

    /// Total size of the copied range, including chunks not produced yet.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contents(&self) -> &CopyContents {
        &self.contents
    }

    fn take(&mut self) -> CopyContents {
        mem::replace(&mut self.contents, CopyContents::EntryList(Vec::new()))
    }

    /// Returns the source page for copy offset `offset`, advancing through page-list
    /// chunks as needed. `None` means the source is zero-filled.
    fn source_page(&mut self, offset: usize) -> Result<Option<&'static Page>, VmError> {
        loop {
            match &mut self.contents {
                CopyContents::EntryList(entries) => {
                    let found = entries
                        .iter()
                        .find(|e| e.offset <= offset && offset < e.offset + e.size)
                        .and_then(|e| e.object.page_at(e.object_offset + (offset - e.offset)));
                    return Ok(found.filter(|page| !page.is_fictitious()));
                }
                CopyContents::Object { object, offset: base } => {
                    return Ok(object.page_at(*base + offset).filter(|page| !page.is_fictitious()));
                }
                CopyContents::PageList { base, pages, continuation } => {
                    if offset < *base {
                        return Ok(None);
                    }
                    let index = (offset - *base) / PAGE_SIZE;
                    if index < pages.len() {
                        return Ok(Some(pages[index]));
                    }
                    let Some(next) = continuation.take() else {
                        return Ok(None);
                    };
                    let mut chunk = next.resume()?;
                    let contents = chunk.take();
                    for page in mem::replace(&mut self.contents, contents).into_pages() {
                        self.cache.free(page, None);
                    }
                }
            }
        }
    }
}

impl CopyContents {
    fn into_pages(self) -> Vec<&'static Page> {
        match self {
            Self::PageList { pages, .. } => pages,
            _ => Vec::new(),
        }
    }
}

impl Drop for VmMapCopy {
    fn drop(&mut self) {
        if let CopyContents::PageList { pages, .. } = &mut self.contents {
            for page in pages.drain(..) {
                self.cache.free(page, None);
            }
        }
    }
}

impl fmt::Debug for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapCopy")
            .field("size", &format_args!("{:#x}", self.size))
            .field("contents", &self.contents)
            .finish()
    }
}

/// Creates an object holding copies of the resident pages of `source` in
/// `[offset, offset + size)`.
pub(crate) fn copy_object_range(
    vm: &'static VmSystem,
    source: &VmObject,
    offset: usize,
    size: usize,
) -> Result<Arc<VmObject>, VmError> {
    let copy = vm.object_create(size);
    let cache = vm.cache();
    let source_state = source.lock();
    let mut state = copy.lock();
    let pages: Vec<&'static Page> = source_state
        .resident_pages()
        .filter(|page| !page.is_fictitious() && (offset..offset + size).contains(&page.offset()))
        .collect();
    for page in pages {
        let new = cache.grab()?;
        new.copy_from(page);
        cache.insert(new, &mut state, page.offset() - offset);
    }
    drop(state);
    drop(source_state);
    Ok(copy)
}

fn page_list_chunk(
    map: &Arc<VmMap>,
    origin: usize,
    from: usize,
    end: usize,
    steal: bool,
) -> Result<VmMapCopy, VmError> {
    let cache = map.vm.cache();
    let limit = map.vm.config().page_list_max.max(1);
    let chunk_end = end.min(from + limit * PAGE_SIZE);

    let mut pages = Vec::with_capacity((chunk_end - from) / PAGE_SIZE);
    for va in (from..chunk_end).step_by(PAGE_SIZE) {
        match map.take_page(va, steal) {
            Ok(page) => pages.push(page),
            Err(err) => {
                for page in pages {
                    cache.free(page, None);
                }
                return Err(err);
            }
        }
    }

    let continuation = (chunk_end < end).then(|| PageListContinuation {
        map: Arc::clone(map),
        origin,
        next: chunk_end,
        end,
        steal,
    });
    log::trace!("page list chunk {:#x}..{:#x} of {:#x}..{:#x}", from, chunk_end, origin, end);
    Ok(VmMapCopy {
        cache,
        size: end - origin,
        contents: CopyContents::PageList {
            base: from - origin,
            pages,
            continuation,
        },
    })
}

impl VmMap {
    /// Copies `[address, address + size)` out as copy-on-write references.
    ///
    /// Objects that ask for immediate copies, wired ranges and objects mapped anywhere
    /// else are copied now; everything else becomes copy-on-write in this map too.
    pub fn copyin(&self, address: usize, size: usize) -> Result<VmMapCopy, VmError> {
        let end = check_range(address, size)?;
        let mut inner = self.write_settled(address, end);
        inner.check_covered(address, end)?;
        if inner
            .overlapping(address, end)
            .iter()
            .any(|key| inner.entries[key].object.is_submap())
        {
            return Err(VmError::InvalidArgument);
        }

        inner.clip(address);
        inner.clip(end);
        let mut entries = Vec::new();
        for key in inner.overlapping(address, end) {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if matches!(entry.object, EntryObject::None) {
                entry.object = EntryObject::Object(self.vm.object_create(entry.size()));
                entry.offset = 0;
            }
            let Some(object) = entry.object.object().cloned() else {
                continue;
            };

            // The entry and `object` account for two references. Anything beyond that
            // can write the object without going through this entry.
            let shared = Arc::strong_count(&object) > 2;
            let eager = shared
                || object.strategy() == CopyStrategy::Immediate
                || entry.wired_count > 0;
            let (object, object_offset) = if eager {
                (copy_object_range(self.vm, &object, entry.offset, entry.size())?, 0)
            } else {
                if !entry.needs_copy {
                    entry.needs_copy = true;
                    self.pmap.protect(
                        VirtualAddress::new(entry.start),
                        VirtualAddress::new(entry.end),
                        entry.effective_protection(),
                    );
                }
                (object, entry.offset)
            };
            entries.push(CopyEntry {
                offset: entry.start - address,
                size: entry.size(),
                object,
                object_offset,
                protection: entry.protection,
                max_protection: entry.max_protection,
                inheritance: entry.inheritance,
            });
        }
        log::trace!("copied in {} entries at {:#x}", entries.len(), address);
        Ok(VmMapCopy {
            cache: self.vm.cache(),
            size,
            contents: CopyContents::EntryList(entries),
        })
    }

    /// Copies `[address, address + size)` out as a list of pages owned by the copy.
    ///
    /// At most the configured page-list maximum is copied at once; the rest is reachable
    /// through the continuation. With `steal`, pages nobody else can see are moved out of
    /// their object instead of copied.
    pub fn copyin_page_list(
        self: &Arc<Self>,
        address: usize,
        size: usize,
        steal: bool,
    ) -> Result<VmMapCopy, VmError> {
        let end = check_range(address, size)?;
        page_list_chunk(self, address, address, end, steal)
    }

    /// Produces the page at `va` for a page-list copy.
    fn take_page(&self, va: usize, steal: bool) -> Result<&'static Page, VmError> {
        self.fault(va, Protection::READ, false)?;
        let inner = self.inner.read();
        let entry = inner.entry_containing(va).ok_or(VmError::InvalidAddress(va))?;
        if let EntryObject::SubMap(submap) = &entry.object {
            let submap = Arc::clone(submap);
            drop(inner);
            return submap.take_page(va, steal);
        }

        let object = entry.object.object().ok_or(VmError::InvalidAddress(va))?;
        let cache = self.vm.cache();
        let mut state = object.lock();
        let source = cache
            .lookup(&state, entry.offset_of(va))
            .ok_or(VmError::InvalidAddress(va))?;

        let private = Arc::strong_count(object) == 1 && !entry.needs_copy;
        if steal && private && source.wire_count() == 0 && !source.is_fictitious() {
            cache.remove(source, &mut state);
            self.pmap
                .remove(VirtualAddress::new(va), VirtualAddress::new(va + PAGE_SIZE));
            return Ok(source);
        }

        let page = cache.grab()?;
        page.copy_from(source);
        Ok(page)
    }

    /// Maps `copy` at a free range and returns its address.
    pub fn copyout(&self, mut copy: VmMapCopy) -> Result<usize, VmError> {
        let size = copy.size;
        match copy.take() {
            CopyContents::EntryList(entries) => {
                let mut inner = self.inner.write();
                let start = inner
                    .gaps
                    .find(size, PAGE_SIZE - 1, 0)
                    .ok_or(VmError::ResourceShortage(Shortage::AddressSpace))?;
                for copied in entries {
                    let entry_start = start + copied.offset;
                    let mut entry = MapEntry::new(
                        entry_start,
                        entry_start + copied.size,
                        EntryObject::Object(copied.object),
                        copied.object_offset,
                    );
                    entry.protection = copied.protection;
                    entry.max_protection = copied.max_protection;
                    entry.inheritance = copied.inheritance;
                    entry.needs_copy = true;
                    inner.insert(entry);
                }
                Ok(start)
            }
            CopyContents::Object { object, offset } => {
                self.enter(EnterRequest::anywhere(size).with_object(object, offset))
            }
            CopyContents::PageList { base, pages, continuation } => {
                self.copyout_pages(size, base, pages, continuation)
            }
        }
    }

    fn copyout_pages(
        &self,
        size: usize,
        base: usize,
        pages: Vec<&'static Page>,
        mut continuation: Option<PageListContinuation>,
    ) -> Result<usize, VmError> {
        let cache = self.vm.cache();
        let object = self.vm.object_create(size);
        let insert = |base: usize, pages: Vec<&'static Page>| {
            let mut state = object.lock();
            for (index, page) in pages.into_iter().enumerate() {
                cache.insert(page, &mut state, base + index * PAGE_SIZE);
            }
        };

        insert(base, pages);
        while let Some(next) = continuation.take() {
            let mut chunk = next.resume()?;
            if let CopyContents::PageList { base, pages, continuation: more } = chunk.take() {
                insert(base, pages);
                continuation = more;
            }
        }

        let start = self.enter(EnterRequest::anywhere(size).with_object(Arc::clone(&object), 0))?;
        let state = object.lock();
        let mut resident = state.resident_pages();
        while let Some(page) = resident.next() {
            cache.activate(page);
            let va = VirtualAddress::new(start + page.offset());
            if let Err(err) = self.pmap.enter(va, page.phys(), Protection::DEFAULT, false) {
                drop(resident);
                drop(state);
                self.delete(start, start + size)?;
                return Err(err.into());
            }
        }
        Ok(start)
    }

    /// Overwrites the mapped, writable range at `address` with the contents of `copy`.
    pub fn copy_overwrite(&self, address: usize, mut copy: VmMapCopy) -> Result<(), VmError> {
        let end = check_range(address, copy.size)?;
        {
            let inner = self.inner.read();
            inner.check_covered(address, end)?;
            for key in inner.overlapping(address, end) {
                let entry = &inner.entries[&key];
                if !entry.protection.contains(Protection::WRITE) {
                    return Err(VmError::ProtectionFailure(entry.start.max(address)));
                }
            }
        }

        // Every destination page is faulted in first, so running out of memory leaves
        // the destination unchanged.
        let targets = (0..copy.size)
            .step_by(PAGE_SIZE)
            .map(|offset| self.touch(address + offset, Protection::WRITE))
            .collect::<Result<Vec<_>, _>>()?;
        for (index, target) in targets.into_iter().enumerate() {
            match copy.source_page(index * PAGE_SIZE)? {
                Some(source) => target.copy_from(source),
                None => target.zero(),
            }
            target.insert_state(crate::PageState::DIRTY);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use proptest::prelude::*;

    use super::*;
    use crate::test_support;

    const BASE: usize = 0x40_0000;

    fn fill(map: &VmMap, address: usize, pages: usize) {
        for i in 0..pages {
            map.write_bytes(address + i * PAGE_SIZE, &(i as u32).to_le_bytes())
                .expect("write");
        }
    }

    fn page_tag(map: &VmMap, address: usize) -> u32 {
        let mut buf = [0u8; 4];
        map.read_bytes(address, &mut buf).expect("read");
        u32::from_le_bytes(buf)
    }

    /// Takes free pages until only `left` remain.
    fn drain_to(vm: &'static VmSystem, left: usize) -> Vec<&'static Page> {
        let mut held = Vec::new();
        while vm.allocator().free_pages() > left {
            held.push(vm.cache().grab().expect("page"));
        }
        held
    }

    fn give_back(vm: &'static VmSystem, held: Vec<&'static Page>) {
        for page in held {
            vm.cache().free(page, None);
        }
    }

    #[test]
    fn entry_list_copies_are_copy_on_write() {
        let vm = test_support::boot_default();
        let source = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let target = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let address = source.enter(EnterRequest::anywhere(4 * PAGE_SIZE)).expect("enter");
        fill(&source, address, 4);

        let copy = source.copyin(address, 4 * PAGE_SIZE).expect("copyin");
        assert!(matches!(copy.contents(), CopyContents::EntryList(e) if e.len() == 1));
        assert!(source.lookup_entry(address).is_some_and(|e| e.needs_copy));

        let copied = target.copyout(copy).expect("copyout");
        source.write_bytes(address, &99u32.to_le_bytes()).expect("write");
        assert_eq!(page_tag(&target, copied), 0);
        assert_eq!(page_tag(&target, copied + 3 * PAGE_SIZE), 3);
        assert_eq!(page_tag(&source, address), 99);
    }

    #[test]
    fn copies_of_shared_objects_are_snapshots() {
        let vm = test_support::boot_default();
        let parent = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let address = parent
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_inheritance(Inheritance::Share))
            .expect("enter");
        parent.write_bytes(address, &1u32.to_le_bytes()).expect("write");
        let child = parent.fork(vm.create_pmap().expect("pmap")).expect("fork");

        let copy = parent.copyin(address, PAGE_SIZE).expect("copyin");
        child.write_bytes(address, &2u32.to_le_bytes()).expect("write");

        let copied = parent.copyout(copy).expect("copyout");
        assert_eq!(page_tag(&parent, copied), 1);
        assert_eq!(page_tag(&parent, address), 2);
    }

    #[test]
    fn immediate_objects_are_copied_at_copyin() {
        let vm = test_support::boot_default();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let object = vm.object_create_with(PAGE_SIZE, CopyStrategy::Immediate);
        let address = map
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_object(Arc::clone(&object), 0))
            .expect("enter");
        fill(&map, address, 1);

        let copy = map.copyin(address, PAGE_SIZE).expect("copyin");
        let CopyContents::EntryList(entries) = copy.contents() else {
            panic!("expected an entry list");
        };
        assert_ne!(entries[0].object.id(), object.id());
        assert!(map.lookup_entry(address).is_some_and(|e| !e.needs_copy));
    }

    #[test]
    fn page_lists_are_chunked_and_resumed() {
        let vm = test_support::boot_default();
        let source = vm.map_create(BASE, BASE + 0x100_0000).expect("map");
        let target = vm.map_create(BASE, BASE + 0x100_0000).expect("map");
        let pages = vm.config().page_list_max + 6;
        let address = source.enter(EnterRequest::anywhere(pages * PAGE_SIZE)).expect("enter");
        fill(&source, address, pages);

        let copy = source.copyin_page_list(address, pages * PAGE_SIZE, false).expect("copyin");
        match copy.contents() {
            CopyContents::PageList { base, pages: chunk, continuation } => {
                assert_eq!(*base, 0);
                assert_eq!(chunk.len(), vm.config().page_list_max);
                assert_eq!(continuation.as_ref().map(|c| c.remaining()), Some(6 * PAGE_SIZE));
            }
            other => panic!("unexpected contents {other:?}"),
        }

        let copied = target.copyout(copy).expect("copyout");
        for i in [0, 1, pages - 7, pages - 1] {
            assert_eq!(page_tag(&target, copied + i * PAGE_SIZE), i as u32);
        }
        assert_eq!(page_tag(&source, address + (pages - 1) * PAGE_SIZE), (pages - 1) as u32);
    }

    #[test]
    fn stealing_moves_private_pages() {
        let vm = test_support::boot_default();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let address = map.enter(EnterRequest::anywhere(2 * PAGE_SIZE)).expect("enter");
        fill(&map, address, 2);
        let object_id = map.lookup_entry(address).and_then(|e| e.object).expect("object");
        let free_before = vm.allocator().free_pages();

        let copy = map.copyin_page_list(address, 2 * PAGE_SIZE, true).expect("copyin");
        assert_eq!(vm.allocator().free_pages(), free_before);
        let CopyContents::PageList { pages, .. } = copy.contents() else {
            panic!("expected a page list");
        };
        assert!(pages.iter().all(|p| !p.is_tabled()));
        drop(copy);
        assert_eq!(vm.allocator().free_pages(), free_before + 2);

        // The source refaults zero-filled pages.
        assert_eq!(page_tag(&map, address + PAGE_SIZE), 0);
        assert_eq!(map.lookup_entry(address).and_then(|e| e.object), Some(object_id));
    }

    #[test]
    fn overwrite_requires_a_writable_destination() {
        let vm = test_support::boot_default();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let source = map.enter(EnterRequest::anywhere(2 * PAGE_SIZE)).expect("enter");
        fill(&map, source, 2);
        let readonly = map
            .enter(EnterRequest::anywhere(2 * PAGE_SIZE).with_protection(Protection::READ, Protection::all()))
            .expect("enter");
        let writable = map.enter(EnterRequest::anywhere(2 * PAGE_SIZE)).expect("enter");

        let copy = map.copyin(source, 2 * PAGE_SIZE).expect("copyin");
        assert_eq!(
            map.copy_overwrite(readonly, copy),
            Err(VmError::ProtectionFailure(readonly))
        );

        let copy = map.copyin(source, 2 * PAGE_SIZE).expect("copyin");
        map.copy_overwrite(writable, copy).expect("overwrite");
        assert_eq!(page_tag(&map, writable + PAGE_SIZE), 1);

        let copy = map.copyin(source, 2 * PAGE_SIZE).expect("copyin");
        assert_eq!(
            map.copy_overwrite(BASE + 0x8_0000, copy),
            Err(VmError::InvalidAddress(BASE + 0x8_0000))
        );
    }

    #[test]
    fn object_copies_map_the_object() {
        let vm = test_support::boot_default();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let object = vm.object_create(2 * PAGE_SIZE);
        {
            let mut state = object.lock();
            let page = vm.cache().alloc(&mut state, PAGE_SIZE).expect("page");
            page.write(0, &7u32.to_le_bytes());
        }

        let copy = VmMapCopy::from_object(Arc::clone(&object), PAGE_SIZE, PAGE_SIZE);
        let address = map.copyout(copy).expect("copyout");
        assert_eq!(page_tag(&map, address), 7);
        assert_eq!(map.lookup_entry(address).and_then(|e| e.object), Some(object.id()));
    }

    #[test]
    fn failed_page_list_copyin_frees_its_pages() {
        let (vm, _pageout) = test_support::boot_with_pageout();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let address = map.enter(EnterRequest::anywhere(8 * PAGE_SIZE)).expect("enter");
        fill(&map, address, 8);

        let held = drain_to(vm, 3);
        let result = map.copyin_page_list(address, 8 * PAGE_SIZE, false);
        assert!(matches!(result, Err(VmError::ResourceShortage(_))));
        assert_eq!(vm.allocator().free_pages(), 3);
        give_back(vm, held);

        for i in 0..8 {
            assert_eq!(page_tag(&map, address + i * PAGE_SIZE), i as u32);
        }
    }

    #[test]
    fn failed_overwrite_leaves_the_destination_alone() {
        let (vm, _pageout) = test_support::boot_with_pageout();
        let map = vm.map_create(BASE, BASE + 0x10_0000).expect("map");
        let source = map.enter(EnterRequest::anywhere(8 * PAGE_SIZE)).expect("enter");
        fill(&map, source, 8);
        let destination = map.enter(EnterRequest::anywhere(8 * PAGE_SIZE)).expect("enter");
        for i in 0..2 {
            map.write_bytes(destination + i * PAGE_SIZE, &7u32.to_le_bytes())
                .expect("write");
        }

        let copy = map.copyin(source, 8 * PAGE_SIZE).expect("copyin");
        let held = drain_to(vm, 3);
        let result = map.copy_overwrite(destination, copy);
        assert!(matches!(result, Err(VmError::ResourceShortage(_))));
        assert_eq!(page_tag(&map, destination), 7);
        assert_eq!(page_tag(&map, destination + PAGE_SIZE), 7);
        give_back(vm, held);
        assert_eq!(page_tag(&map, source + 5 * PAGE_SIZE), 5);
    }

    /// A byte pattern that differs between pages and within each page.
    fn pattern(pages: usize, seed: u8) -> Vec<u8> {
        (0..pages * PAGE_SIZE)
            .map(|i| (i / 7) as u8 ^ (i / PAGE_SIZE) as u8 ^ seed)
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn copyout_reproduces_every_byte(
            pages in 1..140usize,
            seed in any::<u8>(),
            page_list in any::<bool>(),
        ) {
            let vm = test_support::boot_default();
            let source = vm.map_create(BASE, BASE + 0x100_0000).expect("map");
            let target = vm.map_create(BASE, BASE + 0x100_0000).expect("map");
            let size = pages * PAGE_SIZE;
            let address = source.enter(EnterRequest::anywhere(size)).expect("enter");
            let data = pattern(pages, seed);
            source.write_bytes(address, &data).expect("write");

            let copy = if page_list {
                source.copyin_page_list(address, size, false)
            } else {
                source.copyin(address, size)
            }
            .expect("copyin");
            let copied = target.copyout(copy).expect("copyout");
            source.write_bytes(address, &vec![0xA5; size]).expect("write");

            let mut read = vec![0u8; size];
            target.read_bytes(copied, &mut read).expect("read");
            prop_assert!(read == data, "copied bytes differ");
            target.check_invariants();
        }
    }
}
