//! Address maps.
//!
//! A map is an ordered set of non-overlapping entries, each naming the object (or nested
//! map) that backs a virtual range, together with an index of the gaps between them.
//! Page table contents are derived state: the map tells its [`Pmap`] what to establish
//! and the fault handler fills translations in on demand.
//!
//! Every map has a reader/writer lock. Mutations take it for writing; operations that must
//! run with the map unlocked (wiring faults pages in) mark the affected entries
//! in transition, and writers that find such an entry back off and retry. When two maps
//! must be locked together, the one at the lower address is locked first.

mod copy;
mod entry;
mod fault;
mod gaps;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

pub use copy::{CopyContents, CopyEntry, PageListContinuation, VmMapCopy};
pub use entry::{EntryInfo, EntryObject, Inheritance, Protection};

use self::copy::copy_object_range;
use self::entry::{MapEntry, Projection};
use self::gaps::GapIndex;
use crate::error::{Shortage, VmError};
use crate::object::VmObject;
use crate::page::Page;
use crate::pmap::Pmap;
use crate::resident::ResidentCache;
use crate::system::VmSystem;
use crate::{PAGE_SIZE, VirtualAddress};

/// Parameters of [`VmMap::enter`].
#[derive(Debug, Clone)]
pub struct EnterRequest {
    /// Placement hint when `anywhere`, exact address otherwise.
    pub address: usize,
    pub size: usize,
    /// Alignment mask for `anywhere` placement. Page alignment is always applied.
    pub mask: usize,
    pub anywhere: bool,
    pub object: Option<Arc<VmObject>>,
    pub offset: usize,
    /// Map a private copy of the object range instead of the object itself.
    pub copy: bool,
    pub protection: Protection,
    pub max_protection: Protection,
    pub inheritance: Inheritance,
}

impl EnterRequest {
    pub fn anywhere(size: usize) -> Self {
        Self {
            address: 0,
            size,
            mask: 0,
            anywhere: true,
            object: None,
            offset: 0,
            copy: false,
            protection: Protection::DEFAULT,
            max_protection: Protection::all(),
            inheritance: Inheritance::default(),
        }
    }

    pub fn fixed(address: usize, size: usize) -> Self {
        Self {
            address,
            anywhere: false,
            ..Self::anywhere(size)
        }
    }

    pub fn with_hint(mut self, address: usize) -> Self {
        self.address = address;
        self
    }

    pub fn with_mask(mut self, mask: usize) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_object(mut self, object: Arc<VmObject>, offset: usize) -> Self {
        self.object = Some(object);
        self.offset = offset;
        self
    }

    pub fn with_copy(mut self) -> Self {
        self.copy = true;
        self
    }

    pub fn with_protection(mut self, protection: Protection, max_protection: Protection) -> Self {
        self.protection = protection;
        self.max_protection = max_protection;
        self
    }

    pub fn with_inheritance(mut self, inheritance: Inheritance) -> Self {
        self.inheritance = inheritance;
        self
    }
}

pub(crate) struct MapInner {
    min: usize,
    max: usize,
    entries: BTreeMap<usize, MapEntry>,
    gaps: GapIndex,
}

impl MapInner {
    fn new(min: usize, max: usize) -> Self {
        let mut gaps = GapIndex::new();
        gaps.set(min, max - min);
        Self {
            min,
            max,
            entries: BTreeMap::new(),
            gaps,
        }
    }

    fn entry_containing(&self, address: usize) -> Option<&MapEntry> {
        self.entries
            .range(..=address)
            .next_back()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.contains(address))
    }

    /// Start of the gap at or before `address`: the end of the previous entry.
    fn gap_start_before(&self, address: usize) -> usize {
        self.entries
            .range(..address)
            .next_back()
            .map_or(self.min, |(_, entry)| entry.end)
    }

    fn next_start(&self, address: usize) -> usize {
        self.entries
            .range(address..)
            .next()
            .map_or(self.max, |(&start, _)| start)
    }

    /// Recomputes the gap beginning at `gap_start` in both the index and the entry.
    fn refresh_gap(&mut self, gap_start: usize) {
        let size = self.next_start(gap_start) - gap_start;
        self.gaps.set(gap_start, size);
        if let Some((_, previous)) = self.entries.range_mut(..gap_start).next_back()
            && previous.end == gap_start
        {
            previous.gap_after = size;
        }
    }

    fn is_free(&self, start: usize, end: usize) -> bool {
        start >= self.min
            && end <= self.max
            && start < end
            && self
                .entries
                .range(..end)
                .next_back()
                .is_none_or(|(_, entry)| entry.end <= start)
    }

    /// Starts of the entries overlapping `[start, end)`.
    fn overlapping(&self, start: usize, end: usize) -> Vec<usize> {
        let first = self
            .entry_containing(start)
            .map_or(start, |entry| entry.start);
        self.entries
            .range(first..end)
            .map(|(&key, _)| key)
            .collect()
    }

    fn any_in_transition(&self, start: usize, end: usize) -> bool {
        self.overlapping(start, end)
            .iter()
            .any(|key| self.entries[key].in_transition)
    }

    /// Fails with the first unmapped address in `[start, end)`.
    fn check_covered(&self, start: usize, end: usize) -> Result<(), VmError> {
        let mut cursor = start;
        for key in self.overlapping(start, end) {
            let entry = &self.entries[&key];
            if entry.start > cursor {
                return Err(VmError::InvalidAddress(cursor));
            }
            cursor = entry.end;
        }
        if cursor < end {
            return Err(VmError::InvalidAddress(cursor));
        }
        Ok(())
    }

    /// Links `entry` into the free range it covers, folding it into its predecessor when
    /// the two are indistinguishable.
    fn insert(&mut self, entry: MapEntry) {
        debug_assert!(self.is_free(entry.start, entry.end));
        let (start, end) = (entry.start, entry.end);
        let before = self.gap_start_before(start);

        if let Some((_, previous)) = self.entries.range_mut(..start).next_back()
            && previous.can_absorb(&entry)
        {
            self.gaps.remove(previous.end);
            previous.end = end;
            self.refresh_gap(end);
            log::trace!("extended entry to {:#x}", end);
            return;
        }

        self.entries.insert(start, entry);
        self.refresh_gap(before);
        self.refresh_gap(end);
    }

    fn remove(&mut self, start: usize) -> Option<MapEntry> {
        let entry = self.entries.remove(&start)?;
        self.gaps.remove(entry.end);
        let before = self.gap_start_before(start);
        self.refresh_gap(before);
        Some(entry)
    }

    /// Splits the entry containing `address` so that an entry starts there.
    fn clip(&mut self, address: usize) {
        let Some((_, entry)) = self.entries.range_mut(..address).next_back() else {
            return;
        };
        if !entry.contains(address) {
            return;
        }
        let tail = entry.split_at(address);
        log::trace!("clipped entry at {:#x}", address);
        self.entries.insert(address, tail);
        self.refresh_gap(address);
    }

    fn check(&self) {
        let mut cursor = self.min;
        let mut expected = Vec::new();
        for (&key, entry) in &self.entries {
            assert_eq!(key, entry.start, "entry keyed at the wrong address");
            assert!(entry.start < entry.end, "empty entry at {:#x}", entry.start);
            assert!(entry.start >= cursor, "entry at {:#x} overlaps its predecessor", entry.start);
            assert_eq!(entry.start % PAGE_SIZE, 0);
            assert_eq!(entry.end % PAGE_SIZE, 0);
            if entry.start > cursor {
                expected.push((cursor, entry.start - cursor));
            }
            assert_eq!(
                entry.gap_after,
                self.next_start(entry.end) - entry.end,
                "stale gap after entry at {:#x}",
                entry.start
            );
            cursor = entry.end;
        }
        assert!(cursor <= self.max, "entry past the end of the map");
        if cursor < self.max {
            expected.push((cursor, self.max - cursor));
        }
        let indexed: Vec<_> = self.gaps.iter().collect();
        assert_eq!(indexed, expected, "gap index disagrees with the entries");
    }
}

pub struct VmMap {
    vm: &'static VmSystem,
    pmap: Arc<dyn Pmap>,
    min: usize,
    max: usize,
    inner: spin::RwLock<MapInner>,
    /// Start of the entry found by the last lookup.
    hint: AtomicUsize,
}

fn check_range(start: usize, size: usize) -> Result<usize, VmError> {
    if size == 0 || start % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(VmError::InvalidArgument);
    }
    start.checked_add(size).ok_or(VmError::InvalidAddress(start))
}

/// Drops the wiring an entry holds on each of its resident pages.
fn unwire_entry(cache: &ResidentCache, entry: &MapEntry) {
    let Some(object) = entry.object.object() else {
        return;
    };
    let state = object.lock();
    for va in (entry.start..entry.end).step_by(PAGE_SIZE) {
        if let Some(page) = cache.lookup(&state, entry.offset_of(va))
            && page.wire_count() > 0
        {
            cache.unwire(page);
        }
    }
}

impl VmMap {
    pub(crate) fn new(vm: &'static VmSystem, pmap: Arc<dyn Pmap>, min: usize, max: usize) -> Self {
        assert!(min < max, "empty map range");
        assert!(min % PAGE_SIZE == 0 && max % PAGE_SIZE == 0, "unaligned map range");
        log::debug!("map created for {:#x}..{:#x}", min, max);
        Self {
            vm,
            pmap,
            min,
            max,
            inner: spin::RwLock::new(MapInner::new(min, max)),
            hint: AtomicUsize::new(min),
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn pmap(&self) -> &Arc<dyn Pmap> {
        &self.pmap
    }

    pub fn system(&self) -> &'static VmSystem {
        self.vm
    }

    /// Takes the write lock once no entry in `[start, end)` is in transition.
    fn write_settled(&self, start: usize, end: usize) -> spin::RwLockWriteGuard<'_, MapInner> {
        loop {
            let inner = self.inner.write();
            if !inner.any_in_transition(start, end) {
                return inner;
            }
            drop(inner);
            core::hint::spin_loop();
        }
    }

    /// Maps `size` bytes of `object` at the best-fitting free range.
    ///
    /// The object offset is the distance from the start of the map, so an object entered
    /// this way backs the map's whole range. Adjacent entries of the same object are
    /// extended instead of duplicated.
    pub fn find_entry(
        &self,
        size: usize,
        mask: usize,
        object: Option<Arc<VmObject>>,
    ) -> Result<usize, VmError> {
        check_range(0, size)?;
        let mut inner = self.inner.write();
        let start = inner
            .gaps
            .find(size, mask | (PAGE_SIZE - 1), 0)
            .ok_or(VmError::ResourceShortage(Shortage::AddressSpace))?;
        let object = object.map_or(EntryObject::None, EntryObject::Object);
        inner.insert(MapEntry::new(start, start + size, object, start - self.min));
        Ok(start)
    }

    /// Establishes a new mapping and returns its address.
    ///
    /// Fails with an invalid address when a fixed range is outside the map or overlaps
    /// a mapping, and with an address space shortage when nothing fits.
    pub fn enter(&self, request: EnterRequest) -> Result<usize, VmError> {
        let EnterRequest {
            address,
            size,
            mask,
            anywhere,
            object,
            offset,
            copy,
            protection,
            max_protection,
            inheritance,
        } = request;
        check_range(address, size)?;
        if offset % PAGE_SIZE != 0 || !max_protection.contains(protection) {
            return Err(VmError::InvalidArgument);
        }

        let (object, offset, needs_copy) = match object {
            Some(object) if copy => match object.strategy() {
                crate::CopyStrategy::Immediate => {
                    (Some(copy_object_range(self.vm, &object, offset, size)?), 0, false)
                }
                crate::CopyStrategy::Delay => (Some(object), offset, true),
            },
            object => (object, offset, false),
        };

        let mut inner = self.inner.write();
        let start = if anywhere {
            let floor = if address > self.min { address } else { 0 };
            inner
                .gaps
                .find(size, mask | (PAGE_SIZE - 1), floor)
                .ok_or(VmError::ResourceShortage(Shortage::AddressSpace))?
        } else {
            if !inner.is_free(address, address + size) {
                return Err(VmError::InvalidAddress(address));
            }
            address
        };

        let mut entry = MapEntry::new(
            start,
            start + size,
            object.map_or(EntryObject::None, EntryObject::Object),
            offset,
        );
        entry.protection = protection;
        entry.max_protection = max_protection;
        entry.inheritance = inheritance;
        entry.needs_copy = needs_copy;
        inner.insert(entry);
        log::trace!("entered {:#x}..{:#x}", start, start + size);
        Ok(start)
    }

    /// Returns the entry containing `address`.
    pub fn lookup_entry(&self, address: usize) -> Option<EntryInfo> {
        let inner = self.inner.read();
        let hinted = inner
            .entries
            .get(&self.hint.load(Ordering::Relaxed))
            .filter(|entry| entry.contains(address));
        let entry = match hinted {
            Some(entry) => entry,
            None => inner.entry_containing(address)?,
        };
        self.hint.store(entry.start, Ordering::Relaxed);
        Some(entry.info())
    }

    /// Splits the entry containing `address` so that a new entry begins there.
    pub fn clip_start(&self, address: usize) -> Result<(), VmError> {
        let mut inner = self.write_settled(address, address + 1);
        if inner.entry_containing(address).is_none() {
            return Err(VmError::InvalidAddress(address));
        }
        inner.clip(address);
        Ok(())
    }

    /// Splits the entry containing `address - 1` so that it ends at `address`.
    pub fn clip_end(&self, address: usize) -> Result<(), VmError> {
        let last = address.checked_sub(1).ok_or(VmError::InvalidAddress(address))?;
        let mut inner = self.write_settled(last, address);
        if inner.entry_containing(last).is_none() {
            return Err(VmError::InvalidAddress(last));
        }
        inner.clip(address);
        Ok(())
    }

    /// Changes the protection of `[start, end)`, or its maximum protection when `set_max`.
    ///
    /// Lowering the maximum also lowers the current protection. Unmapped pieces of the
    /// range are skipped. Nothing changes if any entry refuses.
    pub fn protect(
        &self,
        start: usize,
        end: usize,
        protection: Protection,
        set_max: bool,
    ) -> Result<(), VmError> {
        check_range(start, end.saturating_sub(start))?;
        let mut inner = self.write_settled(start, end);
        for key in inner.overlapping(start, end) {
            let entry = &inner.entries[&key];
            if entry.object.is_submap() {
                return Err(VmError::InvalidArgument);
            }
            if entry.projected_on.is_some() || (!set_max && !entry.max_protection.contains(protection)) {
                return Err(VmError::ProtectionFailure(entry.start.max(start)));
            }
        }

        inner.clip(start);
        inner.clip(end);
        for key in inner.overlapping(start, end) {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            if set_max {
                entry.max_protection = protection;
                entry.protection &= protection;
            } else {
                entry.protection = protection;
            }
            self.pmap.protect(
                VirtualAddress::new(entry.start),
                VirtualAddress::new(entry.end),
                entry.effective_protection(),
            );
        }
        Ok(())
    }

    /// Sets what a forked child receives for `[start, end)`.
    pub fn inherit(&self, start: usize, end: usize, inheritance: Inheritance) -> Result<(), VmError> {
        check_range(start, end.saturating_sub(start))?;
        let mut inner = self.write_settled(start, end);
        if inner
            .overlapping(start, end)
            .iter()
            .any(|key| inner.entries[key].object.is_submap())
        {
            return Err(VmError::InvalidArgument);
        }
        inner.clip(start);
        inner.clip(end);
        for key in inner.overlapping(start, end) {
            if let Some(entry) = inner.entries.get_mut(&key) {
                entry.inheritance = inheritance;
            }
        }
        Ok(())
    }

    /// Faults in and pins every page of `[start, end)` for `access`.
    ///
    /// Wirings nest per entry; only the first one touches pages. On failure every page
    /// wired by this call is released again.
    pub fn wire(&self, start: usize, end: usize, access: Protection) -> Result<(), VmError> {
        check_range(start, end.saturating_sub(start))?;
        let ranges = {
            let mut inner = self.write_settled(start, end);
            inner.check_covered(start, end)?;
            for key in inner.overlapping(start, end) {
                let entry = &inner.entries[&key];
                if entry.object.is_submap() {
                    return Err(VmError::InvalidArgument);
                }
                if !entry.protection.contains(access) {
                    return Err(VmError::ProtectionFailure(entry.start.max(start)));
                }
            }

            inner.clip(start);
            inner.clip(end);
            // Every entry is latched, including ones that were already wired, so that
            // a failure can take back each count it added.
            let mut bumped = Vec::new();
            for key in inner.overlapping(start, end) {
                let Some(entry) = inner.entries.get_mut(&key) else {
                    continue;
                };
                entry.wired_count += 1;
                entry.in_transition = true;
                bumped.push((entry.start, entry.end, entry.wired_count == 1));
            }
            bumped
        };

        let mut wired = Vec::new();
        let mut result = Ok(());
        let newly_wired = ranges.iter().filter(|&&(_, _, first)| first);
        'ranges: for &(range_start, range_end, _) in newly_wired {
            for va in (range_start..range_end).step_by(PAGE_SIZE) {
                if let Err(err) = self.fault(va, access, true) {
                    result = Err(err);
                    break 'ranges;
                }
                wired.push(va);
            }
        }

        let mut inner = self.inner.write();
        if result.is_err() {
            log::warn!("wiring {:#x}..{:#x} failed, unwinding", start, end);
            for &va in &wired {
                if let Some(page) = self.resident_page(&inner, va) {
                    self.vm.cache().unwire(page);
                }
            }
        }
        for &(range_start, _, _) in &ranges {
            if let Some(entry) = inner.entries.get_mut(&range_start) {
                entry.in_transition = false;
                if result.is_err() {
                    entry.wired_count -= 1;
                }
            }
        }
        result
    }

    /// Releases one wiring of `[start, end)`, which must be entirely wired.
    pub fn unwire(&self, start: usize, end: usize) -> Result<(), VmError> {
        check_range(start, end.saturating_sub(start))?;
        let mut inner = self.write_settled(start, end);
        inner.check_covered(start, end)?;
        if inner
            .overlapping(start, end)
            .iter()
            .any(|key| inner.entries[key].wired_count == 0)
        {
            return Err(VmError::InvalidArgument);
        }

        inner.clip(start);
        inner.clip(end);
        for key in inner.overlapping(start, end) {
            let Some(entry) = inner.entries.get_mut(&key) else {
                continue;
            };
            entry.wired_count -= 1;
            if entry.wired_count == 0 {
                unwire_entry(self.vm.cache(), entry);
            }
        }
        Ok(())
    }

    /// Returns the resident page backing `va`, if any.
    fn resident_page(&self, inner: &MapInner, va: usize) -> Option<&'static Page> {
        let entry = inner.entry_containing(va)?;
        entry.object.object()?.page_at(entry.offset_of(va))
    }

    /// Unmaps `[start, end)`.
    ///
    /// Entries crossing the boundaries are clipped; unmapped pieces are ignored. Removed
    /// entries drop their object references once the map is unlocked.
    pub fn delete(&self, start: usize, end: usize) -> Result<(), VmError> {
        if start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 || start > end {
            return Err(VmError::InvalidArgument);
        }
        let start = start.max(self.min);
        let end = end.min(self.max);
        if start >= end {
            return Ok(());
        }

        let removed: Vec<MapEntry> = {
            let mut inner = self.write_settled(start, end);
            inner.clip(start);
            inner.clip(end);
            let mut removed = Vec::new();
            for key in inner.overlapping(start, end) {
                let Some(entry) = inner.remove(key) else {
                    continue;
                };
                if entry.wired_count > 0 {
                    unwire_entry(self.vm.cache(), &entry);
                }
                self.pmap
                    .remove(VirtualAddress::new(entry.start), VirtualAddress::new(entry.end));
                removed.push(entry);
            }
            removed
        };
        log::trace!("deleted {} entries in {:#x}..{:#x}", removed.len(), start, end);
        drop(removed);
        Ok(())
    }

    /// Hands `[start, end)` to `submap`.
    ///
    /// The range must be mapped by a single entry of the system's submap placeholder
    /// object, and `submap` must cover exactly the same range.
    pub fn submap(&self, start: usize, end: usize, submap: Arc<VmMap>) -> Result<(), VmError> {
        check_range(start, end.saturating_sub(start))?;
        if submap.min() != start || submap.max() != end {
            return Err(VmError::InvalidArgument);
        }
        let mut inner = self.write_settled(start, end);
        let placeholder = inner
            .entry_containing(start)
            .filter(|entry| entry.end >= end)
            .and_then(|entry| entry.object.object())
            .is_some_and(|object| Arc::ptr_eq(object, self.vm.submap_object()));
        if !placeholder {
            return Err(VmError::InvalidArgument);
        }

        inner.clip(start);
        inner.clip(end);
        if let Some(entry) = inner.entries.get_mut(&start) {
            entry.object = EntryObject::SubMap(submap);
            entry.offset = 0;
        }
        Ok(())
    }

    /// Carves a nested map of `size` bytes out of this one.
    ///
    /// The nested map shares this map's pmap.
    pub fn suballoc(&self, size: usize) -> Result<Arc<VmMap>, VmError> {
        let size = crate::round_up_to_page(size);
        let request = EnterRequest::anywhere(size)
            .with_object(Arc::clone(self.vm.submap_object()), 0)
            .with_inheritance(Inheritance::None);
        let start = self.enter(request)?;
        let child = Arc::new(VmMap::new(self.vm, Arc::clone(&self.pmap), start, start + size));
        if let Err(err) = self.submap(start, start + size, Arc::clone(&child)) {
            self.delete(start, start + size)?;
            return Err(err);
        }
        Ok(child)
    }

    /// Creates a child map according to each entry's inheritance.
    ///
    /// Copied entries become copy-on-write in both maps, except wired ones, which are
    /// copied immediately.
    pub fn fork(&self, pmap: Arc<dyn Pmap>) -> Result<Arc<VmMap>, VmError> {
        let mut child = VmMap::new(self.vm, pmap, self.min, self.max);
        {
            let mut inner = self.write_settled(self.min, self.max);
            let child_inner = child.inner.get_mut();
            let keys: Vec<usize> = inner.entries.keys().copied().collect();
            for key in keys {
                let Some(entry) = inner.entries.get_mut(&key) else {
                    continue;
                };
                let inheritance = if entry.object.is_submap() {
                    Inheritance::Share
                } else {
                    entry.inheritance
                };

                let mut copy = entry.clone();
                copy.wired_count = 0;
                copy.in_transition = false;
                copy.projected_on = None;
                copy.gap_after = 0;
                match inheritance {
                    Inheritance::None => continue,
                    Inheritance::Share => {
                        if matches!(entry.object, EntryObject::None) {
                            entry.object = EntryObject::Object(self.vm.object_create(entry.size()));
                            entry.offset = 0;
                            copy.object = entry.object.clone();
                            copy.offset = 0;
                        }
                    }
                    Inheritance::Copy => match &entry.object {
                        EntryObject::Object(object) if entry.wired_count > 0 => {
                            let private = copy_object_range(self.vm, object, entry.offset, entry.size())?;
                            copy.object = EntryObject::Object(private);
                            copy.offset = 0;
                            copy.needs_copy = false;
                        }
                        EntryObject::Object(_) => {
                            entry.needs_copy = true;
                            copy.needs_copy = true;
                            self.pmap.protect(
                                VirtualAddress::new(entry.start),
                                VirtualAddress::new(entry.end),
                                entry.effective_protection(),
                            );
                        }
                        _ => {}
                    },
                }
                child_inner.insert(copy);
            }
        }
        log::debug!("forked map {:#x}..{:#x}", self.min, self.max);
        Ok(Arc::new(child))
    }

    /// Maps the kernel buffer `[kernel_address, kernel_address + size)` of `kernel` into
    /// this map and returns where.
    ///
    /// The new entry refers back to the kernel entry and its protection can no longer be
    /// changed from this map.
    pub fn project(
        &self,
        kernel: &Arc<VmMap>,
        kernel_address: usize,
        size: usize,
        protection: Protection,
    ) -> Result<usize, VmError> {
        check_range(kernel_address, size)?;
        if core::ptr::eq(self, Arc::as_ptr(kernel)) {
            return Err(VmError::InvalidArgument);
        }

        let this_first = (self as *const VmMap as usize) < (Arc::as_ptr(kernel) as usize);
        let mut inner;
        let kernel_inner;
        if this_first {
            inner = self.inner.write();
            kernel_inner = kernel.inner.read();
        } else {
            kernel_inner = kernel.inner.read();
            inner = self.inner.write();
        }

        let source = kernel_inner
            .entry_containing(kernel_address)
            .filter(|entry| entry.end >= kernel_address + size)
            .ok_or(VmError::InvalidAddress(kernel_address))?;
        let object = source.object.object().cloned().ok_or(VmError::InvalidArgument)?;
        if !source.max_protection.contains(protection) {
            return Err(VmError::ProtectionFailure(kernel_address));
        }

        let start = inner
            .gaps
            .find(size, PAGE_SIZE - 1, 0)
            .ok_or(VmError::ResourceShortage(Shortage::AddressSpace))?;
        let mut entry = MapEntry::new(
            start,
            start + size,
            EntryObject::Object(object),
            source.offset_of(kernel_address),
        );
        entry.protection = protection;
        entry.max_protection = protection;
        entry.inheritance = Inheritance::Share;
        entry.projected_on = Some(Projection {
            map: Arc::downgrade(kernel),
            start: kernel_address,
        });
        inner.insert(entry);
        log::trace!("projected {:#x} to {:#x}", kernel_address, start);
        Ok(start)
    }

    /// Returns the kernel map and address a projected entry at `address` shows.
    pub fn projection_source(&self, address: usize) -> Option<(Arc<VmMap>, usize)> {
        let inner = self.inner.read();
        let entry = inner.entry_containing(address)?;
        let projection = entry.projected_on.as_ref()?;
        Some((projection.map.upgrade()?, projection.start + (address - entry.start)))
    }

    /// Faults in the page at `address` and returns its descriptor.
    fn touch(&self, address: usize, access: Protection) -> Result<&'static Page, VmError> {
        let va = address & !(PAGE_SIZE - 1);
        self.fault(va, access, false)?;
        let pa = self
            .pmap
            .extract(VirtualAddress::new(va))
            .ok_or(VmError::InvalidAddress(address))?;
        self.vm
            .allocator()
            .lookup(pa)
            .ok_or(VmError::InvalidAddress(address))
    }

    /// Copies mapped memory at `address` into `buf`.
    pub fn read_bytes(&self, address: usize, buf: &mut [u8]) -> Result<(), VmError> {
        address
            .checked_add(buf.len())
            .ok_or(VmError::InvalidAddress(address))?;
        let mut done = 0;
        while done < buf.len() {
            let va = address + done;
            let page = self.touch(va, Protection::READ)?;
            let within = va % PAGE_SIZE;
            let count = (PAGE_SIZE - within).min(buf.len() - done);
            page.read(within, &mut buf[done..done + count]);
            done += count;
        }
        Ok(())
    }

    /// Copies `data` into mapped memory at `address`.
    pub fn write_bytes(&self, address: usize, data: &[u8]) -> Result<(), VmError> {
        address
            .checked_add(data.len())
            .ok_or(VmError::InvalidAddress(address))?;
        let mut done = 0;
        while done < data.len() {
            let va = address + done;
            let page = self.touch(va, Protection::WRITE)?;
            let within = va % PAGE_SIZE;
            let count = (PAGE_SIZE - within).min(data.len() - done);
            page.write(within, &data[done..done + count]);
            page.insert_state(crate::PageState::DIRTY);
            done += count;
        }
        Ok(())
    }

    /// Snapshots every entry in address order.
    pub fn entries(&self) -> Vec<EntryInfo> {
        self.inner.read().entries.values().map(MapEntry::info).collect()
    }

    /// Snapshots the gap index as `(start, size)` pairs in address order.
    pub fn gaps(&self) -> Vec<(usize, usize)> {
        self.inner.read().gaps.iter().collect()
    }

    /// Lowest unmapped address.
    pub fn first_free(&self) -> Option<usize> {
        self.inner.read().gaps.first_free()
    }

    /// Verifies entry order and gap bookkeeping.
    ///
    /// # Panics
    ///
    /// Panics describing the first inconsistency found.
    pub fn check_invariants(&self) {
        self.inner.read().check();
    }
}

impl Drop for VmMap {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for entry in inner.entries.values() {
            if entry.wired_count > 0 {
                unwire_entry(self.vm.cache(), entry);
            }
            self.pmap
                .remove(VirtualAddress::new(entry.start), VirtualAddress::new(entry.end));
        }
        log::trace!("map {:#x}..{:#x} destroyed", self.min, self.max);
    }
}

impl fmt::Debug for VmMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("VmMap")
            .field("min", &format_args!("{:#x}", self.min))
            .field("max", &format_args!("{:#x}", self.max))
            .field("entries", &inner.entries.len())
            .field("gaps", &inner.gaps.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use proptest::prelude::*;

    use super::*;
    use crate::test_support;

    const USER_BASE: usize = 0x10_0000;

    fn user_map(vm: &'static VmSystem) -> Arc<VmMap> {
        vm.map_create(USER_BASE, USER_BASE + 0x100_0000).expect("map")
    }

    #[test]
    fn enter_then_lookup_returns_the_mapping() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let object = vm.object_create(3 * PAGE_SIZE);

        let address = map
            .enter(EnterRequest::anywhere(3 * PAGE_SIZE).with_object(Arc::clone(&object), 0))
            .expect("enter");
        let entry = map.lookup_entry(address).expect("entry");
        assert_eq!(entry.offset, 0);
        assert_eq!(entry.end - entry.start, 3 * PAGE_SIZE);
        assert_eq!(entry.protection, Protection::READ | Protection::WRITE);
        assert_eq!(entry.object, Some(object.id()));
        map.check_invariants();
    }

    #[test]
    fn fixed_entries_must_not_overlap() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        map.enter(EnterRequest::fixed(USER_BASE + 0x4000, 0x4000)).expect("enter");

        assert_eq!(
            map.enter(EnterRequest::fixed(USER_BASE + 0x6000, 0x4000)),
            Err(VmError::InvalidAddress(USER_BASE + 0x6000))
        );
        assert_eq!(
            map.enter(EnterRequest::fixed(USER_BASE - PAGE_SIZE, PAGE_SIZE)),
            Err(VmError::InvalidAddress(USER_BASE - PAGE_SIZE))
        );
        assert_eq!(
            map.enter(EnterRequest::fixed(USER_BASE + 0x123, PAGE_SIZE)),
            Err(VmError::InvalidArgument)
        );
    }

    #[test]
    fn exhausting_the_address_space_is_a_shortage() {
        let vm = test_support::boot_default();
        let map = vm.map_create(USER_BASE, USER_BASE + 4 * PAGE_SIZE).expect("map");
        map.enter(EnterRequest::anywhere(3 * PAGE_SIZE)).expect("enter");
        assert_eq!(
            map.enter(EnterRequest::anywhere(2 * PAGE_SIZE)),
            Err(VmError::ResourceShortage(Shortage::AddressSpace))
        );
    }

    #[test]
    fn hints_place_entries_at_or_above_the_hint() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let address = map
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_hint(USER_BASE + 0x20_0000))
            .expect("enter");
        assert_eq!(address, USER_BASE + 0x20_0000);
        let aligned = map
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_mask(0xF_FFFF))
            .expect("enter");
        assert_eq!(aligned % 0x10_0000, 0);
    }

    #[test]
    fn find_entry_extends_contiguous_object_mappings() {
        let vm = test_support::boot_default();
        let map = vm.map_create(USER_BASE, USER_BASE + 0x10_0000).expect("map");
        let object = vm.object_create(0x10_0000);
        let first = map.find_entry(2 * PAGE_SIZE, 0, Some(Arc::clone(&object))).expect("first");
        let second = map.find_entry(PAGE_SIZE, 0, Some(Arc::clone(&object))).expect("second");

        assert_eq!(first, USER_BASE);
        assert_eq!(second, USER_BASE + 2 * PAGE_SIZE);
        let entries = map.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size(), 3 * PAGE_SIZE);
        assert_eq!(Arc::strong_count(&object), 2);
        map.check_invariants();
    }

    #[test]
    fn coalescing_skips_mismatched_attributes() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        map.enter(EnterRequest::fixed(USER_BASE, PAGE_SIZE)).expect("enter");
        map.enter(
            EnterRequest::fixed(USER_BASE + PAGE_SIZE, PAGE_SIZE)
                .with_protection(Protection::READ, Protection::all()),
        )
        .expect("enter");
        map.enter(EnterRequest::fixed(USER_BASE + 2 * PAGE_SIZE, PAGE_SIZE).with_inheritance(Inheritance::Share))
            .expect("enter");
        assert_eq!(map.entries().len(), 3);
    }

    #[test]
    fn clipping_keeps_gaps_current() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let object = vm.object_create(4 * PAGE_SIZE);
        map.enter(EnterRequest::fixed(USER_BASE + PAGE_SIZE, 4 * PAGE_SIZE).with_object(object, 0))
            .expect("enter");

        map.clip_start(USER_BASE + 2 * PAGE_SIZE).expect("clip");
        map.clip_end(USER_BASE + 4 * PAGE_SIZE).expect("clip");
        let entries = map.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].offset, PAGE_SIZE);
        assert_eq!(entries[2].offset, 3 * PAGE_SIZE);
        assert_eq!(entries[0].gap_after, 0);
        assert_eq!(entries[2].gap_after, 0x100_0000 - 5 * PAGE_SIZE);
        map.check_invariants();

        assert_eq!(map.clip_start(USER_BASE), Err(VmError::InvalidAddress(USER_BASE)));
    }

    #[test]
    fn delete_across_entries_drops_their_objects() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let objects: Vec<_> = (0..3).map(|_| vm.object_create(2 * PAGE_SIZE)).collect();
        for (i, object) in objects.iter().enumerate() {
            map.enter(
                EnterRequest::fixed(USER_BASE + i * 2 * PAGE_SIZE, 2 * PAGE_SIZE)
                    .with_object(Arc::clone(object), 0)
                    .with_protection(Protection::READ, Protection::all()),
            )
            .expect("enter");
        }
        assert!(objects.iter().all(|o| Arc::strong_count(o) == 2));

        map.delete(USER_BASE, USER_BASE + 5 * PAGE_SIZE).expect("delete");

        let entries = map.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start, USER_BASE + 5 * PAGE_SIZE);
        assert_eq!(entries[0].end, USER_BASE + 6 * PAGE_SIZE);
        assert_eq!(entries[0].offset, PAGE_SIZE);
        assert_eq!(Arc::strong_count(&objects[0]), 1);
        assert_eq!(Arc::strong_count(&objects[1]), 1);
        assert_eq!(Arc::strong_count(&objects[2]), 2);
        assert_eq!(
            map.gaps(),
            vec![
                (USER_BASE, 5 * PAGE_SIZE),
                (USER_BASE + 6 * PAGE_SIZE, 0x100_0000 - 6 * PAGE_SIZE)
            ]
        );
        map.check_invariants();
    }

    #[test]
    fn delete_ignores_unmapped_ranges() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        map.delete(USER_BASE, USER_BASE + 0x10_0000).expect("delete");
        map.delete(0, usize::MAX & !(PAGE_SIZE - 1)).expect("delete");
        assert!(map.entries().is_empty());
        assert_eq!(map.delete(USER_BASE + 1, USER_BASE + PAGE_SIZE), Err(VmError::InvalidArgument));
    }

    #[test]
    fn protect_respects_the_maximum() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let start = map
            .enter(EnterRequest::anywhere(4 * PAGE_SIZE).with_protection(Protection::READ, Protection::DEFAULT))
            .expect("enter");

        assert_eq!(
            map.protect(start, start + PAGE_SIZE, Protection::all(), false),
            Err(VmError::ProtectionFailure(start))
        );
        map.protect(start + PAGE_SIZE, start + 2 * PAGE_SIZE, Protection::DEFAULT, false)
            .expect("protect");
        map.protect(start, start + 4 * PAGE_SIZE, Protection::READ, true).expect("protect");

        let entries = map.entries();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.max_protection == Protection::READ));
        assert!(entries.iter().all(|e| e.protection == Protection::READ));
        map.check_invariants();
    }

    #[test]
    fn faults_zero_fill_and_respect_protection() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let start = map
            .enter(EnterRequest::anywhere(2 * PAGE_SIZE).with_protection(Protection::READ, Protection::all()))
            .expect("enter");

        let mut buf = [0xAAu8; 16];
        map.read_bytes(start + 8, &mut buf).expect("read");
        assert_eq!(buf, [0; 16]);
        assert_eq!(
            map.write_bytes(start, b"denied"),
            Err(VmError::ProtectionFailure(start))
        );
        assert_eq!(map.fault(start - PAGE_SIZE, Protection::READ, false), Err(VmError::InvalidAddress(start - PAGE_SIZE)));
        assert!(map.lookup_entry(start).and_then(|e| e.object).is_some());
    }

    #[test]
    fn byte_access_past_the_top_of_memory_is_rejected() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let mut buf = [0u8; 8];
        assert_eq!(
            map.read_bytes(usize::MAX - 3, &mut buf),
            Err(VmError::InvalidAddress(usize::MAX - 3))
        );
        assert_eq!(
            map.write_bytes(usize::MAX - 3, &buf),
            Err(VmError::InvalidAddress(usize::MAX - 3))
        );
    }

    #[test]
    fn wiring_pins_and_unwiring_releases() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let start = map.enter(EnterRequest::anywhere(4 * PAGE_SIZE)).expect("enter");

        map.wire(start + PAGE_SIZE, start + 3 * PAGE_SIZE, Protection::READ).expect("wire");
        let entries = map.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].wired_count, 1);
        assert!(!entries[1].in_transition);
        assert_eq!(vm.cache().stats().wired, 2);

        assert_eq!(map.unwire(start, start + PAGE_SIZE), Err(VmError::InvalidArgument));
        map.unwire(start + PAGE_SIZE, start + 3 * PAGE_SIZE).expect("unwire");
        assert_eq!(vm.cache().stats().wired, 0);
        assert_eq!(
            map.wire(start, start + 8 * PAGE_SIZE, Protection::READ),
            Err(VmError::InvalidAddress(start + 4 * PAGE_SIZE))
        );
    }

    #[test]
    fn deleting_wired_memory_unwires_it() {
        let vm = test_support::boot_default();
        let map = user_map(vm);
        let free_before = vm.allocator().free_pages();
        let start = map.enter(EnterRequest::anywhere(2 * PAGE_SIZE)).expect("enter");
        map.wire(start, start + 2 * PAGE_SIZE, Protection::DEFAULT).expect("wire");
        map.delete(start, start + 2 * PAGE_SIZE).expect("delete");
        assert_eq!(vm.cache().stats().wired, 0);
        // Page table pages stay with the map's pmap.
        assert!(vm.allocator().free_pages() + 8 >= free_before);
    }

    #[test]
    fn failed_wiring_keeps_earlier_wirings_intact() {
        let (vm, _pageout) = test_support::boot_with_pageout();
        let map = vm.map_create(0x40_0000, 0x4000_0000).expect("map");
        let size = (vm.allocator().free_pages() + 4) * PAGE_SIZE;
        let start = map.enter(EnterRequest::anywhere(size)).expect("enter");
        let head = start + 2 * PAGE_SIZE;

        map.wire(start, head, Protection::READ).expect("wire");
        let pages: Vec<&'static Page> = (start..head)
            .step_by(PAGE_SIZE)
            .map(|va| {
                let pa = map.pmap().extract(VirtualAddress::new(va)).expect("mapped");
                vm.allocator().lookup(pa).expect("descriptor")
            })
            .collect();

        let result = map.wire(start, start + size, Protection::READ);
        assert!(matches!(result, Err(VmError::ResourceShortage(_))));
        let entries = map.entries();
        assert_eq!(entries[0].wired_count, 1);
        assert!(entries[1..].iter().all(|e| e.wired_count == 0));
        assert!(entries.iter().all(|e| !e.in_transition));
        assert!(pages.iter().all(|page| page.wire_count() == 1));
        assert_eq!(vm.cache().stats().wired, 2);

        map.unwire(start, head).expect("unwire");
        assert!(pages.iter().all(|page| page.wire_count() == 0));
        assert_eq!(vm.cache().stats().wired, 0);
    }

    #[test]
    fn fork_shares_copies_and_skips() {
        let vm = test_support::boot_default();
        let parent = user_map(vm);
        let shared = parent
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_inheritance(Inheritance::Share))
            .expect("enter");
        let copied = parent.enter(EnterRequest::anywhere(PAGE_SIZE)).expect("enter");
        let skipped = parent
            .enter(EnterRequest::anywhere(PAGE_SIZE).with_inheritance(Inheritance::None))
            .expect("enter");
        parent.write_bytes(shared, b"shared").expect("write");
        parent.write_bytes(copied, b"before").expect("write");

        let child = parent.fork(vm.create_pmap().expect("pmap")).expect("fork");
        assert!(child.lookup_entry(skipped).is_none());
        assert!(parent.lookup_entry(copied).is_some_and(|e| e.needs_copy));

        child.write_bytes(shared, b"SHARED").expect("write");
        child.write_bytes(copied, b"child!").expect("write");

        let mut buf = [0u8; 6];
        parent.read_bytes(shared, &mut buf).expect("read");
        assert_eq!(&buf, b"SHARED");
        parent.read_bytes(copied, &mut buf).expect("read");
        assert_eq!(&buf, b"before");
        child.read_bytes(copied, &mut buf).expect("read");
        assert_eq!(&buf, b"child!");

        parent.write_bytes(copied, b"parent").expect("write");
        child.read_bytes(copied, &mut buf).expect("read");
        assert_eq!(&buf, b"child!");
        parent.check_invariants();
        child.check_invariants();
    }

    #[test]
    fn suballocated_maps_fault_through_the_parent() {
        let vm = test_support::boot_default();
        let kernel = vm.create_kernel_map().expect("kernel map");
        let window = kernel.suballoc(8 * PAGE_SIZE).expect("suballoc");
        let entry = kernel.lookup_entry(window.min()).expect("entry");
        assert!(entry.is_submap);
        assert_eq!(
            kernel.protect(window.min(), window.max(), Protection::READ, false),
            Err(VmError::InvalidArgument)
        );

        let address = window.enter(EnterRequest::anywhere(PAGE_SIZE)).expect("enter");
        kernel.write_bytes(address, b"nested").expect("write");
        let mut buf = [0u8; 6];
        window.read_bytes(address, &mut buf).expect("read");
        assert_eq!(&buf, b"nested");
    }

    #[test]
    fn submap_requires_the_placeholder_object() {
        let vm = test_support::boot_default();
        let kernel = vm.create_kernel_map().expect("kernel map");
        let start = kernel.enter(EnterRequest::anywhere(PAGE_SIZE)).expect("enter");
        let child = vm.map_create(start, start + PAGE_SIZE).expect("map");
        assert_eq!(kernel.submap(start, start + PAGE_SIZE, child), Err(VmError::InvalidArgument));
    }

    #[test]
    fn projected_buffers_share_kernel_pages() {
        let vm = test_support::boot_default();
        let kernel = vm.create_kernel_map().expect("kernel map");
        let user = user_map(vm);
        let buffer = kernel.enter(EnterRequest::anywhere(2 * PAGE_SIZE)).expect("enter");
        kernel.write_bytes(buffer + PAGE_SIZE, b"kernel data").expect("write");

        let address = user
            .project(&kernel, buffer + PAGE_SIZE, PAGE_SIZE, Protection::READ)
            .expect("project");
        let mut buf = [0u8; 11];
        user.read_bytes(address, &mut buf).expect("read");
        assert_eq!(&buf, b"kernel data");

        let (source, kernel_address) = user.projection_source(address).expect("projected");
        assert!(Arc::ptr_eq(&source, &kernel));
        assert_eq!(kernel_address, buffer + PAGE_SIZE);
        assert_eq!(
            user.protect(address, address + PAGE_SIZE, Protection::READ, false),
            Err(VmError::ProtectionFailure(address))
        );
        assert_eq!(user.write_bytes(address, b"x"), Err(VmError::ProtectionFailure(address)));
    }

    #[derive(Debug, Clone)]
    enum MapOp {
        Enter { page: usize, pages: usize },
        EnterAnywhere { pages: usize },
        Delete { page: usize, pages: usize },
        Clip { page: usize },
        Protect { page: usize, pages: usize },
    }

    fn map_op() -> impl Strategy<Value = MapOp> {
        prop_oneof![
            (0..64usize, 1..8usize).prop_map(|(page, pages)| MapOp::Enter { page, pages }),
            (1..8usize).prop_map(|pages| MapOp::EnterAnywhere { pages }),
            (0..64usize, 1..16usize).prop_map(|(page, pages)| MapOp::Delete { page, pages }),
            (0..64usize).prop_map(|page| MapOp::Clip { page }),
            (0..64usize, 1..8usize).prop_map(|(page, pages)| MapOp::Protect { page, pages }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn entries_and_gaps_stay_consistent(ops in proptest::collection::vec(map_op(), 1..60)) {
            let vm = test_support::boot_small();
            let map = vm.map_create(USER_BASE, USER_BASE + 64 * PAGE_SIZE).expect("map");
            let page = |n: usize| USER_BASE + n * PAGE_SIZE;

            for op in ops {
                match op {
                    MapOp::Enter { page: p, pages } => {
                        let end = (p + pages).min(64);
                        let _ = map.enter(EnterRequest::fixed(page(p), (end - p) * PAGE_SIZE));
                    }
                    MapOp::EnterAnywhere { pages } => {
                        let _ = map.enter(EnterRequest::anywhere(pages * PAGE_SIZE));
                    }
                    MapOp::Delete { page: p, pages } => {
                        map.delete(page(p), page(p + pages)).expect("delete never fails");
                    }
                    MapOp::Clip { page: p } => {
                        let _ = map.clip_start(page(p));
                    }
                    MapOp::Protect { page: p, pages } => {
                        let _ = map.protect(page(p), page(p + pages), Protection::READ, false);
                    }
                }

                map.check_invariants();
                let entries = map.entries();
                for pair in entries.windows(2) {
                    prop_assert!(pair[0].end <= pair[1].start);
                }
                let mapped: usize = entries.iter().map(EntryInfo::size).sum();
                let unmapped: usize = map.gaps().iter().map(|&(_, size)| size).sum();
                prop_assert_eq!(mapped + unmapped, 64 * PAGE_SIZE);
            }
        }
    }
}
