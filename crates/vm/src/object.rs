//! Memory objects: the backing store named by map entries.
//!
//! An object is a sparse array of pages indexed by byte offset. Its resident pages live in
//! the [`ResidentCache`]; the object itself only keeps the list of them, under its lock.
//! Objects are shared through `Arc`, and the last reference frees every resident page.

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::list::{ObjectLinkage, PageList};
use crate::page::Page;
use crate::resident::ResidentCache;

static NEXT_OBJECT_ID: AtomicUsize = AtomicUsize::new(1);

/// How mappings that request a copy of the object obtain one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyStrategy {
    /// Share the pages and copy each one on the first write (copy-on-write).
    #[default]
    Delay,
    /// Copy every resident page when the mapping is made.
    Immediate,
}

/// The lock-protected part of an object.
///
/// Holding `&mut ObjectState` is what entitles a caller to insert, remove or look up this
/// object's pages in the resident cache.
pub struct ObjectState {
    id: usize,
    pub(crate) resident: PageList<ObjectLinkage>,
    /// Offset of the most recent insertion, for sequential access detection.
    pub(crate) last_inserted: Option<usize>,
}

impl ObjectState {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Iterates over the resident pages in insertion order.
    pub fn resident_pages(&self) -> impl Iterator<Item = &'static Page> + '_ {
        self.resident.iter()
    }
}

pub struct VmObject {
    id: usize,
    size: usize,
    strategy: CopyStrategy,
    cache: &'static ResidentCache,
    state: spin::Mutex<ObjectState>,
}

impl VmObject {
    pub fn new(cache: &'static ResidentCache, size: usize, strategy: CopyStrategy) -> Self {
        let id = NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed);
        log::trace!("object {} created ({:#x} bytes, {:?})", id, size, strategy);
        Self {
            id,
            size,
            strategy,
            cache,
            state: spin::Mutex::new(ObjectState {
                id,
                resident: PageList::new(),
                last_inserted: None,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn strategy(&self) -> CopyStrategy {
        self.strategy
    }

    pub fn cache(&self) -> &'static ResidentCache {
        self.cache
    }

    /// Locks the object. Take object locks before the page queue lock.
    pub fn lock(&self) -> spin::MutexGuard<'_, ObjectState> {
        self.state.lock()
    }

    pub fn resident_count(&self) -> usize {
        self.state.lock().resident_count()
    }

    /// Returns the resident page at `offset`.
    pub fn page_at(&self, offset: usize) -> Option<&'static Page> {
        self.cache.lookup(&self.state.lock(), offset)
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        log::trace!("object {} released with {} resident pages", self.id, state.resident_count());
        self.cache.release_object(state);
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("size", &format_args!("{:#x}", self.size))
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use crate::test_support;
    use crate::{CopyStrategy, PAGE_SIZE, PageState};

    #[test]
    fn dropping_the_last_reference_frees_resident_pages() {
        let vm = test_support::boot_default();
        let free_before = vm.allocator().free_pages();

        let object = vm.object_create(4 * PAGE_SIZE);
        let shared = Arc::clone(&object);
        {
            let mut state = object.lock();
            for i in 0..4 {
                vm.cache().alloc(&mut state, i * PAGE_SIZE).expect("page");
            }
        }
        assert_eq!(object.resident_count(), 4);
        assert_eq!(vm.allocator().free_pages(), free_before - 4);

        drop(object);
        assert_eq!(shared.resident_count(), 4);
        drop(shared);
        assert_eq!(vm.allocator().free_pages(), free_before);
    }

    #[test]
    fn object_ids_are_unique() {
        let vm = test_support::boot_default();
        let a = vm.object_create(PAGE_SIZE);
        let b = vm.object_create_with(PAGE_SIZE, CopyStrategy::Immediate);
        assert_ne!(a.id(), b.id());
        assert_eq!(b.strategy(), CopyStrategy::Immediate);
    }

    #[test]
    fn page_at_finds_resident_pages() {
        let vm = test_support::boot_default();
        let object = vm.object_create(2 * PAGE_SIZE);
        let page = {
            let mut state = object.lock();
            vm.cache().alloc(&mut state, PAGE_SIZE).expect("page")
        };
        let found = object.page_at(PAGE_SIZE).expect("resident");
        assert!(core::ptr::eq(found, page));
        assert!(found.contains(PageState::TABLED));
        assert!(object.page_at(0).is_none());
    }
}
