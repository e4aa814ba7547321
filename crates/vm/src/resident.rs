//! The resident page cache.
//!
//! Maps `(object, offset)` to the page holding that data, and keeps the active and inactive
//! queues the pageout daemon scans. Every page that leaves an object goes back through
//! [`ResidentCache::free`].
//!
//! Lock order: object lock, then a bucket lock or the queue lock. Bucket locks and the
//! queue lock are never held together.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::diag::{BucketOccupancy, PageDump};
use crate::error::{Shortage, VmError};
use crate::list::{PageList, QueueLinkage};
use crate::object::{ObjectState, VmObject};
use crate::page::{Page, PageState, PageUsage};
use crate::pageout::Pageout;
use crate::physical_allocator::PhysicalAllocator;
use crate::segment::Selector;
use crate::{PAGE_SHIFT, PAGE_SIZE};

/// One hash chain, threaded through `Page::hash_next`.
pub(crate) type Bucket = spin::Mutex<Option<&'static Page>>;

const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

struct PageQueues {
    active: PageList<QueueLinkage>,
    inactive: PageList<QueueLinkage>,
    wired: usize,
    laundry: usize,
}

/// Queue moves. Wire counts only change under the queue lock, so they are stable here.
impl PageQueues {
    fn dequeue(&mut self, page: &'static Page) {
        if page.is_active() {
            self.active.remove(page);
        }
        if page.is_inactive() {
            self.inactive.remove(page);
        }
        page.remove_state(PageState::ACTIVE | PageState::INACTIVE);
    }

    fn activate(&mut self, page: &'static Page) {
        if page.wire_count() > 0 {
            return;
        }
        if page.is_inactive() {
            self.inactive.remove(page);
            page.remove_state(PageState::INACTIVE);
        }
        if !page.is_active() {
            self.active.push_back(page);
            page.insert_state(PageState::ACTIVE);
        }
    }

    fn deactivate(&mut self, page: &'static Page) {
        if page.wire_count() > 0 {
            return;
        }
        if page.is_active() {
            self.active.remove(page);
            page.remove_state(PageState::ACTIVE);
        }
        if !page.is_inactive() {
            self.inactive.push_back(page);
            page.insert_state(PageState::INACTIVE);
        }
        page.remove_state(PageState::REFERENCED);
    }
}

/// Queue population, for diagnostics and the pageout daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub active: usize,
    pub inactive: usize,
    pub wired: usize,
    pub laundry: usize,
    pub fictitious_free: usize,
}

pub struct ResidentCache {
    allocator: &'static PhysicalAllocator,
    pageout: &'static dyn Pageout,
    buckets: &'static [Bucket],
    mask: usize,
    queues: spin::Mutex<PageQueues>,
    fictitious: spin::Mutex<PageList<QueueLinkage>>,
    fictitious_chunk: usize,
    free_min: usize,
    free_target: usize,
}

impl ResidentCache {
    pub(crate) fn new(
        allocator: &'static PhysicalAllocator,
        pageout: &'static dyn Pageout,
        buckets: &'static [Bucket],
        free_min: usize,
        free_target: usize,
        fictitious_chunk: usize,
    ) -> Self {
        assert!(
            buckets.len().is_power_of_two(),
            "bucket count {} is not a power of two",
            buckets.len()
        );
        log::debug!("resident cache with {} buckets", buckets.len());
        Self {
            allocator,
            pageout,
            buckets,
            mask: buckets.len() - 1,
            queues: spin::Mutex::new(PageQueues {
                active: PageList::new(),
                inactive: PageList::new(),
                wired: 0,
                laundry: 0,
            }),
            fictitious: spin::Mutex::new(PageList::new()),
            fictitious_chunk: fictitious_chunk.max(1),
            free_min,
            free_target,
        }
    }

    pub fn allocator(&self) -> &'static PhysicalAllocator {
        self.allocator
    }

    fn bucket(&self, object: usize, offset: usize) -> &Bucket {
        let hash = (object as u64).wrapping_mul(HASH_MULTIPLIER) as usize ^ (offset >> PAGE_SHIFT);
        &self.buckets[hash & self.mask]
    }

    /// Enters `page` into the table at `(object, offset)` and onto the object's list.
    fn link(&self, page: &'static Page, state: &mut ObjectState, offset: usize) {
        assert!(!page.is_tabled(), "page already tabled at offset {:#x}", page.offset());
        assert!(!page.is_active() && !page.is_inactive(), "inserting a queued page");
        debug_assert_eq!(offset % PAGE_SIZE, 0);

        page.set_owner(state.id(), offset);
        {
            let mut head = self.bucket(state.id(), offset).lock();
            page.hash_next.set(*head);
            *head = Some(page);
        }
        page.insert_state(PageState::TABLED);
        state.resident.push_back(page);
    }

    /// Inserts `page` at `(object, offset)`.
    ///
    /// When the insertion continues a sequential run, the page one before it is moved to
    /// the inactive queue if it is active and not busy.
    ///
    /// # Panics
    ///
    /// Panics if the page is already tabled or queued.
    pub fn insert(&self, page: &'static Page, state: &mut ObjectState, offset: usize) {
        self.link(page, state, offset);

        let sequential = offset
            .checked_sub(PAGE_SIZE)
            .filter(|&previous| state.last_inserted == Some(previous));
        if let Some(previous) = sequential.and_then(|previous| self.lookup(state, previous))
            && previous.is_active()
            && !previous.is_busy()
        {
            log::trace!("deactivating behind offset {:#x}", offset);
            self.deactivate(previous);
        }
        state.last_inserted = Some(offset);
    }

    /// Inserts `page` at `(object, offset)`, first freeing any page already there.
    pub fn replace(&self, page: &'static Page, state: &mut ObjectState, offset: usize) {
        if let Some(existing) = self.lookup(state, offset) {
            self.free(existing, Some(&mut *state));
        }
        self.insert(page, state, offset);
    }

    /// Removes `page` from the table, its object and its queue.
    ///
    /// # Panics
    ///
    /// Panics if the page is not tabled or belongs to another object.
    pub fn remove(&self, page: &'static Page, state: &mut ObjectState) {
        if !page.is_tabled() {
            log::error!("removing untabled page at offset {:#x}", page.offset());
            panic!("removing an untabled page");
        }
        assert_eq!(
            page.object_id(),
            Some(state.id()),
            "removing a page through the wrong object"
        );

        {
            let mut head = self.bucket(state.id(), page.offset()).lock();
            let mut cursor = *head;
            let mut previous: Option<&'static Page> = None;
            loop {
                match cursor {
                    Some(candidate) if core::ptr::eq(candidate, page) => break,
                    Some(candidate) => {
                        previous = Some(candidate);
                        cursor = candidate.hash_next.get();
                    }
                    None => panic!("tabled page missing from its bucket"),
                }
            }
            let next = page.hash_next.get();
            match previous {
                Some(previous) => previous.hash_next.set(next),
                None => *head = next,
            }
            page.hash_next.set(None);
        }

        state.resident.remove(page);
        self.dequeue(page);
        page.remove_state(PageState::TABLED);
        page.set_owner(0, 0);
    }

    /// Finds the page at `(object, offset)`.
    pub fn lookup(&self, state: &ObjectState, offset: usize) -> Option<&'static Page> {
        let head = self.bucket(state.id(), offset).lock();
        let mut cursor = *head;
        while let Some(page) = cursor {
            if page.object_id() == Some(state.id()) && page.offset() == offset {
                return Some(page);
            }
            cursor = page.hash_next.get();
        }
        None
    }

    /// Takes a free page from any segment without entering it anywhere.
    ///
    /// Wakes the pageout daemon when free memory runs low. Never blocks.
    pub fn grab(&self) -> Result<&'static Page, VmError> {
        let page = match self.allocator.alloc(0, Selector::HighMem, PageUsage::Kernel) {
            Ok(page) => page,
            Err(_) => {
                log::warn!("no free pages, waking pageout");
                self.pageout.wakeup();
                return Err(VmError::ResourceShortage(Shortage::Pages));
            }
        };
        if self.allocator.free_pages() < self.free_min {
            self.pageout.wakeup();
        }
        page.reset_state(PageState::empty());
        page.set_wire_count(0);
        Ok(page)
    }

    /// Like [`Self::grab`], but waits for the pageout daemon until a page is free.
    pub fn grab_wait(&self) -> &'static Page {
        loop {
            if let Ok(page) = self.grab() {
                return page;
            }
            self.pageout.wait_for_pages();
        }
    }

    /// Allocates a page and inserts it at `(object, offset)`. Never blocks.
    pub fn alloc(&self, state: &mut ObjectState, offset: usize) -> Result<&'static Page, VmError> {
        let page = self.grab()?;
        self.insert(page, state, offset);
        Ok(page)
    }

    /// Allocates a page for `(object, offset)`, waiting for memory with the object unlocked.
    pub fn alloc_wait(&self, object: &VmObject, offset: usize) -> &'static Page {
        loop {
            {
                let mut state = object.lock();
                if let Ok(page) = self.alloc(&mut state, offset) {
                    return page;
                }
            }
            self.pageout.wait_for_pages();
        }
    }

    /// Returns a page to where it came from.
    ///
    /// Tabled pages are removed from their object first, which requires its state. Wiring
    /// and laundry are cleared. Fictitious pages go back to the pool, real ones to the
    /// physical allocator.
    ///
    /// # Panics
    ///
    /// Panics on a tabled page without its object state, and on a double free.
    pub fn free(&self, page: &'static Page, state: Option<&mut ObjectState>) {
        assert!(
            !page.contains(PageState::POOLED),
            "fictitious page freed twice"
        );
        if page.is_tabled() {
            match state {
                Some(state) => self.remove(page, state),
                None => panic!("freeing a tabled page without its object"),
            }
        }

        {
            let mut queues = self.queues.lock();
            queues.dequeue(page);
            if page.wire_count() > 0 {
                queues.wired -= 1;
                page.set_wire_count(0);
            }
        }
        if page.contains(PageState::LAUNDRY) {
            self.clear_laundry(page);
        }

        if page.contains(PageState::PRIVATE) {
            page.reset_state(PageState::FICTITIOUS | PageState::PRIVATE | PageState::POOLED);
            self.fictitious.lock().push_front(page);
        } else {
            page.reset_state(PageState::empty());
            self.allocator.free(page, 0);
        }
    }

    /// Frees every resident page of an object that is going away.
    pub(crate) fn release_object(&self, state: &mut ObjectState) {
        while let Some(page) = state.resident.front() {
            self.free(page, Some(&mut *state));
        }
    }

    /// Moves `page` to the tail of the active queue. Wired pages stay off the queues.
    pub fn activate(&self, page: &'static Page) {
        self.queues.lock().activate(page);
    }

    /// Moves `page` to the tail of the inactive queue.
    pub fn deactivate(&self, page: &'static Page) {
        self.queues.lock().deactivate(page);
    }

    /// Takes `page` off whichever queue it is on.
    pub fn dequeue(&self, page: &'static Page) {
        if !page.is_active() && !page.is_inactive() {
            return;
        }
        self.queues.lock().dequeue(page);
    }

    /// Pins `page`, taking it off the reclamation queues on the first wiring.
    pub fn wire(&self, page: &'static Page) {
        let mut queues = self.queues.lock();
        let count = page.wire_count();
        if count == 0 {
            queues.dequeue(page);
            queues.wired += 1;
            page.insert_state(PageState::WIRED);
        }
        page.set_wire_count(count + 1);
    }

    /// Drops one wiring; the last one puts the page back on the active queue.
    ///
    /// # Panics
    ///
    /// Panics if the page is not wired.
    pub fn unwire(&self, page: &'static Page) {
        let mut queues = self.queues.lock();
        let count = page.wire_count();
        assert!(count > 0, "unwiring an unwired page");
        page.set_wire_count(count - 1);
        if count == 1 {
            queues.wired -= 1;
            page.remove_state(PageState::WIRED);
            queues.activate(page);
        }
    }

    /// Marks `page` as queued for cleaning.
    pub fn set_laundry(&self, page: &'static Page) {
        let mut queues = self.queues.lock();
        if !page.contains(PageState::LAUNDRY) {
            page.insert_state(PageState::LAUNDRY);
            queues.laundry += 1;
        }
    }

    /// Marks `page` as clean. The last one tells the pageout daemon the laundry is done.
    pub fn clear_laundry(&self, page: &'static Page) {
        let drained = {
            let mut queues = self.queues.lock();
            if !page.contains(PageState::LAUNDRY) {
                return;
            }
            page.remove_state(PageState::LAUNDRY);
            queues.laundry -= 1;
            queues.laundry == 0
        };
        if drained {
            self.pageout.laundry_drained();
        }
    }

    /// Takes a placeholder descriptor from the fictitious pool, growing it if empty.
    pub fn grab_fictitious(&self) -> &'static Page {
        let mut pool = self.fictitious.lock();
        if pool.is_empty() {
            let chunk: Vec<Page> = (0..self.fictitious_chunk).map(|_| Page::fictitious()).collect();
            for page in Box::leak(chunk.into_boxed_slice()).iter() {
                page.insert_state(PageState::POOLED);
                pool.push_back(page);
            }
            log::debug!("fictitious pool grown by {} descriptors", self.fictitious_chunk);
        }
        match pool.pop_front() {
            Some(page) => {
                page.remove_state(PageState::POOLED);
                page
            }
            None => unreachable!("fictitious pool refilled above"),
        }
    }

    /// Replaces the fictitious placeholder `fictitious` with the real page `real`.
    ///
    /// The real page takes the placeholder's key, content state and queue position; the
    /// placeholder returns to the pool. Both happen under the object lock, so a reader
    /// holding that lock sees either the placeholder or the real page, never neither.
    ///
    /// # Panics
    ///
    /// Panics if `fictitious` is not a tabled placeholder of this object or `real` is
    /// itself fictitious.
    pub fn convert_fictitious(
        &self,
        state: &mut ObjectState,
        fictitious: &'static Page,
        real: &'static Page,
    ) {
        assert!(fictitious.is_fictitious(), "converting a real page");
        assert!(!real.is_fictitious(), "converting into a fictitious page");

        let offset = fictitious.offset();
        let carried = fictitious.state() & PageState::CONTENT;
        let was_active = fictitious.is_active();

        self.remove(fictitious, state);
        self.free(fictitious, None);
        self.link(real, state, offset);
        real.insert_state(carried);
        if was_active {
            self.activate(real);
        }
        log::trace!("converted fictitious page at offset {:#x}", offset);
    }

    pub fn stats(&self) -> QueueStats {
        let fictitious_free = self.fictitious.lock().len();
        let queues = self.queues.lock();
        QueueStats {
            active: queues.active.len(),
            inactive: queues.inactive.len(),
            wired: queues.wired,
            laundry: queues.laundry,
            fictitious_free,
        }
    }

    /// Pages the pageout daemon still has to reclaim to reach the free target.
    pub fn page_shortage(&self) -> usize {
        self.free_target.saturating_sub(self.allocator.free_pages())
    }

    /// Summarizes hash chain lengths.
    pub fn bucket_occupancy(&self) -> BucketOccupancy {
        let mut occupancy = BucketOccupancy {
            buckets: self.buckets.len(),
            ..BucketOccupancy::default()
        };
        for bucket in self.buckets {
            let mut length = 0;
            let mut cursor = *bucket.lock();
            while let Some(page) = cursor {
                length += 1;
                cursor = page.hash_next.get();
            }
            if length == 0 {
                occupancy.empty += 1;
            }
            occupancy.pages += length;
            occupancy.longest = occupancy.longest.max(length);
        }
        occupancy
    }

    /// Iterates over the descriptors chained in bucket `index`.
    pub fn bucket_pages(&self, index: usize) -> Vec<PageDump> {
        let mut pages = Vec::new();
        let mut cursor = self.buckets.get(index).and_then(|bucket| *bucket.lock());
        while let Some(page) = cursor {
            pages.push(PageDump::of(page));
            cursor = page.hash_next.get();
        }
        pages
    }
}
