//! Intrusive doubly linked lists of page descriptors.
//!
//! A list never owns its pages; it threads them through one pair of link fields. The
//! `Linkage` parameter selects which pair, so a page can sit on a queue and on its
//! object's resident list at the same time.

use core::marker::PhantomData;

use crate::page::{Page, PageLink};

pub(crate) trait Linkage {
    fn next(page: &Page) -> &PageLink;
    fn prev(page: &Page) -> &PageLink;
}

/// Free lists and the active/inactive queues.
pub(crate) struct QueueLinkage;

impl Linkage for QueueLinkage {
    fn next(page: &Page) -> &PageLink {
        &page.next
    }

    fn prev(page: &Page) -> &PageLink {
        &page.prev
    }
}

/// An object's list of resident pages.
pub(crate) struct ObjectLinkage;

impl Linkage for ObjectLinkage {
    fn next(page: &Page) -> &PageLink {
        &page.object_next
    }

    fn prev(page: &Page) -> &PageLink {
        &page.object_prev
    }
}

pub(crate) struct PageList<L> {
    head: Option<&'static Page>,
    tail: Option<&'static Page>,
    len: usize,
    _linkage: PhantomData<L>,
}

impl<L: Linkage> PageList<L> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _linkage: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn front(&self) -> Option<&'static Page> {
        self.head
    }

    pub(crate) fn push_front(&mut self, page: &'static Page) {
        L::prev(page).set(None);
        L::next(page).set(self.head);
        match self.head {
            Some(head) => L::prev(head).set(Some(page)),
            None => self.tail = Some(page),
        }
        self.head = Some(page);
        self.len += 1;
    }

    pub(crate) fn push_back(&mut self, page: &'static Page) {
        L::next(page).set(None);
        L::prev(page).set(self.tail);
        match self.tail {
            Some(tail) => L::next(tail).set(Some(page)),
            None => self.head = Some(page),
        }
        self.tail = Some(page);
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<&'static Page> {
        let page = self.head?;
        self.remove(page);
        Some(page)
    }

    /// Unlinks `page`, which must be on this list.
    pub(crate) fn remove(&mut self, page: &'static Page) {
        debug_assert!(self.len > 0, "removing from an empty page list");
        let next = L::next(page).get();
        let prev = L::prev(page).get();
        match prev {
            Some(prev) => L::next(prev).set(next),
            None => self.head = next,
        }
        match next {
            Some(next) => L::prev(next).set(prev),
            None => self.tail = prev,
        }
        L::next(page).set(None);
        L::prev(page).set(None);
        self.len -= 1;
    }

    pub(crate) fn iter(&self) -> Iter<'_, L> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

pub(crate) struct Iter<'a, L> {
    next: Option<&'static Page>,
    _list: PhantomData<&'a PageList<L>>,
}

impl<L: Linkage> Iterator for Iter<'_, L> {
    type Item = &'static Page;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.next?;
        self.next = L::next(page).get();
        Some(page)
    }
}

#[cfg(test)]
mod tests {
    use alloc::boxed::Box;
    use alloc::vec::Vec;

    use super::*;
    use crate::PhysicalAddress;

    fn pages(count: usize) -> &'static [Page] {
        let pages: Vec<Page> = (0..count)
            .map(|i| Page::new(PhysicalAddress::new(i * crate::PAGE_SIZE), 0))
            .collect();
        Box::leak(pages.into_boxed_slice())
    }

    fn addresses<L: Linkage>(list: &PageList<L>) -> Vec<usize> {
        list.iter().map(|p| p.phys().as_usize()).collect()
    }

    #[test]
    fn push_pop_and_remove() {
        let pages = pages(4);
        let mut list = PageList::<QueueLinkage>::new();
        list.push_back(&pages[1]);
        list.push_back(&pages[2]);
        list.push_front(&pages[0]);
        list.push_back(&pages[3]);
        assert_eq!(addresses(&list), [0x0, 0x1000, 0x2000, 0x3000]);

        list.remove(&pages[2]);
        assert_eq!(addresses(&list), [0x0, 0x1000, 0x3000]);
        list.remove(&pages[3]);
        assert_eq!(list.pop_front().map(|p| p.phys().as_usize()), Some(0x0));
        assert_eq!(addresses(&list), [0x1000]);
        assert_eq!(list.len(), 1);
        list.remove(&pages[1]);
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[test]
    fn linkages_are_independent() {
        let pages = pages(2);
        let mut queue = PageList::<QueueLinkage>::new();
        let mut resident = PageList::<ObjectLinkage>::new();
        queue.push_back(&pages[0]);
        queue.push_back(&pages[1]);
        resident.push_back(&pages[1]);
        resident.push_back(&pages[0]);

        queue.remove(&pages[0]);
        assert_eq!(addresses(&queue), [0x1000]);
        assert_eq!(addresses(&resident), [0x1000, 0x0]);
    }
}
