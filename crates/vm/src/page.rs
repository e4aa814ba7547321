use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use crate::{AddressTranslator, PAGE_SIZE, PhysicalAddress};

/// Maximum order supported by the buddy allocator (order 11 = 2048 pages = 8 MiB).
pub const MAX_ORDER: usize = 11;

/// Order value of a page that does not head a free buddy block.
pub const ORDER_NONE: u8 = 0xFF;

/// Physical address recorded in fictitious descriptors.
pub(crate) const FICTITIOUS_ADDRESS: usize = usize::MAX;

/// What a page is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageUsage {
    Free = 0,
    /// Boot-reserved: holes inside a segment, boot data, bootstrap heap.
    Reserved = 1,
    /// Page table pages.
    Table = 2,
    /// Kernel allocator backing.
    Kmem = 3,
    Stack = 4,
    /// Generic kernel use, including resident object pages.
    Kernel = 5,
}

impl PageUsage {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Reserved,
            2 => Self::Table,
            3 => Self::Kmem,
            4 => Self::Stack,
            _ => Self::Kernel,
        }
    }
}

bitflags::bitflags! {
    /// State bits of a page descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageState: u32 {
        const WIRED = 1 << 0;
        const BUSY = 1 << 1;
        const DIRTY = 1 << 2;
        const PRECIOUS = 1 << 3;
        const ABSENT = 1 << 4;
        const ERROR = 1 << 5;
        const REFERENCED = 1 << 6;
        const FICTITIOUS = 1 << 7;
        const EXTERNAL = 1 << 8;
        /// Linked into the resident hash table.
        const TABLED = 1 << 9;
        const ACTIVE = 1 << 10;
        const INACTIVE = 1 << 11;
        const LAUNDRY = 1 << 12;
        /// Belongs to the fictitious pool rather than the buddy allocator.
        const PRIVATE = 1 << 13;
        /// Sitting in the fictitious pool.
        const POOLED = 1 << 14;

        /// Bits that describe the page's data and survive a fictitious conversion.
        const CONTENT = Self::BUSY.bits()
            | Self::DIRTY.bits()
            | Self::PRECIOUS.bits()
            | Self::ABSENT.bits()
            | Self::ERROR.bits()
            | Self::REFERENCED.bits()
            | Self::EXTERNAL.bits();
    }
}

/// A non-owning link to another descriptor.
///
/// Descriptors live for the lifetime of the machine, so links are plain `'static`
/// references. Every link is guarded by the lock of the structure it threads
/// (a free list, a page queue, a hash bucket, or an object's resident list).
pub(crate) struct PageLink(AtomicPtr<Page>);

impl PageLink {
    pub(crate) const fn new() -> Self {
        Self(AtomicPtr::new(ptr::null_mut()))
    }

    pub(crate) fn get(&self) -> Option<&'static Page> {
        // SAFETY: links only ever hold descriptors that are never deallocated.
        unsafe { self.0.load(Ordering::Relaxed).as_ref() }
    }

    pub(crate) fn set(&self, page: Option<&'static Page>) {
        let raw = page.map_or(ptr::null_mut(), |p| p as *const Page as *mut Page);
        self.0.store(raw, Ordering::Relaxed);
    }
}

/// Holds metadata for one physical page.
///
/// Descriptors are created once at boot, in arrays carved from bootstrap memory, and
/// are never freed; what changes is their usage. Every field is atomic so a descriptor
/// can be shared as `&'static Page` while the lock that owns it mutates its linkage.
pub struct Page {
    phys: usize,
    segment: u8,
    usage: AtomicU8,
    /// Buddy order when heading a free block, `ORDER_NONE` otherwise.
    order: AtomicU8,
    state: AtomicU32,
    wire_count: AtomicU32,
    /// Identity of the owning object (0 when unowned).
    object: AtomicUsize,
    offset: AtomicUsize,
    /// Free list, active queue or inactive queue linkage. A page is on at most one.
    pub(crate) next: PageLink,
    pub(crate) prev: PageLink,
    /// Resident hash bucket chain.
    pub(crate) hash_next: PageLink,
    /// Owning object's resident list.
    pub(crate) object_next: PageLink,
    pub(crate) object_prev: PageLink,
}

impl Page {
    /// Creates a boot-reserved descriptor for the page at `phys` in `segment`.
    pub(crate) const fn new(phys: PhysicalAddress, segment: u8) -> Self {
        Self::with_state(phys.as_usize(), segment, PageUsage::Reserved, PageState::empty())
    }

    /// Creates a descriptor with no physical backing.
    pub(crate) const fn fictitious() -> Self {
        Self::with_state(
            FICTITIOUS_ADDRESS,
            u8::MAX,
            PageUsage::Kernel,
            PageState::FICTITIOUS.union(PageState::PRIVATE),
        )
    }

    const fn with_state(phys: usize, segment: u8, usage: PageUsage, state: PageState) -> Self {
        Self {
            phys,
            segment,
            usage: AtomicU8::new(usage as u8),
            order: AtomicU8::new(ORDER_NONE),
            state: AtomicU32::new(state.bits()),
            wire_count: AtomicU32::new(0),
            object: AtomicUsize::new(0),
            offset: AtomicUsize::new(0),
            next: PageLink::new(),
            prev: PageLink::new(),
            hash_next: PageLink::new(),
            object_next: PageLink::new(),
            object_prev: PageLink::new(),
        }
    }

    /// Returns the physical address of this page.
    ///
    /// # Panics
    ///
    /// Panics on fictitious pages, which have none.
    pub fn phys(&self) -> PhysicalAddress {
        assert!(!self.is_fictitious(), "fictitious page has no physical address");
        PhysicalAddress::new(self.phys)
    }

    pub(crate) fn segment_index(&self) -> usize {
        self.segment as usize
    }

    pub fn usage(&self) -> PageUsage {
        PageUsage::from_raw(self.usage.load(Ordering::Acquire))
    }

    pub(crate) fn set_usage(&self, usage: PageUsage) {
        self.usage.store(usage as u8, Ordering::Release);
    }

    /// Gets the buddy order recorded on this page.
    pub fn order(&self) -> u8 {
        self.order.load(Ordering::Acquire)
    }

    pub(crate) fn set_order(&self, order: u8) {
        self.order.store(order, Ordering::Release);
    }

    pub fn state(&self) -> PageState {
        PageState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    pub fn contains(&self, bits: PageState) -> bool {
        self.state().contains(bits)
    }

    pub fn insert_state(&self, bits: PageState) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn remove_state(&self, bits: PageState) {
        self.state.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    pub(crate) fn reset_state(&self, state: PageState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    pub fn is_fictitious(&self) -> bool {
        self.contains(PageState::FICTITIOUS)
    }

    pub fn is_tabled(&self) -> bool {
        self.contains(PageState::TABLED)
    }

    pub fn is_busy(&self) -> bool {
        self.contains(PageState::BUSY)
    }

    pub fn is_active(&self) -> bool {
        self.contains(PageState::ACTIVE)
    }

    pub fn is_inactive(&self) -> bool {
        self.contains(PageState::INACTIVE)
    }

    pub fn wire_count(&self) -> u32 {
        self.wire_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_wire_count(&self, count: u32) {
        self.wire_count.store(count, Ordering::Release);
    }

    /// Identity of the object holding this page, if it is tabled.
    pub fn object_id(&self) -> Option<usize> {
        match self.object.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, object: usize, offset: usize) {
        self.object.store(object, Ordering::Release);
        self.offset.store(offset, Ordering::Release);
    }

    fn data_ptr(&self) -> *mut u8 {
        AddressTranslator::current().phys_to_ptr(self.phys())
    }

    /// Fills the page with zeroes.
    pub fn zero(&self) {
        // SAFETY: the caller owns the page, and the translator maps all of physical memory.
        unsafe { ptr::write_bytes(self.data_ptr(), 0, PAGE_SIZE) };
    }

    /// Copies the whole contents of `source` into this page.
    pub fn copy_from(&self, source: &Page) {
        // SAFETY: distinct pages never overlap.
        unsafe { ptr::copy_nonoverlapping(source.data_ptr(), self.data_ptr(), PAGE_SIZE) };
    }

    /// Reads `buf.len()` bytes starting at `offset` within the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE, "read past end of page");
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(self.data_ptr().add(offset), buf.as_mut_ptr(), buf.len()) };
    }

    /// Writes `data` starting at `offset` within the page.
    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= PAGE_SIZE, "write past end of page");
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), self.data_ptr().add(offset), data.len()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits_set_and_clear() {
        let page = Page::new(PhysicalAddress::new(0x1000), 0);
        page.insert_state(PageState::BUSY | PageState::DIRTY);
        assert!(page.is_busy());
        page.remove_state(PageState::BUSY);
        assert!(!page.is_busy());
        assert!(page.contains(PageState::DIRTY));
    }

    #[test]
    fn boot_descriptors_are_reserved() {
        let page = Page::new(PhysicalAddress::new(0x3000), 2);
        assert_eq!(page.usage(), PageUsage::Reserved);
        assert_eq!(page.order(), ORDER_NONE);
        assert_eq!(page.segment_index(), 2);
        assert_eq!(page.phys(), PhysicalAddress::new(0x3000));
        assert_eq!(page.object_id(), None);
    }

    #[test]
    #[should_panic(expected = "fictitious page has no physical address")]
    fn fictitious_pages_have_no_address() {
        let page = Page::fictitious();
        assert!(page.contains(PageState::PRIVATE));
        page.phys();
    }
}
