//! The assembled virtual memory system.
//!
//! [`VmSystem::bootstrap`] turns the boot loader's memory map into segments, lays out the
//! page descriptors and resident hash buckets in a bump-allocated heap, and hands every
//! remaining available page to the buddy allocator. Everything it builds lives for the
//! rest of the machine's life, so bootstrap needs no global allocator; the kernel map is
//! created separately once one exists.

use alloc::sync::Arc;
use core::{fmt, mem, slice};

use crate::arch::MAX_PHYSICAL_BITS;
use crate::boot::{BootData, BootError, BootMap, BootstrapHeap, MemoryRegion, RegionArray};
use crate::config::VmConfig;
use crate::error::VmError;
use crate::map::VmMap;
use crate::object::{CopyStrategy, VmObject};
use crate::page::Page;
use crate::page_directory::PageDirectory;
use crate::pageout::Pageout;
use crate::physical_allocator::PhysicalAllocator;
use crate::pmap::Pmap;
use crate::resident::{Bucket, ResidentCache};
use crate::segment::{Segment, Selector};
use crate::{AddressTranslator, HumanSize, PAGE_SIZE, PhysicalAddress};

pub struct VmSystem {
    config: VmConfig,
    allocator: &'static PhysicalAllocator,
    cache: &'static ResidentCache,
    boot_map: BootMap,
    boot_data: spin::Mutex<BootData>,
    /// Physical range consumed by the bootstrap heap.
    heap: (u64, u64),
    kernel_map: spin::Once<Arc<VmMap>>,
    submap_object: spin::Once<Arc<VmObject>>,
}

/// Reserves room for `len` values of `T` in the bootstrap heap.
fn reserve<T>(heap: &mut BootstrapHeap, len: usize) -> Result<*mut T, BootError> {
    let phys = heap.alloc(len * mem::size_of::<T>(), mem::align_of::<T>())?;
    Ok(AddressTranslator::current().phys_to_ptr::<T>(phys))
}

/// Builds a `len`-element array in bootstrap heap memory.
fn place_array<T>(
    heap: &mut BootstrapHeap,
    len: usize,
    mut init: impl FnMut(usize) -> T,
) -> Result<&'static [T], BootError> {
    let ptr = reserve::<T>(heap, len)?;
    // SAFETY: the heap hands out each range once and never reclaims it, the translator
    // maps it for the lifetime of the machine, and every element is written before the
    // slice is formed.
    unsafe {
        for i in 0..len {
            ptr.add(i).write(init(i));
        }
        Ok(slice::from_raw_parts(ptr, len))
    }
}

fn place<T>(heap: &mut BootstrapHeap, value: T) -> Result<&'static T, BootError> {
    let ptr = reserve::<T>(heap, 1)?;
    // SAFETY: as in `place_array`.
    unsafe {
        ptr.write(value);
        Ok(&*ptr)
    }
}

/// Physical spans of each segment, indexed by selector.
fn segment_spans(map: &BootMap, config: &VmConfig) -> Result<[Option<(u64, u64)>; 4], BootError> {
    let limit = 1u64 << MAX_PHYSICAL_BITS;
    let mut spans = [None; 4];
    let mut floor = 0;
    for (selector, ceiling) in Selector::ALL.into_iter().zip(config.ceilings()) {
        let Some(ceiling) = ceiling.map(|c| c.min(limit)) else {
            continue;
        };
        if ceiling > floor {
            spans[selector.index()] = map.find_available(floor, ceiling);
        }
        floor = floor.max(ceiling);
    }
    if spans[Selector::Dma.index()].is_none() {
        log::error!("no available memory below {:#x}", config.dma_limit);
        return Err(BootError::NoDmaSegment);
    }
    Ok(spans)
}

/// Available memory from `map` inside `[start, end)`, minus every range in `reserved`.
fn releasable(
    map: &BootMap,
    start: u64,
    end: u64,
    reserved: impl IntoIterator<Item = (u64, u64)>,
) -> Result<RegionArray, BootError> {
    let mut free = RegionArray::new();
    for entry in map.available() {
        free.add(MemoryRegion::new(entry.base, entry.end))?;
    }
    free.clamp(start.max(PAGE_SIZE as u64), end)?;
    for (base, end) in reserved {
        free.subtract(MemoryRegion::new(base, end))?;
    }
    Ok(free)
}

impl VmSystem {
    /// Builds the physical memory layer from the boot memory map.
    ///
    /// Boot data ranges and the bootstrap heap stay reserved, as do holes inside a
    /// segment's span and the first physical page. The address translator must already be
    /// installed.
    pub fn bootstrap(
        mut map: BootMap,
        data: BootData,
        pageout: &'static dyn Pageout,
        config: VmConfig,
    ) -> Result<&'static VmSystem, BootError> {
        map.resolve()?;
        let spans = segment_spans(&map, &config)?;
        let mut heap = BootstrapHeap::carve(&map, &data, config.direct_map_limit, config.heap_mode)?;

        let mut segments: [Option<Segment>; 4] = [const { None }; 4];
        let mut total_pages = 0;
        for selector in Selector::ALL {
            let Some((start, end)) = spans[selector.index()] else {
                continue;
            };
            let count = ((end - start) / PAGE_SIZE as u64) as usize;
            let pages = place_array(&mut heap, count, |i| {
                Page::new(
                    PhysicalAddress::new(start as usize + i * PAGE_SIZE),
                    selector.index() as u8,
                )
            })?;
            segments[selector.index()] = Some(Segment::new(selector, pages));
            total_pages += count;
        }

        let bucket_count = (total_pages / config.pages_per_bucket.max(1))
            .max(1)
            .next_power_of_two();
        let buckets: &'static [Bucket] = place_array(&mut heap, bucket_count, |_| spin::Mutex::new(None))?;

        let allocator = place(&mut heap, PhysicalAllocator::new(segments))?;
        let cache = place(
            &mut heap,
            ResidentCache::new(
                allocator,
                pageout,
                buckets,
                config.free_min,
                config.free_target,
                config.fictitious_chunk,
            ),
        )?;
        let slot = reserve::<VmSystem>(&mut heap, 1)?;
        let used = heap.used();

        let low = spans.iter().flatten().map(|&(start, _)| start).min().unwrap_or(0);
        let high = spans.iter().flatten().map(|&(_, end)| end).max().unwrap_or(0);
        let reserved = data
            .ranges()
            .iter()
            .map(|r| (r.start, r.end))
            .chain(core::iter::once(used));
        let free = releasable(&map, low, high, reserved)?;
        for region in free.iter() {
            allocator.release(
                PhysicalAddress::new(region.base() as usize),
                PhysicalAddress::new(region.end() as usize),
            );
        }

        log::info!(
            "vm: {} pages described, {} free, {} buckets, heap {:#x}..{:#x}",
            total_pages,
            HumanSize::pages(allocator.free_pages()),
            bucket_count,
            used.0,
            used.1
        );

        let system = VmSystem {
            config,
            allocator,
            cache,
            boot_map: map,
            boot_data: spin::Mutex::new(data),
            heap: used,
            kernel_map: spin::Once::new(),
            submap_object: spin::Once::new(),
        };
        // SAFETY: `slot` was reserved above and is excluded from the released memory.
        unsafe {
            slot.write(system);
            Ok(&*slot)
        }
    }

    /// Installs `self` as the machine's VM system.
    ///
    /// # Panics
    ///
    /// Panics if a system has already been installed.
    pub fn install(&'static self) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if VM_SYSTEM.get().is_some() {
                panic!("vm system already installed");
            }
            VM_SYSTEM.call_once(|| self);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        VM_SYSTEM.with(|system| {
            if system.get().is_some() {
                panic!("vm system already installed");
            }
            system.call_once(|| self);
        });
    }

    /// Returns the installed system, if any.
    pub fn current() -> Option<&'static VmSystem> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            VM_SYSTEM.get().copied()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            VM_SYSTEM.with(|system| system.get().copied())
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn allocator(&self) -> &'static PhysicalAllocator {
        self.allocator
    }

    pub fn cache(&self) -> &'static ResidentCache {
        self.cache
    }

    /// The resolved boot memory map.
    pub fn boot_map(&self) -> &BootMap {
        &self.boot_map
    }

    /// Physical range holding the descriptors, buckets and the system itself.
    pub fn heap_range(&self) -> (u64, u64) {
        self.heap
    }

    /// Hands temporary boot data that sat in available memory to the allocator and
    /// returns how many pages were freed.
    pub fn release_temporary_boot_data(&self) -> Result<usize, BootError> {
        let mut data = self.boot_data.lock();
        let released = data.unregister_temporary();
        let free_before = self.allocator.free_pages();

        for range in released.ranges() {
            let kept = data
                .ranges()
                .iter()
                .map(|r| (r.start, r.end))
                .chain(core::iter::once(self.heap));
            let free = releasable(&self.boot_map, range.start, range.end, kept)?;
            for region in free.iter() {
                self.allocator.release(
                    PhysicalAddress::new(region.base() as usize),
                    PhysicalAddress::new(region.end() as usize),
                );
            }
        }

        let freed = self.allocator.free_pages() - free_before;
        log::info!("released {} of temporary boot data", HumanSize::pages(freed));
        Ok(freed)
    }

    pub fn object_create(&self, size: usize) -> Arc<VmObject> {
        self.object_create_with(size, CopyStrategy::default())
    }

    pub fn object_create_with(&self, size: usize, strategy: CopyStrategy) -> Arc<VmObject> {
        Arc::new(VmObject::new(self.cache, size, strategy))
    }

    /// The object whose entries stand in for ranges handed to submaps.
    pub fn submap_object(&self) -> &Arc<VmObject> {
        self.submap_object
            .call_once(|| Arc::new(VmObject::new(self.cache, 0, CopyStrategy::Delay)))
    }

    /// Creates a user page directory.
    pub fn create_pmap(&self) -> Result<Arc<dyn Pmap>, VmError> {
        let pmap: Arc<dyn Pmap> = Arc::new(PageDirectory::new(self.allocator, true)?);
        Ok(pmap)
    }

    /// Creates an empty map over `[min, max)` with a page directory of its own.
    pub fn map_create(&'static self, min: usize, max: usize) -> Result<Arc<VmMap>, VmError> {
        if min >= max || min % PAGE_SIZE != 0 || max % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }
        Ok(Arc::new(VmMap::new(self, self.create_pmap()?, min, max)))
    }

    /// Creates an empty map over the configured user range.
    pub fn user_map_create(&'static self) -> Result<Arc<VmMap>, VmError> {
        self.map_create(self.config.user_map_start, self.config.user_map_end)
    }

    /// Creates the kernel map. Later calls return the existing one.
    pub fn create_kernel_map(&'static self) -> Result<Arc<VmMap>, VmError> {
        let map = self.kernel_map.try_call_once(|| {
            let pmap = PageDirectory::new(self.allocator, false)?;
            log::debug!("kernel page directory at {}", pmap.root());
            Ok::<_, VmError>(Arc::new(VmMap::new(
                self,
                Arc::new(pmap),
                self.config.kernel_map_start,
                self.config.kernel_map_end,
            )))
        })?;
        Ok(Arc::clone(map))
    }

    /// Returns the kernel map.
    ///
    /// # Panics
    ///
    /// Panics if [`Self::create_kernel_map`] has not succeeded yet.
    pub fn kernel_map(&self) -> Arc<VmMap> {
        match self.kernel_map.get() {
            Some(map) => Arc::clone(map),
            None => panic!("kernel map not created"),
        }
    }
}

impl fmt::Debug for VmSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmSystem")
            .field("free_pages", &self.allocator.free_pages())
            .field("heap", &format_args!("{:#x}..{:#x}", self.heap.0, self.heap.1))
            .field("kernel_map", &self.kernel_map.get())
            .finish_non_exhaustive()
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static VM_SYSTEM: spin::Once<&'static VmSystem> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static VM_SYSTEM: spin::Once<&'static VmSystem> = spin::Once::new();
}
