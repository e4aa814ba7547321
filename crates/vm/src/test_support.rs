//! Booting throwaway VM systems on emulated memory.
//!
//! Each test thread gets one 64 MiB emulated physical memory. Booting again on the same
//! thread reuses it; systems are leaked and simply abandoned.

use alloc::boxed::Box;

use crate::{AddressTranslator, BootData, BootMap, BootMemoryEntry, IdlePageout, VmConfig, VmSystem};

const EMULATED_MEMORY: usize = 64 << 20;

pub(crate) fn ensure_translator() {
    if AddressTranslator::try_current().is_none() {
        AddressTranslator::set_current(AddressTranslator::emulated(EMULATED_MEMORY));
    }
}

/// Low memory with the legacy hole below 1 MiB, then memory up to 32 MiB.
pub(crate) fn default_map() -> BootMap {
    BootMap::from_regions(&[
        BootMemoryEntry::available(0x1000, 0x9F000),
        BootMemoryEntry::reserved(0x9F000, 0x100000),
        BootMemoryEntry::available(0x100000, 0x200_0000),
    ])
    .expect("boot map")
}

fn small_map() -> BootMap {
    BootMap::from_regions(&[
        BootMemoryEntry::available(0x1000, 0x9F000),
        BootMemoryEntry::available(0x100000, 0x40_0000),
    ])
    .expect("boot map")
}

pub(crate) fn boot_with_pageout_and(
    map: BootMap,
    data: BootData,
    config: VmConfig,
) -> (&'static VmSystem, &'static IdlePageout) {
    ensure_translator();
    let pageout: &'static IdlePageout = Box::leak(Box::new(IdlePageout::new()));
    let vm = VmSystem::bootstrap(map, data, pageout, config).expect("bootstrap");
    (vm, pageout)
}

pub(crate) fn boot_with(map: BootMap, data: BootData, config: VmConfig) -> &'static VmSystem {
    boot_with_pageout_and(map, data, config).0
}

pub(crate) fn boot_default() -> &'static VmSystem {
    boot_with(default_map(), BootData::new(), VmConfig::new())
}

/// A 3.6 MiB machine with one bucket per four pages.
pub(crate) fn boot_small() -> &'static VmSystem {
    boot_with(small_map(), BootData::new(), VmConfig::new().with_pages_per_bucket(4))
}

/// A small machine whose pageout daemon can be inspected.
pub(crate) fn boot_with_pageout() -> (&'static VmSystem, &'static IdlePageout) {
    boot_with_pageout_and(small_map(), BootData::new(), VmConfig::new().with_free_min(16))
}
