//! The contract with the page reclamation daemon.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Signals exchanged with the pageout daemon.
///
/// The daemon itself (scanning the inactive queue, cleaning and evicting pages) lives
/// outside this crate.
pub trait Pageout: Sync {
    /// Free memory fell below the low-water mark; start reclaiming.
    fn wakeup(&self);

    /// Blocks the calling context until the daemon has freed memory.
    fn wait_for_pages(&self);

    /// The last page queued for cleaning has been cleaned.
    fn laundry_drained(&self);
}

/// A daemon that never reclaims anything and only counts the signals it receives.
///
/// Used during early boot and in emulation.
#[derive(Debug, Default)]
pub struct IdlePageout {
    wakeups: AtomicUsize,
    waits: AtomicUsize,
    drains: AtomicUsize,
}

impl IdlePageout {
    pub const fn new() -> Self {
        Self {
            wakeups: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            drains: AtomicUsize::new(0),
        }
    }

    pub fn wakeups(&self) -> usize {
        self.wakeups.load(Ordering::Relaxed)
    }

    pub fn waits(&self) -> usize {
        self.waits.load(Ordering::Relaxed)
    }

    pub fn drains(&self) -> usize {
        self.drains.load(Ordering::Relaxed)
    }
}

impl Pageout for IdlePageout {
    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    fn wait_for_pages(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        core::hint::spin_loop();
    }

    fn laundry_drained(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }
}
