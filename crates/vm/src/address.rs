//! Physical and virtual addresses, and reaching physical memory from the kernel.
//!
//! Descriptors, buckets and page tables all live in physical memory that the VM code
//! touches through the [`AddressTranslator`]: a fixed direct-map offset on hardware, or a
//! host buffer standing in for RAM under emulation.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, arch};

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// How physical memory is reached.
pub enum AddressTranslator {
    /// All of physical memory is mapped at `direct_map_offset`.
    Hardware { direct_map_offset: usize },
    /// Physical memory is a host buffer; physical address zero is its first byte.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Emulates a machine with `size` bytes of physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the translator. Under emulation each thread has its own.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        ADDRESS_TRANSLATOR.with(|current| {
            if current.get().is_some() {
                panic!("address translator already set");
            }
            current.call_once(|| translator);
        });
    }

    /// # Panics
    ///
    /// Panics if no translator has been installed.
    pub fn current() -> &'static AddressTranslator {
        match Self::try_current() {
            Some(translator) => translator,
            None => panic!("address translator not set"),
        }
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|current| {
                current.get().map(|translator| {
                    // SAFETY: a thread's translator is never replaced and lives as long as
                    // the thread.
                    unsafe { &*(translator as *const AddressTranslator) }
                })
            })
        }
    }

    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.translate(phys) as usize,
        }
    }

    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.ptr_to_phys(virt as *const u8),
        }
    }

    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys.as_usize()) as *mut T
    }

    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        PhysicalAddress::new(self.virt_to_phys(ptr as usize))
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

#[inline]
pub const fn round_up_to_page(value: usize) -> usize {
    (value + arch::PAGE_SIZE - 1) & !(arch::PAGE_SIZE - 1)
}

#[inline]
pub const fn round_down_to_page(value: usize) -> usize {
    value & !(arch::PAGE_SIZE - 1)
}

/// Start of the buddy of the `2^order`-page block at `address`.
#[inline]
pub const fn block_buddy_address(address: PhysicalAddress, order: usize) -> PhysicalAddress {
    PhysicalAddress::new(address.as_usize() ^ (arch::PAGE_SIZE << order))
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Offset of the address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub for $name {
            type Output = usize;

            fn sub(self, rhs: Self) -> usize {
                self.0 - rhs.0
            }
        }
    };
}

address_type! {
    /// A physical address, no wider than the machine's physical address bits.
    PhysicalAddress
}

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address is wider than the architecture allows.
    #[inline]
    pub const fn new(address: usize) -> Self {
        assert!(
            arch::validate_physical(address),
            "physical address exceeds maximum width"
        );
        Self(address)
    }

    #[inline]
    pub fn frame_number(self) -> FrameNumber {
        FrameNumber::from(self)
    }
}

address_type! {
    /// A canonical virtual address.
    VirtualAddress
}

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(address: usize) -> Self {
        assert!(arch::validate_virtual(address), "address is not canonical");
        Self(address)
    }
}
