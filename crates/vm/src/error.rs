//! Error types.
//!
//! Resource shortages and caller mistakes are reported through these types. Internal
//! consistency violations (double free, removing an untabled page, a corrupt free list)
//! are not errors: they panic.

/// What ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Shortage {
    #[error("physical pages")]
    Pages,
    #[error("address space")]
    AddressSpace,
    #[error("page descriptors")]
    Descriptors,
}

/// Errors returned by address map and resident cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Recoverable: retry once memory or address space has been reclaimed.
    #[error("resource shortage: {0}")]
    ResourceShortage(Shortage),
    /// The address is unmapped, outside the map, or conflicts with an existing mapping.
    #[error("invalid address {0:#x}")]
    InvalidAddress(usize),
    /// Misaligned or empty ranges, inconsistent protections, operations on submaps.
    #[error("invalid argument")]
    InvalidArgument,
    /// The access is not permitted by the entry's protection.
    #[error("protection failure at {0:#x}")]
    ProtectionFailure(usize),
}

/// Errors that can occur during physical memory allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No block of the requested order is free in any reachable segment.
    #[error("out of physical memory")]
    OutOfMemory,
    /// The requested order exceeds `MAX_ORDER`.
    #[error("order {0} exceeds the maximum block order")]
    OrderTooLarge(usize),
}

/// Errors reported by a physical map implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmapError {
    /// A page table page could not be allocated.
    #[error("out of memory for page tables")]
    OutOfMemory,
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => Self::ResourceShortage(Shortage::Pages),
            AllocError::OrderTooLarge(_) => Self::InvalidArgument,
        }
    }
}

impl From<PmapError> for VmError {
    fn from(err: PmapError) -> Self {
        match err {
            PmapError::OutOfMemory => Self::ResourceShortage(Shortage::Pages),
        }
    }
}
