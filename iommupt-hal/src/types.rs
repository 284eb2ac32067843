//! Address types, protection flags and error codes

use bitflags::bitflags;

/// Output (physical) address type
pub type PhysAddr = u64;

/// Input virtual address consumed by the IOMMU
pub type IoVa = u64;

bitflags! {
    /// Protection flags requested for a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        /// Request cache coherency
        const CACHE  = 1 << 2;
        /// Request no-execute permission
        const NOEXEC = 1 << 3;
        /// MMIO peripheral mapping
        const MMIO   = 1 << 4;
        /// Privileged mapping
        const PRIV   = 1 << 5;
    }
}

bitflags! {
    /// Table memory allocation hints
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The caller cannot sleep; the allocation must not block.
        const ATOMIC = 1 << 0;
    }
}

/// Generic error codes for page table operations.
///
/// Internal CAS races are retried locally and never surface here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtError {
    /// Zero length, misaligned address, or unsupported protection bits
    InvalidArgument,
    /// VA or OA exceeds the current caps, or top growth hit the format limit
    OutOfRange,
    /// Table allocation failed
    OutOfMemory,
    /// A different translation already exists in the requested range
    InUse,
    /// The feature is not compiled in or not supported by this format
    NotSupported,
    /// Translation lookup hit an empty entry
    TranslationMissing,
}
