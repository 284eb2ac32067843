#![no_std]

//! Generic multi-format IOMMU radix page table
//!
//! Facade over the two layers: `iommupt-hal` carries the per-format
//! descriptor contracts and host interfaces, `iommupt-core` the walker and
//! map/unmap engine. Embedders construct a format instance, implement the
//! flush callbacks, and drive translations through [`PagingDomain`].

pub use iommupt_core::{DomainCfg, PagingDomain};

pub use iommupt_hal::fmt;
pub use iommupt_hal::{
    AllocFlags, DirtyBitmap, DirtyFlags, DmaDevice, EntryKind, FlushOps, IotlbGather, IoVa,
    PhysAddr, Prot, PtError, PtFeatures, PtFormat, PtInfo, TableWord,
};
