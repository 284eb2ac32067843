#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Format contracts and host interfaces for the iommupt engine
//!
//! This crate defines the boundary between the generic radix page table
//! engine and everything that differs per deployment: the descriptor format
//! of the hardware walker, the IOTLB flush hooks of the embedding driver,
//! and the DMA device used when table memory itself is not cache-coherent.

extern crate alloc;

pub mod dirty;
pub mod flush;
pub mod fmt;
pub mod format;
pub mod log2;
pub mod types;
pub mod word;

// Re-export core traits and types
pub use dirty::{DirtyBitmap, DirtyFlags};
pub use flush::{DmaDevice, FlushOps, IotlbGather};
pub use format::{EntryKind, PtFeatures, PtFormat, PtInfo};
pub use types::{AllocFlags, IoVa, PhysAddr, Prot, PtError};
pub use word::TableWord;
