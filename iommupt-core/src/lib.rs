#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! Generic radix page table engine
//!
//! This crate drives multi-level hardware translation tables through the
//! format contract defined in `iommupt-hal`: a single walker and a single
//! set of map/unmap/query algorithms, monomorphised per format and per
//! level so descriptor interpretation compiles down to inline bit math.
//!
//! The engine consumes IOVA ranges and emits flush requests; it does not
//! allocate IOVA, own an IOTLB strategy, or serialise callers. The caller
//! guarantees that concurrent operations never overlap on the same range,
//! which is what lets descriptor updates stay plain release stores while
//! child-table publication uses compare-exchange.

extern crate alloc;

pub mod domain;
pub mod log;
pub mod table_mem;
pub mod top;
pub mod walker;

mod cut;
mod map;
mod query;
mod unmap;

pub use domain::{DomainCfg, PagingDomain};
pub use iommupt_hal as hal;
