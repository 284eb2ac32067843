//! Hardware table formats
//!
//! One module per supported descriptor layout. Each implements
//! [`crate::format::PtFormat`] as pure arithmetic over its configuration;
//! the engine owns all table memory access.

pub mod amdv1;
pub mod armv7s;
pub mod armv8;
pub mod dart;
pub mod vtd;
pub mod x86pae;

pub use amdv1::AmdV1;
pub use armv7s::ArmV7S;
pub use armv8::{ArmGranule, ArmV8, ArmV8Cfg};
pub use dart::Dart;
pub use vtd::VtdSs;
pub use x86pae::X86Pae;
