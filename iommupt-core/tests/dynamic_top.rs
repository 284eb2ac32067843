//! Dynamic root growth under lockless readers.

mod common;

use std::sync::atomic::Ordering;

use common::{flush, DummyFlush};
use iommupt_core::hal::fmt::{AmdV1, ArmGranule, ArmV8, ArmV8Cfg};
use iommupt_core::hal::{Prot, PtError, PtFeatures};
use iommupt_core::{DomainCfg, PagingDomain};

#[test]
fn mapping_above_the_window_grows_the_top() {
    let host = DummyFlush::new();
    let top_changes = host.top_changes.clone();
    let cfg = DomainCfg {
        features: PtFeatures::DYNAMIC_TOP,
        starting_level: Some(2),
        ..DomainCfg::default()
    };
    let dom = PagingDomain::new(AmdV1::new(), cfg, Box::new(host), None).unwrap();
    assert_eq!(dom.top_level(), 2);

    // Keep something mapped below before growing.
    let mut mapped = 0;
    dom.map_range(0x1000, 0x5000, 0x1000, Prot::READ | Prot::WRITE, &mut mapped).unwrap();

    // A 40-bit address forces two increases past the 30-bit window.
    dom.map_range(0xFF_FFFF_F000, 0, 0x1000, Prot::READ | Prot::WRITE, &mut mapped).unwrap();
    assert!(dom.top_level() >= 4);
    // Both new levels publish in one hardware reprogram.
    assert_eq!(top_changes.load(Ordering::SeqCst), 1);

    // Both the old and the new translation resolve through the new top.
    assert_eq!(dom.iova_to_phys(0xFF_FFFF_F000).unwrap(), 0);
    assert_eq!(dom.iova_to_phys(0x1000).unwrap(), 0x5000);
}

#[test]
fn growth_stops_at_the_format_ceiling() {
    let host = DummyFlush::new();
    let cfg = DomainCfg {
        features: PtFeatures::DYNAMIC_TOP,
        starting_level: Some(2),
        max_va_lg2: Some(48),
        ..DomainCfg::default()
    };
    let dom = PagingDomain::new(AmdV1::new(), cfg, Box::new(host), None).unwrap();
    let mut mapped = 0;
    assert_eq!(
        dom.map_range(1u64 << 48, 0, 0x1000, Prot::READ, &mut mapped),
        Err(PtError::OutOfRange)
    );
    assert_eq!(dom.top_level(), 2);
}

#[test]
fn fixed_top_formats_refuse_out_of_window() {
    let fmt = ArmV8::new(ArmV8Cfg::stage1(ArmGranule::K4, 39)).unwrap();
    let dom = PagingDomain::new(fmt, DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;
    assert_eq!(
        dom.map_range(1u64 << 39, 0, 0x1000, Prot::READ, &mut mapped),
        Err(PtError::OutOfRange)
    );
}

#[test]
fn growth_preserves_a_full_lower_tree() {
    let host = DummyFlush::new();
    let cfg = DomainCfg {
        features: PtFeatures::DYNAMIC_TOP,
        starting_level: Some(1),
        ..DomainCfg::default()
    };
    let dom = PagingDomain::new(AmdV1::new(), cfg, Box::new(host), None).unwrap();
    let mut mapped = 0;
    for page in 0..8u64 {
        dom.map_range(page * 0x1000, 0x100000 + page * 0x1000, 0x1000, Prot::READ, &mut mapped)
            .unwrap();
    }
    assert_eq!(dom.top_level(), 1);

    dom.map_range(0x4000_0000, 0x2000, 0x1000, Prot::READ, &mut mapped).unwrap();
    assert!(dom.top_level() >= 3);
    for page in 0..8u64 {
        assert_eq!(dom.iova_to_phys(page * 0x1000).unwrap(), 0x100000 + page * 0x1000);
    }
    assert_eq!(dom.iova_to_phys(0x4000_0000).unwrap(), 0x2000);
}
