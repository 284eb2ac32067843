//! Every format drives the same engine: map, translate, unmap, tear down.

mod common;

use common::flush;
use iommupt_core::hal::fmt::{AmdV1, ArmGranule, ArmV7S, ArmV8, ArmV8Cfg, Dart, VtdSs, X86Pae};
use iommupt_core::hal::{IotlbGather, Prot, PtError, PtFormat};
use iommupt_core::{DomainCfg, PagingDomain};

fn exercise<F: PtFormat>(fmt: F, va: u64, pa: u64, len: u64) {
    let mut dom = PagingDomain::new(fmt, DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;
    dom.map_range(va, pa, len, Prot::READ | Prot::WRITE, &mut mapped).unwrap();
    assert_eq!(mapped, len);

    assert_eq!(dom.iova_to_phys(va).unwrap(), pa);
    assert_eq!(dom.iova_to_phys(va + len - 1).unwrap(), pa + len - 1);
    assert_eq!(dom.iova_to_phys(va + len), Err(PtError::TranslationMissing));

    let mut gather = IotlbGather::new();
    assert_eq!(dom.unmap_range(va, len, &mut gather).unwrap(), len);
    assert_eq!(dom.iova_to_phys(va), Err(PtError::TranslationMissing));

    dom.flush_deferred();
    dom.deinit();
    assert_eq!(dom.outstanding_tables(), 0);
}

#[test]
fn amdv1() {
    exercise(AmdV1::new(), 0x40_3000, 0x9000_1000, 0x5000);
}

#[test]
fn armv8_each_granule() {
    exercise(
        ArmV8::new(ArmV8Cfg::stage1(ArmGranule::K4, 48)).unwrap(),
        0x7F_FFF0_0000,
        0x12_3456_7000,
        0x10000,
    );
    exercise(
        ArmV8::new(ArmV8Cfg::stage1(ArmGranule::K16, 47)).unwrap(),
        0x10_0000_4000,
        0x3_0000_8000,
        0x8000,
    );
    exercise(
        ArmV8::new(ArmV8Cfg::stage2(ArmGranule::K64, 44)).unwrap(),
        0x8_0001_0000,
        0x44_0000_0000,
        0x20000,
    );
}

#[test]
fn armv8_upper_half_table() {
    let fmt = ArmV8::new(ArmV8Cfg {
        ttbr1: true,
        ..ArmV8Cfg::stage1(ArmGranule::K4, 39)
    })
    .unwrap();
    let dom = PagingDomain::new(fmt, DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;

    // Lower-half addresses are outside this table.
    assert_eq!(
        dom.map_range(0x1000, 0x2000, 0x1000, Prot::READ, &mut mapped),
        Err(PtError::OutOfRange)
    );

    let va = 0xFFFF_FFFF_FFFF_0000u64;
    dom.map_range(va, 0x5000_0000, 0x1000, Prot::READ | Prot::WRITE, &mut mapped).unwrap();
    assert_eq!(dom.iova_to_phys(va).unwrap(), 0x5000_0000);
    assert_eq!(dom.iova_to_phys(0x1000), Err(PtError::OutOfRange));
}

#[test]
fn armv7s_section_and_pages() {
    // 1 MiB section straight in the first level
    exercise(ArmV7S::new(32).unwrap(), 0x4010_0000, 0x8020_0000, 0x10_0000);
    // Small pages through a second-level table
    exercise(ArmV7S::new(32).unwrap(), 0x1000, 0x5000, 0x3000);
    // A 64 KiB large page
    exercise(ArmV7S::new(32).unwrap(), 0x20_0000, 0x60_0000, 0x1_0000);
}

#[test]
fn armv7s_upper_half_table() {
    let fmt = ArmV7S::new(28).unwrap().with_ttbr1();
    let dom = PagingDomain::new(fmt, DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;
    let va = 0xFFF0_0000u64;
    dom.map_range(va, 0x30_0000, 0x1000, Prot::READ, &mut mapped).unwrap();
    assert_eq!(dom.iova_to_phys(va).unwrap(), 0x30_0000);
    assert_eq!(
        dom.map_range(0x10_0000, 0x1000, 0x1000, Prot::READ, &mut mapped),
        Err(PtError::OutOfRange)
    );
}

#[test]
fn dart_both_generations() {
    exercise(Dart::new(12, false).unwrap(), 0x100_0000, 0x8_0000_1000, 0x4000);
    exercise(Dart::new(14, true).unwrap(), 0x4_0000_8000, 0x3_0000_4000, 0x10000);
}

#[test]
fn vtd_second_stage() {
    exercise(VtdSs::new(3).unwrap(), 0x1234_5000, 0x6_0000_3000, 0x2000);
    exercise(VtdSs::new(4).unwrap().with_snoop(), 0x8000_0000_0000 - 0x10000, 0x1000, 0x10000);
}

#[test]
fn x86_pae() {
    exercise(X86Pae::new(), 0x1000_0000, 0xF_F000_0000, 0x3000);
    // 2 MiB PS leaf
    exercise(X86Pae::new(), 0x4000_0000, 0x8000_0000, 0x20_0000);
}

#[test]
fn formats_reject_unsupported_prot() {
    let dom = PagingDomain::new(X86Pae::new(), DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;
    // Write-only cannot be expressed without read permission here.
    assert_eq!(
        dom.map_range(0, 0x1000, 0x1000, Prot::WRITE, &mut mapped),
        Err(PtError::InvalidArgument)
    );
}
