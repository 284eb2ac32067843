//! Concurrent mappers on disjoint ranges of the same tables.

mod common;

use std::sync::Arc;
use std::thread;

use common::flush;
use iommupt_core::hal::fmt::AmdV1;
use iommupt_core::hal::{IotlbGather, Prot};
use iommupt_core::{DomainCfg, PagingDomain};

#[test]
fn racing_mappers_share_one_child_table() {
    // Both threads map under the same empty level-2 entry, so the loser of
    // the publication race must discard its table and reuse the winner's.
    for _ in 0..64 {
        let cfg = DomainCfg { max_va_lg2: Some(30), ..DomainCfg::default() };
        let dom = Arc::new(PagingDomain::new(AmdV1::new(), cfg, flush(), None).unwrap());
        let base_tables = dom.outstanding_tables();

        let a = {
            let dom = Arc::clone(&dom);
            thread::spawn(move || {
                let mut mapped = 0;
                dom.map_range(0x0, 0x10_0000, 0x1000, Prot::READ | Prot::WRITE, &mut mapped)
                    .unwrap();
            })
        };
        let b = {
            let dom = Arc::clone(&dom);
            thread::spawn(move || {
                let mut mapped = 0;
                dom.map_range(0x1000, 0x20_0000, 0x1000, Prot::READ | Prot::WRITE, &mut mapped)
                    .unwrap();
            })
        };
        a.join().unwrap();
        b.join().unwrap();

        assert_eq!(dom.iova_to_phys(0x0).unwrap(), 0x10_0000);
        assert_eq!(dom.iova_to_phys(0x1000).unwrap(), 0x20_0000);
        // Exactly one child table exists; the race loser leaked nothing.
        assert_eq!(dom.outstanding_tables(), base_tables + 1);
    }
}

#[test]
fn parallel_mappers_over_disjoint_windows() {
    let dom = Arc::new(
        PagingDomain::new(AmdV1::new(), DomainCfg::default(), flush(), None).unwrap(),
    );
    let threads: Vec<_> = (0..4u64)
        .map(|t| {
            let dom = Arc::clone(&dom);
            thread::spawn(move || {
                let base = t * 0x20_0000;
                let mut mapped = 0;
                for page in 0..32u64 {
                    let va = base + page * 0x1000;
                    dom.map_range(va, va + 0x1_0000_0000, 0x1000, Prot::READ, &mut mapped)
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
    for t in 0..4u64 {
        for page in 0..32u64 {
            let va = t * 0x20_0000 + page * 0x1000;
            assert_eq!(dom.iova_to_phys(va).unwrap(), va + 0x1_0000_0000);
        }
    }
}

#[test]
fn unmap_defers_frees_until_the_flush() {
    let dom = PagingDomain::new(AmdV1::new(), DomainCfg::default(), flush(), None).unwrap();
    let mut mapped = 0;
    dom.map_range(0, 0x40_0000, 0x1000, Prot::READ, &mut mapped).unwrap();
    let before = dom.outstanding_tables();

    let mut gather = IotlbGather::new();
    dom.unmap_range(0, 0x200000, &mut gather).unwrap();
    // The collected table stays allocated until the caller's flush point.
    assert_eq!(dom.outstanding_tables(), before);
    assert_eq!(dom.flush_deferred(), 1);
    assert_eq!(dom.outstanding_tables(), before - 1);
}
