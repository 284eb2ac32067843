//! Algebraic laws every format must satisfy, checked with random inputs.

use proptest::prelude::*;

use iommupt_core::hal::fmt::{AmdV1, ArmGranule, ArmV7S, ArmV8, ArmV8Cfg, Dart, VtdSs, X86Pae};
use iommupt_core::hal::{log2, EntryKind, PhysAddr, Prot, PtFormat};

/// Check the leaf laws for one `(level, size, oa)` position.
fn check_leaf_laws<F: PtFormat>(fmt: &F, level: u8, sz: u8, oa: PhysAddr, prot: Prot) {
    let attrs = match fmt.attrs_from_prot(prot) {
        Ok(a) => a,
        Err(_) => return,
    };
    let item = fmt.item_lg2sz(level);
    let run_oa = oa & !log2::to_max(sz);
    let n = 1u64 << (sz - item);
    for i in 0..n.min(8) {
        let item_oa = run_oa + (i << item);
        let word = fmt.encode_leaf(item_oa, level, sz, &attrs);
        assert_eq!(fmt.entry_kind(word, level), EntryKind::Oa);
        // Run base recovers by aligning the stored OA down to the run size.
        assert_eq!(fmt.entry_oa(word, level) & !log2::to_max(sz), run_oa);
        assert_eq!(fmt.entry_num_contig_lg2(word, level), sz - item);
        // Reinstalling the recovered attributes reproduces the descriptor.
        let attrs2 = fmt.attrs_from_entry(word, level);
        let word2 = fmt.encode_leaf(item_oa, level, sz, &attrs2);
        assert_eq!(word2, word);
    }
}

fn check_level_laws<F: PtFormat>(fmt: &F, oa_seed: PhysAddr, prot: Prot) {
    for level in 1..=fmt.max_top_level() {
        let sizes = fmt.possible_sizes(level);
        let span = fmt.item_lg2sz(level) + fmt.num_items_lg2(level);
        if sizes != 0 {
            assert!(fmt.can_have_leaf(level));
            assert!(log2::fls(sizes) - 1 <= span);
            assert_ne!(sizes & log2::to_int(fmt.item_lg2sz(level)), 0);
        }
        let mut rest = sizes;
        while rest != 0 {
            let sz = log2::fls(rest) - 1;
            rest &= !log2::to_int(sz);
            if sz >= fmt.max_oa_lg2() {
                continue;
            }
            let oa = (oa_seed & log2::to_max(fmt.max_oa_lg2())) & !log2::to_max(sz);
            check_leaf_laws(fmt, level, sz, oa, prot);
        }
        if level > 1 {
            let table = (oa_seed & log2::to_max(fmt.max_oa_lg2()))
                & !log2::to_max(fmt.table_lg2sz(level - 1));
            let word = fmt.encode_table(table, level);
            assert_eq!(fmt.entry_kind(word, level), EntryKind::Table);
            assert_eq!(fmt.table_pa(word, level), table);
        }
    }
}

fn arb_prot() -> impl Strategy<Value = Prot> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(w, c, x, p)| {
        let mut prot = Prot::READ;
        if w {
            prot |= Prot::WRITE;
        }
        if c {
            prot |= Prot::CACHE;
        }
        if x {
            prot |= Prot::NOEXEC;
        }
        if p {
            prot |= Prot::PRIV;
        }
        prot
    })
}

proptest! {
    #[test]
    fn amdv1_laws(oa in any::<u64>(), prot in arb_prot()) {
        check_level_laws(&AmdV1::new(), oa, prot);
        check_level_laws(&AmdV1::with_dirty_tracking(), oa, prot);
    }

    #[test]
    fn armv8_laws(oa in any::<u64>(), prot in arb_prot(), s2 in any::<bool>()) {
        for granule in [ArmGranule::K4, ArmGranule::K16, ArmGranule::K64] {
            let cfg = if s2 {
                ArmV8Cfg::stage2(granule, 44)
            } else {
                ArmV8Cfg::stage1(granule, 44)
            };
            check_level_laws(&ArmV8::new(cfg).unwrap(), oa, prot);
        }
    }

    #[test]
    fn armv8_lpa_laws(oa in any::<u64>(), prot in arb_prot()) {
        let fmt = ArmV8::new(ArmV8Cfg {
            lpa: true,
            dbm: true,
            ..ArmV8Cfg::stage2(ArmGranule::K64, 48)
        })
        .unwrap();
        check_level_laws(&fmt, oa, prot);
    }

    #[test]
    fn armv7s_laws(oa in any::<u64>(), prot in arb_prot()) {
        check_level_laws(&ArmV7S::new(32).unwrap(), oa, prot);
        check_level_laws(&ArmV7S::new(32).unwrap().with_ns(), oa, prot);
    }

    #[test]
    fn dart_laws(oa in any::<u64>(), prot in arb_prot()) {
        check_level_laws(&Dart::new(12, false).unwrap(), oa, prot);
        check_level_laws(&Dart::new(14, true).unwrap(), oa, prot);
    }

    #[test]
    fn vtd_laws(oa in any::<u64>(), prot in arb_prot()) {
        check_level_laws(&VtdSs::new(5).unwrap(), oa, prot);
        check_level_laws(&VtdSs::new(4).unwrap().with_snoop().with_dirty_tracking(), oa, prot);
    }

    #[test]
    fn x86pae_laws(oa in any::<u64>(), prot in arb_prot()) {
        check_level_laws(&X86Pae::new(), oa, prot);
        check_level_laws(&X86Pae::with_dirty_tracking(), oa, prot);
    }

    #[test]
    fn dirty_ops_cycle(oa in any::<u64>(), prot in arb_prot()) {
        let fmt = AmdV1::with_dirty_tracking();
        if let Ok(attrs) = fmt.attrs_from_prot(prot) {
            let oa = (oa & log2::to_max(51)) & !log2::to_max(12);
            let clean = fmt.encode_leaf(oa, 1, 12, &attrs);
            prop_assert!(!fmt.entry_is_dirty(clean, 1));
            let dirty = fmt.entry_set_dirty(clean, 1);
            prop_assert!(fmt.entry_is_dirty(dirty, 1));
            prop_assert_eq!(fmt.entry_clear_dirty(dirty, 1), clean);
        }
    }
}
