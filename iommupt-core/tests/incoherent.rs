//! Incoherent walkers: identity DMA mapping and batched cache flushes.

mod common;

use std::sync::atomic::Ordering;

use common::{flush, DummyDma, SkewedDma};
use iommupt_core::hal::fmt::AmdV1;
use iommupt_core::hal::{IotlbGather, Prot, PtError, PtFeatures};
use iommupt_core::{DomainCfg, PagingDomain};

fn incoherent_cfg() -> DomainCfg {
    DomainCfg { features: PtFeatures::DMA_INCOHERENT, ..DomainCfg::default() }
}

#[test]
fn table_updates_are_synced_to_the_device() {
    let dma = DummyDma::new();
    let (maps, syncs) = (dma.maps.clone(), dma.syncs.clone());
    let dom =
        PagingDomain::new(AmdV1::new(), incoherent_cfg(), flush(), Some(Box::new(dma))).unwrap();
    // The root was mapped and pushed out already.
    assert_eq!(maps.load(Ordering::SeqCst), 1);
    assert!(syncs.load(Ordering::SeqCst) >= 1);

    let before = syncs.load(Ordering::SeqCst);
    let mut mapped = 0;
    dom.map_range(0, 0, 0x200000, Prot::READ | Prot::WRITE, &mut mapped).unwrap();
    // Every new table plus the touched parent windows flushed.
    assert!(syncs.load(Ordering::SeqCst) > before);
    assert!(maps.load(Ordering::SeqCst) > 1);
}

#[test]
fn adjacent_updates_batch_into_one_sync() {
    let dma = DummyDma::new();
    let syncs = dma.syncs.clone();
    let cfg = DomainCfg { max_va_lg2: Some(21), ..incoherent_cfg() };
    let dom =
        PagingDomain::new(AmdV1::new(), cfg, flush(), Some(Box::new(dma))).unwrap();

    let before = syncs.load(Ordering::SeqCst);
    let mut mapped = 0;
    // Sixteen granules' worth of adjacent entries in one call: the write
    // log folds every touched index into one ranged flush.
    dom.map_range(0x3000, 0x10_1000, 0x10000, Prot::READ, &mut mapped).unwrap();
    assert_eq!(syncs.load(Ordering::SeqCst) - before, 1);
}

#[test]
fn unmap_flushes_cleared_windows() {
    let dma = DummyDma::new();
    let (syncs, unmaps) = (dma.syncs.clone(), dma.unmaps.clone());
    let dom =
        PagingDomain::new(AmdV1::new(), incoherent_cfg(), flush(), Some(Box::new(dma))).unwrap();
    let mut mapped = 0;
    dom.map_range(0, 0x40_0000, 0x1000, Prot::READ, &mut mapped).unwrap();

    let before = syncs.load(Ordering::SeqCst);
    let mut gather = IotlbGather::new();
    dom.unmap_range(0, 0x200000, &mut gather).unwrap();
    assert!(syncs.load(Ordering::SeqCst) > before);

    // The freed table's device mapping tears down with it.
    assert_eq!(unmaps.load(Ordering::SeqCst), 0);
    dom.flush_deferred();
    assert_eq!(unmaps.load(Ordering::SeqCst), 1);
}

#[test]
fn non_identity_dma_is_refused() {
    let err = PagingDomain::new(AmdV1::new(), incoherent_cfg(), flush(), Some(Box::new(SkewedDma)));
    assert!(matches!(err, Err(PtError::NotSupported)));
}

#[test]
fn incoherent_feature_requires_a_device() {
    let err = PagingDomain::new(AmdV1::new(), incoherent_cfg(), flush(), None);
    assert!(matches!(err, Err(PtError::InvalidArgument)));
}
