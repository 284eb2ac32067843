//! Translation domain: shared state and public surface
//!
//! One `PagingDomain` owns one radix tree: the encoded top word, the table
//! page store, the deferred-free queue and the host callbacks. All
//! operations take `&self`; the caller serialises overlapping IOVA ranges,
//! everything else is internally safe for concurrent use.

use alloc::boxed::Box;

use iommupt_hal::{
    log2, AllocFlags, DmaDevice, FlushOps, IoVa, PhysAddr, PtError, PtFeatures, PtFormat, PtInfo,
    TableWord,
};


use crate::table_mem::{DeferredFrees, FreeBatch, TableStore};
use crate::top::TopOfTable;
use crate::unmap::collect_dispatch;
use crate::walker::store_entry;

/// Construction parameters for a translation domain
#[derive(Debug, Clone, Copy)]
pub struct DomainCfg {
    /// Requested feature bits; must be supported by the format instance
    pub features: PtFeatures,
    /// Cap on input address bits; clamped to the format maximum
    pub max_va_lg2: Option<u8>,
    /// Cap on output address bits; clamped to the format maximum
    pub max_oa_lg2: Option<u8>,
    /// Root level to start from; defaults to the smallest root covering the
    /// VA cap, or a small root when the top is growable
    pub starting_level: Option<u8>,
    /// Allocation hints for table memory
    pub alloc: AllocFlags,
}

impl Default for DomainCfg {
    fn default() -> Self {
        Self {
            features: PtFeatures::empty(),
            max_va_lg2: None,
            max_oa_lg2: None,
            starting_level: None,
            alloc: AllocFlags::empty(),
        }
    }
}

/// A translation domain driving one radix tree
pub struct PagingDomain<F: PtFormat> {
    pub(crate) fmt: F,
    pub(crate) top: TopOfTable,
    pub(crate) features: PtFeatures,
    pub(crate) max_va_lg2: u8,
    pub(crate) max_oa_lg2: u8,
    pub(crate) alloc_flags: AllocFlags,
    pub(crate) store: TableStore,
    pub(crate) deferred: DeferredFrees,
    pub(crate) flush: Box<dyn FlushOps>,
    pub(crate) dma: Option<Box<dyn DmaDevice>>,
}

impl<F: PtFormat> PagingDomain<F> {
    /// Build a domain for `fmt`, allocate its root table and register the
    /// host callbacks.
    pub fn new(
        fmt: F,
        cfg: DomainCfg,
        flush: Box<dyn FlushOps>,
        dma: Option<Box<dyn DmaDevice>>,
    ) -> Result<Self, PtError> {
        let mut features = cfg.features;
        if fmt.full_va_prefix() != 0 {
            features |= PtFeatures::FULL_VA;
        }
        if !fmt.supported_features().contains(features) {
            return Err(PtError::NotSupported);
        }
        if features.contains(PtFeatures::DMA_INCOHERENT) && dma.is_none() {
            return Err(PtError::InvalidArgument);
        }

        let max_va_lg2 = cfg.max_va_lg2.unwrap_or(fmt.max_va_lg2()).min(fmt.max_va_lg2());
        let max_oa_lg2 = cfg.max_oa_lg2.unwrap_or(fmt.max_oa_lg2()).min(fmt.max_oa_lg2());
        if max_va_lg2 <= fmt.granule_lg2sz() {
            return Err(PtError::InvalidArgument);
        }

        let covering = (1..=fmt.max_top_level())
            .find(|&l| {
                let w = fmt.item_lg2sz(l).saturating_add(fmt.top_items_lg2(l));
                w >= max_va_lg2
            })
            .unwrap_or(fmt.max_top_level());
        let top_level = cfg.starting_level.unwrap_or(
            if features.contains(PtFeatures::DYNAMIC_TOP) { 2.min(covering) } else { covering },
        );
        if top_level == 0 || top_level > fmt.max_top_level() {
            return Err(PtError::InvalidArgument);
        }
        if !features.contains(PtFeatures::DYNAMIC_TOP) && top_level < covering {
            return Err(PtError::OutOfRange);
        }

        let dom = Self {
            top: TopOfTable::new(0, 0),
            features,
            max_va_lg2,
            max_oa_lg2,
            alloc_flags: cfg.alloc,
            store: TableStore::new(),
            deferred: DeferredFrees::new(),
            flush,
            dma,
            fmt,
        };

        let root_lg2 = dom.fmt.top_items_lg2(top_level) + F::Word::LG2SZ;
        let root = dom.new_table(root_lg2)?;
        dom.table_sync_done(root);
        dom.top.store(root, top_level);
        crate::log!("domain up: top level {}, va {} bits, oa {} bits", top_level, max_va_lg2, max_oa_lg2);
        Ok(dom)
    }

    /// Current root level; grows on dynamic-top formats.
    pub fn top_level(&self) -> u8 {
        self.top.load().1
    }

    /// Live table pages, for leak accounting.
    pub fn outstanding_tables(&self) -> usize {
        self.store.outstanding()
    }

    /// Reclaim every table staged behind the caller's last flush.
    pub fn flush_deferred(&self) -> usize {
        self.deferred.drain(&self.store, self.dma_ref())
    }

    /// Aperture summary: representable page sizes under the current
    /// geometry and OA cap, plus address widths.
    pub fn get_info(&self) -> Result<PtInfo, PtError> {
        let (_, top_level) = self.live_top()?;
        let mut pgsizes = 0u64;
        for level in 1..=top_level {
            pgsizes |= self.fmt.possible_sizes(level);
        }
        let cap = self.max_oa_lg2.min(self.top_window_lg2(top_level));
        pgsizes &= log2::to_max(cap.saturating_add(1));
        Ok(PtInfo {
            pgsize_bitmap: pgsizes,
            ias: self.max_va_lg2,
            oas: self.max_oa_lg2,
            features: self.features,
        })
    }

    /// Tear the tree down: collect every remaining table with a passive
    /// walk that ignores mapped state, then free them synchronously.
    pub fn deinit(&mut self) {
        let (top_pa, top_level) = self.top.load();
        if top_pa == 0 {
            return;
        }
        let mut batch = FreeBatch::new();
        collect_dispatch(
            top_level,
            self,
            top_pa,
            self.fmt.top_items_lg2(top_level),
            &mut batch,
        );
        let freed = batch.count();
        self.store.free_list(batch, self.dma_ref());
        let deferred = self.deferred.drain(&self.store, self.dma_ref());
        self.top.store(0, 0);
        crate::log!("domain down: freed {} tables, {} deferred", freed, deferred);
    }

    // ---- internal helpers ----

    pub(crate) fn live_top(&self) -> Result<(PhysAddr, u8), PtError> {
        let (pa, level) = self.top.load();
        if pa == 0 {
            return Err(PtError::InvalidArgument);
        }
        Ok((pa, level))
    }

    pub(crate) fn dma_ref(&self) -> Option<&dyn DmaDevice> {
        self.dma.as_deref()
    }

    pub(crate) fn incoherent(&self) -> bool {
        self.features.contains(PtFeatures::DMA_INCOHERENT)
    }

    pub(crate) fn dma_if_incoherent(&self) -> Option<&dyn DmaDevice> {
        if self.incoherent() {
            self.dma_ref()
        } else {
            None
        }
    }

    /// Total VA bits addressable under a root at `level`.
    pub(crate) fn top_window_lg2(&self, level: u8) -> u8 {
        let w = self.fmt.item_lg2sz(level) as u32 + self.fmt.top_items_lg2(level) as u32;
        w.min(64) as u8
    }

    /// Allocate a zeroed table page, DMA-mapped when walks are incoherent.
    pub(crate) fn new_table(&self, lg2sz: u8) -> Result<PhysAddr, PtError> {
        let pa = self.store.alloc(lg2sz, self.alloc_flags)?;
        if self.incoherent() {
            if let Some(dma) = self.dma_ref() {
                if let Err(e) = self.store.start_incoherent(pa, dma) {
                    self.store.free(pa, None);
                    return Err(e);
                }
            }
        }
        Ok(pa)
    }

    /// Push the table's contents to the walker and release the
    /// still-flushing gate.
    pub(crate) fn table_sync_done(&self, pa: PhysAddr) {
        if let Some(dma) = self.dma_if_incoherent() {
            let size = log2::to_int(self.store.table_lg2sz(pa)) as usize;
            dma.sync_for_device(pa, size);
            self.store.done_incoherent_flush(pa);
        }
    }

    /// Discard a table that was never published.
    pub(crate) fn drop_unpublished_table(&self, pa: PhysAddr) {
        self.store.free(pa, self.dma_ref());
    }

    /// Normalise and validate `(iova, len)` to an inclusive VA range.
    pub(crate) fn check_va_range(&self, iova: IoVa, len: u64) -> Result<(IoVa, IoVa), PtError> {
        let granule = self.fmt.granule_lg2sz();
        if len == 0 || log2::modulo(iova, granule) != 0 || log2::modulo(len, granule) != 0 {
            return Err(PtError::InvalidArgument);
        }
        let last_va = iova.checked_add(len - 1).ok_or(PtError::OutOfRange)?;
        if self.features.contains(PtFeatures::FULL_VA) {
            let prefix = self.fmt.full_va_prefix();
            if !log2::in_prefix_range(iova, self.max_va_lg2, prefix)
                || !log2::in_prefix_range(last_va, self.max_va_lg2, prefix)
            {
                return Err(PtError::OutOfRange);
            }
        } else if log2::div(last_va, self.max_va_lg2) != 0 {
            return Err(PtError::OutOfRange);
        }
        Ok((iova, last_va))
    }

    /// Grow the root until its window covers `required` VA bits.
    pub(crate) fn increase_top(&self, required: u8) -> Result<(), PtError> {
        loop {
            let (old_pa, old_level) = self.live_top()?;
            if self.top_window_lg2(old_level) >= required {
                return Ok(());
            }

            let mut staged: heapless::Vec<PhysAddr, 8> = heapless::Vec::new();
            let mut level = old_level;
            let mut child = old_pa;
            let mut failure = None;
            while self.top_window_lg2(level) < required {
                if level >= self.fmt.max_top_level()
                    || self.top_window_lg2(level) >= self.max_va_lg2
                {
                    failure = Some(PtError::OutOfRange);
                    break;
                }
                level += 1;
                let lg2 = self.fmt.top_items_lg2(level) + F::Word::LG2SZ;
                match self.new_table(lg2) {
                    Ok(pa) => {
                        // The old top stays reachable at index 0.
                        store_entry::<F>(pa, 0, self.fmt.encode_table(child, level));
                        if staged.push(pa).is_err() {
                            self.drop_unpublished_table(pa);
                            failure = Some(PtError::OutOfRange);
                            break;
                        }
                        child = pa;
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(e) = failure {
                for &pa in staged.iter() {
                    self.drop_unpublished_table(pa);
                }
                return Err(e);
            }
            for &pa in staged.iter() {
                self.table_sync_done(pa);
            }

            let guard = self.flush.top_lock().lock();
            if self.top.load() != (old_pa, old_level) {
                // Someone else grew the top underneath us; rebuild.
                drop(guard);
                for &pa in staged.iter() {
                    self.drop_unpublished_table(pa);
                }
                continue;
            }
            self.flush.change_top(child, level);
            self.top.store(child, level);
            drop(guard);
            crate::log!("top grew to level {}", level);
            return Ok(());
        }
    }
}

impl<F: PtFormat> Drop for PagingDomain<F> {
    fn drop(&mut self) {
        self.deinit();
    }
}
