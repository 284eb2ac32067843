//! Map engine
//!
//! Top-down installation of leaves at the largest representable size:
//! contiguous runs where the format encodes them, child tables published
//! through compare-exchange where subdivision is needed, and reclamation
//! of emptied child tables back into large leaves when the format can
//! exchange tables for OAs in place.

use iommupt_hal::{
    log2, EntryKind, IoVa, PhysAddr, Prot, PtError, PtFeatures, PtFormat, TableWord,
};

use crate::domain::PagingDomain;
use crate::table_mem::FreeBatch;
use crate::unmap::{collect_dispatch, subtree_empty_dispatch};
use crate::walker::{
    best_pgsize, cmpxchg_entry, dispatch_level, end_index, item_last_va, load_entry, store_entry,
    va_index, WriteLog,
};

pub(crate) struct MapCtx<'a, F: PtFormat> {
    dom: &'a PagingDomain<F>,
    attrs: F::Attrs,
    oa: PhysAddr,
    mapped: u64,
    batch: FreeBatch,
    /// Child tables published by concurrent mappers whose initial cache
    /// flush we must wait out before reporting success.
    flush_waits: heapless::Vec<PhysAddr, 8>,
}

impl<F: PtFormat> PagingDomain<F> {
    /// Install a translation for `[iova, iova + len)` onto `paddr`.
    ///
    /// `mapped` reports the successfully installed prefix in bytes; on
    /// failure the caller unmaps that prefix.
    pub fn map_range(
        &self,
        iova: IoVa,
        paddr: PhysAddr,
        len: u64,
        prot: Prot,
        mapped: &mut u64,
    ) -> Result<(), PtError> {
        *mapped = 0;
        let attrs = self.fmt.attrs_from_prot(prot)?;
        let (va, last_va) = self.check_va_range(iova, len)?;
        if log2::modulo(paddr, self.fmt.granule_lg2sz()) != 0 {
            return Err(PtError::InvalidArgument);
        }
        let last_oa = paddr.checked_add(len - 1).ok_or(PtError::OutOfRange)?;
        if log2::div(last_oa, self.max_oa_lg2) != 0 {
            return Err(PtError::OutOfRange);
        }

        let (top_pa, top_level) = self.map_top(last_va)?;
        let mut ctx = MapCtx {
            dom: self,
            attrs,
            oa: paddr,
            mapped: 0,
            batch: FreeBatch::new(),
            flush_waits: heapless::Vec::new(),
        };
        let res = map_dispatch(
            top_level,
            &mut ctx,
            top_pa,
            self.fmt.top_items_lg2(top_level),
            va,
            last_va,
        );
        *mapped = ctx.mapped;
        for &pa in ctx.flush_waits.iter() {
            while self.store.still_flushing(pa) {
                core::hint::spin_loop();
            }
        }
        if !ctx.batch.is_empty() {
            self.deferred.defer(&self.store, ctx.batch);
        }
        res
    }

    /// Snapshot a top covering `last_va`, growing it when the format
    /// allows.
    fn map_top(&self, last_va: IoVa) -> Result<(PhysAddr, u8), PtError> {
        if self.features.contains(PtFeatures::FULL_VA) {
            return self.live_top();
        }
        let (top_pa, top_level) = self.live_top()?;
        let need = log2::fls(last_va);
        if need <= self.top_window_lg2(top_level) {
            return Ok((top_pa, top_level));
        }
        if !self.features.contains(PtFeatures::DYNAMIC_TOP) {
            return Err(PtError::OutOfRange);
        }
        self.increase_top(need)?;
        self.live_top()
    }
}

pub(crate) fn map_dispatch<F: PtFormat>(
    level: u8,
    ctx: &mut MapCtx<'_, F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    va: IoVa,
    last_va: IoVa,
) -> Result<(), PtError> {
    dispatch_level!(map_table::<F>(level, ctx, table_pa, items_lg2, va, last_va))
}

fn map_table<F: PtFormat, const LVL: u8>(
    ctx: &mut MapCtx<'_, F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    va: IoVa,
    last_va: IoVa,
) -> Result<(), PtError> {
    let item = ctx.dom.fmt.item_lg2sz(LVL);
    let mut index = va_index(va, item, items_lg2);
    let end = end_index(va, last_va, item, items_lg2);
    let mut cur_va = va;
    let mut wlog = WriteLog::new(ctx.dom.dma_if_incoherent(), table_pa, F::Word::LG2SZ);

    while index < end {
        let word = load_entry::<F>(table_pa, index);
        let kind = ctx.dom.fmt.entry_kind(word, LVL);
        let entry_last = item_last_va(cur_va, last_va, item);

        // Prefer the largest leaf that fits this position. When a run is
        // blocked by an occupied neighbour, an empty entry still takes a
        // single-item leaf and the collision surfaces where it sits.
        if kind != EntryKind::Oa && ctx.dom.fmt.can_have_leaf(LVL) {
            let best = best_pgsize(&ctx.dom.fmt, LVL, cur_va, last_va, ctx.oa);
            let sz = if best >= item && reclaim_run::<F, LVL>(ctx, table_pa, index, best - item)
            {
                best
            } else if kind == EntryKind::Empty
                && best >= item
                && ctx.dom.fmt.possible_sizes(LVL) & log2::to_int(item) != 0
            {
                item
            } else {
                0
            };
            if sz != 0 {
                let n = 1u32 << (sz - item);
                for i in 0..n {
                    let leaf_oa = ctx.oa + ((i as u64) << item);
                    let w = ctx.dom.fmt.encode_leaf(leaf_oa, LVL, sz, &ctx.attrs);
                    store_entry::<F>(table_pa, index + i, w);
                }
                wlog.note_range(index, index + n - 1);
                let size = log2::to_int(sz);
                ctx.oa += size;
                ctx.mapped += size;
                let run_last = cur_va + (size - 1);
                if run_last >= last_va {
                    break;
                }
                cur_va = run_last + 1;
                index += n;
                continue;
            }
        }

        match kind {
            EntryKind::Empty => {
                if LVL == 1 {
                    // Nothing below the granule to subdivide into.
                    return Err(PtError::InvalidArgument);
                }
                let child = ctx.dom.new_table(ctx.dom.fmt.table_lg2sz(LVL - 1))?;
                let new_word = ctx.dom.fmt.encode_table(child, LVL);
                if !cmpxchg_entry::<F>(table_pa, index, word, new_word) {
                    // A concurrent mapper published this entry first; drop
                    // ours and retry the same slot.
                    ctx.dom.drop_unpublished_table(child);
                    continue;
                }
                wlog.note(index);
                ctx.dom.table_sync_done(child);
                map_dispatch(
                    LVL - 1,
                    ctx,
                    child,
                    ctx.dom.fmt.num_items_lg2(LVL - 1),
                    cur_va,
                    entry_last,
                )?;
            }
            EntryKind::Table => {
                if LVL == 1 {
                    return Err(PtError::InUse);
                }
                let child = ctx.dom.fmt.table_pa(word, LVL);
                if ctx.dom.incoherent() && ctx.dom.store.still_flushing(child) {
                    // Our completion must wait for the publisher's flush.
                    if ctx.flush_waits.push(child).is_err() {
                        while ctx.dom.store.still_flushing(child) {
                            core::hint::spin_loop();
                        }
                    }
                }
                map_dispatch(
                    LVL - 1,
                    ctx,
                    child,
                    ctx.dom.fmt.num_items_lg2(LVL - 1),
                    cur_va,
                    entry_last,
                )?;
            }
            EntryKind::Oa => return Err(PtError::InUse),
        }

        if entry_last >= last_va {
            break;
        }
        cur_va = entry_last + 1;
        index += 1;
    }
    Ok(())
}

/// May a leaf run of `2^contig` items land on `[index, index + 2^contig)`?
/// Empty entries are free; empty child tables are reclaimed onto the free
/// batch when the format supports the exchange. Anything mapped refuses.
fn reclaim_run<F: PtFormat, const LVL: u8>(
    ctx: &mut MapCtx<'_, F>,
    table_pa: PhysAddr,
    index: u32,
    contig: u8,
) -> bool {
    let n = 1u32 << contig;
    let allow_tables = LVL > 1 && ctx.dom.features.contains(PtFeatures::OA_TABLE_XCHG);
    for i in 0..n {
        let word = load_entry::<F>(table_pa, index + i);
        match ctx.dom.fmt.entry_kind(word, LVL) {
            EntryKind::Empty => {}
            EntryKind::Table if allow_tables => {
                let child = ctx.dom.fmt.table_pa(word, LVL);
                if !subtree_empty_dispatch(
                    LVL - 1,
                    ctx.dom,
                    child,
                    ctx.dom.fmt.num_items_lg2(LVL - 1),
                ) {
                    return false;
                }
            }
            _ => return false,
        }
    }
    // Unlink the emptied subtrees; they are freed after the caller's
    // grace period, never before the overwrite below lands.
    for i in 0..n {
        let word = load_entry::<F>(table_pa, index + i);
        if ctx.dom.fmt.entry_kind(word, LVL) == EntryKind::Table {
            let child = ctx.dom.fmt.table_pa(word, LVL);
            collect_dispatch(
                LVL - 1,
                ctx.dom,
                child,
                ctx.dom.fmt.num_items_lg2(LVL - 1),
                &mut ctx.batch,
            );
        }
    }
    true
}
