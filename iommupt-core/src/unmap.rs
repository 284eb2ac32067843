//! Unmap engine
//!
//! Clears leaves over a range, whole contiguous runs at a time, and frees
//! child tables whose entire window the range covers. Freed tables chain
//! onto a batch that is staged behind the caller's flush, so a concurrent
//! walker that snapshotted the old top never dereferences reused memory.

use iommupt_hal::{log2, EntryKind, IotlbGather, IoVa, PhysAddr, PtError, PtFormat, TableWord};

use crate::domain::PagingDomain;
use crate::table_mem::FreeBatch;
use crate::walker::{
    dispatch_level, end_index, item_last_va, load_entry, store_entry, va_index, WriteLog,
};

struct UnmapCtx<'a, F: PtFormat> {
    dom: &'a PagingDomain<F>,
    gather: &'a mut IotlbGather,
    batch: FreeBatch,
    unmapped: u64,
}

impl<F: PtFormat> PagingDomain<F> {
    /// Remove translations over `[iova, iova + len)`.
    ///
    /// Returns the number of bytes actually unmapped; a range that covers
    /// the start of a larger leaf takes the whole leaf down and reports
    /// its full size. Empty stretches are skipped. The caller drives the
    /// IOTLB flush described by `gather`, after which `flush_deferred`
    /// reclaims the collected tables.
    pub fn unmap_range(
        &self,
        iova: IoVa,
        len: u64,
        gather: &mut IotlbGather,
    ) -> Result<u64, PtError> {
        let (va, mut last_va) = self.check_va_range(iova, len)?;
        let (top_pa, top_level) = self.live_top()?;
        let window = self.top_window_lg2(top_level);
        if !self.features.contains(iommupt_hal::PtFeatures::FULL_VA) {
            // Nothing can live above the current top window.
            if log2::div(va, window) != 0 {
                return Ok(0);
            }
            if log2::div(last_va, window) != 0 {
                last_va = log2::to_max(window);
            }
        }
        let mut ctx = UnmapCtx { dom: self, gather, batch: FreeBatch::new(), unmapped: 0 };
        let res = unmap_dispatch(
            top_level,
            &mut ctx,
            top_pa,
            self.fmt.top_items_lg2(top_level),
            va,
            last_va,
        );
        let unmapped = ctx.unmapped;
        if !ctx.batch.is_empty() {
            self.deferred.defer(&self.store, ctx.batch);
        }
        res.map(|()| unmapped)
    }
}

fn unmap_dispatch<F: PtFormat>(
    level: u8,
    ctx: &mut UnmapCtx<'_, F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    va: IoVa,
    last_va: IoVa,
) -> Result<(), PtError> {
    dispatch_level!(unmap_table::<F>(level, ctx, table_pa, items_lg2, va, last_va))
}

fn unmap_table<F: PtFormat, const LVL: u8>(
    ctx: &mut UnmapCtx<'_, F>,
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
        let entry_last = item_last_va(cur_va, last_va, item);
        match ctx.dom.fmt.entry_kind(word, LVL) {
            EntryKind::Empty => {}
            EntryKind::Oa => {
                let contig = ctx.dom.fmt.entry_num_contig_lg2(word, LVL);
                let run_lg2 = item + contig;
                if log2::modulo(cur_va, run_lg2) != 0 {
                    // Unmap starting inside a leaf cannot split it.
                    return Err(PtError::InvalidArgument);
                }
                let n = 1u32 << contig;
                for i in 0..n {
                    store_entry::<F>(table_pa, index + i, F::Word::ZERO);
                }
                wlog.note_range(index, index + n - 1);
                let size = log2::to_int(run_lg2);
                ctx.gather.add_range(cur_va, size);
                ctx.unmapped += size;
                let run_last = cur_va + (size - 1);
                if run_last >= last_va {
                    break;
                }
                cur_va = run_last + 1;
                index += n;
                continue;
            }
            EntryKind::Table => {
                let child = ctx.dom.fmt.table_pa(word, LVL);
                let child_items = ctx.dom.fmt.num_items_lg2(LVL - 1);
                let fully_covered =
                    log2::modulo(cur_va, item) == 0 && entry_last == log2::set_mod_max(cur_va, item);
                unmap_dispatch(LVL - 1, ctx, child, child_items, cur_va, entry_last)?;
                if fully_covered {
                    store_entry::<F>(table_pa, index, F::Word::ZERO);
                    wlog.note(index);
                    ctx.batch.push(&ctx.dom.store, child);
                }
            }
        }
        if entry_last >= last_va {
            break;
        }
        cur_va = entry_last + 1;
        index += 1;
    }
    Ok(())
}

/// Passive collection walk for teardown and table-for-leaf exchange:
/// gathers every table in the subtree (the subtree root last) onto the
/// batch, ignoring mapped leaves.
pub(crate) fn collect_dispatch<F: PtFormat>(
    level: u8,
    dom: &PagingDomain<F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    batch: &mut FreeBatch,
) {
    dispatch_level!(collect_table::<F>(level, dom, table_pa, items_lg2, batch))
}

fn collect_table<F: PtFormat, const LVL: u8>(
    dom: &PagingDomain<F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    batch: &mut FreeBatch,
) {
    if LVL > 1 {
        let n = log2::to_int(items_lg2) as u32;
        for index in 0..n {
            let word = load_entry::<F>(table_pa, index);
            if dom.fmt.entry_kind(word, LVL) == EntryKind::Table {
                let child = dom.fmt.table_pa(word, LVL);
                collect_dispatch(LVL - 1, dom, child, dom.fmt.num_items_lg2(LVL - 1), batch);
            }
        }
    }
    batch.push(&dom.store, table_pa);
}

/// Does this subtree translate nothing? Empty tables hanging off partial
/// unmaps count as empty.
pub(crate) fn subtree_empty_dispatch<F: PtFormat>(
    level: u8,
    dom: &PagingDomain<F>,
    table_pa: PhysAddr,
    items_lg2: u8,
) -> bool {
    dispatch_level!(subtree_empty::<F>(level, dom, table_pa, items_lg2))
}

fn subtree_empty<F: PtFormat, const LVL: u8>(
    dom: &PagingDomain<F>,
    table_pa: PhysAddr,
    items_lg2: u8,
) -> bool {
    let n = log2::to_int(items_lg2) as u32;
    for index in 0..n {
        let word = load_entry::<F>(table_pa, index);
        match dom.fmt.entry_kind(word, LVL) {
            EntryKind::Empty => {}
            EntryKind::Oa => return false,
            EntryKind::Table => {
                if LVL == 1 {
                    return false;
                }
                let child = dom.fmt.table_pa(word, LVL);
                if !subtree_empty_dispatch(LVL - 1, dom, child, dom.fmt.num_items_lg2(LVL - 1)) {
                    return false;
                }
            }
        }
    }
    true
}
