//! Lookup and dirty tracking
//!
//! Translation descends a single path to the leaf. Dirty collection walks
//! every leaf in the range and handles whole contiguous runs at a time: a
//! run with any dirty member reports dirty over its full span and is
//! cleared member by member with compare-exchange, so a hardware writer
//! marking pages concurrently never loses an update.

use iommupt_hal::{
    log2, DirtyBitmap, DirtyFlags, EntryKind, IoVa, PhysAddr, PtError, PtFeatures, PtFormat,
    TableWord,
};

use crate::domain::PagingDomain;
use crate::walker::{
    cmpxchg_entry, dispatch_level, end_index, item_last_va, load_entry, va_index, WriteLog,
};

struct DirtyCtx<'a, F: PtFormat> {
    dom: &'a PagingDomain<F>,
    bitmap: &'a mut DirtyBitmap,
    clear: bool,
}

impl<F: PtFormat> PagingDomain<F> {
    /// Resolve `iova` to its output address, preserving the sub-page
    /// offset.
    pub fn iova_to_phys(&self, iova: IoVa) -> Result<PhysAddr, PtError> {
        let (top_pa, top_level) = self.live_top()?;
        if self.features.contains(PtFeatures::FULL_VA) {
            if !log2::in_prefix_range(iova, self.max_va_lg2, self.fmt.full_va_prefix()) {
                return Err(PtError::OutOfRange);
            }
        } else {
            if log2::div(iova, self.max_va_lg2) != 0 {
                return Err(PtError::OutOfRange);
            }
            if log2::div(iova, self.top_window_lg2(top_level)) != 0 {
                return Err(PtError::TranslationMissing);
            }
        }

        let mut table = top_pa;
        let mut level = top_level;
        let mut items = self.fmt.top_items_lg2(top_level);
        loop {
            let item = self.fmt.item_lg2sz(level);
            let word = load_entry::<F>(table, va_index(iova, item, items));
            match self.fmt.entry_kind(word, level) {
                EntryKind::Empty => return Err(PtError::TranslationMissing),
                EntryKind::Oa => {
                    let run_lg2 = item + self.fmt.entry_num_contig_lg2(word, level);
                    let run_base = self.fmt.entry_oa(word, level) & !log2::to_max(run_lg2);
                    return Ok(run_base + log2::modulo(iova, run_lg2));
                }
                EntryKind::Table => {
                    table = self.fmt.table_pa(word, level);
                    level -= 1;
                    items = self.fmt.num_items_lg2(level);
                }
            }
        }
    }

    /// Sample and optionally reset hardware dirty state over a range into
    /// the caller's bitmap.
    pub fn read_and_clear_dirty(
        &self,
        iova: IoVa,
        len: u64,
        flags: DirtyFlags,
        bitmap: &mut DirtyBitmap,
    ) -> Result<(), PtError> {
        if !self.fmt.dirty_tracking() {
            return Err(PtError::NotSupported);
        }
        let (va, mut last_va) = self.check_va_range(iova, len)?;
        let (top_pa, top_level) = self.live_top()?;
        let window = self.top_window_lg2(top_level);
        if !self.features.contains(PtFeatures::FULL_VA) {
            if log2::div(va, window) != 0 {
                return Ok(());
            }
            if log2::div(last_va, window) != 0 {
                last_va = log2::to_max(window);
            }
        }
        let mut ctx =
            DirtyCtx { dom: self, bitmap, clear: !flags.contains(DirtyFlags::NO_CLEAR) };
        dirty_dispatch(
            top_level,
            &mut ctx,
            top_pa,
            self.fmt.top_items_lg2(top_level),
            va,
            last_va,
        );
        Ok(())
    }

    /// Force the leaf containing `iova` dirty, as after a migration
    /// resume.
    pub fn set_dirty(&self, iova: IoVa) -> Result<(), PtError> {
        if !self.fmt.dirty_tracking() {
            return Err(PtError::NotSupported);
        }
        let (top_pa, top_level) = self.live_top()?;
        let mut table = top_pa;
        let mut level = top_level;
        let mut items = self.fmt.top_items_lg2(top_level);
        loop {
            let item = self.fmt.item_lg2sz(level);
            let index = va_index(iova, item, items);
            let word = load_entry::<F>(table, index);
            match self.fmt.entry_kind(word, level) {
                EntryKind::Empty => return Err(PtError::TranslationMissing),
                EntryKind::Oa => {
                    loop {
                        let cur = load_entry::<F>(table, index);
                        let marked = self.fmt.entry_set_dirty(cur, level);
                        if marked == cur || cmpxchg_entry::<F>(table, index, cur, marked) {
                            return Ok(());
                        }
                    }
                }
                EntryKind::Table => {
                    table = self.fmt.table_pa(word, level);
                    level -= 1;
                    items = self.fmt.num_items_lg2(level);
                }
            }
        }
    }
}

fn dirty_dispatch<F: PtFormat>(
    level: u8,
    ctx: &mut DirtyCtx<'_, F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    va: IoVa,
    last_va: IoVa,
) {
    dispatch_level!(dirty_table::<F>(level, ctx, table_pa, items_lg2, va, last_va))
}

fn dirty_table<F: PtFormat, const LVL: u8>(
    ctx: &mut DirtyCtx<'_, F>,
    table_pa: PhysAddr,
    items_lg2: u8,
    va: IoVa,
    last_va: IoVa,
) {
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
            EntryKind::Table => {
                if LVL > 1 {
                    let child = ctx.dom.fmt.table_pa(word, LVL);
                    dirty_dispatch(
                        LVL - 1,
                        ctx,
                        child,
                        ctx.dom.fmt.num_items_lg2(LVL - 1),
                        cur_va,
                        entry_last,
                    );
                }
            }
            EntryKind::Oa => {
                let contig = ctx.dom.fmt.entry_num_contig_lg2(word, LVL);
                let run_lg2 = item + contig;
                let n = 1u32 << contig;
                let run_base_idx = index & !(n - 1);
                let run_base_va = log2::set_mod(cur_va, 0, run_lg2);

                let mut any_dirty = false;
                for i in 0..n {
                    let w = load_entry::<F>(table_pa, run_base_idx + i);
                    if ctx.dom.fmt.entry_is_dirty(w, LVL) {
                        any_dirty = true;
                        break;
                    }
                }
                if any_dirty {
                    ctx.bitmap.record(run_base_va, log2::to_int(run_lg2));
                    if ctx.clear {
                        for i in 0..n {
                            loop {
                                let w = load_entry::<F>(table_pa, run_base_idx + i);
                                if !ctx.dom.fmt.entry_is_dirty(w, LVL) {
                                    break;
                                }
                                let cleaned = ctx.dom.fmt.entry_clear_dirty(w, LVL);
                                if cmpxchg_entry::<F>(table_pa, run_base_idx + i, w, cleaned) {
                                    break;
                                }
                            }
                        }
                        wlog.note_range(run_base_idx, run_base_idx + n - 1);
                    }
                }

                let run_last = run_base_va + (log2::to_int(run_lg2) - 1);
                if run_last >= last_va {
                    break;
                }
                cur_va = run_last + 1;
                index = run_base_idx + n;
                continue;
            }
        }
        if entry_last >= last_va {
            break;
        }
        cur_va = entry_last + 1;
        index += 1;
    }
}
