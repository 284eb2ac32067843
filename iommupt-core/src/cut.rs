//! Mapping cut
//!
//! Turns one mapping into two independently unmappable halves by
//! subdividing every leaf the cut point lands inside: contiguous runs are
//! rewritten as the largest pieces that stop at the cut, and single large
//! blocks are pushed down into a freshly built child table mirroring the
//! same translation. Each rewritten entry describes the same VA→OA
//! relation throughout, so concurrent hardware walks stay coherent.

#[cfg(feature = "cut")]
mod imp {
    use iommupt_hal::{log2, EntryKind, IoVa, PhysAddr, PtError, PtFeatures, PtFormat, TableWord};

    use crate::domain::PagingDomain;
    use crate::walker::{best_pgsize, cmpxchg_entry, load_entry, store_entry, va_index, WriteLog};

    impl<F: PtFormat> PagingDomain<F> {
        /// Subdivide large pages so no leaf crosses `iova`, keeping the
        /// largest page size compatible with the new boundary on each side.
        pub fn cut_mapping(&self, iova: IoVa) -> Result<(), PtError> {
            if log2::modulo(iova, self.fmt.granule_lg2sz()) != 0 {
                return Err(PtError::InvalidArgument);
            }
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
                let index = va_index(iova, item, items);
                let word = load_entry::<F>(table, index);
                match self.fmt.entry_kind(word, level) {
                    EntryKind::Empty => return Err(PtError::TranslationMissing),
                    EntryKind::Table => {
                        table = self.fmt.table_pa(word, level);
                        level -= 1;
                        items = self.fmt.num_items_lg2(level);
                    }
                    EntryKind::Oa => {
                        let contig = self.fmt.entry_num_contig_lg2(word, level);
                        let run_lg2 = item + contig;
                        if log2::modulo(iova, run_lg2) == 0 {
                            // Already a leaf boundary; nothing crosses.
                            return Ok(());
                        }
                        if contig > 0 {
                            self.split_run(table, level, index, word, iova);
                            // Re-examine: the entry under the cut shrank.
                            continue;
                        }
                        // A single block strictly containing the cut.
                        let child = self.new_table(self.fmt.table_lg2sz(level - 1))?;
                        self.fill_split_table(child, level - 1, word, level, iova);
                        self.table_sync_done(child);
                        let table_word = self.fmt.encode_table(child, level);
                        if !cmpxchg_entry::<F>(table, index, word, table_word) {
                            self.drop_unpublished_table(child);
                            continue;
                        }
                        if let Some(dma) = self.dma_if_incoherent() {
                            let off = (index as u64) << F::Word::LG2SZ;
                            dma.sync_for_device(table + off, 1 << F::Word::LG2SZ);
                        }
                    }
                }
            }
        }

        /// Rewrite the contiguous run containing `cut` as the largest
        /// pieces stopping at the item boundary around the cut.
        fn split_run(&self, table: PhysAddr, level: u8, index: u32, word: F::Word, cut: IoVa) {
            let item = self.fmt.item_lg2sz(level);
            let contig = self.fmt.entry_num_contig_lg2(word, level);
            let run_lg2 = item + contig;
            let n = 1u32 << contig;
            let base_idx = index & !(n - 1);
            let base_va = log2::set_mod(cut, 0, run_lg2);
            let base_oa = self.fmt.entry_oa(word, level) & !log2::to_max(run_lg2);
            let attrs = self.fmt.attrs_from_entry(word, level);
            let run_last = base_va + (log2::to_int(run_lg2) - 1);
            let cut_item = log2::set_mod(cut, 0, item);
            let mut wlog = WriteLog::new(self.dma_if_incoherent(), table, F::Word::LG2SZ);

            let mut i = 0u32;
            let mut va = base_va;
            while i < n {
                let piece_last = if va < cut_item {
                    cut_item - 1
                } else if va == cut_item {
                    log2::set_mod_max(va, item)
                } else {
                    run_last
                };
                let oa = base_oa + ((i as u64) << item);
                let sz = best_pgsize(&self.fmt, level, va, piece_last, oa);
                let m = 1u32 << (sz - item);
                let mut dirty = false;
                if self.fmt.dirty_tracking() {
                    for j in 0..m {
                        let old = load_entry::<F>(table, base_idx + i + j);
                        if self.fmt.entry_is_dirty(old, level) {
                            dirty = true;
                            break;
                        }
                    }
                }
                for j in 0..m {
                    let mut w =
                        self.fmt.encode_leaf(oa + ((j as u64) << item), level, sz, &attrs);
                    if dirty {
                        w = self.fmt.entry_set_dirty(w, level);
                    }
                    store_entry::<F>(table, base_idx + i + j, w);
                }
                wlog.note_range(base_idx + i, base_idx + i + m - 1);
                i += m;
                va += log2::to_int(sz);
            }
        }

        /// Populate a fresh child table with the translation of one parent
        /// block, using the largest pieces that stop at the cut.
        fn fill_split_table(
            &self,
            child: PhysAddr,
            child_level: u8,
            parent_word: F::Word,
            parent_level: u8,
            cut: IoVa,
        ) {
            let parent_item = self.fmt.item_lg2sz(parent_level);
            let child_item = self.fmt.item_lg2sz(child_level);
            let attrs = self.fmt.attrs_from_entry(parent_word, parent_level);
            let dirty =
                self.fmt.dirty_tracking() && self.fmt.entry_is_dirty(parent_word, parent_level);
            let base_va = log2::set_mod(cut, 0, parent_item);
            let base_oa = self.fmt.entry_oa(parent_word, parent_level);
            let window_last = log2::set_mod_max(base_va, parent_item);
            let cut_item = log2::set_mod(cut, 0, child_item);

            let mut va = base_va;
            let mut index = 0u32;
            while va <= window_last {
                let piece_last = if va < cut_item {
                    cut_item - 1
                } else if va == cut_item {
                    log2::set_mod_max(va, child_item)
                } else {
                    window_last
                };
                let oa = base_oa + (va - base_va);
                let sz = best_pgsize(&self.fmt, child_level, va, piece_last, oa);
                let m = 1u32 << (sz - child_item);
                for j in 0..m {
                    let mut w = self.fmt.encode_leaf(
                        oa + ((j as u64) << child_item),
                        child_level,
                        sz,
                        &attrs,
                    );
                    if dirty {
                        w = self.fmt.entry_set_dirty(w, child_level);
                    }
                    store_entry::<F>(child, index + j, w);
                }
                index += m;
                va += log2::to_int(sz);
                if va == 0 {
                    break;
                }
            }
        }
    }
}

#[cfg(not(feature = "cut"))]
mod imp {
    use iommupt_hal::{IoVa, PtError, PtFormat};

    use crate::domain::PagingDomain;

    impl<F: PtFormat> PagingDomain<F> {
        /// Mapping subdivision is not compiled in.
        pub fn cut_mapping(&self, _iova: IoVa) -> Result<(), PtError> {
            Err(PtError::NotSupported)
        }
    }
}
