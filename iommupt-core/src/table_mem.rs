//! Table memory
//!
//! Table pages are power-of-two sized blocks whose alignment equals their
//! size, so the block address doubles as the output address installed in
//! parent descriptors and as the DMA address on incoherent walkers (the
//! engine requires the identity mapping and refuses anything else).
//!
//! Every page has metadata in the owning domain's store: its size, its
//! incoherent state, a release/acquire `still_flushing` flag paired with
//! the cache flush that makes the page visible to the hardware walker, and
//! an intrusive link so whole batches of freed tables chain together
//! without allocating.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use iommupt_hal::{log2, AllocFlags, DmaDevice, PhysAddr, PtError};
use spin::Mutex;

/// Per-page metadata
pub struct TableMeta {
    lg2sz: u8,
    incoherent: AtomicBool,
    still_flushing: AtomicBool,
    /// Next table in a free batch, 0 when unlinked
    free_next: AtomicU64,
}

/// Per-domain registry of live table pages
pub struct TableStore {
    tables: Mutex<BTreeMap<PhysAddr, Arc<TableMeta>>>,
    outstanding: AtomicUsize,
}

impl TableStore {
    pub fn new() -> Self {
        Self { tables: Mutex::new(BTreeMap::new()), outstanding: AtomicUsize::new(0) }
    }

    /// Allocate a zeroed table page of `2^lg2sz` bytes, aligned to its size.
    pub fn alloc(&self, lg2sz: u8, _flags: AllocFlags) -> Result<PhysAddr, PtError> {
        let size = log2::to_int(lg2sz) as usize;
        let layout = Layout::from_size_align(size, size).map_err(|_| PtError::InvalidArgument)?;
        // SAFETY: `layout` has a non-zero, power-of-two size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(PtError::OutOfMemory);
        }
        let pa = ptr as PhysAddr;
        let meta = Arc::new(TableMeta {
            lg2sz,
            incoherent: AtomicBool::new(false),
            still_flushing: AtomicBool::new(false),
            free_next: AtomicU64::new(0),
        });
        self.tables.lock().insert(pa, meta);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        Ok(pa)
    }

    fn meta(&self, pa: PhysAddr) -> Arc<TableMeta> {
        self.tables.lock().get(&pa).cloned().expect("table page is not owned by this domain")
    }

    /// Number of live table pages, for leak accounting.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    pub fn table_lg2sz(&self, pa: PhysAddr) -> u8 {
        self.meta(pa).lg2sz
    }

    /// Map the page for an incoherent walker and mark it still flushing.
    pub fn start_incoherent(&self, pa: PhysAddr, dma: &dyn DmaDevice) -> Result<(), PtError> {
        let meta = self.meta(pa);
        let size = log2::to_int(meta.lg2sz) as usize;
        let dma_addr = dma.map_identity(pa, size)?;
        if dma_addr != pa {
            dma.unmap(dma_addr, size);
            return Err(PtError::NotSupported);
        }
        meta.incoherent.store(true, Ordering::Relaxed);
        meta.still_flushing.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Release-publish that the page's initial cache flush completed.
    pub fn done_incoherent_flush(&self, pa: PhysAddr) {
        self.meta(pa).still_flushing.store(false, Ordering::Release);
    }

    /// Acquire-observe whether the page's initial flush is still pending.
    pub fn still_flushing(&self, pa: PhysAddr) -> bool {
        self.meta(pa).still_flushing.load(Ordering::Acquire)
    }

    /// Free one page immediately. The page must already be unreachable.
    pub fn free(&self, pa: PhysAddr, dma: Option<&dyn DmaDevice>) {
        let meta = self.tables.lock().remove(&pa).expect("freeing a table page twice");
        let size = log2::to_int(meta.lg2sz) as usize;
        if meta.incoherent.load(Ordering::Relaxed) {
            if let Some(dma) = dma {
                dma.unmap(pa, size);
            }
        }
        let layout = Layout::from_size_align(size, size).expect("layout was valid at alloc");
        // SAFETY: `pa` came from `alloc` with this exact layout and is
        // removed from the registry, so it cannot be freed again.
        unsafe { dealloc(pa as *mut u8, layout) };
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Free an entire batch immediately.
    pub fn free_list(&self, batch: FreeBatch, dma: Option<&dyn DmaDevice>) {
        let mut pa = batch.head;
        while pa != 0 {
            let next = self.meta(pa).free_next.load(Ordering::Relaxed);
            self.free(pa, dma);
            pa = next;
        }
    }

    fn link(&self, batch: &mut FreeBatch, pa: PhysAddr) {
        self.meta(pa).free_next.store(batch.head, Ordering::Relaxed);
        if batch.head == 0 {
            batch.tail = pa;
        }
        batch.head = pa;
        batch.count += 1;
    }

    fn concat(&self, dst: &mut FreeBatch, src: FreeBatch) {
        if src.is_empty() {
            return;
        }
        if dst.is_empty() {
            *dst = src;
            return;
        }
        self.meta(src.tail).free_next.store(dst.head, Ordering::Relaxed);
        dst.head = src.head;
        dst.count += src.count;
    }
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A chain of unlinked table pages awaiting free, threaded through the
/// per-page metadata so batching never allocates.
#[derive(Debug, Clone, Copy)]
pub struct FreeBatch {
    head: PhysAddr,
    tail: PhysAddr,
    count: usize,
}

impl FreeBatch {
    pub const fn new() -> Self {
        Self { head: 0, tail: 0, count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.head == 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn push(&mut self, store: &TableStore, pa: PhysAddr) {
        store.link(self, pa);
    }
}

impl Default for FreeBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Grace-period staging for tables removed while other ranges may still be
/// walking through stale snapshots. The queue drains at the caller-driven
/// quiescent points: an explicit flush, or domain teardown.
pub struct DeferredFrees {
    pending: Mutex<FreeBatch>,
}

impl DeferredFrees {
    pub const fn new() -> Self {
        Self { pending: Mutex::new(FreeBatch::new()) }
    }

    /// Stage a batch behind the next grace period.
    pub fn defer(&self, store: &TableStore, batch: FreeBatch) {
        let mut pending = self.pending.lock();
        store.concat(&mut pending, batch);
    }

    /// Reclaim everything staged so far.
    pub fn drain(&self, store: &TableStore, dma: Option<&dyn DmaDevice>) -> usize {
        let batch = core::mem::take(&mut *self.pending.lock());
        let count = batch.count();
        store.free_list(batch, dma);
        count
    }
}

impl Default for DeferredFrees {
    fn default() -> Self {
        Self::new()
    }
}
