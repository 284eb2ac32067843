//! Common test helpers and dummy host implementations used across
//! integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use iommupt_core::hal::{DmaDevice, FlushOps, PhysAddr, PtError};

/// Flush callback stub counting invocations.
pub struct DummyFlush {
    lock: spin::Mutex<()>,
    pub flushes: Arc<AtomicUsize>,
    pub top_changes: Arc<AtomicUsize>,
}

impl DummyFlush {
    pub fn new() -> Self {
        Self {
            lock: spin::Mutex::new(()),
            flushes: Arc::new(AtomicUsize::new(0)),
            top_changes: Arc::new(AtomicUsize::new(0)),
        }
    }

}

impl FlushOps for DummyFlush {
    fn flush_all(&self) {
        self.flushes.fetch_add(1, Ordering::SeqCst);
    }

    fn change_top(&self, _new_top_pa: PhysAddr, _new_top_level: u8) {
        self.top_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn top_lock(&self) -> &spin::Mutex<()> {
        &self.lock
    }
}

/// Identity DMA device counting cache syncs.
pub struct DummyDma {
    pub maps: Arc<AtomicUsize>,
    pub syncs: Arc<AtomicUsize>,
    pub unmaps: Arc<AtomicUsize>,
}

impl DummyDma {
    pub fn new() -> Self {
        Self {
            maps: Arc::new(AtomicUsize::new(0)),
            syncs: Arc::new(AtomicUsize::new(0)),
            unmaps: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl DmaDevice for DummyDma {
    fn map_identity(&self, pa: PhysAddr, _size: usize) -> Result<PhysAddr, PtError> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(pa)
    }

    fn sync_for_device(&self, _pa: PhysAddr, _len: usize) {
        self.syncs.fetch_add(1, Ordering::SeqCst);
    }

    fn unmap(&self, _pa: PhysAddr, _size: usize) {
        self.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

/// A DMA device that cannot satisfy the identity relation.
pub struct SkewedDma;

impl DmaDevice for SkewedDma {
    fn map_identity(&self, pa: PhysAddr, _size: usize) -> Result<PhysAddr, PtError> {
        Ok(pa + 0x1000)
    }

    fn sync_for_device(&self, _pa: PhysAddr, _len: usize) {}

    fn unmap(&self, _pa: PhysAddr, _size: usize) {}
}

pub fn flush() -> Box<DummyFlush> {
    Box::new(DummyFlush::new())
}
