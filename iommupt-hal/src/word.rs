//! Descriptor word access
//!
//! Hardware walkers read table entries concurrently with our updates, so
//! every descriptor access goes through this trait: acquire loads, release
//! stores, and a compare-exchange used to publish freshly built child tables.

use core::fmt::Debug;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// A raw table entry word: `u32` for short-descriptor formats, `u64` for
/// everything else.
pub trait TableWord: Copy + Eq + Debug + Send + Sync + 'static {
    /// log2 of the word size in bytes (2 or 3)
    const LG2SZ: u8;

    /// The empty (non-present) descriptor. All supported formats clear to 0.
    const ZERO: Self;

    /// # Safety
    /// `ptr` must point to a live, suitably aligned table entry.
    unsafe fn load_acquire(ptr: *const Self) -> Self;

    /// # Safety
    /// `ptr` must point to a live, suitably aligned table entry.
    unsafe fn store_release(ptr: *mut Self, val: Self);

    /// Publish `new` if the entry still holds `old`. Returns `false` when the
    /// entry changed under us (a concurrent walker won the race).
    ///
    /// # Safety
    /// `ptr` must point to a live, suitably aligned table entry.
    unsafe fn cmpxchg_release(ptr: *mut Self, old: Self, new: Self) -> bool;

    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl TableWord for u64 {
    const LG2SZ: u8 = 3;
    const ZERO: Self = 0;

    #[inline]
    unsafe fn load_acquire(ptr: *const Self) -> Self {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe { (*ptr.cast::<AtomicU64>()).load(Ordering::Acquire) }
    }

    #[inline]
    unsafe fn store_release(ptr: *mut Self, val: Self) {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe { (*ptr.cast::<AtomicU64>()).store(val, Ordering::Release) }
    }

    #[inline]
    unsafe fn cmpxchg_release(ptr: *mut Self, old: Self, new: Self) -> bool {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe {
            (*ptr.cast::<AtomicU64>())
                .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        }
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits
    }
}

impl TableWord for u32 {
    const LG2SZ: u8 = 2;
    const ZERO: Self = 0;

    #[inline]
    unsafe fn load_acquire(ptr: *const Self) -> Self {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe { (*ptr.cast::<AtomicU32>()).load(Ordering::Acquire) }
    }

    #[inline]
    unsafe fn store_release(ptr: *mut Self, val: Self) {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe { (*ptr.cast::<AtomicU32>()).store(val, Ordering::Release) }
    }

    #[inline]
    unsafe fn cmpxchg_release(ptr: *mut Self, old: Self, new: Self) -> bool {
        // SAFETY: caller guarantees `ptr` is a live aligned entry.
        unsafe {
            (*ptr.cast::<AtomicU32>())
                .compare_exchange(old, new, Ordering::Release, Ordering::Relaxed)
                .is_ok()
        }
    }

    #[inline]
    fn to_bits(self) -> u64 {
        self as u64
    }

    #[inline]
    fn from_bits(bits: u64) -> Self {
        bits as u32
    }
}
