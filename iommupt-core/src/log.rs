//! Engine logging subsystem
//!
//! Lock-free ring-buffer logging that works in a `no_std` environment. The
//! buffer can be fetched by an external monitoring agent without stopping
//! the engine.
//!
//! • Events are pushed via the `log!` macro which accepts standard
//!   `format!` syntax.
//! • The ring buffer is 16 KiB and overwrites old data when full.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};

const LOG_BUF_SIZE: usize = 16 * 1024;

struct LogBuffer(UnsafeCell<[u8; LOG_BUF_SIZE]>);

// Concurrent byte stores into distinct ring positions; same-slot races only
// garble that slot of the log.
unsafe impl Sync for LogBuffer {}

static LOG_BUFFER: LogBuffer = LogBuffer(UnsafeCell::new([0; LOG_BUF_SIZE]));
static WRITE_POS: AtomicUsize = AtomicUsize::new(0);

/// Internal writer implementing `core::fmt::Write`.
pub struct RingBufferWriter;

impl Write for RingBufferWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            write_byte(b);
        }
        Ok(())
    }
}

#[inline]
fn write_byte(b: u8) {
    let pos = WRITE_POS.fetch_add(1, Ordering::Relaxed) % LOG_BUF_SIZE;
    let base = LOG_BUFFER.0.get().cast::<u8>();
    // SAFETY: `pos` is in bounds and the slot is a plain byte.
    unsafe { base.add(pos).write_volatile(b) };
}

/// Low-level logging macro
#[macro_export]
macro_rules! log {
    ($($arg:tt)*) => {{
        use core::fmt::Write as _;
        let _ = core::fmt::write(&mut $crate::log::RingBufferWriter, format_args!($($arg)*));
        let _ = $crate::log::RingBufferWriter.write_str("\n");
    }};
}

/// Expose the log buffer for external tools (read-only).
pub fn get_buffer() -> &'static [u8; LOG_BUF_SIZE] {
    // SAFETY: readers only observe bytes; torn reads garble the log at worst.
    unsafe { &*LOG_BUFFER.0.get() }
}

#[cfg(test)]
mod tests {
    #[test]
    fn log_lands_in_buffer() {
        log!("top grew to level {}", 3);
        let buf = super::get_buffer();
        let needle = b"top grew";
        assert!(buf.windows(needle.len()).any(|w| w == needle));
    }
}
