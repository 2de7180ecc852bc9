//! Kernel log backend
//!
//! Routes the `log` facade to whatever byte sink the platform registers.
//! The console driver is an external collaborator; it hands us a sink at
//! boot and everything above this module just uses `log::info!` and friends.

use core::fmt::{self, Write};

use log::{LevelFilter, Metadata, Record};
use spin::Once;

/// Destination for formatted log bytes.
///
/// Implementations must tolerate being called with interrupts disabled and
/// must not block.
pub trait LogSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static SINK: Once<&'static dyn LogSink> = Once::new();

static LOGGER: KernelLogger = KernelLogger;

/// Maximum formatted length of a single record; longer records are truncated.
const LINE_MAX: usize = 256;

struct KernelLogger;

/// Fixed-size formatting buffer, no heap involved.
struct LineBuf {
    buf: [u8; LINE_MAX],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            buf: [0; LINE_MAX],
            len: 0,
        }
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_MAX - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

impl log::Log for KernelLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        SINK.get().is_some()
    }

    fn log(&self, record: &Record) {
        let Some(sink) = SINK.get() else {
            return;
        };

        let mut line = LineBuf::new();
        let _ = write!(line, "[{:5}] {}\r\n", record.level(), record.args());
        sink.write_bytes(&line.buf[..line.len]);
    }

    fn flush(&self) {}
}

/// Register the platform log sink and enable the `log` facade.
///
/// Called once by the console driver during early boot; later calls keep the
/// first sink.
pub fn init(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
    // set_logger only fails if a logger is already installed, which is fine
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Debug);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn line_buf_truncates() {
        let mut line = LineBuf::new();
        for _ in 0..LINE_MAX {
            line.write_str("ab").unwrap();
        }
        assert_eq!(line.len, LINE_MAX);
    }
}
