//! Debug-channel logger.
//!
//! Formats `log` records and ships them to the kernel debug channel, so an
//! attached debugger sees runtime diagnostics interleaved with the image
//! notifications. Level comes from `BASERT_LOG_LEVEL` at runtime init.

use core::str::FromStr;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::format;

use log::{LevelFilter, Log, Metadata, Record};

use crate::platform;
use crate::platform::gate::DEBUG_KIND_MESSAGE;

static LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

struct DebugChannelLogger;

static LOGGER: DebugChannelLogger = DebugChannelLogger;

impl Log for DebugChannelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // Records before gate installation have nowhere to go.
        let Some(kernel) = platform::try_kernel() else {
            return;
        };
        let line = format!("{}: {}", record.level(), record.args());
        kernel.debug_report(DEBUG_KIND_MESSAGE, line.as_bytes());
    }

    fn flush(&self) {}
}

/// Install the logger. `level` is the raw `BASERT_LOG_LEVEL` value if the
/// environment carries one. Installation is idempotent.
pub fn init(level: Option<&str>) {
    let filter = level
        .and_then(|value| LevelFilter::from_str(value).ok())
        .unwrap_or(LevelFilter::Info);
    LEVEL.store(filter as usize, Ordering::Relaxed);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    } else {
        log::error!("logger already installed");
    }
}
