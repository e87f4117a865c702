//! Minimal stderr backend for the `log` facade.
//!
//! Library code only uses `log::{error, warn, info, debug, trace}`.
//! Binaries and tests that want output call [`init`] once.
//!
//! # Environment Variables
//!
//! - `XENNET_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//!   (names accepted too). Default: info.
//! - `XENNET_FLUSH_EPRINT=1` - Flush stderr after each record.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Log, Metadata, Record};

use crate::env::env_get_bool;

struct StderrLogger {
    flush: AtomicBool,
}

static LOGGER: StderrLogger = StderrLogger { flush: AtomicBool::new(false) };

/// Parse a level the way `XENNET_LOG_LEVEL` is written.
pub fn parse_level(val: &str) -> Option<LevelFilter> {
    let level = match val.trim().to_ascii_lowercase().as_str() {
        "off" | "0" => LevelFilter::Off,
        "error" | "1" => LevelFilter::Error,
        "warn" | "2" => LevelFilter::Warn,
        "info" | "3" => LevelFilter::Info,
        "debug" | "4" => LevelFilter::Debug,
        "trace" | "5" => LevelFilter::Trace,
        _ => return None,
    };
    Some(level)
}

/// Install the stderr logger. Idempotent: a second call (or another
/// logger already installed) only updates the level.
pub fn init() {
    let level = std::env::var("XENNET_LOG_LEVEL")
        .ok()
        .and_then(|v| parse_level(&v))
        .unwrap_or(LevelFilter::Info);
    LOGGER.flush.store(env_get_bool("XENNET_FLUSH_EPRINT", false), Ordering::Relaxed);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(handle, "[{:<5}] {}: {}", record.level(), record.target(), record.args());
        if self.flush.load(Ordering::Relaxed) {
            let _ = handle.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
