//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details.
//!
//! The runtime logs through the `log` facade. This module provides a
//! minimal stderr backend so binaries and tests get leveled output without
//! pulling in a logging framework:
//!
//! ```no_run
//! corio::log::init();
//! log::info!("runtime up");
//! ```

use std::io::Write;

use log::{LevelFilter, Log, Metadata, Record};

use crate::clock;

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait
/// implementation writing one line per record to stderr.
pub struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    #[inline(always)]
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let ms = clock::wall_ms();
        // Single write call so concurrent workers don't interleave lines.
        let line = format!(
            "[{}.{:03}] {:5} {}: {}\n",
            ms / 1000,
            ms % 1000,
            record.level(),
            record.target(),
            record.args()
        );
        let _ = std::io::stderr().write_all(line.as_bytes());
    }

    #[inline(always)]
    fn flush(&self) {}
}

/// Installs the stderr logger with the `Info` level. Safe to call more
/// than once; only the first call takes effect.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

/// Installs the stderr logger with an explicit level filter.
pub fn init_with_level(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
