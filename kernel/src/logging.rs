//! `log` backend writing to the serial console.
//!
//! Records from interrupt handlers and from processes interleave on one
//! port, so each line is written whole with interrupts disabled. The level
//! is `Debug` in debug builds and `Info` in release builds.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

pub static LOGGER: Logger = Logger::new();

#[cfg(debug_assertions)]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

pub struct Logger {
    line: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            line: Mutex::new(()),
        }
    }

    fn write_line(&self, record: &Record) {
        let _line = self.line.lock();
        crate::serial_println!(
            "[{:<5}] {}: {}",
            record.level(),
            short_target(record.target()),
            record.args()
        );
    }
}

/// `pebble::memory::heap` becomes `memory::heap`.
fn short_target(target: &str) -> &str {
    match target.split_once("::") {
        Some((_, rest)) => rest,
        None => target,
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        #[cfg(target_os = "none")]
        crate::arch::without_interrupts(&crate::arch::x86::CPU, || self.write_line(record));

        #[cfg(not(target_os = "none"))]
        self.write_line(record);
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`]. Later calls only reset the level.
pub fn init() {
    set_level(DEFAULT_LEVEL);
    if log::set_logger(&LOGGER).is_err() {
        log::debug!("logger already installed");
    }
}

pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_drop_the_crate_name() {
        assert_eq!(short_target("pebble::memory::heap"), "memory::heap");
        assert_eq!(short_target("pebble"), "pebble");
    }

    #[test]
    fn init_twice_keeps_the_logger() {
        init();
        init();
        assert_eq!(log::max_level(), DEFAULT_LEVEL);
        log::info!("logger installed");
    }
}
