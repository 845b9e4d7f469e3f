//! `log` backend writing one line per record to COM1.

use log::{Level, Metadata, Record};

use crate::config::LOG_LEVEL;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= LOG_LEVEL
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        crate::serial_println!("[{}] {}: {}", level, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Installs the serial logger. Only the first call has an effect.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LOG_LEVEL);
    }
}
