//! Logging backend: timestamped, prefixed diagnostics on stderr, with
//! error-level records forwarded to the persistent error log.

use crate::{env, errlog};
use log::{Level, LevelFilter, Log, Metadata, Record};

struct PcdLogger;

static LOGGER: PcdLogger = PcdLogger;

impl Log for PcdLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = format!("{}", record.args());
        if record.level() == Level::Error {
            errlog::append(&message);
        }
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        let level = match record.level() {
            Level::Error => "error:",
            Level::Warn => "warning:",
            _ => "",
        };
        if level.is_empty() {
            eprintln!("{timestamp} pcd: {message}");
        } else {
            eprintln!("{timestamp} pcd: {level} {message}");
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(*env::PCD_LOG);
    }
}

/// Raise the log level; used by the `-v` flag.
pub fn set_verbose() {
    if log::max_level() < LevelFilter::Debug {
        log::set_max_level(LevelFilter::Debug);
    }
}
