//! Colored stderr backend for the `log` facade.
//!
//! Each record carries the id of the processor that produced it, so
//! interleaved output from several kernel threads stays attributable. The
//! level filter comes from `WEFT_LOG` (error/warn/info/debug/trace/off).

use std::io::Write;

use log::{Level, LevelFilter, Log};
use owo_colors::OwoColorize;

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = record.level();
        let level_tag = match level {
            Level::Error => "ERROR".bright_red().to_string(),
            Level::Warn => "WARN ".bright_yellow().to_string(),
            Level::Info => "INFO ".bright_blue().to_string(),
            Level::Debug => "DEBUG".bright_cyan().to_string(),
            Level::Trace => "TRACE".bright_magenta().to_string(),
        };
        let origin = match crate::local::kernel_id() {
            Some(id) => format!("[P{id:02}]"),
            None => "[--]".to_string(),
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(
            err,
            "{level_tag} {} {}",
            origin.dimmed(),
            record.args()
        );
    }

    fn flush(&self) {}
}

fn level_from_env() -> LevelFilter {
    match std::env::var("WEFT_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("info") => LevelFilter::Info,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        Ok("off") => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}

/// Install the logger. Safe to call more than once; later calls only adjust
/// the level filter.
pub fn init() {
    init_with_level(level_from_env());
}

pub fn init_with_level(level: LevelFilter) {
    log::set_max_level(level);
    let _ = log::set_logger(&LOGGER);
}
