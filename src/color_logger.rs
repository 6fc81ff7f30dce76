use std::io::{self, Write};

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

/// Stderr logger with colored level prefixes; warnings and errors stand out,
/// debug output only appears with --verbose.
pub struct ColorLogger {
    max_level: LevelFilter,
}

impl ColorLogger {
    pub fn new(verbose: bool) -> Self {
        Self {
            max_level: if verbose {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            },
        }
    }

    pub fn init(self) {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self)).expect("logger already initialized");
    }
}

impl Log for ColorLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => eprintln!(
                "{} {}",
                "[ERROR]".red().bold(),
                format!("{}", record.args()).red().bold()
            ),
            Level::Warn => eprintln!(
                "{} {}",
                "[WARN]".yellow().bold(),
                format!("{}", record.args()).yellow()
            ),
            Level::Info => eprintln!("{}", record.args()),
            _ => eprintln!("{} {}", "[DEBUG]".blue(), record.args()),
        }
        self.flush();
    }

    fn flush(&self) {
        io::stderr().flush().ok();
    }
}
