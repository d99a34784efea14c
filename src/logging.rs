//! Injected logging.
//!
//! Every component takes an `Arc<dyn Logger>` at construction instead of
//! reaching for global state. The default [`LogFacade`] forwards records to
//! the [`log`](https://crates.io/crates/log) crate so applications keep using
//! whatever `log` backend they already install; [`MemoryLogger`] keeps records
//! in memory so tests can inspect them.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use stillframe::{Logger, MemoryLogger};
//!
//! let logger = Arc::new(MemoryLogger::new());
//! logger.log(log::Level::Info, "batch finished", &[("processed", "3".to_string())]);
//! assert!(logger.contains("batch finished"));
//! ```

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use log::Level;

/// Structured key/value context attached to a log record.
pub type LogContext<'a> = &'a [(&'static str, String)];

/// Destination for diagnostic records emitted by the crate.
///
/// Implementations must be [`Send`] and [`Sync`]; a single logger is shared
/// by every component built from one configuration.
pub trait Logger: Send + Sync {
    /// Record a message at `level` with structured context.
    fn log(&self, level: Level, message: &str, context: LogContext<'_>);
}

/// Forwards records to the `log` facade under the `stillframe` target.
///
/// Context pairs are rendered as trailing `key=value` tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogFacade;

impl Logger for LogFacade {
    fn log(&self, level: Level, message: &str, context: LogContext<'_>) {
        if !log::log_enabled!(target: "stillframe", level) {
            return;
        }
        log::log!(target: "stillframe", level, "{}", render(message, context));
    }
}

/// A captured log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity.
    pub level: Level,
    /// Message text without context.
    pub message: String,
    /// Context pairs in emission order.
    pub context: Vec<(String, String)>,
}

/// Logger that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records captured so far.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// Returns `true` if any record's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|record| record.message.contains(needle))
    }

    /// Number of records captured at exactly `level`.
    pub fn count_at(&self, level: Level) -> usize {
        self.records()
            .iter()
            .filter(|record| record.level == level)
            .count()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, level: Level, message: &str, context: LogContext<'_>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                level,
                message: message.to_string(),
                context: context
                    .iter()
                    .map(|(key, value)| ((*key).to_string(), value.clone()))
                    .collect(),
            });
        }
    }
}

/// The logger used when none is supplied.
pub fn default_logger() -> Arc<dyn Logger> {
    Arc::new(LogFacade)
}

/// Render a message and its context on one line.
pub fn render(message: &str, context: LogContext<'_>) -> String {
    let mut line = message.to_string();
    for (key, value) in context {
        let _ = write!(line, " {key}={value}");
    }
    line
}
