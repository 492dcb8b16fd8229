//! Run loggers.
//!
//! The updater core is polymorphic over a small logging capability so that
//! the binary can print filtered lines to the console while embedders can
//! capture the full log of a run and hand it back alongside any error.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for Level {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            _ => Err(()),
        }
    }
}

/// Logging capability required by the updater core.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, msg: &str);

    fn debug(&self, msg: &str) {
        self.log(Level::Debug, msg);
    }
    fn info(&self, msg: &str) {
        self.log(Level::Info, msg);
    }
    fn warn(&self, msg: &str) {
        self.log(Level::Warn, msg);
    }
    fn error(&self, msg: &str) {
        self.log(Level::Error, msg);
    }
}

/// Console logger. Forwards to the `tracing` macros; the binary installs a
/// subscriber whose filter decides what actually reaches the terminal.
pub struct ConsoleLogger;

impl Logger for ConsoleLogger {
    fn log(&self, level: Level, msg: &str) {
        match level {
            Level::Debug => tracing::debug!("{}", msg),
            Level::Info => tracing::info!("{}", msg),
            Level::Warn => tracing::warn!("{}", msg),
            Level::Error => tracing::error!("{}", msg),
        }
    }
}

/// Logger that retains every line in emission order. Used by
/// [`run_once`](crate::updater::run_once) so a failed run's log can be
/// returned together with the error.
#[derive(Default)]
pub struct CapturingLogger {
    lines: Mutex<Vec<(Level, String)>>,
}

impl CapturingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All lines logged so far.
    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Logger for CapturingLogger {
    fn log(&self, level: Level, msg: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((level, msg.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    #[test]
    fn test_level_from_str() {
        assert_eq!("warn".parse(), Ok(Level::Warn));
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn test_capturing_logger_order() {
        let logger = CapturingLogger::new();
        logger.debug("first");
        logger.error("second");
        assert_eq!(
            logger.lines(),
            vec![
                (Level::Debug, "first".to_string()),
                (Level::Error, "second".to_string()),
            ]
        );
    }
}
