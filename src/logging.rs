//! The injected `Logger` trait spec.md §9 asks for, alongside the
//! other platform-overridable subsystems. Most integrations never
//! implement this: the crate's own internals always emit `tracing`
//! spans/events directly (instrumented work ticks, deployment state
//! transitions, codec decode failures), and [`TracingLogger`] is the
//! default bridge for platforms that want a `Logger` handle without
//! replacing the global subscriber.
//!
//! A platform with no `tracing` sink of its own (e.g. routing log
//! lines to a UART console on the MCU) implements [`Logger`] instead
//! and installs it via whatever wiring the platform integration uses;
//! this crate does not call through `Logger` itself.

/// Severity levels mirroring `tracing`'s, kept separate so `Logger`
/// implementors don't need a `tracing` dependency of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Platform log sink boundary (spec.md §9).
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// Default [`Logger`] that forwards to the global `tracing`
/// dispatcher, so most integrations need not implement anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warn => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLogger {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: Level, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn default_methods_tag_the_right_level() {
        let logger = RecordingLogger::default();
        logger.debug("d");
        logger.info("i");
        logger.warn("w");
        logger.error("e");
        let lines = logger.lines.lock().unwrap();
        assert_eq!(
            *lines,
            vec![
                (Level::Debug, "d".to_string()),
                (Level::Info, "i".to_string()),
                (Level::Warn, "w".to_string()),
                (Level::Error, "e".to_string()),
            ]
        );
    }

    #[test]
    fn tracing_logger_does_not_panic() {
        let logger = TracingLogger;
        logger.info("hello from the demo binary");
    }
}
