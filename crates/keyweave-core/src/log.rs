//! User-facing run log.
//!
//! The executor reports progress as a stream of [`LogEntry`] values sent to
//! an optional [`LogSink`]. Every entry is mirrored to `tracing` so that a
//! run without a sink still leaves a trace in the diagnostic log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Receiving end handed to [`MacroExecutor::execute`](crate::executor::MacroExecutor::execute).
pub type LogSink = UnboundedSender<LogEntry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// A command line about to be dispatched, after substitution.
    Command,
    /// Output of an `echo` command.
    Echo,
    Info,
    Warn,
    Error,
    Debug,
}

/// A single line of run output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Source line the entry refers to, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, line: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            line,
            message: message.into(),
        }
    }
}

/// Wraps an optional sink and mirrors every entry to `tracing`.
///
/// A closed receiver is not an error: the run keeps going and only the
/// `tracing` copy remains.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    sink: Option<LogSink>,
}

impl RunLog {
    pub fn new(sink: Option<LogSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, level: LogLevel, line: Option<usize>, message: impl Into<String>) {
        let entry = LogEntry::new(level, line, message);
        match level {
            LogLevel::Command | LogLevel::Echo | LogLevel::Info => {
                info!(line = entry.line, level = ?level, "{}", entry.message)
            }
            LogLevel::Warn => warn!(line = entry.line, "{}", entry.message),
            LogLevel::Error => error!(line = entry.line, "{}", entry.message),
            LogLevel::Debug => debug!(line = entry.line, "{}", entry.message),
        }
        if let Some(sink) = &self.sink {
            let _ = sink.send(entry);
        }
    }

    pub fn command(&self, line: usize, text: &str) {
        self.emit(LogLevel::Command, Some(line), text);
    }

    pub fn echo(&self, line: usize, message: impl Into<String>) {
        self.emit(LogLevel::Echo, Some(line), message);
    }

    pub fn info(&self, line: Option<usize>, message: impl Into<String>) {
        self.emit(LogLevel::Info, line, message);
    }

    pub fn warn(&self, line: Option<usize>, message: impl Into<String>) {
        self.emit(LogLevel::Warn, line, message);
    }

    pub fn error(&self, line: Option<usize>, message: impl Into<String>) {
        self.emit(LogLevel::Error, line, message);
    }

    pub fn debug(&self, line: Option<usize>, message: impl Into<String>) {
        self.emit(LogLevel::Debug, line, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_entries_reach_the_sink() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let log = RunLog::new(Some(tx));
        log.echo(3, "hello");
        log.warn(None, "careful");

        let first = rx.try_recv().unwrap();
        assert_eq!(first.level, LogLevel::Echo);
        assert_eq!(first.line, Some(3));
        assert_eq!(first.message, "hello");
        assert_eq!(rx.try_recv().unwrap().level, LogLevel::Warn);
    }

    #[test]
    fn test_closed_sink_is_ignored() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        RunLog::new(Some(tx)).error(Some(1), "nobody listening");
        RunLog::default().info(None, "no sink at all");
    }

    #[test]
    fn test_entry_serializes_level_in_snake_case() {
        let entry = LogEntry::new(LogLevel::Echo, None, "hi");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["level"], "echo");
        assert!(json.get("line").is_none());
    }
}
