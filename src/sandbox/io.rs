//! Host-side sinks for sandboxed `console` output.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::cell::CellId;

/// Tracing target used for script output.
pub const TRACE_TARGET_SCRIPT: &str = "cellbox::script";

/// Marker prefixed to every line of script output.
pub const SCRIPT_MARKER: &str = "[vm]";

/// Severity of a console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives console output from sandboxed code.
pub trait LogSink: Send + Sync {
    /// Record one console call. `cell` is `None` for session-scope code.
    fn log(&self, level: LogLevel, cell: Option<&CellId>, message: &str);
}

/// Forwards script output to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, cell: Option<&CellId>, message: &str) {
        let cell = cell.map(CellId::as_str).unwrap_or("-");
        match level {
            LogLevel::Debug => {
                tracing::debug!(target: TRACE_TARGET_SCRIPT, cell, "{} {}", SCRIPT_MARKER, message)
            }
            LogLevel::Info => {
                tracing::info!(target: TRACE_TARGET_SCRIPT, cell, "{} {}", SCRIPT_MARKER, message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: TRACE_TARGET_SCRIPT, cell, "{} {}", SCRIPT_MARKER, message)
            }
            LogLevel::Error => {
                tracing::error!(target: TRACE_TARGET_SCRIPT, cell, "{} {}", SCRIPT_MARKER, message)
            }
        }
    }
}

/// One captured console call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub level: LogLevel,
    pub cell: Option<CellId>,
    pub message: String,
}

/// A sink that keeps console output in memory.
#[derive(Clone, Debug, Default)]
pub struct CapturedLog {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl CapturedLog {
    /// Create a new empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every captured line.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Captured messages, without level or cell.
    pub fn messages(&self) -> Vec<String> {
        self.lines().into_iter().map(|l| l.message).collect()
    }

    /// Messages logged by one cell.
    pub fn messages_for(&self, cell: &CellId) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| l.cell.as_ref() == Some(cell))
            .map(|l| l.message)
            .collect()
    }

    /// Clear the buffer.
    pub fn clear(&self) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.clear();
        }
    }

    /// Number of captured lines.
    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Check if nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for CapturedLog {
    fn log(&self, level: LogLevel, cell: Option<&CellId>, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(LogLine {
                level,
                cell: cell.cloned(),
                message: message.to_string(),
            });
        }
    }
}
