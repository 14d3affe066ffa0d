//! Error types for the cell sandbox.

use thiserror::Error;

/// Errors that can occur while evaluating cells.
///
/// Errors raised by sandboxed code never escape as host failures: they are
/// carried in the `Err` arm of an [`ExecutionResult`] and handed to the
/// cell's subscribers.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The session was disposed before or during the operation.
    #[error("sandbox session is closed")]
    SessionClosed,

    /// Sandboxed code threw.
    #[error("{name}: {message}")]
    EvaluationThrew {
        /// The error name (e.g. "TypeError", "ReferenceError").
        name: String,
        /// The error message.
        message: String,
        /// The interpreter stack trace, if one was attached.
        stack: Option<String>,
    },

    /// The evaluation produced a value with no host representation.
    #[error("result could not be converted: {0}")]
    MaterializationFailed(String),

    /// A deferred action was invoked after its owning cell re-ran or was disposed.
    #[error("deferred action was released")]
    ActionReleased,

    /// No cell with this identifier is mounted.
    #[error("unknown cell: {0}")]
    UnknownCell(String),

    /// A cell with this identifier is already mounted.
    #[error("cell already mounted: {0}")]
    DuplicateCell(String),

    /// Failed to start the interpreter.
    #[error("failed to initialize runtime: {0}")]
    RuntimeInit(#[source] anyhow::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Build an `EvaluationThrew` from its parts.
    pub fn threw(name: impl Into<String>, message: impl Into<String>, stack: Option<String>) -> Self {
        SandboxError::EvaluationThrew {
            name: name.into(),
            message: message.into(),
            stack: stack.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Check if the session was closed.
    pub fn is_session_closed(&self) -> bool {
        matches!(self, SandboxError::SessionClosed)
    }

    /// Check if this error was thrown by sandboxed code.
    pub fn is_thrown(&self) -> bool {
        matches!(self, SandboxError::EvaluationThrew { .. })
    }

    /// Check if this error comes from value conversion.
    pub fn is_materialization(&self) -> bool {
        matches!(self, SandboxError::MaterializationFailed(_))
    }

    /// The message a presentation layer should render inline at the cell.
    pub fn message(&self) -> String {
        match self {
            SandboxError::EvaluationThrew { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threw_display() {
        let err = SandboxError::threw("TypeError", "x is not a function", None);
        assert_eq!(err.to_string(), "TypeError: x is not a function");
        assert_eq!(err.message(), "x is not a function");
        assert!(err.is_thrown());
    }

    #[test]
    fn test_blank_stack_is_dropped() {
        let err = SandboxError::threw("Error", "boom", Some("  \n".to_string()));
        if let SandboxError::EvaluationThrew { stack, .. } = err {
            assert!(stack.is_none());
        } else {
            panic!("Expected EvaluationThrew");
        }
    }

    #[test]
    fn test_error_helpers() {
        let closed = SandboxError::SessionClosed;
        assert!(closed.is_session_closed());
        assert!(!closed.is_thrown());
        assert_eq!(closed.message(), "sandbox session is closed");

        let conv = SandboxError::MaterializationFailed("NaN".to_string());
        assert!(conv.is_materialization());
        assert!(!conv.is_session_closed());
    }
}
