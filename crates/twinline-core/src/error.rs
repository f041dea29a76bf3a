// ── Core error types ──
//
// Every failure a command, an ingestion or an action invocation can
// surface. Errors are `Clone` so a single outcome can be fanned out to
// batch members and dependent commands without re-wrapping.

use thiserror::Error;

use crate::value::ValueKind;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CoreError {
    // ── Input errors ─────────────────────────────────────────────────
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Cannot convert {value} to {kind}")]
    ValueConversion { kind: ValueKind, value: String },

    // ── Model errors ─────────────────────────────────────────────────
    #[error("Model conflict at {path}: {message}")]
    ModelConflict { path: String, message: String },

    #[error("Not found: {path}")]
    NotFound { path: String },

    // ── Command errors ───────────────────────────────────────────────
    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Command panicked: {message}")]
    CommandPanicked { message: String },

    #[error("Command has already been submitted")]
    AlreadyExecuted,

    #[error("Engine misuse: {message}")]
    EngineMisuse { message: String },

    #[error("Gateway is shutting down")]
    ShuttingDown,

    // ── Handler errors ───────────────────────────────────────────────
    #[error("No suitable handler for {path}")]
    NoSuitableHandler { path: String },

    #[error("Handler for {path} failed: {message}")]
    ActionFailed { path: String, message: String },

    #[error("Handler for {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
}

impl CoreError {
    /// Shorthand for a user-level command failure.
    pub fn command(message: impl Into<String>) -> Self {
        Self::CommandFailed {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn conflict(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModelConflict {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }
}
