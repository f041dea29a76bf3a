//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` variants into user-facing errors
//! with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use twinline_config::ConfigError;
use twinline_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const NOT_FOUND: i32 = 4;
    pub const CONFLICT: i32 = 6;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Twin ─────────────────────────────────────────────────────────

    #[error("'{path}' not found in the twin")]
    #[diagnostic(
        code(twinline::not_found),
        help("Run: twinline replay <FILE> --output plain to list known providers")
    )]
    NotFound { path: String },

    #[error("Model conflict at {path}: {message}")]
    #[diagnostic(code(twinline::conflict))]
    Conflict { path: String, message: String },

    #[error("Gateway error: {message}")]
    #[diagnostic(code(twinline::gateway))]
    Gateway { message: String },

    // ── Validation ───────────────────────────────────────────────────

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(twinline::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Configuration file not found")]
    #[diagnostic(
        code(twinline::no_config),
        help(
            "Check the --config path or TWINLINE_CONFIG.\n\
             Looked at: {path}"
        )
    )]
    NoConfig { path: String },

    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(twinline::config),
        help("Run: twinline config show to see the effective configuration")
    )]
    Config { message: String },

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render JSON: {0}")]
    #[diagnostic(code(twinline::json))]
    Json(#[from] serde_json::Error),

    #[error("Failed to render YAML: {0}")]
    #[diagnostic(code(twinline::yaml))]
    Yaml(#[from] serde_yaml::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } | Self::NoConfig { .. } => exit_code::NOT_FOUND,
            Self::Conflict { .. } => exit_code::CONFLICT,
            Self::Validation { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── ConfigError → CliError mapping ───────────────────────────────────

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NotFound { path } => CliError::NoConfig {
                path: path.display().to_string(),
            },
            ConfigError::Validation { field, reason } => CliError::Validation { field, reason },
            other => CliError::Config {
                message: other.to_string(),
            },
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { path } | CoreError::NoSuitableHandler { path } => {
                CliError::NotFound { path }
            }

            CoreError::ModelConflict { path, message } => CliError::Conflict { path, message },

            CoreError::InvalidInput { message } => CliError::Validation {
                field: "update".into(),
                reason: message,
            },

            CoreError::ValueConversion { .. } => CliError::Validation {
                field: "value".into(),
                reason: err.to_string(),
            },

            other => CliError::Gateway {
                message: other.to_string(),
            },
        }
    }
}
