//! Configuration for the twinline gateway.
//!
//! Layered loading (defaults, TOML file, `TWINLINE_*` environment) and
//! translation to `twinline_core::GatewayConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use twinline_core::GatewayConfig;

/// Environment prefix; nested keys are separated by `__`, e.g.
/// `TWINLINE_GATEWAY__ADMIN_SERVICE=false`.
pub const ENV_PREFIX: &str = "TWINLINE_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[gateway]` table. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub notification_capacity: usize,
    pub package_uri_prefix: String,
    pub admin_service: bool,
    /// `0` disables the limit.
    pub action_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub queue_warn_threshold: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        let runtime = GatewayConfig::default();
        Self {
            notification_capacity: runtime.notification_capacity,
            package_uri_prefix: runtime.package_uri_prefix,
            admin_service: runtime.admin_service,
            action_timeout_ms: runtime.action_timeout.map_or(0, millis),
            shutdown_timeout_ms: millis(runtime.shutdown_timeout),
            queue_warn_threshold: runtime.queue_warn_threshold,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `[logging]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".into(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.notification_capacity == 0 {
            return Err(invalid("gateway.notification_capacity", "must be at least 1"));
        }
        if self.gateway.queue_warn_threshold == 0 {
            return Err(invalid("gateway.queue_warn_threshold", "must be at least 1"));
        }
        let level = self.logging.level.to_ascii_lowercase();
        if !LEVELS.contains(&level.as_str()) {
            return Err(invalid(
                "logging.level",
                format!("expected one of {}, got '{}'", LEVELS.join(", "), self.logging.level),
            ));
        }
        Ok(())
    }

    /// Runtime configuration for `Gateway::start`.
    pub fn gateway_config(&self) -> Result<GatewayConfig, ConfigError> {
        self.validate()?;
        let gateway = &self.gateway;
        Ok(GatewayConfig {
            notification_capacity: gateway.notification_capacity,
            package_uri_prefix: gateway.package_uri_prefix.clone(),
            admin_service: gateway.admin_service,
            action_timeout: (gateway.action_timeout_ms > 0)
                .then(|| Duration::from_millis(gateway.action_timeout_ms)),
            shutdown_timeout: Duration::from_millis(gateway.shutdown_timeout_ms),
            queue_warn_threshold: gateway.queue_warn_threshold,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "twinline", "twinline").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("twinline");
    p
}

// ── Config loading ──────────────────────────────────────────────────

/// Load and validate the config. An explicit `path` must exist; the
/// default location is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let file = match path {
        Some(path) if !path.exists() => {
            return Err(ConfigError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Some(path) => path.to_path_buf(),
        None => config_path(),
    };

    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(&file))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;
    use tempfile::NamedTempFile;

    use super::*;

    fn write(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_runtime_defaults() {
        assert_eq!(
            Config::default().gateway_config().unwrap(),
            GatewayConfig::default()
        );
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let file = write(
            r#"
            [gateway]
            admin_service = false
            action_timeout_ms = 0

            [logging]
            format = "json"
            "#,
        );

        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "warn");

        let runtime = config.gateway_config().unwrap();
        assert!(!runtime.admin_service);
        assert_eq!(runtime.action_timeout, None);
        assert_eq!(runtime.notification_capacity, 1024);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config(Some(&missing)).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { path } if path == missing));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let file = write("[gateway]\nnotification_capacity = 0\n");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(
            matches!(&err, ConfigError::Validation { field, .. } if field == "gateway.notification_capacity"),
            "got {err:?}"
        );
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation { field, .. }) if field == "logging.level"
        ));
    }

    #[test]
    fn malformed_toml_is_a_load_error() {
        let file = write("[gateway\nadmin_service = ");
        let err = load_config(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Figment(_)));
    }

    #[test]
    fn rendered_toml_loads_back() {
        let mut config = Config::default();
        config.gateway.package_uri_prefix = "urn:test:".into();
        let file = write(&config.to_toml().unwrap());
        assert_eq!(load_config(Some(file.path())).unwrap(), config);
    }
}
