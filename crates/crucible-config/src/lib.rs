#![warn(missing_docs)]

//! # crucible-config
//!
//! Configuration loading for the crucible eval server.
//!
//! Everything is optional: a missing file, a missing section, and a missing
//! key all fall through to the CLI flags and then to built-in defaults.
//!
//! ## Example
//!
//! ```toml
//! [server]
//! port = 1101
//! threads = 8
//!
//! [sandbox]
//! max_heap_mb = 64
//! default_timeout_ms = 10
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrucibleConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerOverrides,

    /// Sandbox limits.
    #[serde(default)]
    pub sandbox: SandboxOverrides,
}

/// Listener overrides; unset fields fall back to CLI flags, then defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerOverrides {
    /// Port to listen on.
    #[serde(default)]
    pub port: Option<u16>,

    /// Worker thread count.
    #[serde(default)]
    pub threads: Option<usize>,
}

/// Sandbox limit overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// V8 heap cap in MiB.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Budget for requests without a `timeout` field, in milliseconds.
    #[serde(default)]
    pub default_timeout_ms: Option<u32>,
}

impl CrucibleConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: CrucibleConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.threads == Some(0) {
            return Err(ConfigError::Invalid(
                "server.threads must be at least 1".into(),
            ));
        }
        if self.sandbox.max_heap_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be at least 1".into(),
            ));
        }
        if self.sandbox.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.default_timeout_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// Search order:
/// 1. `CRUCIBLE_CONFIG` environment variable
/// 2. `./crucible.toml` in the current directory
/// 3. None (no config file found — not an error)
pub fn find_config_file() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CRUCIBLE_CONFIG") {
        let p = PathBuf::from(path);
        if p.exists() {
            return Some(p);
        }
    }

    let cwd = PathBuf::from("crucible.toml");
    if cwd.exists() {
        return Some(cwd);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_parses_to_defaults() {
        let config = CrucibleConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, None);
        assert_eq!(config.server.threads, None);
        assert_eq!(config.sandbox.max_heap_mb, None);
        assert_eq!(config.sandbox.default_timeout_ms, None);
    }

    #[test]
    fn full_config_parses() {
        let config = CrucibleConfig::from_toml(
            r#"
            [server]
            port = 9000
            threads = 4

            [sandbox]
            max_heap_mb = 32
            default_timeout_ms = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, Some(9000));
        assert_eq!(config.server.threads, Some(4));
        assert_eq!(config.sandbox.max_heap_mb, Some(32));
        assert_eq!(config.sandbox.default_timeout_ms, Some(25));
    }

    #[test]
    fn partial_sections_are_fine() {
        let config = CrucibleConfig::from_toml("[server]\nport = 1101\n").unwrap();
        assert_eq!(config.server.port, Some(1101));
        assert_eq!(config.server.threads, None);
    }

    #[test]
    fn zero_threads_is_rejected() {
        let err = CrucibleConfig::from_toml("[server]\nthreads = 0\n").unwrap_err();
        assert!(err.to_string().contains("threads"));
    }

    #[test]
    fn zero_heap_is_rejected() {
        let err = CrucibleConfig::from_toml("[sandbox]\nmax_heap_mb = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_heap_mb"));
    }

    #[test]
    fn zero_default_timeout_is_rejected() {
        let err = CrucibleConfig::from_toml("[sandbox]\ndefault_timeout_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("default_timeout_ms"));
    }

    #[test]
    fn bad_toml_is_a_parse_error() {
        let err = CrucibleConfig::from_toml("server = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
