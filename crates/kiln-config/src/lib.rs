#![warn(missing_docs)]

//! # kiln-config
//!
//! Configuration loading for the Kiln script execution engine.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! workspace_root = "/var/lib/kiln/workspace"
//!
//! [engine]
//! default_timeout_secs = 30
//! max_heap_mb = 64
//! max_code_kb = 256
//!
//! [dispatch]
//! invoke_url = "http://127.0.0.1:7311/internal/tools/invoke"
//! search_url = "http://127.0.0.1:7311/internal/tools/search"
//! ```
//!
//! The `[dispatch]` section is optional: when absent, the embedding host is
//! expected to wire an in-process dispatch target instead.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Kiln configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KilnConfig {
    /// Root of the pre-generated tool wrapper workspace.
    pub workspace_root: PathBuf,

    /// Engine execution settings.
    #[serde(default)]
    pub engine: EngineOverrides,

    /// HTTP dispatch target endpoints. Absent means in-process dispatch.
    #[serde(default)]
    pub dispatch: Option<DispatchConfig>,
}

/// Engine setting overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineOverrides {
    /// Default execution timeout in seconds, applied when a request carries
    /// no timeout of its own.
    #[serde(default)]
    pub default_timeout_secs: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum submitted code size in kilobytes.
    #[serde(default)]
    pub max_code_kb: Option<usize>,
}

/// HTTP dispatch target endpoints, fixed for the process lifetime.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Endpoint for tool invocation (`POST`, JSON body).
    pub invoke_url: String,

    /// Endpoint for tool search (`POST`, JSON body).
    pub search_url: String,
}

impl KilnConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: KilnConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("workspace_root is empty".into()));
        }
        if let Some(dispatch) = &self.dispatch {
            for (label, raw) in [
                ("invoke_url", &dispatch.invoke_url),
                ("search_url", &dispatch.search_url),
            ] {
                let parsed = url::Url::parse(raw).map_err(|e| {
                    ConfigError::Invalid(format!("{label} '{raw}' is not a valid URL: {e}"))
                })?;
                if parsed.scheme() != "http" && parsed.scheme() != "https" {
                    return Err(ConfigError::Invalid(format!(
                        "{label} must use http or https, got '{}'",
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
