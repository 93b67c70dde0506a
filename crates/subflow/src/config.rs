// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading and validation.
//!
//! [`SubflowConfig`] holds the settings shared by every process a program
//! starts: logging verbosity, environment inheritance, working directory and
//! the default close timeout. It is read from an optional TOML file and then
//! overridden from `SUBFLOW_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::command::ProcessOptions;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// The close timeout is unusually large.
    LargeTimeout {
        /// Timeout in milliseconds.
        millis: u64,
    },
    /// The configured working directory does not exist (yet).
    MissingWorkingDir {
        /// Configured path.
        path: PathBuf,
    },
    /// Children start from an empty environment.
    EmptyEnvironment,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeTimeout { millis } => {
                write!(f, "close timeout is unusually large ({millis}ms)")
            }
            ConfigWarning::MissingWorkingDir { path } => {
                write!(f, "working directory '{}' does not exist", path.display())
            }
            ConfigWarning::EmptyEnvironment => {
                f.write_str("inherit_env is false: children will not see PATH or HOME")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Settings applied to every subprocess started by a program.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SubflowConfig {
    /// Log level override (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Whether children inherit the caller's environment.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: bool,

    /// Working directory for children.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Grace period between the stop request and a forced kill.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_timeout_ms: Option<u64>,
}

fn default_inherit_env() -> bool {
    true
}

impl Default for SubflowConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".into()),
            inherit_env: true,
            working_dir: None,
            close_timeout_ms: None,
        }
    }
}

impl SubflowConfig {
    /// Process options derived from this configuration.
    pub fn process_options(&self) -> ProcessOptions {
        ProcessOptions {
            inherit_env: self.inherit_env,
            working_dir: self.working_dir.clone(),
        }
    }

    /// Close timeout, zero (kill after [`STOP_GRACE`](crate::STOP_GRACE)) when unset.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms.unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum allowed close timeout (1 hour).
const MAX_CLOSE_TIMEOUT_MS: u64 = 3_600_000;

/// Threshold above which a close timeout generates a warning.
const LARGE_CLOSE_TIMEOUT_MS: u64 = 60_000;

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`SubflowConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file.
/// * If `path` is `None`, returns [`SubflowConfig::default()`].
///
/// Environment variable overrides are applied on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<SubflowConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => SubflowConfig::default(),
    };
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Parse a TOML string into a [`SubflowConfig`].
pub fn parse_toml(content: &str) -> Result<SubflowConfig, ConfigError> {
    toml::from_str::<SubflowConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables:
/// - `SUBFLOW_LOG_LEVEL`
/// - `SUBFLOW_WORKING_DIR`
/// - `SUBFLOW_CLOSE_TIMEOUT_MS` (integer milliseconds)
/// - `SUBFLOW_INHERIT_ENV` (`true`/`false`/`1`/`0`)
pub fn apply_env_overrides(config: &mut SubflowConfig) -> Result<(), ConfigError> {
    apply_overrides(config, |key| std::env::var(key).ok())
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_overrides<F>(config: &mut SubflowConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("SUBFLOW_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Some(val) = lookup("SUBFLOW_WORKING_DIR") {
        config.working_dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("SUBFLOW_CLOSE_TIMEOUT_MS") {
        let millis = val.trim().parse::<u64>().map_err(|e| ConfigError::ParseError {
            reason: format!("SUBFLOW_CLOSE_TIMEOUT_MS={val:?}: {e}"),
        })?;
        config.close_timeout_ms = Some(millis);
    }
    if let Some(val) = lookup("SUBFLOW_INHERIT_ENV") {
        config.inherit_env = match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => true,
            "0" | "false" | "no" => false,
            _ => {
                return Err(ConfigError::ParseError {
                    reason: format!("SUBFLOW_INHERIT_ENV={val:?} is not a boolean"),
                });
            }
        };
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a configuration, returning advisory warnings.
///
/// Hard errors (unknown log level, out-of-range timeout) are returned as a
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &SubflowConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if let Some(millis) = config.close_timeout_ms {
        if millis == 0 || millis > MAX_CLOSE_TIMEOUT_MS {
            errors.push(format!(
                "close_timeout_ms {millis} out of range (1..{MAX_CLOSE_TIMEOUT_MS})"
            ));
        } else if millis > LARGE_CLOSE_TIMEOUT_MS {
            warnings.push(ConfigWarning::LargeTimeout { millis });
        }
    }

    if let Some(dir) = &config.working_dir {
        if dir.as_os_str().is_empty() {
            errors.push("working_dir must not be empty".into());
        } else if !dir.is_dir() {
            warnings.push(ConfigWarning::MissingWorkingDir { path: dir.clone() });
        }
    }

    if !config.inherit_env {
        warnings.push(ConfigWarning::EmptyEnvironment);
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
