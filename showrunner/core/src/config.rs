//! Core Configuration
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (applied by the daemon after loading)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! The file lives at `$XDG_CONFIG_HOME/showrunner/showrunner.toml` unless a
//! path is given explicitly. A missing default file is not an error.
//!
//! # Example Configuration
//!
//! ```toml
//! opus = "/srv/show/opus.yaml"
//! sync_assets = true
//! exit_on_validation_failure = false
//! ack_policy = "block"
//!
//! [transport]
//! listen = "0.0.0.0:8001"
//! heartbeat_interval_ms = 500
//! heartbeat_timeout_ms = 2000
//! grace_period_ms = 8000
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::{AckFailurePolicy, EngineConfig};
use crate::opus::ValidationFailurePolicy;
use crate::transport::TransportConfig;

/// Opus loaded when nothing else is configured
pub const DEFAULT_OPUS_PATH: &str = "resources/dev_opus.yaml";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config file at {}: {source}", path.display())]
    Io {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("failed to parse config file at {}: {message}", path.display())]
    Parse {
        /// The file
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// An environment variable holds an unusable value
    #[error("invalid value `{value}` for {var}: {reason}")]
    InvalidEnv {
        /// Variable name
        var: String,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// Values are individually valid but inconsistent
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// =============================================================================
// Environment Helpers
// =============================================================================

/// Parse the variable `name` from `lookup`, if set
///
/// # Errors
///
/// `ConfigError::InvalidEnv` when the value does not parse as `T`.
pub fn env_parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var: name.to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
}

/// Parse a boolean flag the way operators write them
#[must_use]
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<bool>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    parse_bool(&raw)
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidEnv {
            var: name.to_string(),
            value: raw,
            reason: "expected 1/0, true/false, yes/no or on/off".to_string(),
        })
}

// =============================================================================
// Core Configuration
// =============================================================================

/// Everything Core needs to run a show
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Opus to load at startup
    pub opus: PathBuf,

    /// Reconcile component asset caches against the opus
    pub sync_assets: bool,

    /// Exit when the opus fails validation (otherwise run with no opus)
    pub exit_on_validation_failure: bool,

    /// How long a component has to apply an asset sync instruction
    pub sync_timeout_ms: u64,

    /// Ack timeout for cues that do not set their own
    pub ack_timeout_ms: u64,

    /// What to do when a waited-on cue is not acknowledged
    pub ack_policy: AckFailurePolicy,

    /// Listener and liveness settings
    pub transport: TransportConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            opus: PathBuf::from(DEFAULT_OPUS_PATH),
            sync_assets: false,
            exit_on_validation_failure: true,
            sync_timeout_ms: 30_000,
            ack_timeout_ms: 2000,
            ack_policy: AckFailurePolicy::Continue,
            transport: TransportConfig::default(),
        }
    }
}

impl CoreConfig {
    /// `$XDG_CONFIG_HOME/showrunner/showrunner.toml`
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("showrunner").join("showrunner.toml"))
    }

    /// Read a TOML config file
    ///
    /// # Errors
    ///
    /// `Io` if unreadable, `Parse` for bad TOML or unknown keys.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Defaults, then the config file, then the process environment
    ///
    /// An `explicit` path must exist; the default path may be absent.
    ///
    /// # Errors
    ///
    /// File, environment and consistency errors.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => {
                let config = Self::from_file(path)?;
                tracing::info!(path = %path.display(), "Loaded configuration from file");
                config
            }
            None => match Self::default_path() {
                Some(path) if path.exists() => {
                    let config = Self::from_file(&path)?;
                    tracing::info!(path = %path.display(), "Loaded configuration from file");
                    config
                }
                _ => {
                    tracing::debug!("No config file, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    ///
    /// Environment variables:
    /// - `OPUS`: opus path
    /// - `SYNC_ASSETS`: enable asset reconciliation
    /// - `EXIT_ON_VALIDATION_FAILURE`: abort on an invalid opus
    /// - `SHOWRUNNER_SYNC_TIMEOUT`: ms
    /// - `SHOWRUNNER_ACK_TIMEOUT`: ms
    /// - `SHOWRUNNER_ACK_POLICY`: `block` or `continue`
    ///
    /// plus the transport variables of [`TransportConfig::apply_env`].
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidEnv` naming the first unparseable variable.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("OPUS").filter(|v| !v.trim().is_empty()) {
            self.opus = PathBuf::from(v);
        }
        if let Some(v) = env_bool(&lookup, "SYNC_ASSETS")? {
            self.sync_assets = v;
        }
        if let Some(v) = env_bool(&lookup, "EXIT_ON_VALIDATION_FAILURE")? {
            self.exit_on_validation_failure = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_SYNC_TIMEOUT")? {
            self.sync_timeout_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_ACK_TIMEOUT")? {
            self.ack_timeout_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_ACK_POLICY")? {
            self.ack_policy = v;
        }
        self.transport.apply_env(lookup)
    }

    /// Check the values fit together
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "sync_timeout_ms must be positive".to_string(),
            ));
        }
        if self.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "ack_timeout_ms must be positive".to_string(),
            ));
        }
        self.transport.validate()
    }

    /// Opus failure policy from `exit_on_validation_failure`
    #[must_use]
    pub fn policy(&self) -> ValidationFailurePolicy {
        ValidationFailurePolicy::from_exit_flag(self.exit_on_validation_failure)
    }

    /// Engine settings
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            ack_policy: self.ack_policy,
        }
    }

    /// Asset sync deadline
    #[must_use]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
