//! Transport Configuration
//!
//! Listen address, connection limits and the liveness timings every
//! connection task runs with.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{env_parse, ConfigError};

/// Default TCP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8001";

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Address the daemon listens on
    pub listen: SocketAddr,

    /// Maximum simultaneous connections (components and operators)
    pub max_connections: usize,

    /// How long a new connection has to send its handshake
    pub handshake_timeout_ms: u64,

    /// Heartbeat interval advertised to peers in `HandshakeAck`
    pub heartbeat_interval_ms: u64,

    /// Silence after which a component is marked degraded
    pub heartbeat_timeout_ms: u64,

    /// Silence after which a component is disconnected and removed
    pub grace_period_ms: u64,

    /// Outbound queue depth per connection
    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8001)),
            max_connections: 64,
            handshake_timeout_ms: 5000,
            heartbeat_interval_ms: 1000,
            heartbeat_timeout_ms: 3000,
            grace_period_ms: 10_000,
            outbound_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Defaults overlaid with the process environment
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidEnv` naming the first unparseable variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlay values from an environment lookup
    ///
    /// Environment variables:
    /// - `SHOWRUNNER_LISTEN`: listen address (`host:port`)
    /// - `SHOWRUNNER_MAX_CONNECTIONS`: connection limit
    /// - `SHOWRUNNER_HANDSHAKE_TIMEOUT`: ms
    /// - `SHOWRUNNER_HEARTBEAT_INTERVAL`: ms
    /// - `SHOWRUNNER_HEARTBEAT_TIMEOUT`: ms until degraded
    /// - `SHOWRUNNER_GRACE_PERIOD`: ms until disconnected
    ///
    /// # Errors
    ///
    /// `ConfigError::InvalidEnv` naming the first unparseable variable.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_LISTEN")? {
            self.listen = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_MAX_CONNECTIONS")? {
            self.max_connections = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_HANDSHAKE_TIMEOUT")? {
            self.handshake_timeout_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_HEARTBEAT_INTERVAL")? {
            self.heartbeat_interval_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_HEARTBEAT_TIMEOUT")? {
            self.heartbeat_timeout_ms = v;
        }
        if let Some(v) = env_parse(&lookup, "SHOWRUNNER_GRACE_PERIOD")? {
            self.grace_period_ms = v;
        }
        Ok(())
    }

    /// Check relationships between the timings
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` describing the first inconsistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat interval and handshake timeout must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat timeout ({} ms) must exceed the heartbeat interval ({} ms)",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        if self.grace_period_ms < self.heartbeat_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "grace period ({} ms) must be at least the heartbeat timeout ({} ms)",
                self.grace_period_ms, self.heartbeat_timeout_ms
            )));
        }
        if self.outbound_capacity == 0 {
            return Err(ConfigError::Invalid(
                "outbound_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Handshake deadline
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Heartbeat interval
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Silence until degraded
    #[must_use]
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Silence until disconnected
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.max_connections, 64);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = TransportConfig::default();
        config
            .apply_env(env(&[
                ("SHOWRUNNER_LISTEN", "0.0.0.0:9000"),
                ("SHOWRUNNER_GRACE_PERIOD", "20000"),
            ]))
            .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.grace_period_ms, 20_000);
        assert_eq!(config.heartbeat_timeout_ms, 3000);
    }

    #[test]
    fn test_invalid_env_names_variable() {
        let mut config = TransportConfig::default();
        let err = config
            .apply_env(env(&[("SHOWRUNNER_HEARTBEAT_TIMEOUT", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("SHOWRUNNER_HEARTBEAT_TIMEOUT"));
    }

    #[test]
    fn test_validate_rejects_inverted_timings() {
        let config = TransportConfig {
            heartbeat_timeout_ms: 500,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TransportConfig {
            grace_period_ms: 1000,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
