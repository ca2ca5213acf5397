//! Configuration management for the Tollgate server.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::error::Result;
use crate::ratelimit::LimiterRules;

/// Main configuration for the Tollgate server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Limiter rules
    #[serde(default)]
    pub limiter: LimiterRules,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Interval between sweeps of expired limiter entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_sweep_interval() -> u64 {
    60
}

impl ServerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl TollgateConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;

    #[test]
    fn test_default_config() {
        let config = TollgateConfig::default();
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.limiter, LimiterRules::default());
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
server:
  listen_addr: 0.0.0.0:9000
  sweep_interval_secs: 5
limiter:
  max: 100
  methods: [POST]
"#;
        let config = TollgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(5));
        assert_eq!(config.limiter.max, 100.0);
        assert_eq!(config.limiter.methods, vec!["POST"]);
    }

    #[test]
    fn test_zero_sweep_interval_is_clamped() {
        let config = TollgateConfig::from_yaml("server:\n  sweep_interval_secs: 0").unwrap();
        assert_eq!(config.server.sweep_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_listen_addr() {
        let err = TollgateConfig::from_yaml("server:\n  listen_addr: nowhere").unwrap_err();
        assert!(matches!(err, TollgateError::Yaml(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = TollgateConfig::from_file("/nonexistent/tollgate.yaml").unwrap_err();
        assert!(matches!(err, TollgateError::Io(_)));
    }
}
