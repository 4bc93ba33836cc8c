//! Broker configuration
//!
//! One explicit structure for every deployment knob. It can be loaded from
//! YAML; missing fields take their defaults.
//!
//! ```yaml
//! http_addr: 0.0.0.0:3000
//! control_addr: 0.0.0.0:3001
//! addressing_scheme: subdomain
//! secure_public_scheme: true
//! pending_ttl_secs: 600
//! ```

use burrow_control::{ControlServerConfig, ControlSettings};
use burrow_router::AddressingScheme;
use burrow_server_http::{HttpServerConfig, ProxySettings};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Public HTTP listener
    pub http_addr: SocketAddr,
    /// Agent control channel listener
    pub control_addr: SocketAddr,
    /// Advertise `https://` public URLs
    pub secure_public_scheme: bool,
    pub addressing_scheme: AddressingScheme,
    /// 0 disables the cap
    pub max_connections_per_tunnel: usize,
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bound on waiting for upstream response headers
    pub response_timeout_secs: u64,
    /// Tunnels with no control connection for this long are removed; `None`
    /// keeps them forever
    pub pending_ttl_secs: Option<u64>,
    pub eviction_interval_secs: u64,
    pub landing_page: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            control_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            secure_public_scheme: false,
            addressing_scheme: AddressingScheme::PathPrefix,
            max_connections_per_tunnel: burrow_router::DEFAULT_MAX_CONNECTIONS_PER_TUNNEL,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 120,
            connect_timeout_secs: 10,
            response_timeout_secs: 60,
            pending_ttl_secs: Some(3600),
            eviction_interval_secs: 60,
            landing_page: true,
        }
    }
}

impl BrokerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: BrokerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.idle_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(format!(
                "idle_timeout_secs ({}) must be longer than heartbeat_interval_secs ({})",
                self.idle_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.connect_timeout_secs == 0 || self.response_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "proxy timeouts must be greater than 0".to_string(),
            ));
        }
        if self.eviction_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "eviction_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn http_server_config(&self) -> HttpServerConfig {
        HttpServerConfig {
            bind_addr: self.http_addr,
            addressing_scheme: self.addressing_scheme,
            secure_public_scheme: self.secure_public_scheme,
            landing_page: self.landing_page,
            proxy: ProxySettings {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                response_timeout: Duration::from_secs(self.response_timeout_secs),
            },
        }
    }

    pub fn control_server_config(&self) -> ControlServerConfig {
        ControlServerConfig {
            bind_addr: self.control_addr,
            settings: ControlSettings {
                heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            },
        }
    }

    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.http_addr.port(), 3000);
        assert_eq!(config.control_addr.port(), 3001);
        assert_eq!(config.addressing_scheme, AddressingScheme::PathPrefix);
        assert_eq!(config.max_connections_per_tunnel, 10);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.idle_timeout_secs, 120);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = BrokerConfig::from_yaml_str(
            "addressing_scheme: subdomain\nsecure_public_scheme: true\npending_ttl_secs: null\n",
        )
        .unwrap();

        assert_eq!(config.addressing_scheme, AddressingScheme::Subdomain);
        assert!(config.secure_public_scheme);
        assert_eq!(config.pending_ttl(), None);
        assert_eq!(config.http_addr, BrokerConfig::default().http_addr);
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        assert!(matches!(
            BrokerConfig::from_yaml_str("addressing_scheme: wildcard\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_idle_shorter_than_heartbeat() {
        let result = BrokerConfig::from_yaml_str("heartbeat_interval_secs: 30\nidle_timeout_secs: 10\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "http_addr: 127.0.0.1:8080").unwrap();
        writeln!(file, "max_connections_per_tunnel: 3").unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.http_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.max_connections_per_tunnel, 3);
    }

    #[test]
    fn test_load_missing_file() {
        let result = BrokerConfig::load(Path::new("/nonexistent/burrow.yaml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
