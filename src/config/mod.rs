//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Remote tunnel peer
    pub remote: RemoteConfig,
    /// Forwarded endpoints
    pub endpoints: Vec<EndpointConfig>,
    /// Transceiver tuning
    #[serde(default)]
    pub transceiver: TransceiverConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Sum of `max_connections` across all endpoints
    pub fn total_connections(&self) -> usize {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.max_connections)
            .sum()
    }
}

/// Remote tunnel peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Peer host
    pub host: String,
    /// Peer port
    pub port: u16,
    /// Pre-shared secret both peers derive codec keys from
    pub preshared_key: String,
    /// Codec key size in bytes (16 or 32)
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

fn default_key_size() -> usize {
    32
}

/// A forwarded endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Target host
    pub host: String,
    /// Target port
    pub port: u16,
    /// Transport protocol ("tcp" or "udp")
    pub protocol: String,
    /// Concurrent sessions kept for this endpoint
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

fn default_max_connections() -> usize {
    32
}

fn default_request_timeout() -> u64 {
    10
}

impl EndpointConfig {
    /// Per-request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Transceiver tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransceiverConfig {
    /// Idle seconds before a pooled connection is reaped
    pub idle_timeout: u64,
    /// Seconds allowed for dialing and handshaking a new connection
    pub initial_timeout: u64,
    /// Keep connections pooled across requests
    pub connection_persistent: bool,
    /// Logical channels sharing one connection
    pub connection_channels: usize,
    /// Keep-alive ceiling in seconds; 0 leaves the interval derived from
    /// the idle timeout alone
    pub ping_timeout: u64,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 60,
            initial_timeout: 10,
            connection_persistent: true,
            connection_channels: 8,
            ping_timeout: 0,
        }
    }
}

impl TransceiverConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn initial_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_timeout)
    }

    /// Configured ping ceiling, if any
    pub fn ping_timeout(&self) -> Option<Duration> {
        if self.ping_timeout > 0 {
            Some(Duration::from_secs(self.ping_timeout))
        } else {
            None
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        remote: RemoteConfig {
            host: "tunnel.example.com".to_string(),
            port: 8443,
            preshared_key: String::new(),
            key_size: 32,
        },
        endpoints: vec![EndpointConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: "tcp".to_string(),
            max_connections: 32,
            request_timeout: 10,
        }],
        transceiver: TransceiverConfig::default(),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let raw = r#"
            [remote]
            host = "tunnel.example.com"
            port = 8443
            preshared_key = "not a real secret"

            [[endpoints]]
            host = "127.0.0.1"
            port = 5432
            protocol = "tcp"
        "#;

        let config: Config = toml::from_str(raw).unwrap();

        assert_eq!(config.remote.key_size, 32);
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].max_connections, 32);
        assert_eq!(config.transceiver.connection_channels, 8);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_total_connections() {
        let mut config = generate_example_config();
        config.endpoints.push(EndpointConfig {
            host: "127.0.0.1".to_string(),
            port: 53,
            protocol: "udp".to_string(),
            max_connections: 16,
            request_timeout: 5,
        });

        assert_eq!(config.total_connections(), 48);
    }

    #[test]
    fn test_ping_timeout_disabled_by_zero() {
        let tuning = TransceiverConfig::default();
        assert!(tuning.ping_timeout().is_none());

        let tuning = TransceiverConfig {
            ping_timeout: 30,
            ..TransceiverConfig::default()
        };
        assert_eq!(tuning.ping_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = generate_example_config();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(parsed.remote.host, config.remote.host);
        assert_eq!(parsed.endpoints.len(), config.endpoints.len());
    }
}
