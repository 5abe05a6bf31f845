//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_HOST, RELAY_PORT, SERVER_SHARED_FILES)
//! - TOML configuration file
//! - Command line arguments (see `main.rs`)

use anyhow::{Context, Result};
use relay_transport::{DatagramConfig, TcpConfig};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory served by `LIST_FILES` and the download commands.
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// File transfer tuning.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of monitored connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Longest accepted command line in bytes.
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,

    /// Queued outbound items per connection.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Longest accepted display name in bytes.
    #[serde(default = "default_max_name_length")]
    pub max_name_length: usize,
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Inline transfer chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Payload bytes per datagram.
    #[serde(default = "default_datagram_size")]
    pub datagram_size: usize,

    /// Pause between datagrams in microseconds.
    #[serde(default = "default_datagram_pacing_us")]
    pub datagram_pacing_us: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(12000)
}

fn default_shared_dir() -> PathBuf {
    std::env::var_os("SERVER_SHARED_FILES")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("SharedFiles"))
}

fn default_max_connections() -> usize {
    1024
}

fn default_max_line_length() -> usize {
    relay_protocol::codec::DEFAULT_MAX_LINE_LENGTH
}

fn default_outbox_capacity() -> usize {
    relay_transport::outbox::DEFAULT_OUTBOX_CAPACITY
}

fn default_max_name_length() -> usize {
    relay_core::session::DEFAULT_MAX_NAME_LENGTH
}

fn default_chunk_size() -> usize {
    relay_transport::outbox::DEFAULT_CHUNK_SIZE
}

fn default_datagram_size() -> usize {
    relay_transport::datagram::DEFAULT_DATAGRAM_SIZE
}

fn default_datagram_pacing_us() -> u64 {
    1000
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shared_dir: default_shared_dir(),
            limits: LimitsConfig::default(),
            transfer: TransferConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_line_length: default_max_line_length(),
            outbox_capacity: default_outbox_capacity(),
            max_name_length: default_max_name_length(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            datagram_size: default_datagram_size(),
            datagram_pacing_us: default_datagram_pacing_us(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Resolve the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` does not resolve.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))?
            .next()
            .with_context(|| format!("No address for {}:{}", self.host, self.port))
    }

    /// Build the control-channel transport settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not resolve.
    pub fn tcp_config(&self) -> Result<TcpConfig> {
        Ok(TcpConfig {
            bind_addr: self.bind_addr()?,
            max_line_length: self.limits.max_line_length,
            outbox_capacity: self.limits.outbox_capacity,
            chunk_size: self.transfer.chunk_size,
        })
    }

    /// Build the datagram sender settings.
    #[must_use]
    pub fn datagram_config(&self) -> DatagramConfig {
        DatagramConfig {
            max_payload: self.transfer.datagram_size,
            pacing: Duration::from_micros(self.transfer.datagram_pacing_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = Config::default();
        assert_eq!(config.limits.max_line_length, 4096);
        assert_eq!(config.transfer.chunk_size, 4096);
        assert_eq!(config.transfer.datagram_size, 1024);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 4000,
            ..Config::default()
        };
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "127.0.0.1"
            port = 9000
            shared_dir = "/srv/files"

            [limits]
            max_connections = 50

            [transfer]
            datagram_pacing_us = 250
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.shared_dir, PathBuf::from("/srv/files"));
        assert_eq!(config.limits.max_connections, 50);
        assert_eq!(config.limits.outbox_capacity, 1024);
        assert_eq!(
            config.datagram_config().pacing,
            Duration::from_micros(250)
        );
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file("/nonexistent/relay.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
