//! Configuration management

use crate::tunnel::DEFAULT_MAX_VID;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
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
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Local listen host. Loopback unless you know what you are doing.
    pub host: String,
    /// Local listen port
    pub port: u16,
    /// Carrier command to spawn (split on whitespace)
    pub command: String,
    /// Ready marker the carrier must print before protocol bytes
    pub ready_token: String,
    /// Highest virtual connection id the bridge will allocate
    pub max_vid: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 20096,
            command: String::new(),
            ready_token: crate::READY_TOKEN.to_string(),
            max_vid: DEFAULT_MAX_VID,
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Destination host every virtual connection is dialed to
    pub host: String,
    /// Destination port
    pub port: u16,
    /// Ready marker printed on stdout before protocol bytes
    pub ready_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 22,
            ready_token: crate::READY_TOKEN.to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = ClientConfig::default();
        assert_eq!(client.host, "127.0.0.1");
        assert_eq!(client.port, 20096);
        assert_eq!(client.ready_token, crate::READY_TOKEN);
        assert_eq!(client.max_vid, DEFAULT_MAX_VID);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [client]
            port = 9000
            command = "ssh gateway stdio-tunnel-server -p 5432"
            "#,
        )
        .expect("parse");

        let client = config.client.expect("client section");
        assert_eq!(client.port, 9000);
        assert_eq!(client.host, "127.0.0.1");
        assert!(config.server.is_none());
        assert_eq!(config.logging.level, "info");
    }
}
