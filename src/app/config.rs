//! Application configuration management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::proxy::KeyAlgorithm;

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Proxy settings
    pub proxy: ProxyConfig,

    /// Certificate authority settings
    pub certificates: CertificatesConfig,

    /// Attack engine settings
    pub intruder: IntruderConfig,

    /// Observer notification settings
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory (platform default if unset)
    pub data_dir: Option<PathBuf>,

    /// Maximum exchanges kept in history
    pub max_history_items: usize,

    /// Maximum WebSocket sessions kept in history
    pub max_websocket_sessions: usize,

    /// Maximum WebSocket messages kept in history
    pub max_websocket_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy listen address
    pub listen_addr: String,

    /// Proxy port (0 picks a free port)
    pub port: u16,

    /// Hold requests for an operator decision
    pub intercept_enabled: bool,

    /// Decrypt CONNECT tunnels; plain byte tunnels otherwise
    pub https_intercept: bool,

    /// Bodies larger than this are recorded truncated and never rewritten
    pub max_capture_size: usize,

    /// Largest request or response body relayed at all
    pub max_body_size: usize,

    /// Auto-forward delay for held items, in milliseconds
    pub intercept_timeout_ms: u64,

    /// Origin request timeout, in milliseconds
    pub upstream_timeout_ms: u64,

    /// Time given to open connections on stop, in milliseconds
    pub shutdown_grace_ms: u64,

    /// Hosts that bypass capture and interception
    pub excluded_hosts: Vec<String>,

    /// URL prefixes that bypass capture and interception
    pub excluded_url_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificatesConfig {
    /// CA storage directory (`<data_dir>/ca` if unset)
    pub storage_dir: Option<PathBuf>,

    /// Key type for the root and leaf certificates
    pub key_algorithm: KeyAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntruderConfig {
    /// Default worker count per attack
    pub concurrency: usize,

    /// Default requests per second per worker
    pub rate_limit: Option<u32>,

    /// Request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Largest response body read per request
    pub max_response_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Cap on non-control events per channel per second
    pub max_per_second: u32,

    /// Event channel capacity
    pub channel_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_history_items: 1000,
            max_websocket_sessions: 100,
            max_websocket_messages: 10000,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 8080,
            intercept_enabled: false,
            https_intercept: true,
            max_capture_size: 5 * 1024 * 1024,  // 5MB
            max_body_size: 64 * 1024 * 1024,    // 64MB
            intercept_timeout_ms: 30_000,
            upstream_timeout_ms: 30_000,
            shutdown_grace_ms: 2_000,
            excluded_hosts: vec![],
            excluded_url_prefixes: vec![],
        }
    }
}

impl ProxyConfig {
    pub fn intercept_timeout(&self) -> Duration {
        Duration::from_millis(self.intercept_timeout_ms)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// `host:port` string to bind
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.contains(':') && !self.listen_addr.starts_with('[') {
            format!("[{}]:{}", self.listen_addr, self.port)
        } else {
            format!("{}:{}", self.listen_addr, self.port)
        }
    }
}

impl Default for IntruderConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_limit: None,
            request_timeout_ms: 30_000,
            max_response_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl IntruderConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_per_second: 20,
            channel_capacity: 1024,
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::ReadError {
                path: config_path.display().to_string(),
                source,
            })?;

            let config: Config =
                toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

            tracing::info!("Loaded configuration from {:?}", config_path);
            Ok(config)
        } else if path.is_some() {
            anyhow::bail!("Configuration file not found: {:?}", config_path)
        } else {
            tracing::info!("No configuration file found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = match path {
            Some(p) => PathBuf::from(p),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, contents)?;

        tracing::info!("Saved configuration to {:?}", config_path);
        Ok(())
    }

    /// Reject values the proxy cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &str, reason: &str| ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.to_string(),
        };

        if self.proxy.listen_addr.trim().is_empty() {
            return Err(invalid("proxy.listen_addr", "must not be empty"));
        }
        if self.proxy.max_capture_size == 0 {
            return Err(invalid("proxy.max_capture_size", "must be greater than zero"));
        }
        if self.proxy.max_body_size < self.proxy.max_capture_size {
            return Err(invalid("proxy.max_body_size", "must be at least max_capture_size"));
        }
        if self.proxy.intercept_timeout_ms == 0 {
            return Err(invalid("proxy.intercept_timeout_ms", "must be greater than zero"));
        }
        if self.proxy.upstream_timeout_ms == 0 {
            return Err(invalid("proxy.upstream_timeout_ms", "must be greater than zero"));
        }
        if self.intruder.concurrency == 0 {
            return Err(invalid("intruder.concurrency", "must be at least 1"));
        }
        if self.intruder.rate_limit == Some(0) {
            return Err(invalid("intruder.rate_limit", "must be at least 1 when set"));
        }
        if self.notifications.channel_capacity == 0 {
            return Err(invalid("notifications.channel_capacity", "must be greater than zero"));
        }
        Ok(())
    }

    /// Data directory, honouring the configured override
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        match &self.general.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Self::data_dir(),
        }
    }

    /// CA storage directory, honouring the configured override
    pub fn ca_dir(&self) -> Result<PathBuf> {
        match &self.certificates.storage_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.resolved_data_dir()?.join("ca")),
        }
    }

    /// Get default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "pincer", "pincer")
            .context("Failed to determine config directory")?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Get data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("io", "pincer", "pincer")
            .context("Failed to determine data directory")?;

        Ok(dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.proxy.max_capture_size, 5 * 1024 * 1024);
        assert_eq!(config.proxy.intercept_timeout(), Duration::from_secs(30));
        assert_eq!(config.intruder.concurrency, 10);
        assert_eq!(config.notifications.max_per_second, 20);
        assert_eq!(config.certificates.key_algorithm, KeyAlgorithm::Rsa2048);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            port = 9090
            excluded_hosts = ["telemetry.test"]

            [certificates]
            key_algorithm = "ecdsa-p256"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.port, 9090);
        assert_eq!(config.proxy.listen_addr, "127.0.0.1");
        assert_eq!(config.proxy.excluded_hosts, vec!["telemetry.test"]);
        assert_eq!(config.certificates.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(config.intruder, IntruderConfig::default());
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = Config::default();
        config.intruder.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError { field, .. }) if field == "intruder.concurrency"));

        let mut config = Config::default();
        config.proxy.intercept_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.max_capture_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.proxy.intercept_enabled = true;
        config.intruder.rate_limit = Some(5);
        config.save(Some(path)).unwrap();

        assert_eq!(Config::load(Some(path)).unwrap(), config);
        assert!(Config::load(Some("/nonexistent/pincer.toml")).is_err());
    }

    #[test]
    fn test_bind_addr() {
        let mut proxy = ProxyConfig::default();
        assert_eq!(proxy.bind_addr(), "127.0.0.1:8080");
        proxy.listen_addr = "::1".into();
        assert_eq!(proxy.bind_addr(), "[::1]:8080");
    }
}
