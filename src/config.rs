//! WolfGTM Configuration
//!
//! This module provides configuration structures for the node registry and
//! global xmin service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Register log file name inside the data directory
pub const REGISTER_LOG_FILE: &str = "register.node";

/// Main WolfGTM configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtmConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Registry and global xmin configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Hot-standby forwarding configuration
    #[serde(default)]
    pub standby: StandbyConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique manager identifier
    pub id: String,

    /// Address to accept node connections on
    pub bind_address: String,

    /// Data directory for the register log
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Registry and global xmin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without an xmin report before a node is excluded
    #[serde(default = "default_xmin_report_threshold_secs")]
    pub xmin_report_threshold_secs: u64,

    /// Maximum nodes returned by a node listing
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

/// Hot-standby forwarding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandbyConfig {
    /// Standby manager address (forwarding disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Retries on communication errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Pause between retries in milliseconds
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Set on a standby: store registrations forwarded by the primary
    /// without an owning connection
    #[serde(default)]
    pub accept_forwarded: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_xmin_report_threshold_secs() -> u64 {
    120
}

fn default_max_nodes() -> usize {
    1024
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfgtm")
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            xmin_report_threshold_secs: default_xmin_report_threshold_secs(),
            max_nodes: default_max_nodes(),
        }
    }
}

impl Default for StandbyConfig {
    fn default() -> Self {
        Self {
            address: None,
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            accept_forwarded: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RegistryConfig {
    /// Get the staleness threshold as Duration
    pub fn xmin_report_threshold(&self) -> Duration {
        Duration::from_secs(self.xmin_report_threshold_secs)
    }
}

impl StandbyConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl GtmConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GtmConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GtmConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.registry.xmin_report_threshold_secs == 0 {
            return Err(crate::Error::Config(
                "registry.xmin_report_threshold_secs must be positive".into(),
            ));
        }

        if self.registry.max_nodes == 0 {
            return Err(crate::Error::Config("registry.max_nodes must be positive".into()));
        }

        if let Some(address) = &self.standby.address {
            if address.is_empty() {
                return Err(crate::Error::Config("standby.address cannot be empty".into()));
            }
            if *address == self.node.bind_address {
                return Err(crate::Error::Config(
                    "standby.address must differ from node.bind_address".into(),
                ));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the register log path
    pub fn register_log_path(&self) -> PathBuf {
        self.node.data_dir.join(REGISTER_LOG_FILE)
    }

    /// Default configuration written by `wolfgtm init`
    pub fn sample(id: &str, bind_address: &str, data_dir: PathBuf) -> Self {
        Self {
            node: NodeConfig {
                id: id.to_string(),
                bind_address: bind_address.to_string(),
                data_dir,
            },
            registry: RegistryConfig::default(),
            standby: StandbyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
