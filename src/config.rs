//! Configuration management for the mining client
//!
//! Supports configuration via command line arguments, environment variables,
//! and configuration files (YAML/JSON) with proper validation and defaults.

use crate::client::BackoffConfig;
use crate::coordinator::CoordinatorConfig;
use crate::types::NONCE_DOMAIN_END;
use crate::worker::WorkerConfig;
use crate::{Error, Result};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Complete configuration for the mining client
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[command(
    name = "bitcoin-mining-client",
    version = env!("CARGO_PKG_VERSION"),
    about = "Bitcoin proof-of-work search coordinator",
    long_about = "Fetches block templates from a Bitcoin node over JSON-RPC and searches \
                  the nonce space across a pool of concurrent workers"
)]
pub struct Config {
    /// Print the parsed configuration and exit
    #[arg(long)]
    #[serde(default)]
    pub print_config: bool,

    /// Configuration file path (YAML or JSON)
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Bitcoin node RPC address
    #[arg(short = 'n', long, default_value = "localhost:8332")]
    #[serde(default = "default_node")]
    pub node: String,

    /// Use TLS to connect to the node
    #[arg(short = 't', long)]
    #[serde(default)]
    pub tls: bool,

    /// RPC username
    #[arg(short = 'u', long, env = "BITCOIN_RPC_USER")]
    pub rpc_user: Option<String>,

    /// RPC password
    #[arg(short = 'p', long, env = "BITCOIN_RPC_PASSWORD")]
    pub rpc_password: Option<String>,

    /// Number of concurrent mining workers (0 = one per CPU)
    #[arg(short = 'c', long, default_value = "0")]
    #[serde(default)]
    pub workers: usize,

    /// Template re-poll interval in seconds
    #[arg(long, default_value = "10")]
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Status report interval in seconds
    #[arg(long, default_value = "5")]
    #[serde(default = "default_status_interval")]
    pub status_interval: u64,

    /// Per-call RPC timeout in milliseconds
    #[arg(long, default_value = "30000")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: u64,

    /// Maximum retry attempts for RPC calls
    #[arg(long, default_value = "5")]
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Base retry delay in milliseconds
    #[arg(long, default_value = "100")]
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,

    /// Maximum retry delay in milliseconds
    #[arg(long, default_value = "5000")]
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay: u64,

    /// First nonce of the search domain
    #[arg(long, default_value = "0")]
    #[serde(default)]
    pub nonce_start: u64,

    /// End of the search domain (exclusive, at most 2^32)
    #[arg(long, default_value_t = NONCE_DOMAIN_END)]
    #[serde(default = "default_nonce_end")]
    pub nonce_end: u64,

    /// Log level
    #[arg(short = 'l', long, default_value = "info")]
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

impl Config {
    /// Load configuration from CLI, environment and optional file.
    pub async fn load() -> Result<Self> {
        let mut config = Self::parse();

        if let Some(config_file) = &config.config_file {
            let file_config = Self::load_from_file(config_file).await?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    async fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;

        if path.extension().and_then(|s| s.to_str()) == Some("json") {
            serde_json::from_str(&content).map_err(Error::from)
        } else {
            // Default to YAML
            serde_yaml::from_str(&content).map_err(Error::from)
        }
    }

    /// Merge CLI config with file config (CLI takes precedence)
    fn merge_with_file(mut self, file_config: Self) -> Self {
        if self.rpc_user.is_none() {
            self.rpc_user = file_config.rpc_user;
        }
        if self.rpc_password.is_none() {
            self.rpc_password = file_config.rpc_password;
        }
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.rpc_user.is_none() || self.rpc_password.is_none() {
            return Err(Error::config(
                "RPC credentials are required (--rpc-user/--rpc-password or environment)",
            ));
        }

        Url::parse(&self.node_url())
            .map_err(|e| Error::config(format!("Invalid node address: {}", e)))?;

        if self.nonce_start >= self.nonce_end || self.nonce_end > NONCE_DOMAIN_END {
            return Err(Error::config(format!(
                "Invalid nonce domain [{}, {})",
                self.nonce_start, self.nonce_end
            )));
        }

        if self.poll_interval == 0 {
            return Err(Error::config("Poll interval must be greater than 0"));
        }

        Ok(())
    }

    /// Get node URL
    pub fn node_url(&self) -> String {
        if self.tls {
            format!("https://{}", self.node)
        } else {
            format!("http://{}", self.node)
        }
    }

    /// Resolved worker count (0 means one per CPU)
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn poll_interval_duration(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Backoff settings for the RPC client
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(self.retry_delay),
            max_delay: Duration::from_millis(self.max_retry_delay),
            max_retries: self.max_retries,
        }
    }

    /// Coordinator settings derived from this configuration
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            worker_count: self.worker_count(),
            worker: WorkerConfig::default(),
            nonce_start: self.nonce_start,
            nonce_end: self.nonce_end,
            status_interval: Duration::from_secs(self.status_interval),
            ..CoordinatorConfig::default()
        }
    }
}

// Default value functions for serde
fn default_node() -> String {
    "localhost:8332".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_status_interval() -> u64 {
    5
}
fn default_rpc_timeout() -> u64 {
    30000
}
fn default_max_retries() -> usize {
    5
}
fn default_retry_delay() -> u64 {
    100
}
fn default_max_retry_delay() -> u64 {
    5000
}
fn default_nonce_end() -> u64 {
    NONCE_DOMAIN_END
}
fn default_log_level() -> LogLevel {
    LogLevel::Info
}
