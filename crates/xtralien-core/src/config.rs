/*!
 * Configuration management for the Xtralien client.
 *
 * This module provides functionality to load and access the settings that
 * control logging, transports, command dispatch and network discovery.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::utils::millis_to_duration;

/// Top-level client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Command dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Network discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error, `xtralien_devices=debug`)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to stdout (stderr otherwise)
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Per-attempt read timeout of socket transports
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Line read deadline of serial transports
    #[serde(default = "default_serial_timeout_ms")]
    pub serial_timeout_ms: u64,

    /// Write deadline of serial transports
    #[serde(default = "default_serial_timeout_ms")]
    pub serial_write_timeout_ms: u64,

    /// Serial baud rate. USB instruments ignore it.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// TCP connection establishment deadline
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// TCP control port of networked instruments
    #[serde(default = "default_network_port")]
    pub network_port: u16,
}

/// Command dispatch configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delay applied before every command is sent
    #[serde(default = "default_pre_send_delay_ms")]
    pub pre_send_delay_ms: u64,

    /// Upper bound on asynchronous commands running at once
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Settling delay between consecutive EEPROM writes
    #[serde(default = "default_eeprom_write_delay_ms")]
    pub eeprom_write_delay_ms: u64,
}

/// Network discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Destination of the probe datagram
    #[serde(default = "default_broadcast_address")]
    pub broadcast_address: String,

    /// UDP port instruments listen on for probes
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Inactivity window; restarts on every reply
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,

    /// Poll interval used while waiting for an instrument to appear
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
            json_format: false,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            socket_timeout_ms: default_socket_timeout_ms(),
            serial_timeout_ms: default_serial_timeout_ms(),
            serial_write_timeout_ms: default_serial_timeout_ms(),
            baud_rate: default_baud_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
            network_port: default_network_port(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pre_send_delay_ms: default_pre_send_delay_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            eeprom_write_delay_ms: default_eeprom_write_delay_ms(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            broadcast_address: default_broadcast_address(),
            probe_port: default_probe_port(),
            timeout_ms: default_discovery_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

impl TransportConfig {
    /// Socket read timeout as a `Duration`
    pub fn socket_timeout(&self) -> Duration {
        millis_to_duration(self.socket_timeout_ms)
    }

    /// Serial read timeout as a `Duration`
    pub fn serial_timeout(&self) -> Duration {
        millis_to_duration(self.serial_timeout_ms)
    }

    /// Serial write timeout as a `Duration`
    pub fn serial_write_timeout(&self) -> Duration {
        millis_to_duration(self.serial_write_timeout_ms)
    }

    /// TCP connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        millis_to_duration(self.connect_timeout_ms)
    }
}

impl DispatchConfig {
    /// Pre-send delay as a `Duration`
    pub fn pre_send_delay(&self) -> Duration {
        millis_to_duration(self.pre_send_delay_ms)
    }

    /// EEPROM settling delay as a `Duration`
    pub fn eeprom_write_delay(&self) -> Duration {
        millis_to_duration(self.eeprom_write_delay_ms)
    }
}

impl DiscoveryConfig {
    /// Discovery inactivity window as a `Duration`
    pub fn timeout(&self) -> Duration {
        millis_to_duration(self.timeout_ms)
    }

    /// Poll interval as a `Duration`
    pub fn retry_interval(&self) -> Duration {
        millis_to_duration(self.retry_interval_ms)
    }
}

impl Config {
    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_stdout() -> bool {
    true
}

fn default_socket_timeout_ms() -> u64 {
    70
}

fn default_serial_timeout_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_network_port() -> u16 {
    8888
}

fn default_pre_send_delay_ms() -> u64 {
    1
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_eeprom_write_delay_ms() -> u64 {
    100
}

fn default_broadcast_address() -> String {
    "255.255.255.255".to_string()
}

fn default_probe_port() -> u16 {
    8889
}

fn default_discovery_timeout_ms() -> u64 {
    100
}

fn default_retry_interval_ms() -> u64 {
    500
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    ///
    /// Keys are read as `PREFIX__SECTION__KEY`, e.g. `XTRALIEN__LOGGING__LEVEL`.
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            debug!("Using explicit configuration override");
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config_lib = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?;

        let config: Config = config_lib
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        info!("Configuration loaded successfully");
        Ok(config)
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone, Default)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }

    /// The underlying shared pointer
    pub fn inner(&self) -> &Arc<Config> {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl From<&Config> for SharedConfig {
    fn from(config: &Config) -> Self {
        Self::new(config.clone())
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
