/*!
 * Configuration management for Portwarden.
 *
 * This module provides functionality to load and access configuration
 * settings for the governor hierarchy, the security governor and the
 * network boundary. Configuration objects are passed explicitly into every
 * component at construction time; nothing reads a global.
 */
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Core configuration for Portwarden
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Governor hierarchy configuration
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Security governor configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Network boundary configuration
    #[serde(default)]
    pub network: NetworkConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application environment (development, production, etc.)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, portwarden_engine=debug, ...)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Arbitration strategy used by the coordination level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArbitrationStrategy {
    /// Static order: the lowest configured priority value wins
    #[default]
    Priority,
    /// Rotating grant after the last holder
    RoundRobin,
    /// Lowest recent utilization wins
    LoadBalance,
}

/// Configuration for the five governor levels
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Operational level (one governor per port)
    #[serde(default)]
    pub system1: OperationalConfig,

    /// Coordination level
    #[serde(default)]
    pub system2: CoordinationConfig,

    /// Management level
    #[serde(default)]
    pub system3: ManagementConfig,

    /// Intelligence level
    #[serde(default)]
    pub system4: IntelligenceConfig,

    /// Meta level
    #[serde(default)]
    pub system5: MetaConfig,
}

/// Operational level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalConfig {
    /// Interval between PSRLV cycles in milliseconds
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    /// Bound on the validate phase in milliseconds
    #[serde(default = "default_validate_timeout_ms")]
    pub validate_timeout_ms: u64,

    /// Number of PSRLV cycles retained per governor
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

/// Coordination level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// Arbitration strategy for shared resources
    #[serde(default)]
    pub strategy: ArbitrationStrategy,

    /// Interval between PSRLV cycles in milliseconds
    #[serde(default = "default_coordination_interval_ms")]
    pub cycle_interval_ms: u64,

    /// A waiter older than this is considered starving
    #[serde(default = "default_starvation_ms")]
    pub starvation_ms: u64,

    /// Maximum time a requester waits for a grant
    #[serde(default = "default_grant_timeout_ms")]
    pub grant_timeout_ms: u64,
}

/// Management level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// Health window and cycle interval in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Failures that trigger a forced recovery
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Maximum recovery attempts before a governor is marked failed
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base recovery delay in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Intelligence level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntelligenceConfig {
    /// Interval between PSRLV cycles in milliseconds
    #[serde(default = "default_analysis_interval_ms")]
    pub analysis_interval_ms: u64,

    /// Number of recent cycles per governor considered when mining history
    #[serde(default = "default_analysis_window")]
    pub analysis_window: usize,

    /// Failure rate above which a port is flagged
    #[serde(default = "default_failure_rate_alert")]
    pub failure_rate_alert: f64,
}

/// Meta level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Interval between PSRLV cycles in milliseconds
    #[serde(default = "default_reporting_interval_ms")]
    pub reporting_interval_ms: u64,
}

/// Security governor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Default token lifetime in minutes
    #[serde(default = "default_token_expiry_minutes")]
    pub token_expiry_minutes: u64,

    /// Per-peer request cap
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// How long a rate-limited peer stays blacklisted, in seconds
    #[serde(default = "default_blacklist_duration_secs")]
    pub blacklist_duration_secs: u64,

    /// Number of security events retained in memory
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,

    /// Window used for threat assessment, in seconds
    #[serde(default = "default_threat_window_secs")]
    pub threat_window_secs: u64,

    /// Bound on an authorization round-trip in milliseconds
    #[serde(default = "default_authorization_timeout_ms")]
    pub authorization_timeout_ms: u64,

    /// Optional JSON-lines audit file
    #[serde(default)]
    pub audit_log: Option<String>,
}

/// Network boundary configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address the agent listener binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Binding to the unspecified address requires a peer filter
    #[serde(default = "default_true")]
    pub require_peer_filter: bool,

    /// Operator override for a disallowed bind address
    #[serde(default)]
    pub operator_override: bool,
}

impl OperationalConfig {
    /// Cycle interval as a duration
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Validate bound as a duration
    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }
}

impl CoordinationConfig {
    /// Cycle interval as a duration
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    /// Starvation bound as a duration
    pub fn starvation(&self) -> Duration {
        Duration::from_millis(self.starvation_ms)
    }

    /// Grant timeout as a duration
    pub fn grant_timeout(&self) -> Duration {
        Duration::from_millis(self.grant_timeout_ms)
    }
}

impl ManagementConfig {
    /// Health-check interval as a duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Base retry delay as a duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl IntelligenceConfig {
    /// Cycle interval as a duration
    pub fn analysis_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_interval_ms)
    }
}

impl MetaConfig {
    /// Cycle interval as a duration
    pub fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms)
    }
}

impl SecurityConfig {
    /// Default token lifetime
    pub fn token_expiry(&self) -> Duration {
        Duration::from_secs(self.token_expiry_minutes * 60)
    }

    /// Blacklist duration
    pub fn blacklist_duration(&self) -> Duration {
        Duration::from_secs(self.blacklist_duration_secs)
    }

    /// Threat assessment window
    pub fn threat_window(&self) -> Duration {
        Duration::from_secs(self.threat_window_secs)
    }

    /// Authorization round-trip bound
    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_millis(self.authorization_timeout_ms)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            environment: default_environment(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for OperationalConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            validate_timeout_ms: default_validate_timeout_ms(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            strategy: ArbitrationStrategy::default(),
            cycle_interval_ms: default_coordination_interval_ms(),
            starvation_ms: default_starvation_ms(),
            grant_timeout_ms: default_grant_timeout_ms(),
        }
    }
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: default_health_check_interval_ms(),
            failure_threshold: default_failure_threshold(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            analysis_interval_ms: default_analysis_interval_ms(),
            analysis_window: default_analysis_window(),
            failure_rate_alert: default_failure_rate_alert(),
        }
    }
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            reporting_interval_ms: default_reporting_interval_ms(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            token_expiry_minutes: default_token_expiry_minutes(),
            requests_per_minute: default_requests_per_minute(),
            blacklist_duration_secs: default_blacklist_duration_secs(),
            event_log_capacity: default_event_log_capacity(),
            threat_window_secs: default_threat_window_secs(),
            authorization_timeout_ms: default_authorization_timeout_ms(),
            audit_log: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            require_peer_filter: true,
            operator_override: false,
        }
    }
}

fn default_app_name() -> String {
    "portwarden".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_interval_ms() -> u64 {
    1_000
}

fn default_validate_timeout_ms() -> u64 {
    500
}

fn default_history_capacity() -> usize {
    256
}

fn default_coordination_interval_ms() -> u64 {
    500
}

fn default_starvation_ms() -> u64 {
    2_000
}

fn default_grant_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_analysis_interval_ms() -> u64 {
    10_000
}

fn default_analysis_window() -> usize {
    50
}

fn default_failure_rate_alert() -> f64 {
    0.5
}

fn default_reporting_interval_ms() -> u64 {
    60_000
}

fn default_token_expiry_minutes() -> u64 {
    60
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_blacklist_duration_secs() -> u64 {
    300
}

fn default_event_log_capacity() -> usize {
    10_000
}

fn default_threat_window_secs() -> u64 {
    300
}

fn default_authorization_timeout_ms() -> u64 {
    1_000
}

fn default_bind_address() -> String {
    "127.0.0.1:7450".to_string()
}

impl Config {
    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
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
            return Ok(config);
        }

        let defaults = ConfigLib::try_from(&Config::default())
            .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?;
        let mut config_builder = ConfigLib::builder().add_source(defaults);

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
#[derive(Debug, Clone)]
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
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
