//! GeoQuorum Configuration
//!
//! This module provides the typed configuration consumed by the latency
//! model, the protocol estimators and the emulation orchestrator. The
//! configuration is loaded and validated once at the boundary; the core
//! only ever sees this struct.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main GeoQuorum configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Distance to latency model parameters
    #[serde(default)]
    pub model: ModelConfig,

    /// Protocol estimator parameters
    #[serde(default)]
    pub estimator: EstimatorConfig,

    /// Network emulation parameters
    #[serde(default)]
    pub emulation: EmulationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Geographic latency model configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Sphere radius used by the haversine formula, in kilometers
    #[serde(default = "default_earth_radius_km")]
    pub earth_radius_km: f64,

    /// Signal propagation speed in fiber, in km per millisecond
    #[serde(default = "default_fiber_speed_km_per_ms")]
    pub fiber_speed_km_per_ms: f64,
}

/// Protocol estimator configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Sequential quorum rounds paid by a majority-quorum write
    #[serde(default = "default_quorum_write_rounds")]
    pub quorum_write_rounds: f64,

    /// Multiplier applied to the majority RTT for a leader-consensus write
    #[serde(default = "default_leader_write_multiplier")]
    pub leader_write_multiplier: f64,

    /// Slow-path quorum rounds of the fast/slow path protocol
    #[serde(default = "default_slow_path_rounds")]
    pub slow_path_rounds: f64,

    /// Peers contacted to execute a committed fast/slow path operation
    #[serde(default = "default_execute_peers")]
    pub execute_peers: usize,

    /// Weight of the best case when blending the reported mean.
    /// Fast-path probability for the fast/slow path protocol, read
    /// fraction for the other families.
    #[serde(default = "default_best_case_weight")]
    pub best_case_weight: f64,
}

/// Network emulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulationConfig {
    /// Install shaping rules at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Sandbox name prefix; peer slot `i` lives in `<prefix><i + 1>`
    #[serde(default = "default_node_prefix")]
    pub node_prefix: String,

    /// Sandbox network used to resolve peer addresses
    #[serde(default = "default_network_name")]
    pub network_name: String,

    /// Network device shaped inside every sandbox
    #[serde(default = "default_device")]
    pub device: String,

    /// Rate of the default root class
    #[serde(default = "default_root_rate")]
    pub root_rate: String,

    /// Rate cap of each per-destination class
    #[serde(default = "default_class_rate")]
    pub class_rate: String,

    /// Maximum concurrent pair installs
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Timeout for each remote shaping command in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Peer coordinate table (`lat,lon,loc`)
    #[serde(default = "default_locations")]
    pub locations: PathBuf,
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
fn default_earth_radius_km() -> f64 {
    6371.0
}

fn default_fiber_speed_km_per_ms() -> f64 {
    204.0
}

fn default_quorum_write_rounds() -> f64 {
    2.0
}

fn default_leader_write_multiplier() -> f64 {
    3.5
}

fn default_slow_path_rounds() -> f64 {
    3.0
}

fn default_execute_peers() -> usize {
    2
}

fn default_best_case_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_node_prefix() -> String {
    "cassandra-node".to_string()
}

fn default_network_name() -> String {
    "cassandra-network".to_string()
}

fn default_device() -> String {
    "eth0".to_string()
}

fn default_root_rate() -> String {
    "1000mbit".to_string()
}

fn default_class_rate() -> String {
    "100mbit".to_string()
}

fn default_workers() -> usize {
    8
}

fn default_command_timeout_ms() -> u64 {
    10_000
}

fn default_locations() -> PathBuf {
    PathBuf::from("latencies.csv")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            earth_radius_km: default_earth_radius_km(),
            fiber_speed_km_per_ms: default_fiber_speed_km_per_ms(),
        }
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            quorum_write_rounds: default_quorum_write_rounds(),
            leader_write_multiplier: default_leader_write_multiplier(),
            slow_path_rounds: default_slow_path_rounds(),
            execute_peers: default_execute_peers(),
            best_case_weight: default_best_case_weight(),
        }
    }
}

impl Default for EmulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node_prefix: default_node_prefix(),
            network_name: default_network_name(),
            device: default_device(),
            root_rate: default_root_rate(),
            class_rate: default_class_rate(),
            workers: default_workers(),
            command_timeout_ms: default_command_timeout_ms(),
            locations: default_locations(),
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

impl ModelConfig {
    /// Validate the model parameters
    pub fn validate(&self) -> crate::Result<()> {
        if !(self.earth_radius_km.is_finite() && self.earth_radius_km > 0.0) {
            return Err(crate::Error::Config(
                "model.earth_radius_km must be a positive number".into(),
            ));
        }
        if !(self.fiber_speed_km_per_ms.is_finite() && self.fiber_speed_km_per_ms > 0.0) {
            return Err(crate::Error::Config(
                "model.fiber_speed_km_per_ms must be a positive number".into(),
            ));
        }
        Ok(())
    }
}

impl EstimatorConfig {
    /// Validate the estimator parameters
    pub fn validate(&self) -> crate::Result<()> {
        for (name, value) in [
            ("estimator.quorum_write_rounds", self.quorum_write_rounds),
            ("estimator.leader_write_multiplier", self.leader_write_multiplier),
            ("estimator.slow_path_rounds", self.slow_path_rounds),
        ] {
            if !(value.is_finite() && value >= 1.0) {
                return Err(crate::Error::Config(format!("{} must be >= 1", name)));
            }
        }
        if self.execute_peers == 0 {
            return Err(crate::Error::Config(
                "estimator.execute_peers must be at least 1".into(),
            ));
        }
        validate_weight(self.best_case_weight)
    }
}

/// Check that a best-case weight lies in (0, 1]
pub fn validate_weight(weight: f64) -> crate::Result<()> {
    if weight > 0.0 && weight <= 1.0 {
        Ok(())
    } else {
        Err(crate::Error::Config(format!(
            "best case weight must be in (0, 1], got {}",
            weight
        )))
    }
}

impl EmulationConfig {
    /// Validate the emulation parameters
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_prefix.is_empty() {
            return Err(crate::Error::Config("emulation.node_prefix cannot be empty".into()));
        }
        if self.device.is_empty() {
            return Err(crate::Error::Config("emulation.device cannot be empty".into()));
        }
        if self.workers == 0 {
            return Err(crate::Error::Config("emulation.workers must be at least 1".into()));
        }
        if self.command_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "emulation.command_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Get the per-command timeout as Duration
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Sandbox name of the peer in the given 0-based slot
    pub fn sandbox_name(&self, slot: usize) -> String {
        format!("{}{}", self.node_prefix, slot + 1)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.model.validate()?;
        self.estimator.validate()?;
        self.emulation.validate()?;
        Ok(())
    }
}
