//! Configuration management for the discovery runtime.
//!
//! This module provides TOML-based configuration with support for multiple
//! configuration sources (default, file-based, environment variables) and
//! validation of configuration parameters.

use crate::utils::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "discovery.toml";

/// Environment variable prefix for configuration
pub const ENV_PREFIX: &str = "DISCOVERY";

/// Complete configuration for a discovery simulation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Protocol constants and program selection
    pub protocol: ProtocolConfig,
    /// Simulated transport behavior
    pub transport: TransportConfig,
    /// Node runtime tuning
    pub runtime: RuntimeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Protocol constants, all in time units
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Time between two beacons of one node
    pub beacon_period: u64,
    /// Delay before a node's first beacon
    pub initial_delay: u64,
    /// Upper bound (exclusive) of the per-beacon jitter
    pub spaceout: u64,
    /// Link lifetime without refresh
    pub timeout: u64,
    /// Rule program to load instead of the built-in one
    pub program: Option<PathBuf>,
}

/// Behavior of the in-process transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Probability that a single delivery is lost
    pub loss_probability: f64,
    /// Probability that a single delivery arrives twice
    pub duplicate_probability: f64,
    /// Lower bound of the delivery delay in milliseconds
    pub min_delay_ms: u64,
    /// Upper bound of the delivery delay in milliseconds
    pub max_delay_ms: u64,
}

/// Node runtime tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Length of one protocol time unit in milliseconds
    pub time_unit_ms: u64,
    /// Reaper cadence in time units
    pub reap_interval: u64,
    /// Upper bound on facts processed by one cascade
    pub max_cascade_steps: usize,
    /// Seed for jitter and transport randomness
    pub seed: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            beacon_period: crate::defaults::BEACON_PERIOD,
            initial_delay: crate::defaults::INITIAL_DELAY,
            spaceout: crate::defaults::SPACEOUT,
            timeout: crate::defaults::TIMEOUT,
            program: None,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            loss_probability: 0.0,
            duplicate_probability: 0.0,
            min_delay_ms: 0,
            max_delay_ms: 50,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            time_unit_ms: 1000,
            reap_interval: 1,
            max_cascade_steps: 1024,
            seed: 0x5eed,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl ProtocolConfig {
    /// Named constants handed to the rule program, overriding its `#define`s
    pub fn constants(&self) -> BTreeMap<String, i64> {
        [
            ("BEACON_PERIOD", self.beacon_period),
            ("INITIAL_DELAY", self.initial_delay),
            ("SPACEOUT", self.spaceout),
            ("TIMEOUT", self.timeout),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value as i64))
        .collect()
    }
}

impl TransportConfig {
    /// Delivery delay bounds
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

impl RuntimeConfig {
    /// Length of one time unit
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms)
    }
}

impl DiscoveryConfig {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read, parsed, or fails validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
            path: path.display().to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with multiple sources (default, file, environment)
    ///
    /// An explicit path must exist. Without one, `./discovery.toml` and then
    /// the user config directory are tried.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = match config_file {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_locations = [
                    PathBuf::from(DEFAULT_CONFIG_FILE),
                    dirs::config_dir()
                        .unwrap_or_else(|| PathBuf::from("."))
                        .join("beacon-discovery")
                        .join(DEFAULT_CONFIG_FILE),
                ];

                match default_locations.iter().find(|location| location.exists()) {
                    Some(location) => {
                        log::debug!("Using configuration from {}", location.display());
                        Self::from_file(location)?
                    }
                    None => Self::default(),
                }
            }
        };

        config = config.merge_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Merge configuration from environment variables
    fn merge_from_env(mut self) -> Result<Self> {
        if let Some(value) = env_override("PROTOCOL_BEACON_PERIOD")? {
            self.protocol.beacon_period = value;
        }
        if let Some(value) = env_override("PROTOCOL_INITIAL_DELAY")? {
            self.protocol.initial_delay = value;
        }
        if let Some(value) = env_override("PROTOCOL_SPACEOUT")? {
            self.protocol.spaceout = value;
        }
        if let Some(value) = env_override("PROTOCOL_TIMEOUT")? {
            self.protocol.timeout = value;
        }
        if let Some(value) = env_override("TRANSPORT_LOSS_PROBABILITY")? {
            self.transport.loss_probability = value;
        }
        if let Some(value) = env_override("RUNTIME_SEED")? {
            self.runtime.seed = value;
        }
        if let Ok(level) = std::env::var(format!("{ENV_PREFIX}_LOGGING_LEVEL")) {
            self.logging.level = level;
        }

        Ok(self)
    }

    /// Validate the configuration for consistency and correctness
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("protocol.beacon_period", self.protocol.beacon_period),
            ("protocol.timeout", self.protocol.timeout),
            ("runtime.time_unit_ms", self.runtime.time_unit_ms),
            ("runtime.reap_interval", self.runtime.reap_interval),
            ("runtime.max_cascade_steps", self.runtime.max_cascade_steps as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(invalid(field, "0"));
            }
        }

        // Jitter beyond one period would reorder a node's own beacons.
        if self.protocol.spaceout > self.protocol.beacon_period {
            return Err(invalid(
                "protocol.spaceout",
                &self.protocol.spaceout.to_string(),
            ));
        }

        for (field, p) in [
            ("transport.loss_probability", self.transport.loss_probability),
            (
                "transport.duplicate_probability",
                self.transport.duplicate_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(field, &p.to_string()));
            }
        }

        if self.transport.min_delay_ms > self.transport.max_delay_ms {
            return Err(invalid(
                "transport.min_delay_ms",
                &self.transport.min_delay_ms.to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(invalid("logging.level", &self.logging.level)),
        }

        Ok(())
    }

    /// Get the configuration as a pretty-printed TOML string
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::ParseError {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(field: &str, value: &str) -> crate::utils::DiscoveryError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

fn env_override<T: std::str::FromStr>(suffix: &str) -> Result<Option<T>> {
    let key = format!("{ENV_PREFIX}_{suffix}");
    match std::env::var(&key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(&key, &raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = DiscoveryConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.beacon_period, 5);
        assert_eq!(config.protocol.timeout, 11);
        assert_eq!(config.runtime.time_unit(), Duration::from_secs(1));
    }

    #[test]
    fn test_constants() {
        let constants = ProtocolConfig::default().constants();
        assert_eq!(constants["BEACON_PERIOD"], 5);
        assert_eq!(constants["INITIAL_DELAY"], 1);
        assert_eq!(constants["SPACEOUT"], 4);
        assert_eq!(constants["TIMEOUT"], 11);
    }

    #[test]
    fn test_config_file_operations() {
        let mut config = DiscoveryConfig::default();
        config.protocol.timeout = 20;
        let temp_file = NamedTempFile::new().unwrap();

        config.save(temp_file.path()).unwrap();
        let loaded = DiscoveryConfig::from_file(temp_file.path()).unwrap();

        assert_eq!(loaded.protocol.timeout, 20);
        assert_eq!(loaded.runtime.seed, config.runtime.seed);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), "[protocol]\nbeacon_period = 8\n").unwrap();

        let loaded = DiscoveryConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.protocol.beacon_period, 8);
        assert_eq!(loaded.protocol.timeout, 11);
        assert_eq!(loaded.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = DiscoveryConfig::default();
        config.protocol.beacon_period = 0;
        assert!(config.validate().is_err());

        config = DiscoveryConfig::default();
        config.protocol.spaceout = 6;
        assert!(config.validate().is_err());

        config = DiscoveryConfig::default();
        config.transport.loss_probability = 1.5;
        assert!(config.validate().is_err());

        config = DiscoveryConfig::default();
        config.transport.min_delay_ms = 100;
        config.transport.max_delay_ms = 10;
        assert!(config.validate().is_err());

        config = DiscoveryConfig::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("DISCOVERY_PROTOCOL_TIMEOUT", "30");

        let config = DiscoveryConfig::default().merge_from_env().unwrap();
        assert_eq!(config.protocol.timeout, 30);

        std::env::set_var("DISCOVERY_PROTOCOL_TIMEOUT", "soon");
        assert!(DiscoveryConfig::default().merge_from_env().is_err());

        std::env::remove_var("DISCOVERY_PROTOCOL_TIMEOUT");
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = DiscoveryConfig::load(Some(Path::new("/nonexistent/discovery.toml")));
        assert!(result.is_err());
    }
}
