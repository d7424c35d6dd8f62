//! Configuration System using Figment
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults
//! 2. A TOML file (optional; missing files are skipped)
//! 3. Environment variables prefixed with `STAGE_FLEET_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! STAGE_FLEET_APPLICATION__LOG_LEVEL=debug
//! STAGE_FLEET_CONVERGENCE__POLL_DELAY_MS=100
//! STAGE_FLEET_STORAGE__SETTINGS_DIR=/var/lib/stage_fleet
//! ```
//!
//! # Example
//!
//! ```no_run
//! use stage_fleet::config::Settings;
//!
//! let settings = Settings::load_from("config/stage_fleet.toml")?;
//! println!("Polling every {:?}", settings.convergence.poll_delay());
//! # Ok::<(), stage_fleet::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "STAGE_FLEET_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge a source.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    /// A loaded value is out of range.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Convergence polling
    #[serde(default)]
    pub convergence: ConvergenceConfig,
    /// Driver access
    #[serde(default)]
    pub hardware: HardwareConfig,
    /// Simulated controllers
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Name shown in logs
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "stage_fleet".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Convergence polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Delay between two checks
    #[serde(default = "default_poll_delay")]
    pub poll_delay_ms: u64,
    /// Upper bound on checks per armed scheduler
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
}

impl ConvergenceConfig {
    /// `poll_delay_ms` as a `Duration`.
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            poll_delay_ms: default_poll_delay(),
            max_rounds: default_max_rounds(),
        }
    }
}

/// Hardware driver access
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    /// Deadline for a single blocking driver call
    #[serde(default = "default_driver_timeout")]
    pub driver_timeout_ms: u64,
}

impl HardwareConfig {
    /// `driver_timeout_ms` as a `Duration`.
    pub fn driver_timeout(&self) -> Duration {
        Duration::from_millis(self.driver_timeout_ms)
    }
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            driver_timeout_ms: default_driver_timeout(),
        }
    }
}

/// Simulated hardware
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Time a simulated stage needs to settle after a change
    #[serde(default = "default_settle")]
    pub settle_ms: u64,
    /// Channels of a simulated PI controller
    #[serde(default = "default_pi_channels")]
    pub pi_channels: u8,
}

impl SimulationConfig {
    /// `settle_ms` as a `Duration`.
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            settle_ms: default_settle(),
            pi_channels: default_pi_channels(),
        }
    }
}

/// Settings persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one JSON file per settings store
    #[serde(default = "default_settings_dir")]
    pub settings_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_dir: default_settings_dir(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_poll_delay() -> u64 {
    200
}

fn default_max_rounds() -> u32 {
    600
}

fn default_driver_timeout() -> u64 {
    5000
}

fn default_settle() -> u64 {
    250
}

fn default_pi_channels() -> u8 {
    4
}

fn default_settings_dir() -> PathBuf {
    PathBuf::from("settings")
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Defaults overridden by environment variables only.
    pub fn load() -> Result<Self, ConfigError> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `path` (if it exists), then environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(Self::figment().merge(Toml::file(path.as_ref())).merge(Self::env()))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default())).merge(Self::env())
    }

    fn env() -> Env {
        Env::prefixed(ENV_PREFIX).split("__")
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let settings: Self = figment.extract().map_err(Box::new)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Poll delay, round cap and driver timeout are non-zero
    /// - Simulated PI controllers have 1..=9 channels
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.convergence.poll_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "convergence.poll_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.convergence.max_rounds == 0 {
            return Err(ConfigError::ValidationError(
                "convergence.max_rounds must be greater than 0".to_string(),
            ));
        }

        if self.hardware.driver_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "hardware.driver_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !(1..=9).contains(&self.simulation.pi_channels) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid simulation.pi_channels {}. Must be 1-9",
                self.simulation.pi_channels
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.convergence.poll_delay(), Duration::from_millis(200));
        assert_eq!(settings.convergence.max_rounds, 600);
        assert_eq!(settings.storage.settings_dir, PathBuf::from("settings"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_zero_poll_delay_rejected() {
        let mut settings = Settings::default();
        settings.convergence.poll_delay_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[convergence]\npoll_delay_ms = 50\n\n[simulation]\npi_channels = 6"
        )
        .unwrap();
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.convergence.poll_delay_ms, 50);
        assert_eq!(settings.convergence.max_rounds, 600);
        assert_eq!(settings.simulation.pi_channels, 6);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("/nonexistent/stage_fleet.toml").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("STAGE_FLEET_APPLICATION__LOG_LEVEL", "debug");
        let result = Settings::load();
        std::env::remove_var("STAGE_FLEET_APPLICATION__LOG_LEVEL");
        assert_eq!(result.unwrap().application.log_level, "debug");
    }
}
