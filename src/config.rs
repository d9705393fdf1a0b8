//! Configuration loading using Figment.
//!
//! Configuration is layered, highest precedence last:
//! 1. built-in defaults
//! 2. a TOML file (`config/default.toml` unless another path is given)
//! 3. environment variables prefixed with `TCSPC_`, nested keys separated by `__`
//!
//! ```text
//! TCSPC_APPLICATION__LOG_LEVEL=debug
//! TCSPC_DEVICE__PORT=/dev/ttyACM0
//! TCSPC_DEVICE__BIN_SIZE=0.2
//! TCSPC_SIMULATION__SEED=42
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tcspc_arduino::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! println!("Bins: {}", config.device.n_bins);
//! # Ok::<(), tcspc_arduino::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::settings::DeviceSettings;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "TCSPC_";

/// Accepted log levels.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub application: ApplicationConfig,
    /// Initial device settings, including the serial port.
    pub device: DeviceSettings,
    pub simulation: SimulationConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Structured JSON (for log aggregation)
    Json,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "TCSPC Arduino".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Simulation options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Seed of the sample generator; random when absent.
    pub seed: Option<u64>,
}

impl AppConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        let config: Self = Self::figment(Path::new(DEFAULT_CONFIG_PATH)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, which must exist, and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DaqError::Configuration(format!(
                "configuration file '{}' not found",
                path.display()
            )));
        }
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check the log level and every device setting against its limits.
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }

        self.device
            .validate()
            .map_err(|e| DaqError::Configuration(format!("[device] {}", e)))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}
