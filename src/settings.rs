//! Typed device settings with one generic get/set dispatch.
//!
//! Every numeric setting of the histogrammer is addressed by a [`Property`]. The property
//! knows its wire name, its type, its limits and where it lives:
//!
//! | scope        | properties                                         | routed to                |
//! |--------------|----------------------------------------------------|--------------------------|
//! | `Device`     | threshold, bin_size, offset, n_bins                | serial command channel   |
//! | `Host`       | baudrate, timeout, max_time, max_counts, refresh   | kept on the host         |
//! | `Simulation` | lifetime, time_zero, count_rate, dark_rate         | simulation model only    |
//!
//! [`DeviceSettings::set`] validates before it stores, so a rejected value never leaves a
//! partially updated struct behind.

use crate::core::{x_axis, ParameterValue};
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Baud rates offered to the host for the serial link.
pub const STANDARD_BAUDRATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
];

/// Default baud rate of the Arduino firmware.
pub const DEFAULT_BAUDRATE: u32 = 115200;

// =============================================================================
// Property identifiers
// =============================================================================

/// Identifier of one device setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Baudrate,
    Timeout,
    Threshold,
    BinSize,
    Offset,
    NBins,
    MaxTime,
    MaxCounts,
    Refresh,
    Lifetime,
    TimeZero,
    CountRate,
    DarkRate,
}

/// Value type of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    Int,
    Float,
}

/// Where a property is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyScope {
    /// Forwarded to the histogrammer firmware.
    Device,
    /// Only meaningful to the host (link parameters, accumulation limits).
    Host,
    /// Inputs of the simulation model; unavailable with a real device.
    Simulation,
}

/// Accepted values of a property.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Limits {
    /// Inclusive numeric bounds, either side optional.
    Range { min: Option<f64>, max: Option<f64> },
    /// One of a fixed list.
    Choices(&'static [u32]),
}

impl Limits {
    fn at_least(min: f64) -> Self {
        Limits::Range {
            min: Some(min),
            max: None,
        }
    }

    fn between(min: f64, max: f64) -> Self {
        Limits::Range {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Check `value` against the limits.
    pub fn check(&self, name: &str, value: f64) -> AppResult<()> {
        match self {
            Limits::Range { min, max } => {
                if let Some(min) = min {
                    if value < *min {
                        return Err(invalid(name, format!("{} is below the minimum {}", value, min)));
                    }
                }
                if let Some(max) = max {
                    if value > *max {
                        return Err(invalid(name, format!("{} is above the maximum {}", value, max)));
                    }
                }
                Ok(())
            }
            Limits::Choices(choices) => {
                if choices.iter().any(|&c| f64::from(c) == value) {
                    Ok(())
                } else {
                    Err(invalid(name, format!("{} is not one of {:?}", value, choices)))
                }
            }
        }
    }
}

fn invalid(name: &str, reason: impl Into<String>) -> DaqError {
    DaqError::InvalidValue {
        name: name.to_string(),
        reason: reason.into(),
    }
}

impl Property {
    /// All properties, in the order the host presents them.
    pub const ALL: [Property; 13] = [
        Property::Baudrate,
        Property::Timeout,
        Property::Threshold,
        Property::BinSize,
        Property::Offset,
        Property::NBins,
        Property::MaxTime,
        Property::MaxCounts,
        Property::Refresh,
        Property::Lifetime,
        Property::TimeZero,
        Property::CountRate,
        Property::DarkRate,
    ];

    /// Setting name, also used verbatim as the serial command.
    pub fn name(self) -> &'static str {
        match self {
            Property::Baudrate => "baudrate",
            Property::Timeout => "timeout",
            Property::Threshold => "threshold",
            Property::BinSize => "bin_size",
            Property::Offset => "offset",
            Property::NBins => "n_bins",
            Property::MaxTime => "max_time",
            Property::MaxCounts => "max_counts",
            Property::Refresh => "refresh",
            Property::Lifetime => "lifetime",
            Property::TimeZero => "time_zero",
            Property::CountRate => "count_rate",
            Property::DarkRate => "dark_rate",
        }
    }

    /// Human-readable title with units.
    pub fn title(self) -> &'static str {
        match self {
            Property::Baudrate => "Baudrate",
            Property::Timeout => "Timeout (s)",
            Property::Threshold => "Trigger threshold (mV)",
            Property::BinSize => "Bin size (µs)",
            Property::Offset => "Offset (µs)",
            Property::NBins => "Number of bins",
            Property::MaxTime => "Accumulation time (s)",
            Property::MaxCounts => "Maximum counts",
            Property::Refresh => "Refresh time (s)",
            Property::Lifetime => "Lifetime (µs)",
            Property::TimeZero => "Time zero (µs)",
            Property::CountRate => "Count rate (Hz)",
            Property::DarkRate => "Dark rate (Hz)",
        }
    }

    /// Value type.
    pub fn kind(self) -> PropertyKind {
        match self {
            Property::Baudrate
            | Property::NBins
            | Property::MaxCounts
            | Property::CountRate
            | Property::DarkRate => PropertyKind::Int,
            _ => PropertyKind::Float,
        }
    }

    /// Accepted values.
    pub fn limits(self) -> Limits {
        match self {
            Property::Baudrate => Limits::Choices(STANDARD_BAUDRATES),
            Property::Timeout => Limits::at_least(0.0),
            Property::Threshold => Limits::between(-5.0, 5.0),
            Property::BinSize => Limits::at_least(0.1),
            Property::Offset => Limits::at_least(0.0),
            Property::NBins => Limits::between(10.0, 10_000.0),
            Property::MaxTime => Limits::at_least(0.0),
            Property::MaxCounts => Limits::at_least(0.0),
            Property::Refresh => Limits::at_least(0.1),
            Property::Lifetime => Limits::at_least(0.001),
            Property::TimeZero => Limits::between(0.0, 10.0),
            Property::CountRate => Limits::between(1.0, 65_535.0),
            Property::DarkRate => Limits::between(0.0, 1e9),
        }
    }

    /// Where the property is applied.
    pub fn scope(self) -> PropertyScope {
        match self {
            Property::Threshold | Property::BinSize | Property::Offset | Property::NBins => {
                PropertyScope::Device
            }
            Property::Lifetime | Property::TimeZero | Property::CountRate | Property::DarkRate => {
                PropertyScope::Simulation
            }
            _ => PropertyScope::Host,
        }
    }

    /// True for the properties the time axis is derived from.
    pub fn affects_axis(self) -> bool {
        matches!(self, Property::BinSize | Property::Offset | Property::NBins)
    }

    /// True for the properties the simulation model is derived from.
    pub fn affects_simulation(self) -> bool {
        self.affects_axis() || self.scope() == PropertyScope::Simulation
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Property {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Property::ALL
            .iter()
            .copied()
            .find(|p| p.name() == s)
            .ok_or_else(|| DaqError::UnknownProperty(s.to_string()))
    }
}

// =============================================================================
// DeviceSettings
// =============================================================================

/// Flat set of named scalar settings for the histogrammer.
///
/// Times are in µs for the histogram axis (`bin_size`, `offset`, `lifetime`, `time_zero`)
/// and in seconds for host-side timing (`timeout`, `max_time`, `refresh`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Serial port (e.g. "/dev/ttyACM0", "COM3"); `None` selects simulation.
    pub port: Option<String>,
    pub baudrate: u32,
    pub timeout: f64,
    pub threshold: f64,
    pub bin_size: f64,
    pub offset: f64,
    pub n_bins: usize,
    /// Accumulation time limit in seconds, 0 disables it.
    pub max_time: f64,
    /// Ceiling on the largest bin of the running total, 0 disables it.
    pub max_counts: u64,
    pub refresh: f64,
    pub lifetime: f64,
    pub time_zero: f64,
    pub count_rate: u32,
    pub dark_rate: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            port: None,
            baudrate: DEFAULT_BAUDRATE,
            timeout: 1.0,
            threshold: 0.5,
            bin_size: 0.1,
            offset: 0.1,
            n_bins: 400,
            max_time: 0.0,
            max_counts: 0,
            refresh: 0.1,
            lifetime: 3.5,
            time_zero: 0.3,
            count_rate: 100,
            dark_rate: 10,
        }
    }
}

impl DeviceSettings {
    /// Current value of `property`.
    pub fn get(&self, property: Property) -> ParameterValue {
        match property {
            Property::Baudrate => self.baudrate.into(),
            Property::Timeout => self.timeout.into(),
            Property::Threshold => self.threshold.into(),
            Property::BinSize => self.bin_size.into(),
            Property::Offset => self.offset.into(),
            Property::NBins => self.n_bins.into(),
            Property::MaxTime => self.max_time.into(),
            Property::MaxCounts => self.max_counts.into(),
            Property::Refresh => self.refresh.into(),
            Property::Lifetime => self.lifetime.into(),
            Property::TimeZero => self.time_zero.into(),
            Property::CountRate => self.count_rate.into(),
            Property::DarkRate => self.dark_rate.into(),
        }
    }

    /// Coerce `value` to the property's type and check it against its limits.
    ///
    /// Returns the normalised value without touching `self`.
    pub fn validate_value(property: Property, value: &ParameterValue) -> AppResult<ParameterValue> {
        let name = property.name();
        let normalised = match property.kind() {
            PropertyKind::Int => {
                let v = value
                    .as_i64()
                    .ok_or_else(|| invalid(name, format!("expected an integer, got '{}'", value)))?;
                ParameterValue::Int(v)
            }
            PropertyKind::Float => {
                let v = value
                    .as_f64()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| invalid(name, format!("expected a number, got '{}'", value)))?;
                ParameterValue::Float(v)
            }
        };
        let numeric = normalised.as_f64().unwrap_or(f64::NAN);
        property.limits().check(name, numeric)?;
        Ok(normalised)
    }

    /// Validate and store `value`. On error the settings are left unchanged.
    pub fn set(&mut self, property: Property, value: &ParameterValue) -> AppResult<()> {
        let value = Self::validate_value(property, value)?;
        let as_int = || value.as_i64().unwrap_or_default();
        let as_float = || value.as_f64().unwrap_or_default();
        match property {
            Property::Baudrate => self.baudrate = as_int() as u32,
            Property::Timeout => self.timeout = as_float(),
            Property::Threshold => self.threshold = as_float(),
            Property::BinSize => self.bin_size = as_float(),
            Property::Offset => self.offset = as_float(),
            Property::NBins => self.n_bins = as_int() as usize,
            Property::MaxTime => self.max_time = as_float(),
            Property::MaxCounts => self.max_counts = as_int() as u64,
            Property::Refresh => self.refresh = as_float(),
            Property::Lifetime => self.lifetime = as_float(),
            Property::TimeZero => self.time_zero = as_float(),
            Property::CountRate => self.count_rate = as_int() as u32,
            Property::DarkRate => self.dark_rate = as_int() as u64,
        }
        Ok(())
    }

    /// Check every property against its limits.
    pub fn validate(&self) -> AppResult<()> {
        for property in Property::ALL {
            Self::validate_value(property, &self.get(property))?;
        }
        if let Some(port) = &self.port {
            if port.trim().is_empty() {
                return Err(invalid("port", "cannot be empty (omit it to simulate)"));
            }
        }
        Ok(())
    }

    /// Time axis for the current bin configuration.
    pub fn x_axis(&self) -> Vec<f64> {
        x_axis(self.offset, self.bin_size, self.n_bins)
    }

    /// Per-line serial read timeout.
    pub fn timeout_duration(&self) -> Duration {
        seconds(self.timeout)
    }

    /// Interval between two simulated histogram reads.
    pub fn refresh_duration(&self) -> Duration {
        seconds(self.refresh)
    }

    /// Accumulation time limit, `None` when disabled.
    pub fn max_time_duration(&self) -> Option<Duration> {
        (self.max_time > 0.0).then(|| seconds(self.max_time))
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}
