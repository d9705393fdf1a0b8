//! Backends the controller talks to.
//!
//! A backend is selected once, at connect time, and hides the difference between the
//! physical histogrammer and its stand-ins:
//!
//! - [`serial::SerialBackend`]: the Arduino over a serial line (feature `instrument_serial`)
//! - [`simulation::SimulatedBackend`]: Poisson samples of a decay model
//! - [`mock::MockBackend`]: scripted replay for tests and demos
//!
//! All of them implement [`TcspcBackend`].

pub mod mock;
pub mod protocol;
pub mod serial;
pub mod simulation;

use crate::core::Histogram;
use crate::error::AppResult;
use crate::settings::{DeviceSettings, Property};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the controller is simulating instead of talking to a device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationReason {
    /// No serial port was configured.
    NoPortConfigured,
    /// A port was configured but could not be opened; holds the error text.
    PortUnavailable(String),
}

/// Which kind of backend a connected controller uses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// Physical device on the named serial port.
    Device { port: String },
    /// Simulation fallback.
    Simulated { reason: SimulationReason },
    /// Scripted replay backend.
    Scripted,
}

impl ConnectionMode {
    /// True when histograms come from the simulation model.
    pub fn is_simulated(&self) -> bool {
        matches!(self, ConnectionMode::Simulated { .. })
    }

    /// Short label used in logs and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionMode::Device { .. } => "device",
            ConnectionMode::Simulated { .. } => "simulation",
            ConnectionMode::Scripted => "scripted",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::Device { port } => write!(f, "device on {}", port),
            ConnectionMode::Simulated {
                reason: SimulationReason::NoPortConfigured,
            } => write!(f, "simulation (no serial port configured)"),
            ConnectionMode::Simulated {
                reason: SimulationReason::PortUnavailable(detail),
            } => write!(f, "simulation (serial port unavailable: {})", detail),
            ConnectionMode::Scripted => write!(f, "scripted replay"),
        }
    }
}

/// Operations shared by every histogrammer backend.
///
/// Backends keep whatever settings they need. The controller validates a change, hands the
/// candidate settings to [`write_property`](TcspcBackend::write_property), and only stores
/// them once the backend accepted the write.
#[async_trait]
pub trait TcspcBackend: Send {
    /// Connection mode this backend represents.
    fn mode(&self) -> ConnectionMode;

    /// Apply `property` as found in `settings`.
    async fn write_property(&mut self, property: Property, settings: &DeviceSettings) -> AppResult<()>;

    /// Read `property` back from the backend.
    async fn read_property(&mut self, property: Property) -> AppResult<f64>;

    /// Put the device into continuous recording.
    async fn begin_recording(&mut self) -> AppResult<()>;

    /// Read the next histogram of a running acquisition.
    async fn read_histogram(&mut self) -> AppResult<Histogram>;

    /// Record and return exactly one histogram.
    async fn record_once(&mut self) -> AppResult<Histogram>;

    /// Measure the current count rate in counts per second.
    async fn read_rate(&mut self) -> AppResult<f64>;

    /// Stop recording.
    async fn stop(&mut self) -> AppResult<()>;

    /// Release the underlying resources.
    async fn close(&mut self) -> AppResult<()>;
}
