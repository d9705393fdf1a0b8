//! Device controller for the TCSPC histogrammer.
//!
//! The controller owns the connection, the typed [`DeviceSettings`] and the acquiring flag.
//! It picks a backend once, in [`TcspcController::connect`]:
//!
//! - no port configured: simulation
//! - port configured but cannot be opened: simulation, with the open error kept in the mode
//! - port opened: the device, with the device registers pushed so it matches the host
//!
//! While an acquisition is active every settings access is refused with
//! [`DaqError::AcquisitionActive`]; the worker is the only party that talks to the device
//! until [`TcspcController::stop`].

use crate::config::SimulationConfig;
use crate::core::{Histogram, ParameterValue};
use crate::error::{AppResult, DaqError};
use crate::hardware::simulation::SimulatedBackend;
use crate::hardware::{serial, ConnectionMode, SimulationReason, TcspcBackend};
use crate::settings::{DeviceSettings, Property, PropertyScope};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why an acquisition ended on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// `max_time` elapsed.
    TimeLimit,
    /// The largest bin of the running total reached `max_counts`.
    CountLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TimeLimit => write!(f, "time limit reached"),
            StopReason::CountLimit => write!(f, "count limit reached"),
        }
    }
}

/// Limits captured when an acquisition starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StopConditions {
    /// Absent when `max_time` is 0.
    pub deadline: Option<Instant>,
    /// 0 disables the count ceiling.
    pub max_counts: u64,
}

impl StopConditions {
    /// Which limit, if any, `total` has hit at `now`. The time limit is checked first.
    pub fn evaluate(&self, total: &Histogram, now: Instant) -> Option<StopReason> {
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            return Some(StopReason::TimeLimit);
        }
        if self.max_counts > 0 && total.max_count() >= self.max_counts {
            return Some(StopReason::CountLimit);
        }
        None
    }
}

/// State handed to the worker by [`TcspcController::start_tcspc`].
#[derive(Clone, Debug)]
pub struct AcquisitionRun {
    /// Zero-filled running total, one bin per configured bin.
    pub total: Histogram,
    pub stop: StopConditions,
}

/// Controller for one TCSPC histogrammer.
pub struct TcspcController {
    settings: DeviceSettings,
    simulation: SimulationConfig,
    backend: Option<Box<dyn TcspcBackend>>,
    acquiring: bool,
}

impl TcspcController {
    /// New, not yet connected controller.
    pub fn new(settings: DeviceSettings, simulation: SimulationConfig) -> Self {
        Self {
            settings,
            simulation,
            backend: None,
            acquiring: false,
        }
    }

    /// Controller already connected to `backend`.
    ///
    /// Unless the backend simulates, the device registers are pushed to it as in
    /// [`connect`](Self::connect).
    pub async fn with_backend(settings: DeviceSettings, backend: Box<dyn TcspcBackend>) -> AppResult<Self> {
        let mut controller = Self::new(settings, SimulationConfig::default());
        controller.attach(backend).await?;
        Ok(controller)
    }

    /// Open the configured port, or fall back to simulation.
    ///
    /// A missing or unopenable port is not an error; the returned mode says which backend
    /// was chosen. Errors only come from pushing the settings to an opened device.
    pub async fn connect(&mut self) -> AppResult<ConnectionMode> {
        if self.backend.is_some() {
            self.disconnect().await;
        }

        let backend: Box<dyn TcspcBackend> = match self.settings.port.clone() {
            None => {
                info!("No serial port configured, using simulation");
                self.simulated(SimulationReason::NoPortConfigured)
            }
            Some(port) => match serial::open(&port, &self.settings).await {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(port = %port, error = %e, "Serial port unavailable, falling back to simulation");
                    self.simulated(SimulationReason::PortUnavailable(e.to_string()))
                }
            },
        };

        self.attach(backend).await?;
        let mode = self.mode().unwrap_or(ConnectionMode::Scripted);
        info!(mode = %mode, "TCSPC controller connected");
        Ok(mode)
    }

    fn simulated(&self, reason: SimulationReason) -> Box<dyn TcspcBackend> {
        Box::new(SimulatedBackend::new(&self.settings, reason, self.simulation.seed))
    }

    async fn attach(&mut self, mut backend: Box<dyn TcspcBackend>) -> AppResult<()> {
        if !backend.mode().is_simulated() {
            for property in Property::ALL {
                if property.scope() == PropertyScope::Device {
                    if let Err(e) = backend.write_property(property, &self.settings).await {
                        if let Err(close_err) = backend.close().await {
                            warn!(error = %close_err, "Failed to close backend");
                        }
                        return Err(e);
                    }
                }
            }
        }
        self.backend = Some(backend);
        self.acquiring = false;
        Ok(())
    }

    /// Stop any acquisition and release the backend. Safe to call repeatedly.
    pub async fn disconnect(&mut self) {
        if self.acquiring {
            if let Err(e) = self.stop().await {
                warn!(error = %e, "Failed to stop acquisition while disconnecting");
            }
        }
        if let Some(mut backend) = self.backend.take() {
            if let Err(e) = backend.close().await {
                warn!(error = %e, "Failed to close backend");
            }
            info!("TCSPC controller disconnected");
        }
        self.acquiring = false;
    }

    /// Mode of the connected backend, `None` before `connect`.
    pub fn mode(&self) -> Option<ConnectionMode> {
        self.backend.as_ref().map(|b| b.mode())
    }

    /// True when connected to the simulation.
    pub fn is_simulated(&self) -> bool {
        self.mode().is_some_and(|m| m.is_simulated())
    }

    pub fn is_connected(&self) -> bool {
        self.backend.is_some()
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    /// Settings as last stored.
    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    /// Time axis of the current bin configuration.
    pub fn x_axis(&self) -> Vec<f64> {
        self.settings.x_axis()
    }

    fn ensure_idle(&self, operation: &str) -> AppResult<()> {
        if self.acquiring {
            return Err(DaqError::AcquisitionActive(operation.to_string()));
        }
        Ok(())
    }

    fn ensure_supported(&self, property: Property, operation: &str) -> AppResult<()> {
        if property.scope() != PropertyScope::Simulation {
            return Ok(());
        }
        match self.mode() {
            Some(mode) if !mode.is_simulated() => Err(DaqError::NotSupported {
                mode: mode.label().to_string(),
                operation: format!("{} {}", operation, property),
            }),
            _ => Ok(()),
        }
    }

    fn backend_mut(&mut self) -> AppResult<&mut Box<dyn TcspcBackend>> {
        self.backend.as_mut().ok_or(DaqError::SerialPortNotConnected)
    }

    /// Validate `value`, apply it through the backend, then store it.
    pub async fn set_property(&mut self, property: Property, value: ParameterValue) -> AppResult<()> {
        self.ensure_idle(&format!("set {}", property))?;
        self.ensure_supported(property, "set")?;

        let mut candidate = self.settings.clone();
        candidate.set(property, &value)?;

        if let Some(backend) = self.backend.as_mut() {
            backend.write_property(property, &candidate).await?;
        }
        debug!(%property, value = %candidate.get(property), "Setting updated");
        self.settings = candidate;
        Ok(())
    }

    /// Current value of `property`. Device registers are read back from a real device.
    pub async fn get_property(&mut self, property: Property) -> AppResult<ParameterValue> {
        self.ensure_idle(&format!("get {}", property))?;
        self.ensure_supported(property, "get")?;

        let reads_device = property.scope() == PropertyScope::Device && !self.is_simulated();
        if reads_device {
            if let Some(backend) = self.backend.as_mut() {
                let raw = backend.read_property(property).await?;
                let cached = self.settings.get(property);
                self.settings
                    .set(property, &ParameterValue::Float(raw))
                    .map_err(|e| DaqError::Protocol(format!("device reported {}: {}", raw, e)))?;
                if self.settings.get(property) != cached {
                    debug!(%property, %cached, reported = raw, "Device register differs from cache");
                    // Keeps the backend's own view (bins per histogram) in line.
                    backend.write_property(property, &self.settings).await?;
                }
            }
        }
        Ok(self.settings.get(property))
    }

    /// [`set_property`](Self::set_property) addressed by setting name.
    pub async fn set_named(&mut self, name: &str, value: ParameterValue) -> AppResult<()> {
        self.set_property(name.parse()?, value).await
    }

    /// [`get_property`](Self::get_property) addressed by setting name.
    pub async fn get_named(&mut self, name: &str) -> AppResult<ParameterValue> {
        self.get_property(name.parse()?).await
    }

    /// Put the device into recording and hand back a fresh run.
    pub async fn start_tcspc(&mut self) -> AppResult<AcquisitionRun> {
        if self.backend.is_none() {
            return Err(DaqError::SerialPortNotConnected);
        }
        self.ensure_idle("start")?;

        self.acquiring = true;
        if let Err(e) = self.backend_mut()?.begin_recording().await {
            self.acquiring = false;
            return Err(e);
        }

        let deadline = self
            .settings
            .max_time_duration()
            .and_then(|limit| Instant::now().checked_add(limit));
        let run = AcquisitionRun {
            total: Histogram::zeros(self.settings.n_bins),
            stop: StopConditions {
                deadline,
                max_counts: self.settings.max_counts,
            },
        };
        info!(
            n_bins = self.settings.n_bins,
            max_time = self.settings.max_time,
            max_counts = self.settings.max_counts,
            "TCSPC acquisition started"
        );
        Ok(run)
    }

    /// Next histogram of the running acquisition.
    pub async fn read_histogram(&mut self) -> AppResult<Histogram> {
        self.backend_mut()?.read_histogram().await
    }

    /// Record one histogram outside of a live acquisition.
    pub async fn get_histogram(&mut self) -> AppResult<Histogram> {
        self.ensure_idle("single grab")?;
        self.backend_mut()?.record_once().await
    }

    /// Current count rate in counts per second.
    pub async fn read_rate(&mut self) -> AppResult<f64> {
        self.ensure_idle("rate measurement")?;
        self.backend_mut()?.read_rate().await
    }

    /// Stop recording. The acquiring flag is cleared even if the device command fails.
    pub async fn stop(&mut self) -> AppResult<()> {
        let result = match self.backend.as_mut() {
            Some(backend) => backend.stop().await,
            None => Ok(()),
        };
        if self.acquiring {
            info!("TCSPC acquisition stopped");
        }
        self.acquiring = false;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockBackend;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn settings() -> DeviceSettings {
        DeviceSettings {
            n_bins: 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_stop_conditions_evaluate() {
        let now = Instant::now();
        let mut total = Histogram::from(vec![0, 3, 1]);

        let none = StopConditions {
            deadline: None,
            max_counts: 0,
        };
        assert_eq!(none.evaluate(&total, now), None);

        let counts = StopConditions {
            deadline: None,
            max_counts: 5,
        };
        assert_eq!(counts.evaluate(&total, now), None);
        total.accumulate(&Histogram::from(vec![0, 2, 0])).unwrap();
        assert_eq!(counts.evaluate(&total, now), Some(StopReason::CountLimit));

        let time = StopConditions {
            deadline: Some(now + Duration::from_secs(2)),
            max_counts: 5,
        };
        assert_eq!(time.evaluate(&Histogram::zeros(3), now), None);
        assert_eq!(
            time.evaluate(&total, now + Duration::from_secs(2)),
            Some(StopReason::TimeLimit)
        );
    }

    #[tokio::test]
    async fn test_connect_without_port_simulates() {
        let mut controller = TcspcController::new(settings(), SimulationConfig { seed: Some(1) });
        let mode = controller.connect().await.unwrap();
        assert_eq!(
            mode,
            ConnectionMode::Simulated {
                reason: SimulationReason::NoPortConfigured
            }
        );
        assert!(controller.is_simulated());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_with_missing_port_falls_back() {
        let mut controller = TcspcController::new(
            DeviceSettings {
                port: Some("/dev/does-not-exist-tcspc".into()),
                ..settings()
            },
            SimulationConfig::default(),
        );
        let mode = controller.connect().await.unwrap();
        assert!(matches!(
            mode,
            ConnectionMode::Simulated {
                reason: SimulationReason::PortUnavailable(_)
            }
        ));
        assert!(logs_contain("falling back to simulation"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_rejected_while_acquiring() {
        let mut controller = TcspcController::with_backend(settings(), Box::new(MockBackend::new()))
            .await
            .unwrap();
        controller.start_tcspc().await.unwrap();

        let err = controller
            .set_property(Property::BinSize, ParameterValue::Float(1.0))
            .await
            .unwrap_err();
        assert!(err.is_invalid_operation());
        assert!(controller.get_property(Property::NBins).await.unwrap_err().is_invalid_operation());
        assert_eq!(controller.settings().bin_size, 0.1);

        controller.stop().await.unwrap();
        controller
            .set_property(Property::BinSize, ParameterValue::Float(1.0))
            .await
            .unwrap();
        assert_eq!(controller.settings().bin_size, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_properties_not_supported_on_device() {
        let mut controller = TcspcController::with_backend(settings(), Box::new(MockBackend::new()))
            .await
            .unwrap();
        let err = controller
            .set_property(Property::Lifetime, ParameterValue::Float(2.0))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::NotSupported { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_begin_clears_flag() {
        let mock = MockBackend::new();
        let mut controller = TcspcController::with_backend(settings(), Box::new(mock.clone()))
            .await
            .unwrap();
        mock.inject_next_failure();
        assert!(controller.start_tcspc().await.is_err());
        assert!(!controller.is_acquiring());
    }
}
