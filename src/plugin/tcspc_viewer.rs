//! 1D viewer plugin for the TCSPC Arduino.

use super::{
    Axis, DataExport, DataFromPlugin, DataKind, DetectorPlugin, GrabMode, InitStatus, SettingKind,
    SettingLimits, SettingSpec,
};
use crate::config::SimulationConfig;
use crate::controller::TcspcController;
use crate::core::ParameterValue;
use crate::error::{AppResult, DaqError};
use crate::hardware::{serial, ConnectionMode, TcspcBackend};
use crate::settings::{DeviceSettings, Property, PropertyKind, PropertyScope};
use crate::worker::{AcquisitionEvent, AcquisitionWorker};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

const EXPORT_NAME: &str = "tcspc_arduino";
const DATA_NAME: &str = "TCSPC";
const CURRENT: &str = "current";
const TOTAL: &str = "total";

/// Capacity of the export channel.
const EXPORT_CAPACITY: usize = 64;

struct Session {
    controller: Arc<AsyncMutex<TcspcController>>,
    worker: Arc<AcquisitionWorker>,
}

/// Detector plugin wrapping a [`TcspcController`] and its [`AcquisitionWorker`].
///
/// Settings committed before [`ini_detector`](DetectorPlugin::ini_detector) are kept
/// locally and used to build the controller.
pub struct TcspcViewer {
    settings: Arc<Mutex<DeviceSettings>>,
    simulation: SimulationConfig,
    available_ports: Vec<String>,
    backend_override: Mutex<Option<Box<dyn TcspcBackend>>>,
    session: Mutex<Option<Arc<Session>>>,
    exports: broadcast::Sender<DataExport>,
}

impl TcspcViewer {
    /// Viewer over the serial ports present on this machine.
    pub fn new(settings: DeviceSettings, simulation: SimulationConfig) -> Self {
        Self::with_ports(settings, simulation, serial::available_ports())
    }

    /// Viewer over an explicit port list.
    ///
    /// Without a configured port the first available one is preselected.
    pub fn with_ports(mut settings: DeviceSettings, simulation: SimulationConfig, ports: Vec<String>) -> Self {
        if settings.port.is_none() {
            settings.port = ports.first().cloned();
        }
        let (exports, _) = broadcast::channel(EXPORT_CAPACITY);
        Self {
            settings: Arc::new(Mutex::new(settings)),
            simulation,
            available_ports: ports,
            backend_override: Mutex::new(None),
            session: Mutex::new(None),
            exports,
        }
    }

    /// Use `backend` at the next `ini_detector` instead of opening a port.
    pub fn with_backend(self, backend: Box<dyn TcspcBackend>) -> Self {
        *self.backend_override.lock() = Some(backend);
        self
    }

    /// Settings as the viewer currently knows them.
    pub fn settings(&self) -> DeviceSettings {
        self.settings.lock().clone()
    }

    /// Mode of the initialised controller.
    pub async fn mode(&self) -> Option<ConnectionMode> {
        let session = self.session.lock().clone()?;
        let controller = session.controller.lock().await;
        controller.mode()
    }

    /// True while a live acquisition runs.
    pub fn is_live(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.worker.is_running())
    }

    /// Error that ended the last live acquisition, if any.
    pub fn last_error(&self) -> Option<String> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.worker.last_error())
    }

    fn session(&self) -> AppResult<Arc<Session>> {
        self.session.lock().clone().ok_or(DaqError::NotInitialized)
    }

    fn axis(settings: &DeviceSettings) -> Axis {
        Axis {
            label: "Time".to_string(),
            units: "µs".to_string(),
            data: settings.x_axis(),
        }
    }

    fn publish(&self, export: DataExport) {
        // No subscribers is not an error.
        let _ = self.exports.send(export);
    }

    /// Zero-filled traces on the current axis, so the host can resize its plot.
    fn emit_axis(&self) {
        let settings = self.settings();
        let zeros = vec![0.0; settings.n_bins];
        self.publish(DataExport {
            name: EXPORT_NAME.to_string(),
            kind: DataKind::Temporary,
            data: vec![DataFromPlugin {
                name: DATA_NAME.to_string(),
                labels: vec![CURRENT.to_string(), TOTAL.to_string()],
                arrays: vec![zeros.clone(), zeros],
                axis: Self::axis(&settings),
            }],
        });
    }

    async fn build_controller(&self) -> AppResult<TcspcController> {
        let settings = self.settings();
        let backend = self.backend_override.lock().take();
        match backend {
            Some(backend) => TcspcController::with_backend(settings, backend).await,
            None => {
                let mut controller = TcspcController::new(settings, self.simulation.clone());
                controller.connect().await?;
                Ok(controller)
            }
        }
    }

    async fn shutdown(&self, session: Arc<Session>) {
        if session.worker.is_running() {
            session.worker.stop();
            if let Err(e) = session.worker.wait().await {
                debug!(error = %e, "Live acquisition ended with an error");
            }
        }
        session.controller.lock().await.disconnect().await;
    }
}

/// Map a worker event to a host export.
pub fn export_from_event(event: &AcquisitionEvent, axis: Axis) -> DataExport {
    let snapshot = event.snapshot();
    let kind = if event.is_final() {
        DataKind::Persisted
    } else {
        DataKind::Temporary
    };
    DataExport {
        name: EXPORT_NAME.to_string(),
        kind,
        data: vec![DataFromPlugin {
            name: DATA_NAME.to_string(),
            labels: vec![CURRENT.to_string(), TOTAL.to_string()],
            arrays: vec![snapshot.current.as_f64(), snapshot.total.as_f64()],
            axis,
        }],
    }
}

fn spawn_forwarder(
    worker: &AcquisitionWorker,
    settings: Arc<Mutex<DeviceSettings>>,
    exports: broadcast::Sender<DataExport>,
) {
    let mut events = worker.subscribe();
    tokio::spawn(async move {
        while events.changed().await.is_ok() {
            let event = events.borrow_and_update().clone();
            if let Some(event) = event {
                let axis = TcspcViewer::axis(&settings.lock());
                let _ = exports.send(export_from_event(&event, axis));
            }
        }
    });
}

#[async_trait]
impl DetectorPlugin for TcspcViewer {
    fn settings_schema(&self) -> Vec<SettingSpec> {
        let settings = self.settings();
        let simulating = self.available_ports.is_empty();

        let mut schema = vec![SettingSpec {
            name: "device_id".to_string(),
            title: "Device identifier".to_string(),
            kind: SettingKind::Str,
            value: settings.port.clone().unwrap_or_default().into(),
            limits: SettingLimits::Choices(
                self.available_ports.iter().map(|p| p.as_str().into()).collect(),
            ),
        }];

        for property in Property::ALL {
            if property.scope() == PropertyScope::Simulation && !simulating {
                continue;
            }
            let kind = match (property, property.kind()) {
                (Property::Baudrate, _) => SettingKind::List,
                (_, PropertyKind::Int) => SettingKind::Int,
                (_, PropertyKind::Float) => SettingKind::Float,
            };
            schema.push(SettingSpec {
                name: property.name().to_string(),
                title: property.title().to_string(),
                kind,
                value: settings.get(property),
                limits: property.limits().into(),
            });
        }
        schema
    }

    async fn commit_settings(&self, name: &str, value: ParameterValue) -> AppResult<()> {
        if name == "device_id" {
            let port = value.as_string();
            let port = (!port.trim().is_empty()).then_some(port);
            info!(port = ?port, "Device identifier changed, applied at next initialisation");
            self.settings.lock().port = port;
            return Ok(());
        }

        let property: Property = name.parse()?;
        let session = self.session.lock().clone();
        match session {
            Some(session) => {
                let mut controller = session.controller.lock().await;
                controller.set_property(property, value).await?;
                let stored = controller.settings().get(property);
                self.settings.lock().set(property, &stored)?;
            }
            None => {
                self.settings.lock().set(property, &value)?;
            }
        }

        if property.affects_axis() {
            self.emit_axis();
        }
        Ok(())
    }

    async fn ini_detector(&self) -> AppResult<InitStatus> {
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            self.shutdown(previous).await;
        }

        let controller = match self.build_controller().await {
            Ok(controller) => controller,
            Err(e) => {
                error!(error = %e, "TCSPC Arduino initialisation failed");
                return Ok(InitStatus {
                    info: e.to_string(),
                    initialized: false,
                });
            }
        };
        let mode = controller.mode();

        let controller = Arc::new(AsyncMutex::new(controller));
        let worker = Arc::new(AcquisitionWorker::new(controller.clone()));
        // Ends by itself once the worker, and with it the event channel, is dropped.
        spawn_forwarder(&worker, self.settings.clone(), self.exports.clone());
        *self.session.lock() = Some(Arc::new(Session { controller, worker }));

        self.emit_axis();

        let info = match mode {
            Some(mode) => format!("TCSPC Arduino successfully initialised: {}", mode),
            None => "TCSPC Arduino successfully initialised".to_string(),
        };
        info!("{}", info);
        Ok(InitStatus {
            info,
            initialized: true,
        })
    }

    async fn grab_data(&self, mode: GrabMode) -> AppResult<()> {
        let session = self.session()?;
        match mode {
            GrabMode::Live => {
                if !session.worker.start().await? {
                    debug!("Live grab requested while already live");
                }
                Ok(())
            }
            GrabMode::Single => {
                if session.worker.is_running() {
                    session.worker.stop();
                    if let Err(e) = session.worker.wait().await {
                        warn!(error = %e, "Live acquisition ended with an error");
                    }
                }

                let histogram = session.controller.lock().await.get_histogram().await?;
                let axis = Self::axis(&self.settings());
                self.publish(DataExport {
                    name: EXPORT_NAME.to_string(),
                    kind: DataKind::Persisted,
                    data: vec![DataFromPlugin {
                        name: DATA_NAME.to_string(),
                        labels: vec![CURRENT.to_string()],
                        arrays: vec![histogram.as_f64()],
                        axis,
                    }],
                });
                Ok(())
            }
        }
    }

    async fn stop(&self) -> AppResult<()> {
        if let Some(session) = self.session.lock().as_ref() {
            session.worker.stop();
        }
        Ok(())
    }

    async fn close(&self) -> AppResult<()> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            self.shutdown(session).await;
            info!("TCSPC Arduino closed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<DataExport> {
        self.exports.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::StopReason;
    use crate::core::Histogram;
    use crate::worker::Snapshot;
    use chrono::Utc;

    fn snapshot() -> Snapshot {
        Snapshot {
            iteration: 1,
            timestamp: Utc::now(),
            current: Histogram::from(vec![1, 2]),
            total: Histogram::from(vec![3, 4]),
        }
    }

    fn axis() -> Axis {
        Axis {
            label: "Time".into(),
            units: "µs".into(),
            data: vec![0.1, 0.2],
        }
    }

    #[test]
    fn test_event_kinds_map_to_export_kinds() {
        let export = export_from_event(&AcquisitionEvent::InProgress(snapshot()), axis());
        assert_eq!(export.kind, DataKind::Temporary);
        assert_eq!(export.data[0].array("total"), Some(&[3.0, 4.0][..]));

        let export = export_from_event(
            &AcquisitionEvent::Final {
                snapshot: snapshot(),
                reason: StopReason::TimeLimit,
            },
            axis(),
        );
        assert_eq!(export.kind, DataKind::Persisted);
        assert_eq!(export.data[0].labels, vec!["current", "total"]);
    }

    #[test]
    fn test_schema_lists_simulation_settings_only_without_ports() {
        let viewer = TcspcViewer::with_ports(DeviceSettings::default(), SimulationConfig::default(), vec![]);
        let names: Vec<String> = viewer.settings_schema().into_iter().map(|s| s.name).collect();
        assert!(names.contains(&"dark_rate".to_string()));
        assert_eq!(names.len(), 14);

        let viewer = TcspcViewer::with_ports(
            DeviceSettings::default(),
            SimulationConfig::default(),
            vec!["/dev/ttyACM0".to_string()],
        );
        let schema = viewer.settings_schema();
        assert!(!schema.iter().any(|s| s.name == "lifetime"));
        assert_eq!(schema[0].value, ParameterValue::from("/dev/ttyACM0"));
        assert_eq!(schema[1].kind, SettingKind::List);
    }

    #[tokio::test]
    async fn test_grab_before_init_is_rejected() {
        let viewer = TcspcViewer::with_ports(DeviceSettings::default(), SimulationConfig::default(), vec![]);
        let err = viewer.grab_data(GrabMode::Single).await.unwrap_err();
        assert!(matches!(err, DaqError::NotInitialized));
    }
}
