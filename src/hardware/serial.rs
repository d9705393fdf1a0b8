//! Serial backend for the physical histogrammer.
//!
//! Wraps the `serialport` crate. The port is synchronous, so every exchange runs on
//! Tokio's blocking pool.

use super::TcspcBackend;
use crate::error::{AppResult, DaqError};
use crate::settings::DeviceSettings;

#[cfg(feature = "instrument_serial")]
pub use enabled::SerialBackend;

/// Names of the serial ports present on this machine.
///
/// Empty when enumeration fails or serial support is compiled out.
pub fn available_ports() -> Vec<String> {
    #[cfg(feature = "instrument_serial")]
    {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to enumerate serial ports");
                Vec::new()
            }
        }
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        Vec::new()
    }
}

/// Open `port` with the link parameters in `settings`.
pub async fn open(port: &str, settings: &DeviceSettings) -> AppResult<Box<dyn TcspcBackend>> {
    #[cfg(feature = "instrument_serial")]
    {
        let backend = SerialBackend::open(port, settings)?;
        Ok(Box::new(backend))
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        let _ = (port, settings);
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
mod enabled {
    use super::*;
    use crate::core::Histogram;
    use crate::hardware::protocol::{self, RATE_ONCE, RECORD, RECORD_ONCE, STOP};
    use crate::hardware::ConnectionMode;
    use crate::settings::{Property, PropertyScope};
    use async_trait::async_trait;
    use serialport::{ClearBuffer, SerialPort};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tracing::{debug, info};

    /// Internal poll interval of the port; the per-line timeout is enforced on top of it.
    const PORT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

    impl protocol::LinePort for dyn SerialPort {
        fn discard_input(&mut self) -> std::io::Result<()> {
            self.clear(ClearBuffer::Input).map_err(std::io::Error::from)
        }
    }

    /// Arduino histogrammer on a serial port.
    pub struct SerialBackend {
        /// Port name (e.g., "/dev/ttyACM0", "COM3")
        port_name: String,

        /// Per-line read timeout
        timeout: Duration,

        /// Lines expected per histogram
        n_bins: usize,

        port: Arc<Mutex<Box<dyn SerialPort>>>,
    }

    impl SerialBackend {
        /// Open the port at `settings.baudrate`.
        pub fn open(port_name: &str, settings: &DeviceSettings) -> AppResult<Self> {
            let port = serialport::new(port_name, settings.baudrate)
                .timeout(PORT_POLL_TIMEOUT)
                .open()
                .map_err(|e| DaqError::SerialOpen {
                    port: port_name.to_string(),
                    reason: e.to_string(),
                })?;

            info!(port = port_name, baudrate = settings.baudrate, "Serial port opened");

            Ok(Self {
                port_name: port_name.to_string(),
                timeout: settings.timeout_duration(),
                n_bins: settings.n_bins,
                port: Arc::new(Mutex::new(port)),
            })
        }

        /// Write `command` and read `reply_lines` lines back.
        async fn exchange(&self, command: String, reply_lines: usize) -> AppResult<Vec<String>> {
            let port = self.port.clone();
            let timeout = self.timeout;

            tokio::task::spawn_blocking(move || -> AppResult<Vec<String>> {
                let mut guard = port.blocking_lock();
                let lines = protocol::transact(&mut **guard, &command, reply_lines, timeout)?;
                if !command.is_empty() {
                    debug!(command = command.trim_end(), "Sent serial command");
                }
                Ok(lines)
            })
            .await
            .map_err(|e| DaqError::Worker(format!("serial I/O task failed: {}", e)))?
        }

        async fn send(&self, command: String) -> AppResult<()> {
            self.exchange(command, 0).await.map(|_| ())
        }

        async fn read_counts(&self, command: Option<&str>) -> AppResult<Histogram> {
            let command = command.map(protocol::format_command).unwrap_or_default();
            let lines = self.exchange(command, self.n_bins).await?;
            protocol::parse_histogram(&lines)
        }
    }

    #[async_trait]
    impl TcspcBackend for SerialBackend {
        fn mode(&self) -> ConnectionMode {
            ConnectionMode::Device {
                port: self.port_name.clone(),
            }
        }

        async fn write_property(&mut self, property: Property, settings: &DeviceSettings) -> AppResult<()> {
            match property.scope() {
                PropertyScope::Device => {
                    if property == Property::NBins {
                        self.n_bins = settings.n_bins;
                    }
                    self.send(protocol::format_set(property, &settings.get(property))).await
                }
                PropertyScope::Host => {
                    if property == Property::Timeout {
                        self.timeout = settings.timeout_duration();
                    }
                    Ok(())
                }
                PropertyScope::Simulation => Err(DaqError::NotSupported {
                    mode: "device".to_string(),
                    operation: format!("set {}", property),
                }),
            }
        }

        async fn read_property(&mut self, property: Property) -> AppResult<f64> {
            let lines = self.exchange(protocol::format_get(property), 1).await?;
            let line = lines.first().ok_or(DaqError::SerialUnexpectedEof)?;
            protocol::parse_value_line(line)
        }

        async fn begin_recording(&mut self) -> AppResult<()> {
            self.send(protocol::format_command(RECORD)).await
        }

        async fn read_histogram(&mut self) -> AppResult<Histogram> {
            self.read_counts(None).await
        }

        async fn record_once(&mut self) -> AppResult<Histogram> {
            self.read_counts(Some(RECORD_ONCE)).await
        }

        async fn read_rate(&mut self) -> AppResult<f64> {
            let lines = self.exchange(protocol::format_command(RATE_ONCE), 1).await?;
            let line = lines.first().ok_or(DaqError::SerialUnexpectedEof)?;
            protocol::parse_value_line(line)
        }

        async fn stop(&mut self) -> AppResult<()> {
            self.send(protocol::format_command(STOP)).await?;
            let port = self.port.clone();
            tokio::task::spawn_blocking(move || {
                use protocol::LinePort;
                port.blocking_lock().discard_input()
            })
            .await
            .map_err(|e| DaqError::Worker(format!("serial I/O task failed: {}", e)))??;
            Ok(())
        }

        async fn close(&mut self) -> AppResult<()> {
            debug!(port = %self.port_name, "Serial port closed");
            Ok(())
        }
    }
}
