//! Scripted replay backend.
//!
//! Stands in for the histogrammer in tests and demos. It provides:
//! - a queue of scripted histograms, replayed in order
//! - simulated read latency (tokio sleep, so paused-time tests stay deterministic)
//! - one-shot and read-indexed failure injection
//! - a call log of the commands the device would have received
//!
//! Clones share state, so a test can keep one handle and give another to the controller.

use super::{protocol, ConnectionMode, TcspcBackend};
use crate::core::{Histogram, ParameterValue};
use crate::error::{AppResult, DaqError};
use crate::settings::{DeviceSettings, Property};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockState {
    script: VecDeque<Histogram>,
    settings: DeviceSettings,
    call_log: Vec<String>,
    fail_read_at: Option<u64>,
    rate: f64,
}

/// Mock histogrammer replaying scripted data.
///
/// # Example
///
/// ```
/// use tcspc_arduino::core::Histogram;
/// use tcspc_arduino::hardware::mock::MockBackend;
///
/// let backend = MockBackend::new().with_histograms(vec![Histogram::from(vec![1, 0, 2])]);
/// assert_eq!(backend.read_count(), 0);
/// assert!(backend.call_log().is_empty());
/// ```
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    latency: Arc<Mutex<Duration>>,
    should_fail_next: Arc<AtomicBool>,
    reads: Arc<AtomicU64>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Empty script, 10 ms latency.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            latency: Arc::new(Mutex::new(Duration::from_millis(10))),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue histograms to replay. Once the script is exhausted, reads return zeros.
    pub fn with_histograms(self, histograms: impl IntoIterator<Item = Histogram>) -> Self {
        self.state.lock().script.extend(histograms);
        self
    }

    /// Set the simulated latency of every read.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = latency;
        self
    }

    /// Value returned by `read_rate`.
    pub fn with_rate(self, rate: f64) -> Self {
        self.state.lock().rate = rate;
        self
    }

    /// Make the `n`th histogram read (1-based) fail.
    pub fn fail_read_at(self, n: u64) -> Self {
        self.state.lock().fail_read_at = Some(n);
        self
    }

    /// Change a device register behind the host's back, as a firmware reset would.
    pub fn set_register(&self, property: Property, value: ParameterValue) -> AppResult<()> {
        self.state.lock().settings.set(property, &value)
    }

    /// Inject a failure for the next operation.
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> AppResult<()> {
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(DaqError::Protocol("injected failure".to_string()));
        }
        Ok(())
    }

    /// Commands received so far, without terminators.
    pub fn call_log(&self) -> Vec<String> {
        self.state.lock().call_log.clone()
    }

    /// Clear the call log.
    pub fn clear_log(&self) {
        self.state.lock().call_log.clear();
    }

    /// Number of histogram reads attempted.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn log_call(&self, command: &str) {
        self.state
            .lock()
            .call_log
            .push(command.trim_end_matches(protocol::COMMAND_TERMINATOR).to_string());
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    async fn next_histogram(&self) -> AppResult<Histogram> {
        self.simulate_latency().await;
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        self.check_failure()?;

        let mut state = self.state.lock();
        if state.fail_read_at == Some(read) {
            return Err(DaqError::Protocol(format!("scripted failure on read {}", read)));
        }
        let n_bins = state.settings.n_bins;
        Ok(state
            .script
            .pop_front()
            .unwrap_or_else(|| Histogram::zeros(n_bins)))
    }
}

#[async_trait]
impl TcspcBackend for MockBackend {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Scripted
    }

    async fn write_property(&mut self, property: Property, settings: &DeviceSettings) -> AppResult<()> {
        self.check_failure()?;
        self.log_call(&protocol::format_set(property, &settings.get(property)));
        self.state.lock().settings = settings.clone();
        Ok(())
    }

    async fn read_property(&mut self, property: Property) -> AppResult<f64> {
        self.check_failure()?;
        self.log_call(&protocol::format_get(property));
        Ok(self.state.lock().settings.get(property).as_f64().unwrap_or_default())
    }

    async fn begin_recording(&mut self) -> AppResult<()> {
        self.check_failure()?;
        self.log_call(protocol::RECORD);
        Ok(())
    }

    async fn read_histogram(&mut self) -> AppResult<Histogram> {
        self.next_histogram().await
    }

    async fn record_once(&mut self) -> AppResult<Histogram> {
        self.log_call(protocol::RECORD_ONCE);
        self.next_histogram().await
    }

    async fn read_rate(&mut self) -> AppResult<f64> {
        self.check_failure()?;
        self.log_call(protocol::RATE_ONCE);
        Ok(self.state.lock().rate)
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.log_call(protocol::STOP);
        self.check_failure()
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log_call("close");
        Ok(())
    }
}
