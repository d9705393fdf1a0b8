//! Live acquisition loop.
//!
//! [`AcquisitionWorker`] runs the read/accumulate/publish cycle on its own tokio task:
//!
//! ```text
//! Idle ──start()──► Running ──limit reached / read error──► Idle
//!                      │
//!                   stop()
//!                      ▼
//!                  Stopping ──next iteration──► Idle
//! ```
//!
//! Each iteration reads one histogram, adds it into the running total and publishes exactly
//! one event. Events go through a `watch` channel, so a slow consumer only ever sees the
//! newest one. The controller is locked for one read at a time, which lets host calls in
//! between observe the acquiring flag instead of blocking for the whole run.

use crate::controller::{AcquisitionRun, StopReason, TcspcController};
use crate::core::Histogram;
use crate::error::{AppResult, DaqError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Idle,
    Running,
    /// Stop requested, loop not yet exited.
    Stopping,
}

/// Histograms at one iteration of the loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// 1-based iteration number within the run.
    pub iteration: u64,
    pub timestamp: DateTime<Utc>,
    /// Histogram read in this iteration.
    pub current: Histogram,
    /// Running sum since the start of the run.
    pub total: Histogram,
}

/// Event published once per iteration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AcquisitionEvent {
    /// Partial result, more will follow.
    InProgress(Snapshot),
    /// Last event of a run that hit one of its limits.
    Final { snapshot: Snapshot, reason: StopReason },
}

impl AcquisitionEvent {
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            AcquisitionEvent::InProgress(snapshot) => snapshot,
            AcquisitionEvent::Final { snapshot, .. } => snapshot,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, AcquisitionEvent::Final { .. })
    }
}

/// Outcome of a run that ended without error.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub iterations: u64,
    /// `None` when the run was stopped by request.
    pub reason: Option<StopReason>,
    pub elapsed: Duration,
}

/// State shared between the handle and the loop task.
#[derive(Clone)]
struct Shared {
    controller: Arc<AsyncMutex<TcspcController>>,
    state: Arc<Mutex<WorkerState>>,
    stop_flag: Arc<AtomicBool>,
    events: Arc<watch::Sender<Option<AcquisitionEvent>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

/// Runs live acquisitions against a shared controller.
pub struct AcquisitionWorker {
    shared: Shared,
    task: Mutex<Option<JoinHandle<AppResult<RunSummary>>>>,
}

impl AcquisitionWorker {
    pub fn new(controller: Arc<AsyncMutex<TcspcController>>) -> Self {
        let (events, _) = watch::channel(None);
        Self {
            shared: Shared {
                controller,
                state: Arc::new(Mutex::new(WorkerState::Idle)),
                stop_flag: Arc::new(AtomicBool::new(false)),
                events: Arc::new(events),
                last_error: Arc::new(Mutex::new(None)),
            },
            task: Mutex::new(None),
        }
    }

    /// Start a run. Returns `false` without doing anything unless the worker is idle.
    ///
    /// Errors from the controller (not connected, device refused `record`) leave the
    /// worker idle.
    pub async fn start(&self) -> AppResult<bool> {
        {
            let mut state = self.shared.state.lock();
            if *state != WorkerState::Idle {
                debug!(state = ?*state, "Start ignored, acquisition already active");
                return Ok(false);
            }
            // Reset with the claim; a stop() from here on is seen by the loop.
            self.shared.stop_flag.store(false, Ordering::SeqCst);
            *self.shared.last_error.lock() = None;
            *state = WorkerState::Running;
        }

        let run = {
            let mut controller = self.shared.controller.lock().await;
            controller.start_tcspc().await
        };
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                *self.shared.state.lock() = WorkerState::Idle;
                return Err(e);
            }
        };

        if self.shared.stop_flag.load(Ordering::SeqCst) {
            debug!("Stop requested while the acquisition was starting");
        }

        // A pending stop makes the loop exit before its first read.
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move { run_loop(shared, run).await });
        *self.task.lock() = Some(handle);
        Ok(true)
    }

    /// Request a cooperative stop. Idempotent.
    pub fn stop(&self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock();
        if *state == WorkerState::Running {
            *state = WorkerState::Stopping;
            debug!("Acquisition stop requested");
        }
    }

    /// Wait for the current run to finish.
    pub async fn wait(&self) -> AppResult<RunSummary> {
        let handle = self
            .task
            .lock()
            .take()
            .ok_or_else(|| DaqError::Worker("no acquisition has been started".to_string()))?;
        handle
            .await
            .map_err(|e| DaqError::Worker(format!("acquisition task failed: {}", e)))?
    }

    /// Text of the error that ended the last run, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Subscribe to acquisition events; the newest event supersedes unread ones.
    pub fn subscribe(&self) -> watch::Receiver<Option<AcquisitionEvent>> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// True while a run is active or stopping.
    pub fn is_running(&self) -> bool {
        self.state() != WorkerState::Idle
    }
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        self.shared.stop_flag.store(true, Ordering::SeqCst);
    }
}

async fn run_loop(shared: Shared, run: AcquisitionRun) -> AppResult<RunSummary> {
    let started = Instant::now();
    let AcquisitionRun { mut total, stop } = run;
    let mut iteration = 0u64;

    let outcome: AppResult<Option<StopReason>> = loop {
        if shared.stop_flag.load(Ordering::SeqCst) {
            break Ok(None);
        }

        let current = {
            let mut controller = shared.controller.lock().await;
            controller.read_histogram().await
        };
        let current = match current {
            Ok(current) => current,
            Err(e) => break Err(e),
        };
        if let Err(e) = total.accumulate(&current) {
            break Err(e);
        }

        // A stop requested during the read discards that read.
        if shared.stop_flag.load(Ordering::SeqCst) {
            break Ok(None);
        }

        iteration += 1;
        let snapshot = Snapshot {
            iteration,
            timestamp: Utc::now(),
            current,
            total: total.clone(),
        };

        match stop.evaluate(&total, Instant::now()) {
            Some(reason) => {
                info!(iteration, %reason, max_count = total.max_count(), "Acquisition finished");
                shared
                    .events
                    .send_replace(Some(AcquisitionEvent::Final { snapshot, reason }));
                break Ok(Some(reason));
            }
            None => {
                debug!(iteration, max_count = total.max_count(), "Histogram accumulated");
                shared
                    .events
                    .send_replace(Some(AcquisitionEvent::InProgress(snapshot)));
            }
        }
    };

    if let Err(e) = shared.controller.lock().await.stop().await {
        warn!(error = %e, "Failed to stop the device after acquisition");
    }
    *shared.state.lock() = WorkerState::Idle;

    match outcome {
        Ok(reason) => Ok(RunSummary {
            iterations: iteration,
            reason,
            elapsed: started.elapsed(),
        }),
        Err(e) => {
            error!(error = %e, iteration, "Acquisition failed");
            *shared.last_error.lock() = Some(e.to_string());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockBackend;
    use crate::settings::DeviceSettings;

    async fn worker_with(mock: MockBackend, settings: DeviceSettings) -> AcquisitionWorker {
        let controller = TcspcController::with_backend(settings, Box::new(mock)).await.unwrap();
        AcquisitionWorker::new(Arc::new(AsyncMutex::new(controller)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_limit_publishes_final() {
        let settings = DeviceSettings {
            n_bins: 10,
            max_counts: 3,
            ..Default::default()
        };
        let mut ones = vec![0; 10];
        ones[4] = 1;
        let mock = MockBackend::new().with_histograms(vec![Histogram::from(ones); 5]);
        let worker = worker_with(mock.clone(), settings).await;
        let mut events = worker.subscribe();

        assert!(worker.start().await.unwrap());
        let summary = worker.wait().await.unwrap();

        assert_eq!(summary.iterations, 3);
        assert_eq!(summary.reason, Some(StopReason::CountLimit));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(mock.read_count(), 3);

        let event = events.borrow_and_update().clone().unwrap();
        assert!(event.is_final());
        assert_eq!(event.snapshot().total.counts()[4], 3);
        assert_eq!(mock.call_log().last().map(String::as_str), Some("stop"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_running_is_noop() {
        let settings = DeviceSettings {
            n_bins: 10,
            ..Default::default()
        };
        let worker = worker_with(MockBackend::new(), settings).await;
        assert!(worker.start().await.unwrap());
        assert!(!worker.start().await.unwrap());

        worker.stop();
        worker.stop();
        let summary = worker.wait().await.unwrap();
        assert_eq!(summary.reason, None);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_ends_run() {
        let settings = DeviceSettings {
            n_bins: 10,
            ..Default::default()
        };
        let worker = worker_with(MockBackend::new().fail_read_at(2), settings).await;
        worker.start().await.unwrap();

        let err = worker.wait().await.unwrap_err();
        assert!(err.is_protocol_error());
        assert!(worker.last_error().unwrap().contains("read 2"));
        assert!(!worker.shared.controller.lock().await.is_acquiring());
    }
}
