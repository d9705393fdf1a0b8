//! Live acquisition loop: limits, cooperative stop, failures and restarts.

use std::sync::Arc;
use std::time::Duration;
use tcspc_arduino::config::SimulationConfig;
use tcspc_arduino::controller::{StopReason, TcspcController};
use tcspc_arduino::core::{Histogram, ParameterValue};
use tcspc_arduino::error::DaqError;
use tcspc_arduino::hardware::mock::MockBackend;
use tcspc_arduino::settings::{DeviceSettings, Property};
use tcspc_arduino::worker::{AcquisitionEvent, AcquisitionWorker, WorkerState};
use tokio::sync::Mutex;

const N_BINS: usize = 10;

fn settings() -> DeviceSettings {
    DeviceSettings {
        n_bins: N_BINS,
        ..Default::default()
    }
}

fn spike(bin: usize, count: u64) -> Histogram {
    let mut counts = vec![0; N_BINS];
    counts[bin] = count;
    Histogram::from(counts)
}

async fn scripted_worker(
    mock: &MockBackend,
    settings: DeviceSettings,
) -> (Arc<Mutex<TcspcController>>, AcquisitionWorker) {
    let controller = TcspcController::with_backend(settings, Box::new(mock.clone()))
        .await
        .unwrap();
    let controller = Arc::new(Mutex::new(controller));
    let worker = AcquisitionWorker::new(controller.clone());
    (controller, worker)
}

#[tokio::test(start_paused = true)]
async fn test_total_is_sum_of_reads() {
    let mock = MockBackend::new().with_histograms(vec![spike(1, 2), spike(2, 5), spike(1, 4)]);
    let (_, worker) = scripted_worker(
        &mock,
        DeviceSettings {
            max_counts: 6,
            ..settings()
        },
    )
    .await;
    let events = worker.subscribe();

    worker.start().await.unwrap();
    let summary = worker.wait().await.unwrap();

    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.reason, Some(StopReason::CountLimit));

    let event = events.borrow().clone().unwrap();
    match event {
        AcquisitionEvent::Final { snapshot, reason } => {
            assert_eq!(reason, StopReason::CountLimit);
            assert_eq!(snapshot.iteration, 3);
            assert_eq!(snapshot.current, spike(1, 4));
            assert_eq!(snapshot.total.counts()[1], 6);
            assert_eq!(snapshot.total.counts()[2], 5);
            assert_eq!(snapshot.total.total_counts(), 11);
        }
        other => panic!("expected a final event, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_time_limit_on_simulation() {
    let settings = DeviceSettings {
        max_time: 1.0,
        refresh: 0.1,
        ..settings()
    };
    let mut controller = TcspcController::new(settings, SimulationConfig { seed: Some(11) });
    controller.connect().await.unwrap();
    let worker = AcquisitionWorker::new(Arc::new(Mutex::new(controller)));
    let events = worker.subscribe();

    worker.start().await.unwrap();
    let summary = worker.wait().await.unwrap();

    assert_eq!(summary.reason, Some(StopReason::TimeLimit));
    assert!((10..=11).contains(&summary.iterations));
    assert!(summary.elapsed >= Duration::from_secs(1));

    let event = events.borrow().clone().unwrap();
    assert!(event.is_final());
    assert_eq!(event.snapshot().total.len(), N_BINS);
}

#[tokio::test(start_paused = true)]
async fn test_no_events_after_stop() {
    let mock = MockBackend::new().with_histograms(vec![spike(0, 1); 100]);
    let (controller, worker) = scripted_worker(&mock, settings()).await;
    let mut events = worker.subscribe();

    worker.start().await.unwrap();
    for _ in 0..3 {
        events.changed().await.unwrap();
    }
    worker.stop();
    assert_eq!(worker.state(), WorkerState::Stopping);

    let summary = worker.wait().await.unwrap();
    assert_eq!(summary.reason, None);
    assert_eq!(worker.state(), WorkerState::Idle);

    let last = events.borrow_and_update().clone().unwrap();
    assert!(!last.is_final());
    assert_eq!(last.snapshot().total.total_counts(), last.snapshot().iteration);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!events.has_changed().unwrap());
    assert!(!controller.lock().await.is_acquiring());
    assert_eq!(mock.call_log().last().map(String::as_str), Some("stop"));
}

#[tokio::test(start_paused = true)]
async fn test_settings_refused_while_running() {
    let mock = MockBackend::new();
    let (controller, worker) = scripted_worker(&mock, settings()).await;

    worker.start().await.unwrap();
    let err = controller
        .lock()
        .await
        .set_property(Property::BinSize, ParameterValue::Float(0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::AcquisitionActive(_)));

    worker.stop();
    worker.wait().await.unwrap();
    controller
        .lock()
        .await
        .set_property(Property::BinSize, ParameterValue::Float(0.5))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_begins_from_zero() {
    let mock = MockBackend::new().with_histograms(vec![spike(3, 1); 10]);
    let (_, worker) = scripted_worker(
        &mock,
        DeviceSettings {
            max_counts: 2,
            ..settings()
        },
    )
    .await;
    let events = worker.subscribe();

    worker.start().await.unwrap();
    worker.wait().await.unwrap();
    assert!(worker.start().await.unwrap());
    let summary = worker.wait().await.unwrap();

    assert_eq!(summary.iterations, 2);
    let event = events.borrow().clone().unwrap();
    assert_eq!(event.snapshot().iteration, 2);
    assert_eq!(event.snapshot().total.counts()[3], 2);
    assert_eq!(mock.read_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_start_without_connection_stays_idle() {
    let controller = TcspcController::new(settings(), SimulationConfig::default());
    let worker = AcquisitionWorker::new(Arc::new(Mutex::new(controller)));

    let err = worker.start().await.unwrap_err();
    assert!(matches!(err, DaqError::SerialPortNotConnected));
    assert_eq!(worker.state(), WorkerState::Idle);
    assert!(worker.wait().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_bin_count_mismatch_ends_run() {
    let mock = MockBackend::new().with_histograms(vec![spike(0, 1), Histogram::zeros(4)]);
    let (controller, worker) = scripted_worker(&mock, settings()).await;

    worker.start().await.unwrap();
    let err = worker.wait().await.unwrap_err();

    assert!(err.is_protocol_error());
    assert!(worker.last_error().is_some());
    assert_eq!(worker.state(), WorkerState::Idle);
    assert!(!controller.lock().await.is_acquiring());
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_start_is_not_lost() {
    let mock = MockBackend::new();
    let (controller, worker) = scripted_worker(&mock, settings()).await;
    let worker = Arc::new(worker);

    // Keep start() parked on the controller lock while stop() arrives.
    let guard = controller.lock().await;
    let starting = tokio::spawn({
        let worker = worker.clone();
        async move { worker.start().await }
    });
    tokio::task::yield_now().await;
    assert_eq!(worker.state(), WorkerState::Running);
    worker.stop();
    drop(guard);

    assert!(starting.await.unwrap().unwrap());
    let summary = worker.wait().await.unwrap();

    assert_eq!(summary.iterations, 0);
    assert_eq!(summary.reason, None);
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(mock.read_count(), 0);
    assert!(!controller.lock().await.is_acquiring());
    assert!(worker.start().await.unwrap());
    worker.stop();
    worker.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_no_limits_run_until_stopped() {
    let mock = MockBackend::new().with_histograms(vec![spike(0, 1_000_000); 1000]);
    let (_, worker) = scripted_worker(&mock, settings()).await;
    let events = worker.subscribe();

    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(10_500)).await;

    assert!(mock.read_count() >= 1000);
    assert_eq!(worker.state(), WorkerState::Running);
    let latest = events.borrow().clone().unwrap();
    assert!(!latest.is_final());
    assert_eq!(latest.snapshot().total.counts()[0], 1_000_000_000);

    worker.stop();
    let summary = worker.wait().await.unwrap();
    assert_eq!(summary.reason, None);
    assert!(summary.iterations >= 1000);
    assert_eq!(worker.state(), WorkerState::Idle);
}
