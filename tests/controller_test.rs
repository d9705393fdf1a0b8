//! Controller behaviour against the scripted backend and the simulation.

use tcspc_arduino::config::SimulationConfig;
use tcspc_arduino::controller::TcspcController;
use tcspc_arduino::core::{Histogram, ParameterValue};
use tcspc_arduino::error::DaqError;
use tcspc_arduino::hardware::mock::MockBackend;
use tcspc_arduino::hardware::ConnectionMode;
use tcspc_arduino::settings::{DeviceSettings, Property};

fn small_settings() -> DeviceSettings {
    DeviceSettings {
        n_bins: 10,
        ..Default::default()
    }
}

async fn scripted(mock: &MockBackend) -> TcspcController {
    TcspcController::with_backend(small_settings(), Box::new(mock.clone()))
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_attach_pushes_device_registers() {
    let mock = MockBackend::new();
    let controller = scripted(&mock).await;

    assert_eq!(controller.mode(), Some(ConnectionMode::Scripted));
    assert_eq!(
        mock.call_log(),
        vec!["threshold 0.5", "bin_size 0.1", "offset 0.1", "n_bins 10"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_set_property_goes_through_backend() {
    let mock = MockBackend::new();
    let mut controller = scripted(&mock).await;
    mock.clear_log();

    controller
        .set_property(Property::BinSize, ParameterValue::Float(0.2))
        .await
        .unwrap();
    controller.set_named("n_bins", ParameterValue::Int(20)).await.unwrap();
    controller.set_named("max_time", ParameterValue::Float(2.5)).await.unwrap();

    assert_eq!(mock.call_log(), vec!["bin_size 0.2", "n_bins 20", "max_time 2.5"]);
    assert_eq!(controller.settings().n_bins, 20);
    assert_eq!(controller.x_axis().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_values_leave_settings_unchanged() {
    let mock = MockBackend::new();
    let mut controller = scripted(&mock).await;
    mock.clear_log();

    let err = controller
        .set_property(Property::NBins, ParameterValue::Int(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidValue { .. }));

    let err = controller
        .set_property(Property::Baudrate, ParameterValue::Int(1000))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::InvalidValue { .. }));
    assert!(mock.call_log().is_empty());

    mock.inject_next_failure();
    assert!(controller
        .set_property(Property::Offset, ParameterValue::Float(1.0))
        .await
        .is_err());
    assert_eq!(controller.settings().offset, 0.1);
    assert_eq!(controller.settings().n_bins, 10);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_setting_name() {
    let mut controller = scripted(&MockBackend::new()).await;
    let err = controller.get_named("gain").await.unwrap_err();
    assert!(matches!(err, DaqError::UnknownProperty(ref name) if name == "gain"));
}

#[tokio::test(start_paused = true)]
async fn test_get_property_reads_device_registers() {
    let mock = MockBackend::new();
    let mut controller = scripted(&mock).await;
    mock.clear_log();

    let value = controller.get_property(Property::NBins).await.unwrap();
    assert_eq!(value, ParameterValue::Int(10));
    assert_eq!(mock.call_log(), vec!["n_bins"]);

    // host-side settings never reach the device
    controller.get_property(Property::Refresh).await.unwrap();
    assert_eq!(mock.call_log().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_changed_register_is_adopted_everywhere() {
    let mock = MockBackend::new();
    let mut controller = scripted(&mock).await;
    mock.set_register(Property::NBins, ParameterValue::Int(20)).unwrap();
    mock.clear_log();

    let value = controller.get_property(Property::NBins).await.unwrap();

    assert_eq!(value, ParameterValue::Int(20));
    assert_eq!(mock.call_log(), vec!["n_bins", "n_bins 20"]);
    assert_eq!(controller.settings().n_bins, 20);
    assert_eq!(controller.x_axis().len(), 20);
    assert_eq!(controller.get_histogram().await.unwrap().len(), 20);
}

#[tokio::test(start_paused = true)]
async fn test_single_histogram_and_rate() {
    let mock = MockBackend::new()
        .with_histograms(vec![Histogram::from(vec![2; 10])])
        .with_rate(1234.0);
    let mut controller = scripted(&mock).await;

    let histogram = controller.get_histogram().await.unwrap();
    assert_eq!(histogram.total_counts(), 20);
    assert_eq!(controller.read_rate().await.unwrap(), 1234.0);

    let log = mock.call_log();
    assert!(log.contains(&"record 1".to_string()));
    assert!(log.contains(&"rate 1".to_string()));
    assert!(!controller.is_acquiring());
}

#[tokio::test(start_paused = true)]
async fn test_start_requires_connection() {
    let mut controller = TcspcController::new(small_settings(), SimulationConfig::default());
    let err = controller.start_tcspc().await.unwrap_err();
    assert!(matches!(err, DaqError::SerialPortNotConnected));
    assert!(!controller.is_acquiring());
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_is_refused() {
    let mut controller = scripted(&MockBackend::new()).await;
    let run = controller.start_tcspc().await.unwrap();
    assert_eq!(run.total, Histogram::zeros(10));
    assert_eq!(run.stop.deadline, None);

    let err = controller.start_tcspc().await.unwrap_err();
    assert!(matches!(err, DaqError::AcquisitionActive(_)));
    assert!(controller.get_histogram().await.unwrap_err().is_invalid_operation());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_and_closes_once() {
    let mock = MockBackend::new();
    let mut controller = scripted(&mock).await;
    controller.start_tcspc().await.unwrap();
    mock.clear_log();

    controller.disconnect().await;
    controller.disconnect().await;

    assert_eq!(mock.call_log(), vec!["stop", "close"]);
    assert!(!controller.is_connected());
    assert!(!controller.is_acquiring());
}

#[tokio::test(start_paused = true)]
async fn test_simulation_accepts_model_settings() {
    let mut controller = TcspcController::new(small_settings(), SimulationConfig { seed: Some(3) });
    controller.connect().await.unwrap();

    controller
        .set_property(Property::Lifetime, ParameterValue::Float(1.0))
        .await
        .unwrap();
    controller
        .set_property(Property::DarkRate, ParameterValue::Int(0))
        .await
        .unwrap();
    controller
        .set_property(Property::TimeZero, ParameterValue::Float(10.0))
        .await
        .unwrap();

    // every bin is before time zero and there is no dark count
    let histogram = controller.get_histogram().await.unwrap();
    assert_eq!(histogram, Histogram::zeros(10));
    assert_eq!(controller.read_rate().await.unwrap(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_simulation_follows_bin_count() {
    let mut controller = TcspcController::new(small_settings(), SimulationConfig { seed: Some(3) });
    controller.connect().await.unwrap();
    controller.set_named("n_bins", ParameterValue::Int(25)).await.unwrap();

    let histogram = controller.get_histogram().await.unwrap();
    assert_eq!(histogram.len(), 25);
    assert_eq!(controller.get_named("lifetime").await.unwrap(), ParameterValue::Float(3.5));
}
