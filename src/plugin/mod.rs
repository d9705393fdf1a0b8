//! Host-facing detector plugin contract.
//!
//! A data-acquisition host drives a detector through six hooks: it asks for the settings
//! schema, pushes individual setting changes, initialises the detector, requests grabs,
//! stops, and finally closes it. Data flows back as [`DataExport`] events on a broadcast
//! channel. `Temporary` exports are for display only; `Persisted` exports are the ones a
//! host saves.

pub mod tcspc_viewer;

pub use tcspc_viewer::TcspcViewer;

use crate::core::ParameterValue;
use crate::error::AppResult;
use crate::settings::Limits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Widget type of a setting in the host's parameter tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Str,
    Float,
    Int,
    List,
}

/// Accepted values of a setting, as presented to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingLimits {
    Range { min: Option<f64>, max: Option<f64> },
    Choices(Vec<ParameterValue>),
}

impl From<Limits> for SettingLimits {
    fn from(limits: Limits) -> Self {
        match limits {
            Limits::Range { min, max } => SettingLimits::Range { min, max },
            Limits::Choices(choices) => {
                SettingLimits::Choices(choices.iter().map(|&c| ParameterValue::from(c)).collect())
            }
        }
    }
}

/// One entry of the settings schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SettingSpec {
    pub name: String,
    pub title: String,
    pub kind: SettingKind,
    pub value: ParameterValue,
    pub limits: SettingLimits,
}

/// How the host wants data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrabMode {
    /// Continuous acquisition until stopped or a limit is reached.
    Live,
    /// One histogram.
    Single,
}

/// Whether the host should store an export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    Temporary,
    Persisted,
}

/// A labelled axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub label: String,
    pub units: String,
    pub data: Vec<f64>,
}

/// One block of 1D traces sharing an axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataFromPlugin {
    pub name: String,
    /// One label per array.
    pub labels: Vec<String>,
    pub arrays: Vec<Vec<f64>>,
    pub axis: Axis,
}

impl DataFromPlugin {
    /// The array labelled `label`.
    pub fn array(&self, label: &str) -> Option<&[f64]> {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| self.arrays.get(i))
            .map(Vec::as_slice)
    }
}

/// Event sent to the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataExport {
    pub name: String,
    pub kind: DataKind,
    pub data: Vec<DataFromPlugin>,
}

/// Result of [`DetectorPlugin::ini_detector`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitStatus {
    pub info: String,
    pub initialized: bool,
}

/// Lifecycle hooks a host calls on a detector plugin.
#[async_trait]
pub trait DetectorPlugin: Send + Sync {
    /// Settings the host should present, with current values.
    fn settings_schema(&self) -> Vec<SettingSpec>;

    /// Apply one changed setting.
    async fn commit_settings(&self, name: &str, value: ParameterValue) -> AppResult<()>;

    /// Connect to the detector.
    async fn ini_detector(&self) -> AppResult<InitStatus>;

    /// Start a grab.
    async fn grab_data(&self, mode: GrabMode) -> AppResult<()>;

    /// Stop a live grab.
    async fn stop(&self) -> AppResult<()>;

    /// Tear down the connection.
    async fn close(&self) -> AppResult<()>;

    /// Subscribe to data exports.
    ///
    /// Multiple subscribers receive the same stream independently.
    fn subscribe(&self) -> broadcast::Receiver<DataExport>;
}
