//! Core data types shared by the controller, the acquisition worker and the plugin shim.
//!
//! - [`Histogram`]: one TCSPC histogram, N non-negative counts
//! - [`ParameterValue`]: loosely typed value crossing the host/plugin boundary
//! - [`x_axis`]: the time axis derived from offset, bin size and bin count

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Histogram
// =============================================================================

/// A histogram of photon arrival times.
///
/// Bin `i` corresponds to the time `offset + i * bin_size` on the device's time axis.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram(Vec<u64>);

impl Histogram {
    /// Zero-filled histogram with `n_bins` bins.
    pub fn zeros(n_bins: usize) -> Self {
        Self(vec![0; n_bins])
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the histogram has no bins.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the raw counts.
    pub fn counts(&self) -> &[u64] {
        &self.0
    }

    /// Largest single-bin count, 0 for an empty histogram.
    pub fn max_count(&self) -> u64 {
        self.0.iter().copied().max().unwrap_or(0)
    }

    /// Sum over all bins.
    pub fn total_counts(&self) -> u64 {
        self.0.iter().sum()
    }

    /// Add `other` into `self` bin by bin.
    ///
    /// Both histograms must have the same number of bins; a mismatch means the device
    /// answered with a different histogram length than the one configured.
    pub fn accumulate(&mut self, other: &Histogram) -> AppResult<()> {
        if self.len() != other.len() {
            return Err(DaqError::Protocol(format!(
                "histogram has {} bins, expected {}",
                other.len(),
                self.len()
            )));
        }
        for (total, count) in self.0.iter_mut().zip(other.0.iter()) {
            *total = total.saturating_add(*count);
        }
        Ok(())
    }

    /// Counts converted to f64 for plotting/export.
    pub fn as_f64(&self) -> Vec<f64> {
        self.0.iter().map(|&c| c as f64).collect()
    }
}

impl From<Vec<u64>> for Histogram {
    fn from(counts: Vec<u64>) -> Self {
        Self(counts)
    }
}

/// Time axis for a histogram: `n_bins` values starting at `offset`, spaced by `bin_size`.
pub fn x_axis(offset: f64, bin_size: f64, n_bins: usize) -> Vec<f64> {
    (0..n_bins).map(|i| offset + i as f64 * bin_size).collect()
}

// =============================================================================
// ParameterValue
// =============================================================================

/// Strongly-typed argument for settings crossing the host boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl ParameterValue {
    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.trim().parse().ok(),
        }
    }

    /// Extract value as i64. Floats are accepted only when they hold an integral value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            ParameterValue::Float(_) => None,
            ParameterValue::String(s) => s.trim().parse().ok(),
        }
    }

    /// Extract value as a string
    pub fn as_string(&self) -> String {
        self.to_string()
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Int(i64::from(value))
    }
}

impl From<u64> for ParameterValue {
    fn from(value: u64) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<usize> for ParameterValue {
    fn from(value: usize) -> Self {
        ParameterValue::Int(value as i64)
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}
