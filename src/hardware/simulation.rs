//! Simulated histogrammer.
//!
//! The model is a single exponential decay starting at `time_zero` on top of a flat dark
//! count background. Each bin of a sample is an independent Poisson draw around the model
//! mean for that bin. With a seed the sample sequence is reproducible.

use super::{ConnectionMode, SimulationReason, TcspcBackend};
use crate::core::Histogram;
use crate::error::AppResult;
use crate::settings::{DeviceSettings, Property};
use async_trait::async_trait;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Poisson};
use tracing::debug;

/// Largest mean count a bin is sampled around.
pub const MAX_MEAN_COUNTS: f64 = 1e12;

/// Per-bin mean counts for the current settings.
#[derive(Clone, Debug)]
pub struct SimulationModel {
    means: Vec<f64>,
    distributions: Vec<Option<Poisson<f64>>>,
}

impl SimulationModel {
    /// Build the model on the axis defined by `settings`.
    pub fn from_settings(settings: &DeviceSettings) -> Self {
        let means: Vec<f64> = settings
            .x_axis()
            .into_iter()
            .map(|t| mean_counts(t, settings))
            .map(|m| if m.is_nan() { 0.0 } else { m.min(MAX_MEAN_COUNTS) })
            .collect();
        // Poisson::new rejects a zero mean; those bins always sample 0.
        let distributions = means.iter().map(|&m| Poisson::new(m).ok()).collect();
        Self { means, distributions }
    }

    /// Mean count of every bin.
    pub fn means(&self) -> &[f64] {
        &self.means
    }

    /// Number of bins.
    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// True for a model without bins.
    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }

    /// Draw one histogram.
    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Histogram {
        self.distributions
            .iter()
            .map(|dist| match dist {
                Some(dist) => dist.sample(rng) as u64,
                None => 0,
            })
            .collect::<Vec<u64>>()
            .into()
    }
}

/// `dark_rate * bin_size`, plus the decay `count_rate * exp(-(t - time_zero) / lifetime) * bin_size`
/// from `time_zero` on.
pub fn mean_counts(t: f64, settings: &DeviceSettings) -> f64 {
    let dark = settings.dark_rate as f64 * settings.bin_size;
    let signal = if t >= settings.time_zero {
        f64::from(settings.count_rate)
            * (-(t - settings.time_zero) / settings.lifetime).exp()
            * settings.bin_size
    } else {
        0.0
    };
    dark + signal
}

/// Backend producing model samples every `refresh` seconds.
pub struct SimulatedBackend {
    settings: DeviceSettings,
    model: SimulationModel,
    rng: ChaCha8Rng,
    reason: SimulationReason,
}

impl SimulatedBackend {
    /// Create a simulation for `settings`; `seed` makes the samples reproducible.
    pub fn new(settings: &DeviceSettings, reason: SimulationReason, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            settings: settings.clone(),
            model: SimulationModel::from_settings(settings),
            rng,
            reason,
        }
    }

    /// The current model.
    pub fn model(&self) -> &SimulationModel {
        &self.model
    }

    async fn wait_and_sample(&mut self) -> Histogram {
        tokio::time::sleep(self.settings.refresh_duration()).await;
        self.model.sample(&mut self.rng)
    }
}

#[async_trait]
impl TcspcBackend for SimulatedBackend {
    fn mode(&self) -> ConnectionMode {
        ConnectionMode::Simulated {
            reason: self.reason.clone(),
        }
    }

    async fn write_property(&mut self, property: Property, settings: &DeviceSettings) -> AppResult<()> {
        self.settings = settings.clone();
        if property.affects_simulation() {
            self.model = SimulationModel::from_settings(&self.settings);
            debug!(%property, n_bins = self.model.len(), "Simulation model recomputed");
        }
        Ok(())
    }

    async fn read_property(&mut self, property: Property) -> AppResult<f64> {
        Ok(self.settings.get(property).as_f64().unwrap_or_default())
    }

    async fn begin_recording(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn read_histogram(&mut self) -> AppResult<Histogram> {
        Ok(self.wait_and_sample().await)
    }

    async fn record_once(&mut self) -> AppResult<Histogram> {
        Ok(self.wait_and_sample().await)
    }

    async fn read_rate(&mut self) -> AppResult<f64> {
        let sample = self.wait_and_sample().await;
        Ok(sample.total_counts() as f64 / self.settings.refresh)
    }

    async fn stop(&mut self) -> AppResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}
