use anyhow::Context;
use ndarray::Array2;
use num_complex::Complex32;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use scintcore::interface::{ArrayStream, PhaseModel, SpinModel};
use scintcore::prelude::SampleStream;
use scintcore::processing::{Convolve, DispersionConfig, EdgePolicy, Task};
use serde::{Deserialize, Serialize};
use std::f32::consts::FRAC_1_SQRT_2;

/// Configuration for a synthetic dispersed pulsar observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub channels: usize,
    /// Centre of the observed band, in Hz.
    pub centre_frequency: f64,
    /// Complex sample rate, and bandwidth, of every channel.
    pub sample_rate: f64,
    pub samples: usize,
    pub start_time: f64,
    pub spin_frequency: f64,
    /// Phase of the pulse peak, in cycles.
    pub pulse_phase: f64,
    /// Gaussian pulse width, in cycles.
    pub pulse_width: f64,
    /// Pulse power relative to the noise power.
    pub pulse_strength: f64,
    pub dm: f64,
    pub seed: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            centre_frequency: 400e6,
            sample_rate: 1e6,
            samples: 1 << 16,
            start_time: 0.0,
            spin_frequency: 100.0,
            pulse_phase: 0.5,
            pulse_width: 0.02,
            pulse_strength: 4.0,
            dm: 0.5,
            seed: 0,
        }
    }
}

impl SignalConfig {
    /// Channel centres, lowest first, adjacent channels touching.
    pub fn channel_frequencies(&self) -> Vec<f64> {
        let middle = (self.channels as f64 - 1.0) / 2.0;
        (0..self.channels)
            .map(|channel| self.centre_frequency + (channel as f64 - middle) * self.sample_rate)
            .collect()
    }

    pub fn phase_model(&self) -> SpinModel {
        SpinModel::new(self.start_time, self.spin_frequency)
    }

    fn pulse_power(&self, phase: f64) -> f64 {
        let mut offset = (phase - self.pulse_phase).rem_euclid(1.0);
        if offset > 0.5 {
            offset -= 1.0;
        }
        self.pulse_strength * (-0.5 * (offset / self.pulse_width).powi(2)).exp()
    }
}

fn intrinsic(config: &SignalConfig) -> anyhow::Result<ArrayStream<Complex32>> {
    let model = config.phase_model();
    let mut rng = StdRng::seed_from_u64(config.seed);
    // Unit total power split over the real and imaginary parts.
    let normal = Normal::new(0.0f32, FRAC_1_SQRT_2).context("building noise distribution")?;
    let mut data = Array2::zeros((config.samples, config.channels));
    for (index, mut row) in data.rows_mut().into_iter().enumerate() {
        let time = config.start_time + index as f64 / config.sample_rate;
        let gain = (1.0 + config.pulse_power(model.phase(time))).sqrt() as f32;
        for value in row.iter_mut() {
            let noise = Complex32::new(normal.sample(&mut rng), normal.sample(&mut rng));
            *value = noise * gain;
        }
    }
    let stream = ArrayStream::new(data, config.start_time, config.sample_rate)
        .context("wrapping synthetic samples")?
        .with_frequency(config.channel_frequencies(), vec![1; config.channels])
        .context("labelling synthetic channels")?;
    Ok(stream)
}

/// Pulsed noise dispersed by `config.dm`, held in memory.
pub fn generate(config: &SignalConfig) -> anyhow::Result<ArrayStream<Complex32>> {
    anyhow::ensure!(config.channels > 0, "at least one channel is required");
    anyhow::ensure!(config.samples > 0, "at least one sample is required");
    let stream = intrinsic(config)?;
    if config.dm == 0.0 {
        return Ok(stream);
    }

    let dispersion = DispersionConfig::new(config.dm).with_edge(EdgePolicy::ZeroPad);
    let mut dispersed =
        Task::new(stream, Convolve::disperse(dispersion)).context("building dispersion filter")?;
    let data = dispersed
        .read(config.samples)
        .context("dispersing synthetic samples")?;
    log::debug!(
        "dispersed {} samples over {} channels by DM {}",
        config.samples,
        config.channels,
        config.dm
    );
    let info = dispersed.info();
    let stream = ArrayStream::new(data, info.start_time, info.sample_rate)
        .context("wrapping dispersed samples")?
        .with_frequency(config.channel_frequencies(), vec![1; config.channels])
        .context("labelling dispersed channels")?;
    Ok(stream)
}
