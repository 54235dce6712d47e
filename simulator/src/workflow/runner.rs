use crate::workflow::config::WorkflowConfig;
use anyhow::Context;
use num_complex::Complex32;
use scintcore::interface::SpinModel;
use scintcore::math::StatsHelper;
use scintcore::prelude::{SampleStream, StreamInfo};
use scintcore::processing::{
    Convolve, DispersionConfig, Fold, FoldConfig, FourierTransform, Integrate, IntegrateConfig,
    Square, Task,
};
use scintcore::telemetry::MetricsSnapshot;
use serde::Serialize;

type Voltage = Box<dyn SampleStream<Sample = Complex32>>;

/// Shape of the stream leaving one reduction stage.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StageSummary {
    pub name: String,
    pub sample_rate: f64,
    pub start_time: f64,
    pub length: Option<u64>,
    pub sample_shape: Vec<usize>,
}

impl StageSummary {
    fn of(name: &str, info: &StreamInfo) -> Self {
        Self {
            name: name.to_string(),
            sample_rate: info.sample_rate,
            start_time: info.start_time,
            length: info.length,
            sample_shape: info.sample_shape.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkflowResult {
    /// Folded power, averaged over all frequency channels.
    pub profile: Vec<f32>,
    /// Integrated samples behind every phase bin.
    pub counts: Vec<u64>,
    pub peak_bin: usize,
    pub snr: f32,
    pub stages: Vec<StageSummary>,
    pub fold_metrics: MetricsSnapshot,
}

#[derive(Clone)]
pub struct Runner {
    config: WorkflowConfig,
}

impl Runner {
    pub fn new(config: WorkflowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Reduces baseband voltages to a single folded pulse profile.
    pub fn execute<S>(&self, voltage: S) -> anyhow::Result<WorkflowResult>
    where
        S: SampleStream<Sample = Complex32> + 'static,
    {
        let config = &self.config;
        let mut stages = vec![StageSummary::of("voltage", voltage.info())];

        let mut voltage: Voltage = Box::new(voltage);
        if config.dedisperse {
            let mut dispersion = DispersionConfig::new(config.signal.dm);
            if let Some(frame_size) = config.frame_size {
                dispersion = dispersion.with_frame_size(frame_size);
            }
            let dedispersed = Task::new(voltage, Convolve::dedisperse(dispersion))
                .context("initializing dedispersion")?;
            stages.push(StageSummary::of("dedisperse", dedispersed.info()));
            voltage = Box::new(dedispersed);
        }

        let spectra = Task::new(voltage, FourierTransform::channelize(config.channelize))
            .context("initializing channelizer")?;
        stages.push(StageSummary::of("channelize", spectra.info()));

        let power = Task::new(spectra, Square::power()).context("initializing detection")?;
        stages.push(StageSummary::of("square", power.info()));

        let integrated = Task::new(power, Integrate::new(IntegrateConfig::new(config.integrate)))
            .context("initializing integration")?;
        stages.push(StageSummary::of("integrate", integrated.info()));

        let model = SpinModel::new(config.signal.start_time, config.signal.spin_frequency);
        let mut fold = Fold::new(integrated, model, FoldConfig::new(config.phase_bins))
            .context("initializing fold")?;
        stages.push(StageSummary::of("fold", fold.info()));

        let (profiles, counts) = fold.read_with_counts(1).context("folding the observation")?;
        let columns = fold.parent().info().columns();
        let profile: Vec<f32> = profiles
            .row(0)
            .as_slice()
            .context("folded profile is not contiguous")?
            .chunks(columns)
            .map(StatsHelper::finite_mean)
            .collect();
        let peak_bin = profile
            .iter()
            .enumerate()
            .filter(|(_, value)| value.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin)
            .unwrap_or(0);
        let snr = StatsHelper::profile_snr(&profile);
        log::info!(
            "folded {} phase bins, peak at bin {} with S/N {:.1}",
            profile.len(),
            peak_bin,
            snr
        );

        Ok(WorkflowResult {
            profile,
            counts: counts.row(0).to_vec(),
            peak_bin,
            snr,
            stages,
            fold_metrics: fold.metrics(),
        })
    }
}
