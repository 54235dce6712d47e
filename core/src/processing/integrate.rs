//! Decimation in time, optional rebinning along the channel axis, and
//! integration over intervals of time or pulse phase.

use crate::interface::{PhaseModel, SpinModel};
use crate::prelude::{
    check_read, resolve_seek, Element, SampleStream, StreamError, StreamInfo, StreamResult,
};
use crate::processing::fold::first_index_at_phase;
use crate::processing::scheduler::FrameGeometry;
use crate::processing::task::{FramePlan, FrameTransform};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;

fn default_one() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrateConfig {
    /// Time samples per output sample.
    pub factor: usize,
    /// Adjacent channels merged into one.
    #[serde(default = "default_one")]
    pub channel_factor: usize,
    /// Mean rather than sum.
    #[serde(default = "default_true")]
    pub average: bool,
    /// Refuse a finite parent whose length is not a multiple of `factor`
    /// instead of dropping the incomplete last bin.
    #[serde(default)]
    pub strict: bool,
}

impl IntegrateConfig {
    pub fn new(factor: usize) -> Self {
        Self {
            factor,
            channel_factor: 1,
            average: true,
            strict: false,
        }
    }

    pub fn with_channel_factor(mut self, channel_factor: usize) -> Self {
        self.channel_factor = channel_factor;
        self
    }

    pub fn summed(mut self) -> Self {
        self.average = false;
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

pub struct Integrate {
    config: IntegrateConfig,
    /// Output column of every input column.
    targets: Vec<usize>,
    out_columns: usize,
}

impl Integrate {
    pub fn new(config: IntegrateConfig) -> Self {
        Self {
            config,
            targets: Vec::new(),
            out_columns: 0,
        }
    }

    pub fn config(&self) -> &IntegrateConfig {
        &self.config
    }
}

impl<T: Element> FrameTransform<T> for Integrate {
    type Output = T;

    fn name(&self) -> &'static str {
        "integrate"
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        let IntegrateConfig {
            factor,
            channel_factor,
            ..
        } = self.config;
        if factor == 0 || channel_factor == 0 {
            return Err(StreamError::Configuration(
                "integration factors must be positive".into(),
            ));
        }
        let logger = LogManager::new("integrate");
        if let Some(length) = parent.length {
            let remainder = length % factor as u64;
            if remainder != 0 {
                if self.config.strict {
                    return Err(StreamError::Configuration(format!(
                        "factor {} does not divide the stream length {}",
                        factor, length
                    )));
                }
                logger.notice(format_args!(
                    "dropping the final {} of {} samples",
                    remainder, length
                ));
            }
        }

        let channels = parent.channels();
        if channels % channel_factor != 0 {
            return Err(StreamError::Configuration(format!(
                "channel factor {} does not divide {} channels",
                channel_factor, channels
            )));
        }
        let rest = parent.columns() / channels;
        let merged = channels / channel_factor;
        self.targets = (0..parent.columns())
            .map(|column| (column / rest / channel_factor) * rest + column % rest)
            .collect();
        self.out_columns = merged * rest;

        let mut info = parent.clone();
        info.sample_rate = parent.sample_rate / factor as f64;
        if channel_factor > 1 {
            match parent.sample_shape.first() {
                Some(_) => info.sample_shape[0] = merged,
                None => {
                    return Err(StreamError::Configuration(
                        "channel rebinning needs a channel axis".into(),
                    ))
                }
            }
            if let Some(frequency) = &parent.frequency {
                let sidebands = parent.channel_sidebands();
                let mut averaged = Vec::with_capacity(merged);
                for group in 0..merged {
                    let span = group * channel_factor..(group + 1) * channel_factor;
                    if sidebands[span.clone()].iter().any(|&value| value != sidebands[span.start]) {
                        return Err(StreamError::Configuration(format!(
                            "channels {:?} mix sidebands",
                            span
                        )));
                    }
                    averaged.push(frequency[span].iter().sum::<f64>() / channel_factor as f64);
                }
                info.frequency = Some(averaged);
                info.sideband = Some(
                    (0..merged)
                        .map(|group| sidebands[group * channel_factor])
                        .collect(),
                );
            }
        }

        Ok(FramePlan {
            geometry: FrameGeometry::new(factor, 1),
            info,
        })
    }

    fn execute(&mut self, input: ArrayView2<'_, T>, frames: usize) -> StreamResult<Array2<T>> {
        let factor = self.config.factor;
        let mut output = Array2::<T>::zeros((frames, self.out_columns));
        for frame in 0..frames {
            for row in frame * factor..(frame + 1) * factor {
                for (column, &target) in self.targets.iter().enumerate() {
                    output[[frame, target]] += input[[row, column]];
                }
            }
        }
        if self.config.average {
            let scale = 1.0 / (factor * self.config.channel_factor) as f32;
            output.mapv_inplace(|value| value * scale);
        }
        Ok(output)
    }
}

/// Parent samples summed per read while integrating one interval.
const INTERVAL_CHUNK: u64 = 1 << 16;

/// Integration over intervals that need not hold a whole number of parent
/// samples: fixed durations, or fixed steps of pulse phase.
///
/// Interval edges snap to the nearest parent sample, so successive outputs
/// may combine different numbers of inputs; `read_with_counts` reports them.
/// The output starts with the parent. Its sample rate is the mean rate of
/// intervals over the stream; for phase steps of a model whose spin varies,
/// `start_time + k / sample_rate` only approximates where interval `k` begins.
pub struct IntegrateInterval<P: SampleStream, M: PhaseModel> {
    parent: P,
    model: M,
    step: f64,
    average: bool,
    start_phase: f64,
    info: StreamInfo,
    position: u64,
    /// Most recently located `(interval, parent offset)` pair.
    last_offset: (u64, u64),
    metrics: MetricsRecorder,
}

impl<P: SampleStream> IntegrateInterval<P, SpinModel> {
    /// Intervals of `seconds`, counted from the parent's first sample.
    pub fn by_duration(parent: P, seconds: f64, average: bool) -> StreamResult<Self> {
        let clock = SpinModel::new(parent.info().start_time, 1.0);
        Self::by_phase(parent, clock, seconds, average)
    }
}

impl<P: SampleStream, M: PhaseModel> IntegrateInterval<P, M> {
    /// Intervals of `step` cycles of `model`, counted from its phase at the
    /// parent's first sample.
    pub fn by_phase(parent: P, model: M, step: f64, average: bool) -> StreamResult<Self> {
        let logger = LogManager::new("integrate");
        if !(step.is_finite() && step > 0.0) {
            return Err(StreamError::Configuration(format!(
                "integration step {} must be positive",
                step
            )));
        }
        let source = parent.info().clone();
        let start_phase = model.phase(source.start_time);
        let end_time = source.stop_time().unwrap_or(source.start_time + 1.0);
        let advance = model.phase(end_time) - start_phase;
        if !(advance.is_finite() && advance > 0.0) {
            return Err(StreamError::PhaseModel(format!(
                "phase advances by {} over the stream",
                advance
            )));
        }

        let mut info = source.clone();
        info.sample_rate = advance / (end_time - source.start_time) / step;
        info.length = source.length.map(|_| (advance / step).floor() as u64);
        info.validate()?;
        logger.record(format_args!(
            "intervals of {} from phase {}, {} Hz, length {:?}",
            step, start_phase, info.sample_rate, info.length
        ));

        Ok(Self {
            parent,
            model,
            step,
            average,
            start_phase,
            info,
            position: 0,
            last_offset: (0, 0),
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Parent offset where interval `index` starts.
    fn offset(&mut self, index: u64) -> StreamResult<u64> {
        let (known, from) = if index >= self.last_offset.0 {
            self.last_offset
        } else {
            (0, 0)
        };
        let found = if index == known {
            from
        } else {
            let target = self.start_phase + index as f64 * self.step;
            let info = self.parent.info();
            let after = first_index_at_phase(info, &self.model, from, target)?;
            if after > from {
                let below = self.model.phase(info.time_at(after - 1));
                let above = self.model.phase(info.time_at(after));
                if target - below < above - target {
                    after - 1
                } else {
                    after
                }
            } else {
                after
            }
        };
        self.last_offset = (index, found);
        Ok(found)
    }

    /// Integrated samples together with the parent samples behind each.
    pub fn read_with_counts(
        &mut self,
        count: usize,
    ) -> StreamResult<(Array2<P::Sample>, Array1<u64>)> {
        check_read(&self.info, self.position, count)?;
        let mut output = Array2::zeros((count, self.info.columns()));
        let mut counts = Array1::zeros(count);
        for row in 0..count {
            let index = self.position + row as u64;
            let start = self.offset(index)?;
            let end = self.offset(index + 1)?;
            if self.parent.tell() != start {
                self.parent.seek(SeekFrom::Start(start))?;
            }
            let mut cursor = start;
            while cursor < end {
                let take = (end - cursor).min(INTERVAL_CHUNK) as usize;
                let block = self.parent.read(take)?;
                let mut total = output.row_mut(row);
                total += &block.sum_axis(Axis(0));
                self.metrics.record_parent_samples(take);
                cursor += take as u64;
            }
            counts[row] = end - start;
            if self.average {
                let mut total = output.row_mut(row);
                match end - start {
                    0 => total.fill(P::Sample::nan()),
                    n => total.mapv_inplace(|value| value * (1.0 / n as f32)),
                }
            }
        }
        self.position += count as u64;
        self.metrics.record_frames(count);
        self.metrics.record_output(count);
        Ok((output, counts))
    }
}

impl<P: SampleStream, M: PhaseModel> SampleStream for IntegrateInterval<P, M> {
    type Sample = P::Sample;

    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        let target = resolve_seek(pos, self.position, self.info.length)?;
        if target != self.position {
            let finished = self.info.length.map_or(false, |length| target >= length);
            if !finished {
                let start = self.offset(target)?;
                if self.parent.tell() != start {
                    self.parent.seek(SeekFrom::Start(start))?;
                }
            }
            self.position = target;
            self.metrics.record_seek();
        }
        Ok(target)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<P::Sample>> {
        self.read_with_counts(count).map(|(output, _)| output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{ArrayStream, Generator};
    use crate::prelude::SampleStream;
    use crate::processing::task::Task;
    use ndarray::array;
    use num_complex::Complex32;

    fn ramp(rows: usize, columns: usize) -> ArrayStream<f32> {
        let data = Array2::from_shape_fn((rows, columns), |(r, c)| (r * 10 + c) as f32);
        ArrayStream::new(data, 100.0, 8.0).unwrap()
    }

    #[test]
    fn averages_consecutive_samples() {
        let mut task = Task::new(ramp(10, 1), Integrate::new(IntegrateConfig::new(4))).unwrap();
        assert_eq!(task.info().length, Some(2));
        assert_eq!(task.info().sample_rate, 2.0);
        assert_eq!(task.info().start_time, 100.0);
        assert_eq!(task.read(2).unwrap(), array![[15.0], [55.0]]);
        assert!((task.time() - 101.0).abs() < 1e-12);
    }

    #[test]
    fn sums_when_asked() {
        let mut task =
            Task::new(ramp(8, 2), Integrate::new(IntegrateConfig::new(2).summed())).unwrap();
        assert_eq!(task.read(1).unwrap(), array![[10.0, 12.0]]);
    }

    #[test]
    fn strict_mode_rejects_a_remainder() {
        assert!(matches!(
            Task::new(ramp(10, 1), Integrate::new(IntegrateConfig::new(4).strict())),
            Err(StreamError::Configuration(_))
        ));
        assert!(Task::new(ramp(12, 1), Integrate::new(IntegrateConfig::new(4).strict())).is_ok());
        assert!(matches!(
            Task::new(ramp(12, 1), Integrate::new(IntegrateConfig::new(0))),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn channel_rebinning_averages_frequencies() {
        let stream = ramp(4, 4)
            .with_frequency(vec![100.0, 101.0, 102.0, 103.0], vec![1, 1, 1, 1])
            .unwrap();
        let mut task = Task::new(
            stream,
            Integrate::new(IntegrateConfig::new(2).with_channel_factor(2)),
        )
        .unwrap();
        assert_eq!(task.info().sample_shape, vec![2]);
        assert_eq!(task.info().frequency.as_ref().unwrap(), &vec![100.5, 102.5]);
        // Mean of rows 0,1 and columns 0,1: (0 + 1 + 10 + 11) / 4.
        assert_eq!(task.read(2).unwrap(), array![[5.5, 7.5], [25.5, 27.5]]);
    }

    #[test]
    fn channel_rebinning_keeps_trailing_axes_apart() {
        let data = Array2::from_shape_fn((2, 8), |(_, c)| Complex32::new(c as f32, 0.0));
        let stream = ArrayStream::with_shape(data, 0.0, 1.0, vec![4, 2]).unwrap();
        let mut task = Task::new(
            stream,
            Integrate::new(IntegrateConfig::new(1).with_channel_factor(2).summed()),
        )
        .unwrap();
        assert_eq!(task.info().sample_shape, vec![2, 2]);
        let block = task.read(1).unwrap();
        let sums: Vec<f32> = block.row(0).iter().map(|value| value.re).collect();
        assert_eq!(sums, vec![2.0, 4.0, 10.0, 12.0]);
    }

    #[test]
    fn mixed_sidebands_or_ragged_groups_are_rejected() {
        let stream = ramp(4, 2).with_frequency(vec![1.0, 2.0], vec![1, -1]).unwrap();
        assert!(matches!(
            Task::new(stream, Integrate::new(IntegrateConfig::new(1).with_channel_factor(2))),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            Task::new(ramp(4, 3), Integrate::new(IntegrateConfig::new(1).with_channel_factor(2))),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn config_defaults_from_yaml_style_json() {
        let config: IntegrateConfig = serde_json::from_str(r#"{"factor": 16}"#).unwrap();
        assert_eq!(config, IntegrateConfig::new(16));
    }

    fn counter(rows: usize) -> ArrayStream<f32> {
        let data = Array2::from_shape_fn((rows, 1), |(r, _)| r as f32);
        ArrayStream::new(data, 0.0, 1.0).unwrap()
    }

    #[test]
    fn durations_snap_to_the_nearest_sample() {
        let mut integrate = IntegrateInterval::by_duration(counter(10), 2.4, true).unwrap();
        assert_eq!(integrate.info().length, Some(4));
        assert!((integrate.info().sample_rate - 1.0 / 2.4).abs() < 1e-12);
        assert_eq!(integrate.info().start_time, 0.0);
        // Edges at 0, 2.4, 4.8, 7.2 and 9.6 s land on samples 0, 2, 5, 7 and 10.
        let (values, counts) = integrate.read_with_counts(4).unwrap();
        assert_eq!(counts, array![2, 3, 2, 3]);
        assert_eq!(values, array![[0.5], [3.0], [5.5], [8.0]]);
        assert!(matches!(integrate.read(1), Err(StreamError::EndOfStream { .. })));

        integrate.seek(SeekFrom::Start(2)).unwrap();
        assert_eq!(integrate.parent().tell(), 5);
        assert_eq!(integrate.read(1).unwrap(), array![[5.5]]);
        integrate.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(integrate.read(2).unwrap(), array![[0.5], [3.0]]);
    }

    #[test]
    fn intervals_shorter_than_a_sample_can_be_empty() {
        let mut integrate = IntegrateInterval::by_duration(counter(10), 0.5, true).unwrap();
        assert_eq!(integrate.info().length, Some(20));
        let (values, counts) = integrate.read_with_counts(4).unwrap();
        assert_eq!(counts, array![1, 0, 1, 0]);
        assert_eq!(values[[0, 0]], 0.0);
        assert!(values[[1, 0]].is_nan());
        assert_eq!(values[[2, 0]], 1.0);

        let mut summed = IntegrateInterval::by_duration(counter(10), 0.5, false).unwrap();
        let (values, _) = summed.read_with_counts(2).unwrap();
        assert_eq!(values, array![[0.0], [0.0]]);
    }

    #[test]
    fn phase_steps_follow_a_spinning_up_model() {
        let data = Array2::from_shape_fn((40, 1), |(r, _)| r as f32);
        let stream = ArrayStream::new(data, 0.0, 2.0).unwrap();
        let model = SpinModel::new(0.0, 0.3).with_f1(0.02);
        let mut integrate =
            IntegrateInterval::by_phase(stream, model.clone(), 0.75, false).unwrap();
        assert_eq!(integrate.info().length, Some(13));
        assert!((integrate.info().sample_rate - 10.0 / 20.0 / 0.75).abs() < 1e-9);

        let nearest = |target: f64| {
            let mut best = (f64::INFINITY, 0u64);
            for index in 0..=40u64 {
                let distance = (model.phase(index as f64 / 2.0) - target).abs();
                if distance <= best.0 {
                    best = (distance, index);
                }
            }
            best.1
        };
        let edges: Vec<u64> = (0..=13).map(|k| nearest(0.75 * k as f64)).collect();

        let (values, counts) = integrate.read_with_counts(13).unwrap();
        for k in 0..13 {
            let (start, end) = (edges[k], edges[k + 1]);
            assert_eq!(counts[k], end - start, "interval {}", k);
            let total: u64 = (start..end).sum();
            assert_eq!(values[[k, 0]], total as f32, "interval {}", k);
        }
        // Faster spin later on packs fewer samples into each interval.
        assert!(counts[0] > counts[12]);

        integrate.seek(SeekFrom::Start(6)).unwrap();
        let (again, _) = integrate.read_with_counts(3).unwrap();
        assert_eq!(again, values.slice(ndarray::s![6..9, ..]));
    }

    #[test]
    fn unbounded_parents_integrate_indefinitely() {
        let generator = Generator::new(|index, _| index as f32, 0.0, 4.0, vec![1]).unwrap();
        let mut integrate = IntegrateInterval::by_duration(generator, 2.5, false).unwrap();
        assert_eq!(integrate.info().length, None);
        assert!((integrate.info().sample_rate - 0.4).abs() < 1e-12);
        integrate.seek(SeekFrom::Start(100)).unwrap();
        let (values, counts) = integrate.read_with_counts(1).unwrap();
        // 2.5 s at 4 Hz is exactly 10 samples.
        assert_eq!(counts, array![10]);
        assert_eq!(values[[0, 0]], (1000..1010).sum::<u64>() as f32);
    }

    #[test]
    fn stalled_phase_or_bad_steps_are_rejected() {
        assert!(matches!(
            IntegrateInterval::by_duration(counter(10), 0.0, true),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            IntegrateInterval::by_phase(counter(10), SpinModel::new(0.0, 0.0), 1.0, true),
            Err(StreamError::PhaseModel(_))
        ));
    }
}
