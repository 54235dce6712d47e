//! Phase-resolved accumulation of a stream into pulse profiles.

use crate::interface::PhaseModel;
use crate::prelude::{
    check_read, resolve_seek, Element, SampleStream, StreamError, StreamInfo, StreamResult,
};
use crate::telemetry::{LogManager, MetricsRecorder, MetricsSnapshot};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;

/// Stretch of input that goes into one output profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldSpan {
    /// A single profile for the entire (finite) stream.
    #[default]
    Whole,
    /// One profile per `n` parent samples; an incomplete last span is dropped.
    Samples(u64),
    /// One profile per `n` complete rotations, starting at the first whole
    /// rotation; an incomplete last group is dropped.
    ///
    /// The advertised sample rate is the mean spin rate over the stream
    /// divided by `n`, so with a spin-down term `start_time + k / sample_rate`
    /// only approximates where span `k` begins. [`Fold::span_start_time`]
    /// gives the exact time.
    Rotations(u64),
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> usize {
    1 << 16
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldConfig {
    pub n_phase: usize,
    #[serde(default)]
    pub span: FoldSpan,
    /// Mean per bin (NaN where empty) rather than sums.
    #[serde(default = "default_true")]
    pub average: bool,
    /// Largest backwards step, in rotations, the phase model may take
    /// between consecutive samples.
    #[serde(default)]
    pub phase_tolerance: f64,
    /// Parent samples read per call.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl FoldConfig {
    pub fn new(n_phase: usize) -> Self {
        Self {
            n_phase,
            span: FoldSpan::Whole,
            average: true,
            phase_tolerance: 0.0,
            chunk_size: default_chunk_size(),
        }
    }

    pub fn with_span(mut self, span: FoldSpan) -> Self {
        self.span = span;
        self
    }

    pub fn summed(mut self) -> Self {
        self.average = false;
        self
    }

    pub fn with_tolerance(mut self, phase_tolerance: f64) -> Self {
        self.phase_tolerance = phase_tolerance;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoldState {
    /// Samples of the current span are being added.
    Accumulating,
    /// The current span is complete and its profile not yet emitted.
    FlushReady,
    /// Every profile of the stream has been emitted.
    Finalized,
}

/// Running `(sum, count)` per phase bin and column.
#[derive(Debug, Clone)]
pub struct FoldAccumulator<T: Element> {
    sums: Array2<T>,
    counts: Array1<u64>,
}

impl<T: Element> FoldAccumulator<T> {
    pub fn new(n_phase: usize, columns: usize) -> Self {
        Self {
            sums: Array2::zeros((n_phase, columns)),
            counts: Array1::zeros(n_phase),
        }
    }

    pub fn add(&mut self, bin: usize, sample: ArrayView1<'_, T>) {
        let mut row = self.sums.row_mut(bin);
        row.zip_mut_with(&sample, |sum, &value| *sum += value);
        self.counts[bin] += 1;
    }

    pub fn sums(&self) -> ArrayView2<'_, T> {
        self.sums.view()
    }

    pub fn counts(&self) -> ArrayView1<'_, u64> {
        self.counts.view()
    }

    /// Flattened `(n_phase * columns)` profile; averaged bins without samples are NaN.
    pub fn profile(&self, average: bool) -> Array1<T> {
        let columns = self.sums.ncols();
        let mut flat = Array1::zeros(self.sums.len());
        for (bin, (row, &count)) in self.sums.rows().into_iter().zip(&self.counts).enumerate() {
            for (column, &sum) in row.iter().enumerate() {
                flat[bin * columns + column] = match (average, count) {
                    (false, _) => sum,
                    (true, 0) => T::nan(),
                    (true, count) => sum * (1.0 / count as f32),
                };
            }
        }
        flat
    }

    pub fn reset(&mut self) {
        self.sums.fill(T::zero());
        self.counts.fill(0);
    }
}

/// Folds a parent stream with a phase model into `[n_phase] + shape` profiles.
pub struct Fold<P: SampleStream, M: PhaseModel> {
    parent: P,
    model: M,
    config: FoldConfig,
    info: StreamInfo,
    position: u64,
    state: FoldState,
    accumulator: FoldAccumulator<P::Sample>,
    /// Parent index where span 0 starts.
    first_boundary: u64,
    /// Most recently located `(span, parent index)` pair.
    last_boundary: (u64, u64),
    /// First rotation counted by `FoldSpan::Rotations`.
    base_phase: f64,
    metrics: MetricsRecorder,
    logger: LogManager,
}

impl<P: SampleStream, M: PhaseModel> Fold<P, M> {
    pub fn new(parent: P, model: M, config: FoldConfig) -> StreamResult<Self> {
        let logger = LogManager::new("fold");
        if config.n_phase == 0 || config.chunk_size == 0 {
            return Err(StreamError::Configuration(
                "fold needs at least one phase bin and a positive chunk size".into(),
            ));
        }
        if config.phase_tolerance.is_nan() || config.phase_tolerance < 0.0 {
            return Err(StreamError::Configuration(format!(
                "phase tolerance {} is negative",
                config.phase_tolerance
            )));
        }

        let source = parent.info().clone();
        let mut info = source.clone();
        let mut shape = vec![config.n_phase];
        shape.extend_from_slice(&source.sample_shape);
        info.sample_shape = shape;
        info.frequency = None;
        info.sideband = None;

        let mut base_phase = 0.0;
        match config.span {
            FoldSpan::Whole => {
                let length = source.length.ok_or_else(|| {
                    StreamError::Configuration(
                        "folding a whole stream needs a finite parent".into(),
                    )
                })?;
                info.length = Some(1);
                info.sample_rate = source.sample_rate / length.max(1) as f64;
            }
            FoldSpan::Samples(0) | FoldSpan::Rotations(0) => {
                return Err(StreamError::Configuration("fold span must be positive".into()));
            }
            FoldSpan::Samples(samples) => {
                info.length = source.length.map(|length| length / samples);
                info.sample_rate = source.sample_rate / samples as f64;
            }
            FoldSpan::Rotations(rotations) => {
                let start = model.phase(source.start_time);
                let (end_time, end) = match source.stop_time() {
                    Some(stop) => (stop, model.phase(stop)),
                    None => (source.start_time + 1.0, model.phase(source.start_time + 1.0)),
                };
                let spin = (end - start) / (end_time - source.start_time);
                if !(spin.is_finite() && spin > 0.0) {
                    return Err(StreamError::PhaseModel(format!(
                        "phase advances by {} over the stream",
                        end - start
                    )));
                }
                base_phase = start.ceil();
                info.sample_rate = spin / rotations as f64;
                info.length = source.length.map(|_| {
                    let groups = ((end - base_phase) / rotations as f64).floor();
                    if groups > 0.0 {
                        groups as u64
                    } else {
                        0
                    }
                });
            }
        }
        info.validate()?;

        let mut fold = Self {
            accumulator: FoldAccumulator::new(config.n_phase, source.columns()),
            parent,
            model,
            config,
            info,
            position: 0,
            state: FoldState::Accumulating,
            first_boundary: 0,
            last_boundary: (0, 0),
            base_phase,
            metrics: MetricsRecorder::new(),
            logger,
        };
        if let FoldSpan::Rotations(_) = fold.config.span {
            let first = first_index_at_phase(fold.parent.info(), &fold.model, 0, fold.base_phase)?;
            fold.first_boundary = first;
            fold.last_boundary = (0, first);
            fold.info.start_time = source.time_at(first);
        }
        if fold.info.length == Some(0) {
            fold.state = FoldState::Finalized;
        }
        fold.logger.record(format_args!(
            "{} phase bins, span {:?}, {} profiles",
            fold.config.n_phase, fold.config.span, fold.info.length.map_or(-1, |n| n as i64)
        ));
        Ok(fold)
    }

    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn state(&self) -> FoldState {
        self.state
    }

    pub fn accumulator(&self) -> &FoldAccumulator<P::Sample> {
        &self.accumulator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    fn phase_at(&self, index: u64) -> f64 {
        self.model.phase(self.parent.info().time_at(index))
    }

    /// Parent index where span `index` starts.
    fn boundary(&mut self, index: u64) -> StreamResult<u64> {
        match self.config.span {
            FoldSpan::Whole => Ok(if index == 0 {
                0
            } else {
                self.parent.info().length.unwrap_or(0)
            }),
            FoldSpan::Samples(samples) => Ok(index * samples),
            FoldSpan::Rotations(rotations) => {
                let (known, from) = if index >= self.last_boundary.0 {
                    self.last_boundary
                } else {
                    (0, self.first_boundary)
                };
                let found = if index == known {
                    from
                } else {
                    let target = self.base_phase + (index * rotations) as f64;
                    first_index_at_phase(self.parent.info(), &self.model, from, target)?
                };
                self.last_boundary = (index, found);
                Ok(found)
            }
        }
    }

    /// Accumulates parent samples `start..end` into the accumulator.
    fn accumulate(&mut self, start: u64, end: u64) -> StreamResult<()> {
        if self.parent.tell() != start {
            self.parent.seek(SeekFrom::Start(start))?;
        }
        self.accumulator.reset();
        self.state = FoldState::Accumulating;
        let n_phase = self.config.n_phase;
        let mut previous: Option<f64> = None;
        let mut index = start;
        while index < end {
            let count = (end - index).min(self.config.chunk_size as u64) as usize;
            let block = self.parent.read(count)?;
            self.metrics.record_parent_samples(count);
            for (offset, sample) in block.rows().into_iter().enumerate() {
                let phase = self.phase_at(index + offset as u64);
                if let Some(last) = previous {
                    if phase < last - self.config.phase_tolerance {
                        return Err(StreamError::PhaseModel(format!(
                            "phase drops from {} to {} at sample {}",
                            last,
                            phase,
                            index + offset as u64
                        )));
                    }
                }
                previous = Some(phase);
                let fraction = phase - phase.floor();
                let bin = ((fraction * n_phase as f64) as usize).min(n_phase - 1);
                self.accumulator.add(bin, sample);
            }
            self.logger.detail(format_args!(
                "accumulated samples {}..{}",
                index,
                index + count as u64
            ));
            index += count as u64;
        }
        self.state = FoldState::FlushReady;
        Ok(())
    }

    /// Accumulates the span at the current position and leaves its profile
    /// waiting in the accumulator. A span already waiting is kept as is.
    pub fn accumulate_next(&mut self) -> StreamResult<FoldState> {
        check_read(&self.info, self.position, 1)?;
        if self.state != FoldState::FlushReady {
            let start = self.boundary(self.position)?;
            let end = self.boundary(self.position + 1)?;
            self.accumulate(start, end)?;
        }
        Ok(self.state)
    }

    /// Hands out the profile and per-bin counts of the span at the current
    /// position, accumulating it first if needed, and moves past it.
    pub fn flush(&mut self) -> StreamResult<(Array1<P::Sample>, Array1<u64>)> {
        self.accumulate_next()?;
        let profile = self.accumulator.profile(self.config.average);
        let counts = self.accumulator.counts().to_owned();
        self.position += 1;
        self.metrics.record_frames(1);
        self.metrics.record_output(1);
        self.state = match self.info.length {
            Some(length) if self.position >= length => FoldState::Finalized,
            _ => FoldState::Accumulating,
        };
        Ok((profile, counts))
    }

    /// Time of the first parent sample folded into span `index`.
    pub fn span_start_time(&mut self, index: u64) -> StreamResult<f64> {
        if let Some(length) = self.info.length {
            if index >= length {
                return Err(StreamError::InvalidSeek(format!(
                    "span {} of a fold with {} spans",
                    index, length
                )));
            }
        }
        let start = self.boundary(index)?;
        Ok(self.parent.info().time_at(start))
    }

    /// Profiles together with the number of samples behind every phase bin.
    pub fn read_with_counts(
        &mut self,
        count: usize,
    ) -> StreamResult<(Array2<P::Sample>, Array2<u64>)> {
        check_read(&self.info, self.position, count)?;
        let first = self.position;
        let mut profiles = Array2::zeros((count, self.info.columns()));
        let mut counts = Array2::zeros((count, self.config.n_phase));
        for row in 0..count {
            match self.flush() {
                Ok((profile, bins)) => {
                    profiles.row_mut(row).assign(&profile);
                    counts.row_mut(row).assign(&bins);
                }
                Err(err) => {
                    self.position = first;
                    self.accumulator.reset();
                    self.state = FoldState::Accumulating;
                    return Err(err);
                }
            }
        }
        Ok((profiles, counts))
    }
}

/// First parent index in `from..=length` whose phase reaches `target`.
///
/// Relies on the phase being non-decreasing; for an unbounded parent the
/// search range is first bracketed with doubling steps.
pub(crate) fn first_index_at_phase<M: PhaseModel>(
    info: &StreamInfo,
    model: &M,
    from: u64,
    target: f64,
) -> StreamResult<u64> {
    let phase_at = |index: u64| model.phase(info.time_at(index));
    let mut low = from;
    let mut high = match info.length {
        Some(length) => length,
        None => {
            let mut step = 1u64;
            let mut upper = from;
            while phase_at(upper) < target {
                low = upper;
                upper = upper.checked_add(step).ok_or_else(|| {
                    StreamError::PhaseModel(format!("phase never reaches {}", target))
                })?;
                step = step.saturating_mul(2);
            }
            upper
        }
    };
    while low < high {
        let middle = low + (high - low) / 2;
        if phase_at(middle) >= target {
            high = middle;
        } else {
            low = middle + 1;
        }
    }
    Ok(low)
}

impl<P: SampleStream, M: PhaseModel> SampleStream for Fold<P, M> {
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
            self.position = target;
            let finished = self.info.length.map_or(false, |length| target >= length);
            if !finished {
                let start = self.boundary(target)?;
                if self.parent.tell() != start {
                    self.parent.seek(SeekFrom::Start(start))?;
                }
            }
            self.accumulator.reset();
            self.state = if finished {
                FoldState::Finalized
            } else {
                FoldState::Accumulating
            };
            self.metrics.record_seek();
        }
        Ok(target)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<P::Sample>> {
        self.read_with_counts(count).map(|(profiles, _)| profiles)
    }
}
