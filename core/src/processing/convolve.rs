//! Overlap-save convolution with an arbitrary frequency response.

use crate::math::fft::{shifted_bin, FftHelper};
use crate::prelude::{Element, StreamError, StreamInfo, StreamResult};
use crate::processing::scheduler::FrameGeometry;
use crate::processing::task::{FramePlan, FrameTransform};
use crate::telemetry::LogManager;
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use rustfft::num_traits::Zero;
use serde::{Deserialize, Serialize};

/// What happens to the samples near either end of a finite stream that lack
/// a full filter neighbourhood.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgePolicy {
    /// Drop them: the output starts `before` samples late and is `overlap` shorter.
    #[default]
    Trim,
    /// Treat the stream as surrounded by zeros; the output keeps the parent's
    /// start time and length.
    ZeroPad,
}

/// Time-domain extent of a filter: output `i` depends on inputs
/// `i - before ..= i + after`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSupport {
    pub before: usize,
    pub after: usize,
}

impl FilterSupport {
    pub fn new(before: usize, after: usize) -> Self {
        Self { before, after }
    }

    pub fn overlap(&self) -> usize {
        self.before + self.after
    }
}

/// Frequency response applied by [`Convolve`].
pub trait FilterResponse {
    fn name(&self) -> &'static str {
        "convolve"
    }

    /// Checks the parent and reports the filter's time-domain support.
    fn support(&mut self, parent: &StreamInfo) -> StreamResult<FilterSupport>;

    /// Frame size the response is tied to, if any.
    fn frame_size(&self) -> Option<usize> {
        None
    }

    /// Response for frames of `size` samples as a `(size, columns)` array in
    /// FFT bin order. A single column is applied to every column.
    fn response(&self, parent: &StreamInfo, size: usize) -> StreamResult<Array2<Complex32>>;
}

/// FIR filter given by its taps: `y[i] = sum_j taps[j] * x[i + lead - j]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taps {
    pub coefficients: Vec<Complex32>,
    #[serde(default)]
    pub lead: usize,
}

impl Taps {
    /// Causal filter: output `i` sees inputs up to `i`.
    pub fn causal(coefficients: Vec<Complex32>) -> Self {
        Self {
            coefficients,
            lead: 0,
        }
    }

    /// Moves the filter `lead` samples earlier, so output `i` sees input `i + lead`.
    pub fn with_lead(mut self, lead: usize) -> Self {
        self.lead = lead;
        self
    }
}

impl FilterResponse for Taps {
    fn support(&mut self, _parent: &StreamInfo) -> StreamResult<FilterSupport> {
        if self.coefficients.is_empty() || self.lead >= self.coefficients.len() {
            return Err(StreamError::Configuration(format!(
                "{} taps cannot lead by {}",
                self.coefficients.len(),
                self.lead
            )));
        }
        Ok(FilterSupport::new(
            self.coefficients.len() - 1 - self.lead,
            self.lead,
        ))
    }

    fn response(&self, _parent: &StreamInfo, size: usize) -> StreamResult<Array2<Complex32>> {
        let mut kernel = vec![Complex32::zero(); size];
        for (index, &tap) in self.coefficients.iter().enumerate() {
            let shift = (index as i64 - self.lead as i64).rem_euclid(size as i64) as usize;
            kernel[shift] += tap;
        }
        FftHelper::forward(size).process(&mut kernel);
        Array2::from_shape_vec((size, 1), kernel)
            .map_err(|err| StreamError::Internal(err.to_string()))
    }
}

/// Explicit frequency response for one frame size, frequency-ordered like the
/// output of a Fourier transform, with one column or one per parent column.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    values: Array2<Complex32>,
    support: FilterSupport,
}

impl Spectrum {
    pub fn new(values: Array2<Complex32>, support: FilterSupport) -> Self {
        Self { values, support }
    }
}

impl FilterResponse for Spectrum {
    fn support(&mut self, parent: &StreamInfo) -> StreamResult<FilterSupport> {
        let columns = self.values.ncols();
        if columns != 1 && columns != parent.columns() {
            return Err(StreamError::Configuration(format!(
                "spectrum has {} columns for a parent with {}",
                columns,
                parent.columns()
            )));
        }
        Ok(self.support)
    }

    fn frame_size(&self) -> Option<usize> {
        Some(self.values.nrows())
    }

    fn response(&self, _parent: &StreamInfo, size: usize) -> StreamResult<Array2<Complex32>> {
        if size != self.values.nrows() {
            return Err(StreamError::Configuration(format!(
                "spectrum of {} bins used with frames of {}",
                self.values.nrows(),
                size
            )));
        }
        let mut ordered = Array2::zeros(self.values.dim());
        for index in 0..size {
            ordered
                .row_mut(shifted_bin(index, size))
                .assign(&self.values.row(index));
        }
        Ok(ordered)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvolveConfig {
    /// FFT size; derived from the filter support when unset.
    #[serde(default)]
    pub frame_size: Option<usize>,
    #[serde(default)]
    pub edge: EdgePolicy,
}

/// Smallest frame keeping the overlap to at most a quarter of each frame.
pub fn default_frame_size(overlap: usize) -> usize {
    (4 * (overlap + 1)).next_power_of_two().max(1024)
}

/// Overlap-save convolution: each frame is transformed, multiplied by the
/// response and transformed back, and only the uncontaminated centre kept.
pub struct Convolve<R: FilterResponse> {
    filter: R,
    config: ConvolveConfig,
    size: usize,
    support: FilterSupport,
    parent: Option<StreamInfo>,
    spectrum: Option<Array2<Complex32>>,
    forward: Option<FftHelper>,
    inverse: Option<FftHelper>,
}

impl<R: FilterResponse> Convolve<R> {
    pub fn new(filter: R, config: ConvolveConfig) -> Self {
        Self {
            filter,
            config,
            size: 0,
            support: FilterSupport::default(),
            parent: None,
            spectrum: None,
            forward: None,
            inverse: None,
        }
    }

    pub fn filter(&self) -> &R {
        &self.filter
    }

    pub fn support(&self) -> FilterSupport {
        self.support
    }

    pub fn frame_size(&self) -> usize {
        self.size
    }

    pub fn edge(&self) -> EdgePolicy {
        self.config.edge
    }

    fn spectrum(&mut self) -> StreamResult<&Array2<Complex32>> {
        if self.spectrum.is_none() {
            let parent = self
                .parent
                .as_ref()
                .ok_or_else(|| StreamError::Internal("convolution not initialized".into()))?;
            let spectrum = self.filter.response(parent, self.size)?;
            if spectrum.nrows() != self.size
                || (spectrum.ncols() != 1 && spectrum.ncols() != parent.columns())
            {
                return Err(StreamError::Internal(format!(
                    "{} built a {:?} response for frames of {}",
                    self.filter.name(),
                    spectrum.dim(),
                    self.size
                )));
            }
            self.spectrum = Some(spectrum);
        }
        self.spectrum
            .as_ref()
            .ok_or_else(|| StreamError::Internal("response unavailable".into()))
    }
}

impl<I: Element, R: FilterResponse> FrameTransform<I> for Convolve<R> {
    type Output = Complex32;

    fn name(&self) -> &'static str {
        self.filter.name()
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        let logger = LogManager::new(self.filter.name());
        let support = self.filter.support(parent)?;
        let overlap = support.overlap();
        let size = match (self.config.frame_size, self.filter.frame_size()) {
            (Some(configured), Some(fixed)) if configured != fixed => {
                return Err(StreamError::Configuration(format!(
                    "frame size {} conflicts with a response of {} bins",
                    configured, fixed
                )))
            }
            (Some(size), _) | (None, Some(size)) => size,
            (None, None) => default_frame_size(overlap),
        };
        if size <= overlap {
            return Err(StreamError::Configuration(format!(
                "frame size {} does not exceed the filter support of {} samples",
                size, overlap
            )));
        }

        let mut geometry = FrameGeometry::new(size, size - overlap).with_overlap(overlap);
        let mut info = parent.clone();
        info.dtype = Complex32::DTYPE;
        match self.config.edge {
            EdgePolicy::Trim => {
                info.start_time = parent.time_at(support.before as u64);
                if overlap > 0 {
                    logger.notice(format_args!(
                        "trimming {} leading and {} trailing samples",
                        support.before, support.after
                    ));
                }
            }
            EdgePolicy::ZeroPad => {
                geometry = geometry.with_padding(support.before, support.after);
            }
        }

        self.size = size;
        self.support = support;
        self.parent = Some(parent.clone());
        self.spectrum = None;
        Ok(FramePlan { geometry, info })
    }

    fn execute(
        &mut self,
        input: ArrayView2<'_, I>,
        frames: usize,
    ) -> StreamResult<Array2<Complex32>> {
        let size = self.size;
        let support = self.support;
        let step = size - support.overlap();
        let columns = input.ncols();
        let spectrum = self.spectrum()?.clone();
        let shared = spectrum.ncols() == 1;

        let mut buffer = vec![Complex32::zero(); frames * columns * size];
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                for t in 0..size {
                    buffer[base + t] = input[[frame * step + t, column]].to_complex();
                }
            }
        }
        self.forward
            .get_or_insert_with(|| FftHelper::forward(size))
            .process(&mut buffer);
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                let response = if shared { 0 } else { column };
                for bin in 0..size {
                    buffer[base + bin] = buffer[base + bin] * spectrum[[bin, response]];
                }
            }
        }
        self.inverse
            .get_or_insert_with(|| FftHelper::inverse(size))
            .process(&mut buffer);

        let scale = 1.0 / size as f32;
        let mut output = Array2::zeros((frames * step, columns));
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size + support.before;
                for t in 0..step {
                    output[[frame * step + t, column]] = buffer[base + t] * scale;
                }
            }
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::ArrayStream;
    use crate::math::fft::shifted_offset;
    use crate::prelude::SampleStream;
    use crate::processing::task::Task;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::f32::consts::TAU;
    use std::io::SeekFrom;

    fn noise(rows: usize, seed: u64) -> Array2<Complex32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, 2), |_| {
            Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
        })
    }

    fn taps() -> Vec<Complex32> {
        vec![
            Complex32::new(0.5, 0.0),
            Complex32::new(-0.25, 0.5),
            Complex32::new(0.125, -0.125),
        ]
    }

    /// Direct evaluation of `sum_j taps[j] * x[i + lead - j]` with zeros outside.
    fn direct(
        data: &Array2<Complex32>,
        taps: &[Complex32],
        lead: usize,
        i: i64,
        column: usize,
    ) -> Complex32 {
        let mut total = Complex32::zero();
        for (j, tap) in taps.iter().enumerate() {
            let index = i + lead as i64 - j as i64;
            if index >= 0 && (index as usize) < data.nrows() {
                total += *tap * data[[index as usize, column]];
            }
        }
        total
    }

    fn config(frame_size: usize, edge: EdgePolicy) -> ConvolveConfig {
        ConvolveConfig {
            frame_size: Some(frame_size),
            edge,
        }
    }

    #[test]
    fn trimmed_output_matches_direct_convolution() {
        let data = noise(100, 1);
        let stream = ArrayStream::new(data.clone(), 5.0, 2.0).unwrap();
        let filter = Convolve::new(Taps::causal(taps()), config(16, EdgePolicy::Trim));
        let mut task = Task::new(stream, filter).unwrap();

        assert_eq!(task.info().length, Some(98));
        assert_eq!(task.info().start_time, 6.0);
        assert_eq!(task.geometry().overlap, 2);

        let output = task.read(98).unwrap();
        for i in 0..98 {
            for column in 0..2 {
                let expected = direct(&data, &taps(), 0, i as i64 + 2, column);
                assert!((output[[i, column]] - expected).norm() < 1e-5);
            }
        }
    }

    #[test]
    fn zero_padded_output_keeps_length_and_start() {
        let data = noise(50, 2);
        let stream = ArrayStream::new(data.clone(), 5.0, 2.0).unwrap();
        let filter = Convolve::new(
            Taps::causal(taps()).with_lead(1),
            config(8, EdgePolicy::ZeroPad),
        );
        let mut task = Task::new(stream, filter).unwrap();
        assert_eq!(task.info().length, Some(50));
        assert_eq!(task.info().start_time, 5.0);

        let output = task.read(50).unwrap();
        for i in 0..50 {
            let expected = direct(&data, &taps(), 1, i as i64, 1);
            assert!((output[[i, 1]] - expected).norm() < 1e-5);
        }
    }

    #[test]
    fn reads_and_seeks_agree_with_a_single_read() {
        let data = noise(300, 3);
        let build = || {
            let stream = ArrayStream::new(data.clone(), 0.0, 1.0).unwrap();
            Task::new(
                stream,
                Convolve::new(Taps::causal(taps()), config(32, EdgePolicy::Trim)),
            )
            .unwrap()
        };
        let mut whole = build();
        let expected = whole.read(298).unwrap();

        let mut split = build();
        let mut rows = Vec::new();
        for count in [1usize, 29, 30, 31, 100, 107] {
            rows.push(split.read(count).unwrap());
        }
        let views: Vec<_> = rows.iter().map(|block| block.view()).collect();
        assert_eq!(ndarray::concatenate(ndarray::Axis(0), &views).unwrap(), expected);

        let mut sought = build();
        for offset in [200u64, 0, 29, 30, 297] {
            sought.seek(SeekFrom::Start(offset)).unwrap();
            assert_eq!(sought.read(1).unwrap().row(0), expected.row(offset as usize));
        }
    }

    #[test]
    fn zero_padded_reads_and_seeks_agree_with_a_single_read() {
        let data = noise(97, 7);
        let build = || {
            let stream = ArrayStream::new(data.clone(), 0.0, 1.0).unwrap();
            Task::new(
                stream,
                Convolve::new(
                    Taps::causal(taps()).with_lead(1),
                    config(8, EdgePolicy::ZeroPad),
                ),
            )
            .unwrap()
        };
        let mut whole = build();
        assert_eq!(whole.geometry().pad_start, 1);
        assert_eq!(whole.geometry().pad_end, 1);
        let expected = whole.read(97).unwrap();
        for i in 0..97 {
            let reference = direct(&data, &taps(), 1, i as i64, 0);
            assert!((expected[[i, 0]] - reference).norm() < 1e-5);
        }

        let mut split = build();
        let mut rows = Vec::new();
        for count in [1usize, 1, 5, 6, 7, 40, 37] {
            rows.push(split.read(count).unwrap());
        }
        let views: Vec<_> = rows.iter().map(|block| block.view()).collect();
        assert_eq!(ndarray::concatenate(ndarray::Axis(0), &views).unwrap(), expected);

        let mut sought = build();
        for offset in [0u64, 1, 2, 3, 96, 5, 0, 48, 95] {
            sought.seek(SeekFrom::Start(offset)).unwrap();
            assert_eq!(sought.read(1).unwrap().row(0), expected.row(offset as usize));
        }
    }

    #[test]
    fn taps_deserialize_with_complex_coefficients() {
        let filter: Taps = serde_json::from_str(r#"{"coefficients": [[1.0, 0.0], [0.0, -0.5]]}"#)
            .unwrap();
        assert_eq!(
            filter,
            Taps::causal(vec![Complex32::new(1.0, 0.0), Complex32::new(0.0, -0.5)])
        );
        let config: ConvolveConfig = serde_json::from_str(r#"{"edge": "ZeroPad"}"#).unwrap();
        assert_eq!(config.edge, EdgePolicy::ZeroPad);
        assert_eq!(config.frame_size, None);
    }

    #[test]
    fn explicit_spectrum_delays_the_signal() {
        let size = 16;
        let delay = 2.0;
        let values = Array2::from_shape_fn((size, 1), |(k, _)| {
            let offset = shifted_offset(k, size) as f32;
            Complex32::from_polar(1.0, -TAU * offset * delay / size as f32)
        });
        let data = noise(40, 4);
        let stream = ArrayStream::new(data.clone(), 0.0, 4.0).unwrap();
        let filter = Convolve::new(
            Spectrum::new(values, FilterSupport::new(2, 0)),
            ConvolveConfig::default(),
        );
        let mut task = Task::new(stream, filter).unwrap();
        assert_eq!(task.kernel().frame_size(), 16);
        assert_eq!(task.info().length, Some(38));
        assert_eq!(task.info().start_time, 0.5);

        // Output i is aligned with parent sample i + 2 and holds x[i].
        let output = task.read(38).unwrap();
        for (value, expected) in output.iter().zip(data.slice(ndarray::s![..38, ..]).iter()) {
            assert!((*value - *expected).norm() < 1e-5);
        }
    }

    #[test]
    fn configuration_errors_surface_at_construction() {
        let stream = || ArrayStream::new(noise(10, 5), 0.0, 1.0).unwrap();
        assert!(matches!(
            Task::new(stream(), Convolve::new(Taps::causal(taps()), config(2, EdgePolicy::Trim))),
            Err(StreamError::Configuration(_))
        ));
        assert!(matches!(
            Task::new(
                stream(),
                Convolve::new(Taps::causal(taps()).with_lead(3), ConvolveConfig::default()),
            ),
            Err(StreamError::Configuration(_))
        ));
        let spectrum = Spectrum::new(Array2::ones((8, 3)), FilterSupport::default());
        assert!(matches!(
            Task::new(stream(), Convolve::new(spectrum, ConvolveConfig::default())),
            Err(StreamError::Configuration(_))
        ));
        let spectrum = Spectrum::new(Array2::ones((8, 1)), FilterSupport::default());
        assert!(matches!(
            Task::new(stream(), Convolve::new(spectrum, config(16, EdgePolicy::Trim))),
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn default_frame_size_leaves_room_for_the_overlap() {
        assert_eq!(default_frame_size(0), 1024);
        assert_eq!(default_frame_size(1000), 4096);
        let stream = ArrayStream::new(noise(10, 6), 0.0, 1.0).unwrap();
        let task = Task::new(
            stream,
            Convolve::new(Taps::causal(taps()), ConvolveConfig::default()),
        )
        .unwrap();
        assert_eq!(task.geometry().samples_in, 1024);
        assert_eq!(task.info().length, Some(8));
    }
}
