//! Frame-wise Fourier transforms: channelization and its inverse.

use crate::math::fft::{shifted_bin, shifted_offset, FftHelper};
use crate::prelude::{Element, StreamError, StreamInfo, StreamResult};
use crate::processing::scheduler::FrameGeometry;
use crate::processing::task::{FramePlan, FrameTransform};
use ndarray::{Array2, ArrayView2};
use num_complex::Complex32;
use rustfft::num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

/// Where the frequency bins of each frame land in the output sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectrumLayout {
    /// Bins subdivide the channel axis: `[nchan, ...]` becomes `[nchan * bins, ...]`.
    #[default]
    Channels,
    /// Bins form a new leading axis: `shape` becomes `[bins] + shape`.
    Axis,
}

/// Column arithmetic shared by the forward and inverse transforms.
#[derive(Debug, Clone, Copy)]
struct SpectrumMap {
    layout: SpectrumLayout,
    bins: usize,
    /// Columns per channel (product of the trailing axes).
    rest: usize,
    /// Time-domain columns.
    columns: usize,
}

impl SpectrumMap {
    /// Spectral column holding frequency-ordered bin `bin` of time column `column`.
    fn column(&self, column: usize, bin: usize) -> usize {
        match self.layout {
            SpectrumLayout::Channels => {
                let channel = column / self.rest;
                (channel * self.bins + bin) * self.rest + column % self.rest
            }
            SpectrumLayout::Axis => bin * self.columns + column,
        }
    }
}

fn split_shape(shape: &[usize]) -> (usize, Vec<usize>) {
    match shape.split_first() {
        Some((&channels, rest)) => (channels, rest.to_vec()),
        None => (1, Vec::new()),
    }
}

/// Bin offsets in units of the bin spacing, frequency-ordered.
fn bin_offsets(size: usize, one_sided: bool) -> Vec<f64> {
    if one_sided {
        (0..size / 2 + 1).map(|k| k as f64).collect()
    } else {
        (0..size).map(|k| shifted_offset(k, size) as f64).collect()
    }
}

/// Forward transform of `size`-sample frames.
///
/// Complex input yields `size` frequency-ordered bins; real input yields the
/// one-sided `size / 2 + 1` bins. The output sample rate is the parent rate
/// divided by `size`; each output sample is stamped with its frame's start.
pub struct FourierTransform {
    size: usize,
    layout: SpectrumLayout,
    map: Option<SpectrumMap>,
    one_sided: bool,
    fft: Option<FftHelper>,
}

impl FourierTransform {
    pub fn new(size: usize, layout: SpectrumLayout) -> Self {
        Self {
            size,
            layout,
            map: None,
            one_sided: false,
            fft: None,
        }
    }

    /// Splits each channel into `size` (or `size / 2 + 1`) narrower channels.
    pub fn channelize(size: usize) -> Self {
        Self::new(size, SpectrumLayout::Channels)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bins(&self) -> usize {
        if self.one_sided {
            self.size / 2 + 1
        } else {
            self.size
        }
    }
}

impl<I: Element> FrameTransform<I> for FourierTransform {
    type Output = Complex32;

    fn name(&self) -> &'static str {
        match self.layout {
            SpectrumLayout::Channels => "channelize",
            SpectrumLayout::Axis => "fourier",
        }
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        if self.size == 0 {
            return Err(StreamError::Configuration(
                "Fourier frame size must be positive".into(),
            ));
        }
        self.one_sided = !I::DTYPE.is_complex();
        let bins = self.bins();
        let (channels, rest) = split_shape(&parent.sample_shape);
        let map = SpectrumMap {
            layout: self.layout,
            bins,
            rest: rest.iter().product(),
            columns: parent.columns(),
        };

        let spacing = parent.sample_rate / self.size as f64;
        let offsets = bin_offsets(self.size, self.one_sided);
        let mut info = parent.clone();
        info.dtype = Complex32::DTYPE;
        info.sample_rate = spacing;
        info.frequency = None;
        info.sideband = None;
        match self.layout {
            SpectrumLayout::Channels => {
                let mut shape = vec![channels * bins];
                shape.extend_from_slice(&rest);
                info.sample_shape = shape;
                if let Some(frequency) = &parent.frequency {
                    let sideband = parent.channel_sidebands();
                    let mut sub_frequency = Vec::with_capacity(channels * bins);
                    let mut sub_sideband = Vec::with_capacity(channels * bins);
                    for (channel, &centre) in frequency.iter().enumerate() {
                        for offset in &offsets {
                            sub_frequency
                                .push(centre + sideband[channel] as f64 * offset * spacing);
                            sub_sideband.push(sideband[channel]);
                        }
                    }
                    info.frequency = Some(sub_frequency);
                    info.sideband = Some(sub_sideband);
                }
            }
            SpectrumLayout::Axis => {
                let mut shape = vec![bins];
                shape.extend_from_slice(&parent.sample_shape);
                info.sample_shape = shape;
                if let (Some(frequency), 1) = (&parent.frequency, channels) {
                    let sideband = parent.channel_sidebands()[0];
                    info.frequency = Some(
                        offsets
                            .iter()
                            .map(|offset| frequency[0] + sideband as f64 * offset * spacing)
                            .collect(),
                    );
                    info.sideband = Some(vec![sideband; bins]);
                }
            }
        }

        self.map = Some(map);
        Ok(FramePlan {
            geometry: FrameGeometry::new(self.size, 1),
            info,
        })
    }

    fn execute(
        &mut self,
        input: ArrayView2<'_, I>,
        frames: usize,
    ) -> StreamResult<Array2<Complex32>> {
        let map = self
            .map
            .ok_or_else(|| StreamError::Internal("Fourier transform not initialized".into()))?;
        let size = self.size;
        let columns = map.columns;
        let bins = self.bins();

        let mut buffer = vec![Complex32::zero(); frames * columns * size];
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                for t in 0..size {
                    buffer[base + t] = input[[frame * size + t, column]].to_complex();
                }
            }
        }
        self.fft
            .get_or_insert_with(|| FftHelper::forward(size))
            .process(&mut buffer);

        let mut output = Array2::zeros((frames, columns * bins));
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                for bin in 0..bins {
                    let source = if self.one_sided {
                        bin
                    } else {
                        shifted_bin(bin, size)
                    };
                    output[[frame, map.column(column, bin)]] = buffer[base + source];
                }
            }
        }
        Ok(output)
    }
}

/// Inverse of [`FourierTransform`]: rebuilds `size` time samples per input sample.
///
/// A real output type expects one-sided spectra and enforces Hermitian
/// symmetry; a complex output type expects full, frequency-ordered spectra.
pub struct InverseFourierTransform<O: Element> {
    size: usize,
    layout: SpectrumLayout,
    map: Option<SpectrumMap>,
    fft: Option<FftHelper>,
    output: PhantomData<O>,
}

impl<O: Element> InverseFourierTransform<O> {
    pub fn new(size: usize, layout: SpectrumLayout) -> Self {
        Self {
            size,
            layout,
            map: None,
            fft: None,
            output: PhantomData,
        }
    }

    pub fn dechannelize(size: usize) -> Self {
        Self::new(size, SpectrumLayout::Channels)
    }

    fn one_sided(&self) -> bool {
        !O::DTYPE.is_complex()
    }

    pub fn bins(&self) -> usize {
        if self.one_sided() {
            self.size / 2 + 1
        } else {
            self.size
        }
    }
}

impl<O: Element> FrameTransform<Complex32> for InverseFourierTransform<O> {
    type Output = O;

    fn name(&self) -> &'static str {
        match self.layout {
            SpectrumLayout::Channels => "dechannelize",
            SpectrumLayout::Axis => "inverse-fourier",
        }
    }

    fn initialize(&mut self, parent: &StreamInfo) -> StreamResult<FramePlan> {
        if self.size == 0 {
            return Err(StreamError::Configuration(
                "Fourier frame size must be positive".into(),
            ));
        }
        let bins = self.bins();
        let (leading, rest) = split_shape(&parent.sample_shape);
        let spacing = parent.sample_rate;
        let sidebands = parent.channel_sidebands();
        let centre_shift = if self.one_sided() {
            0.0
        } else {
            (self.size / 2) as f64 * spacing
        };

        let mut info = parent.clone();
        info.dtype = O::DTYPE;
        info.sample_rate = parent.sample_rate * self.size as f64;
        info.frequency = None;
        info.sideband = None;
        let map = match self.layout {
            SpectrumLayout::Channels => {
                if parent.sample_shape.is_empty() || leading % bins != 0 {
                    return Err(StreamError::Configuration(format!(
                        "channel axis of {:?} is not a multiple of {} bins",
                        parent.sample_shape, bins
                    )));
                }
                let channels = leading / bins;
                let mut shape = vec![channels];
                shape.extend_from_slice(&rest);
                info.sample_shape = shape;
                if let Some(frequency) = &parent.frequency {
                    info.frequency = Some(
                        (0..channels)
                            .map(|channel| {
                                let first = channel * bins;
                                frequency[first] + sidebands[first] as f64 * centre_shift
                            })
                            .collect(),
                    );
                    info.sideband =
                        Some((0..channels).map(|channel| sidebands[channel * bins]).collect());
                }
                SpectrumMap {
                    layout: self.layout,
                    bins,
                    rest: rest.iter().product(),
                    columns: channels * rest.iter().product::<usize>(),
                }
            }
            SpectrumLayout::Axis => {
                if leading != bins || parent.sample_shape.is_empty() {
                    return Err(StreamError::Configuration(format!(
                        "leading axis of {:?} must hold {} bins",
                        parent.sample_shape, bins
                    )));
                }
                info.sample_shape = rest.clone();
                if let (Some(frequency), 1) = (&parent.frequency, info.channels()) {
                    info.frequency = Some(vec![frequency[0] + sidebands[0] as f64 * centre_shift]);
                    info.sideband = Some(vec![sidebands[0]]);
                }
                SpectrumMap {
                    layout: self.layout,
                    bins,
                    rest: 1,
                    columns: rest.iter().product(),
                }
            }
        };

        self.map = Some(map);
        Ok(FramePlan {
            geometry: FrameGeometry::new(1, self.size),
            info,
        })
    }

    fn execute(
        &mut self,
        input: ArrayView2<'_, Complex32>,
        frames: usize,
    ) -> StreamResult<Array2<O>> {
        let map = self.map.ok_or_else(|| {
            StreamError::Internal("inverse Fourier transform not initialized".into())
        })?;
        let size = self.size;
        let columns = map.columns;
        let one_sided = self.one_sided();

        let mut buffer = vec![Complex32::zero(); frames * columns * size];
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                if one_sided {
                    for bin in 0..map.bins {
                        buffer[base + bin] = input[[frame, map.column(column, bin)]];
                    }
                    for bin in map.bins..size {
                        buffer[base + bin] = buffer[base + size - bin].conj();
                    }
                } else {
                    for bin in 0..size {
                        buffer[base + shifted_bin(bin, size)] =
                            input[[frame, map.column(column, bin)]];
                    }
                }
            }
        }
        self.fft
            .get_or_insert_with(|| FftHelper::inverse(size))
            .process(&mut buffer);

        let scale = 1.0 / size as f32;
        let mut output = Array2::zeros((frames * size, columns));
        for frame in 0..frames {
            for column in 0..columns {
                let base = (frame * columns + column) * size;
                for t in 0..size {
                    output[[frame * size + t, column]] = O::from_complex(buffer[base + t] * scale);
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
    use crate::prelude::SampleStream;
    use crate::processing::task::Task;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::f32::consts::TAU;
    use std::io::SeekFrom;

    fn noise(rows: usize, columns: usize, seed: u64) -> Array2<Complex32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((rows, columns), |_| {
            Complex32::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
        })
    }

    #[test]
    fn channelize_finds_a_tone_in_the_right_channel() {
        let size = 16;
        // Tone at +3 bins of a complex baseband channel.
        let data = Array2::from_shape_fn((64, 1), |(t, _)| {
            Complex32::from_polar(1.0, TAU * 3.0 * t as f32 / size as f32)
        });
        let stream = ArrayStream::new(data, 0.0, 16e6)
            .unwrap()
            .with_frequency(vec![400e6], vec![1])
            .unwrap();
        let mut task = Task::new(stream, FourierTransform::channelize(size)).unwrap();

        let info = task.info().clone();
        assert_eq!(info.sample_shape, vec![16]);
        assert_eq!(info.length, Some(4));
        assert_eq!(info.sample_rate, 1e6);
        let frequency = info.frequency.unwrap();
        assert_eq!(frequency[8], 400e6);
        assert_eq!(frequency[11], 403e6);
        assert_eq!(frequency[0], 392e6);

        let spectra = task.read(4).unwrap();
        for frame in 0..4 {
            let peak = (0..16)
                .max_by(|&a, &b| spectra[[frame, a]].norm().total_cmp(&spectra[[frame, b]].norm()))
                .unwrap();
            assert_eq!(peak, 11);
            assert!((spectra[[frame, 11]].norm() - 16.0).abs() < 1e-3);
        }
    }

    #[test]
    fn lower_sideband_channels_run_downwards() {
        let data = noise(32, 2, 3);
        let stream = ArrayStream::new(data, 0.0, 8.0)
            .unwrap()
            .with_frequency(vec![100.0, 50.0], vec![-1, 1])
            .unwrap();
        let task = Task::new(stream, FourierTransform::channelize(8)).unwrap();
        let frequency = task.info().frequency.clone().unwrap();
        assert_eq!(frequency.len(), 16);
        assert_eq!(frequency[4], 100.0);
        assert_eq!(frequency[5], 99.0);
        assert_eq!(frequency[13], 51.0);
        assert_eq!(task.info().sideband.as_ref().unwrap()[5], -1);
    }

    #[test]
    fn complex_round_trip_restores_samples_rate_and_channels() {
        let data = noise(96, 3, 11);
        let stream = ArrayStream::new(data.clone(), 2.0, 32.0)
            .unwrap()
            .with_frequency(vec![1e3, 2e3, 3e3], vec![1, 1, -1])
            .unwrap();
        let forward = Task::new(stream, FourierTransform::channelize(8)).unwrap();
        assert_eq!(forward.info().sample_shape, vec![24]);
        let mut inverse =
            Task::new(forward, InverseFourierTransform::<Complex32>::dechannelize(8)).unwrap();

        let info = inverse.info().clone();
        assert_eq!(info.sample_shape, vec![3]);
        assert_eq!(info.sample_rate, 32.0);
        assert_eq!(info.start_time, 2.0);
        assert_eq!(info.length, Some(96));
        assert_eq!(info.frequency.unwrap(), vec![1e3, 2e3, 3e3]);

        let rebuilt = inverse.read(96).unwrap();
        for (value, expected) in rebuilt.iter().zip(data.iter()) {
            assert!((*value - *expected).norm() < 1e-5);
        }
    }

    #[test]
    fn real_round_trip_uses_one_sided_spectra() {
        let mut rng = StdRng::seed_from_u64(5);
        let data = Array2::from_shape_fn((40, 2), |_| rng.gen_range(-1.0f32..1.0));
        let stream = ArrayStream::new(data.clone(), 0.0, 10.0)
            .unwrap()
            .with_frequency(vec![0.0, 100.0], vec![1, 1])
            .unwrap();
        let forward = Task::new(stream, FourierTransform::channelize(10)).unwrap();
        assert_eq!(forward.info().sample_shape, vec![12]);
        assert_eq!(
            forward.info().frequency.as_ref().unwrap()[6..],
            [100.0, 101.0, 102.0, 103.0, 104.0, 105.0]
        );

        let mut inverse =
            Task::new(forward, InverseFourierTransform::<f32>::dechannelize(10)).unwrap();
        assert_eq!(inverse.info().sample_shape, vec![2]);
        assert_eq!(inverse.info().frequency.as_ref().unwrap(), &vec![0.0, 100.0]);
        let rebuilt = inverse.read(40).unwrap();
        for (value, expected) in rebuilt.iter().zip(data.iter()) {
            assert!((value - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn axis_layout_adds_a_leading_frequency_axis() {
        let data = noise(20, 6, 7);
        let stream = ArrayStream::with_shape(data.clone(), 0.0, 4.0, vec![3, 2]).unwrap();
        let forward = Task::new(stream, FourierTransform::new(4, SpectrumLayout::Axis)).unwrap();
        assert_eq!(forward.info().sample_shape, vec![4, 3, 2]);
        assert_eq!(forward.info().sample_rate, 1.0);
        let mut inverse = Task::new(
            forward,
            InverseFourierTransform::<Complex32>::new(4, SpectrumLayout::Axis),
        )
        .unwrap();
        assert_eq!(inverse.info().sample_shape, vec![3, 2]);
        let rebuilt = inverse.read(20).unwrap();
        for (value, expected) in rebuilt.iter().zip(data.iter()) {
            assert!((*value - *expected).norm() < 1e-5);
        }
    }

    #[test]
    fn round_trip_seeks_into_the_middle_of_a_frame() {
        let data = noise(64, 1, 9);
        let stream = ArrayStream::new(data.clone(), 0.0, 1.0).unwrap();
        let forward = Task::new(stream, FourierTransform::channelize(16)).unwrap();
        let mut inverse =
            Task::new(forward, InverseFourierTransform::<Complex32>::dechannelize(16)).unwrap();
        inverse.seek(SeekFrom::Start(37)).unwrap();
        let sample = inverse.read(1).unwrap();
        assert!((sample[[0, 0]] - data[[37, 0]]).norm() < 1e-5);
        assert!((inverse.time() - 38.0).abs() < 1e-12);
    }

    #[test]
    fn incompatible_inverse_shape_fails_at_construction() {
        let data = noise(4, 6, 1);
        let stream = ArrayStream::new(data, 0.0, 1.0).unwrap();
        assert!(matches!(
            Task::new(stream, InverseFourierTransform::<Complex32>::dechannelize(4)),
            Err(StreamError::Configuration(_))
        ));
        let stream = ArrayStream::new(noise(4, 1, 1), 0.0, 1.0).unwrap();
        assert!(matches!(
            Task::new(stream, FourierTransform::channelize(0)),
            Err(StreamError::Configuration(_))
        ));
    }
}
