use ndarray::{Array2, ArrayD, IxDyn};
use num_complex::Complex32;
use rustfft::num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::SeekFrom;
use std::ops::{Add, AddAssign, Mul};

/// Element type advertised by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    Float32,
    Complex64,
}

impl Dtype {
    pub fn is_complex(self) -> bool {
        matches!(self, Dtype::Complex64)
    }
}

/// Scalar sample types that can flow through a stream.
pub trait Element:
    Copy
    + Debug
    + Default
    + PartialEq
    + Zero
    + Add<Output = Self>
    + AddAssign
    + Mul<f32, Output = Self>
    + Send
    + Sync
    + 'static
{
    const DTYPE: Dtype;

    fn to_complex(self) -> Complex32;
    /// Real element types keep only the real part.
    fn from_complex(value: Complex32) -> Self;
    /// Squared magnitude.
    fn power(self) -> f32;
    fn nan() -> Self;
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::Float32;

    fn to_complex(self) -> Complex32 {
        Complex32::new(self, 0.0)
    }

    fn from_complex(value: Complex32) -> Self {
        value.re
    }

    fn power(self) -> f32 {
        self * self
    }

    fn nan() -> Self {
        f32::NAN
    }
}

impl Element for Complex32 {
    const DTYPE: Dtype = Dtype::Complex64;

    fn to_complex(self) -> Complex32 {
        self
    }

    fn from_complex(value: Complex32) -> Self {
        value
    }

    fn power(self) -> f32 {
        self.norm_sqr()
    }

    fn nan() -> Self {
        Complex32::new(f32::NAN, f32::NAN)
    }
}

/// Immutable metadata describing a sample stream.
///
/// `frequency` and `sideband`, when present, are aligned with the first axis
/// of `sample_shape` (or hold a single entry for a scalar sample shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub start_time: f64,
    pub sample_rate: f64,
    pub sample_shape: Vec<usize>,
    pub dtype: Dtype,
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sideband: Option<Vec<i8>>,
}

impl StreamInfo {
    pub fn new(
        start_time: f64,
        sample_rate: f64,
        sample_shape: impl Into<Vec<usize>>,
        dtype: Dtype,
        length: Option<u64>,
    ) -> Self {
        Self {
            start_time,
            sample_rate,
            sample_shape: sample_shape.into(),
            dtype,
            length,
            frequency: None,
            sideband: None,
        }
    }

    pub fn with_frequency(mut self, frequency: Vec<f64>, sideband: Vec<i8>) -> Self {
        self.frequency = Some(frequency);
        self.sideband = Some(sideband);
        self
    }

    /// Number of scalar values per time sample.
    pub fn columns(&self) -> usize {
        self.sample_shape.iter().product()
    }

    /// Size of the channel (first) axis.
    pub fn channels(&self) -> usize {
        self.sample_shape.first().copied().unwrap_or(1)
    }

    pub fn time_at(&self, offset: u64) -> f64 {
        self.start_time + offset as f64 / self.sample_rate
    }

    pub fn stop_time(&self) -> Option<f64> {
        self.length.map(|length| self.time_at(length))
    }

    pub fn duration(&self) -> Option<f64> {
        self.length.map(|length| length as f64 / self.sample_rate)
    }

    /// Frequency of every flattened column, repeating each channel's value
    /// across the trailing axes.
    pub fn column_frequencies(&self) -> Option<Vec<f64>> {
        let frequency = self.frequency.as_ref()?;
        let per_channel = self.columns() / self.channels().max(1);
        Some(
            (0..self.columns())
                .map(|column| frequency[column / per_channel.max(1)])
                .collect(),
        )
    }

    /// Sideband of every channel; upper sideband when none is recorded.
    pub fn channel_sidebands(&self) -> Vec<i8> {
        match &self.sideband {
            Some(sideband) => sideband.clone(),
            None => vec![1; self.channels()],
        }
    }

    pub fn column_sidebands(&self) -> Vec<i8> {
        let per_channel = self.columns() / self.channels().max(1);
        (0..self.columns())
            .map(|column| match &self.sideband {
                Some(sideband) => sideband[column / per_channel.max(1)],
                None => 1,
            })
            .collect()
    }

    pub fn validate(&self) -> StreamResult<()> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(StreamError::Configuration(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if !self.start_time.is_finite() {
            return Err(StreamError::Configuration("start time is not finite".into()));
        }
        if self.sample_shape.iter().any(|&dim| dim == 0) {
            return Err(StreamError::Configuration(format!(
                "sample shape {:?} has an empty axis",
                self.sample_shape
            )));
        }
        if let Some(frequency) = &self.frequency {
            if frequency.len() != self.channels() {
                return Err(StreamError::Configuration(format!(
                    "{} frequencies for {} channels",
                    frequency.len(),
                    self.channels()
                )));
            }
        }
        if let Some(sideband) = &self.sideband {
            if sideband.len() != self.channels() {
                return Err(StreamError::Configuration(format!(
                    "{} sidebands for {} channels",
                    sideband.len(),
                    self.channels()
                )));
            }
            if sideband.iter().any(|&value| value != 1 && value != -1) {
                return Err(StreamError::Configuration(
                    "sideband entries must be +1 or -1".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Error taxonomy shared by every stream and task.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid seek: {0}")]
    InvalidSeek(String),
    #[error("end of stream: requested {requested} samples but only {available} remain")]
    EndOfStream { requested: usize, available: u64 },
    #[error("gap of {gap} samples exceeds the maximum of {max_gap}")]
    Gap { gap: u64, max_gap: u64 },
    #[error("stream mismatch: {0}")]
    Mismatch(String),
    #[error("phase model error: {0}")]
    PhaseModel(String),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Result of a best-effort read.
#[derive(Debug, Clone)]
pub struct PartialRead<T> {
    pub data: Array2<T>,
    /// Set when fewer samples than requested were available.
    pub exhausted: bool,
}

/// A seekable, time-ordered sequence of samples.
///
/// Raw readers and tasks both implement this, so any task can serve as the
/// parent of another.
pub trait SampleStream {
    type Sample: Element;

    fn info(&self) -> &StreamInfo;

    /// Current cursor, in samples of this stream.
    fn tell(&self) -> u64;

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64>;

    /// Reads exactly `count` samples as a `(count, columns)` block, or fails
    /// with [`StreamError::EndOfStream`] without moving the cursor.
    fn read(&mut self, count: usize) -> StreamResult<Array2<Self::Sample>>;

    /// Timestamp of the next sample `read` would return.
    fn time(&self) -> f64 {
        self.info().time_at(self.tell())
    }

    fn remaining(&self) -> Option<u64> {
        self.info()
            .length
            .map(|length| length.saturating_sub(self.tell()))
    }

    /// Reads up to `count` samples, flagging exhaustion instead of failing.
    fn read_best_effort(&mut self, count: usize) -> StreamResult<PartialRead<Self::Sample>> {
        let available = match self.remaining() {
            Some(remaining) => remaining.min(count as u64) as usize,
            None => count,
        };
        let data = self.read(available)?;
        Ok(PartialRead {
            data,
            exhausted: available < count,
        })
    }

    /// Like `read`, but reshaped to `(count,) + sample_shape`.
    fn read_shaped(&mut self, count: usize) -> StreamResult<ArrayD<Self::Sample>> {
        let data = self.read(count)?;
        let mut shape = vec![data.nrows()];
        shape.extend_from_slice(&self.info().sample_shape);
        data.into_shape(IxDyn(&shape))
            .map_err(|err| StreamError::Internal(err.to_string()))
    }
}

impl<S: SampleStream + ?Sized> SampleStream for Box<S> {
    type Sample = S::Sample;

    fn info(&self) -> &StreamInfo {
        (**self).info()
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn seek(&mut self, pos: SeekFrom) -> StreamResult<u64> {
        (**self).seek(pos)
    }

    fn read(&mut self, count: usize) -> StreamResult<Array2<Self::Sample>> {
        (**self).read(count)
    }
}

/// Resolves a seek request against the current cursor and optional length.
pub fn resolve_seek(pos: SeekFrom, current: u64, length: Option<u64>) -> StreamResult<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => current as i128 + delta as i128,
        SeekFrom::End(delta) => match length {
            Some(length) => length as i128 + delta as i128,
            None => {
                return Err(StreamError::InvalidSeek(
                    "end-relative seek on a stream of unknown length".into(),
                ))
            }
        },
    };
    if target < 0 {
        return Err(StreamError::InvalidSeek(format!(
            "offset {} is before the start of the stream",
            target
        )));
    }
    if let Some(length) = length {
        if target > length as i128 {
            return Err(StreamError::InvalidSeek(format!(
                "offset {} is beyond the stream length {}",
                target, length
            )));
        }
    }
    Ok(target as u64)
}

/// Fails with `EndOfStream` when `count` samples are not available.
pub fn check_read(info: &StreamInfo, position: u64, count: usize) -> StreamResult<()> {
    if let Some(length) = info.length {
        let available = length.saturating_sub(position);
        if count as u64 > available {
            return Err(StreamError::EndOfStream {
                requested: count,
                available,
            });
        }
    }
    Ok(())
}

/// Relative comparison for sample rates.
pub fn rates_match(lhs: f64, rhs: f64) -> bool {
    (lhs - rhs).abs() <= 1e-9 * lhs.abs().max(rhs.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_seek_supports_all_anchors() {
        assert_eq!(resolve_seek(SeekFrom::Start(4), 0, Some(10)).unwrap(), 4);
        assert_eq!(resolve_seek(SeekFrom::Current(-2), 5, Some(10)).unwrap(), 3);
        assert_eq!(resolve_seek(SeekFrom::End(-1), 0, Some(10)).unwrap(), 9);
        assert_eq!(resolve_seek(SeekFrom::End(0), 0, Some(10)).unwrap(), 10);
    }

    #[test]
    fn resolve_seek_rejects_out_of_range() {
        assert!(matches!(
            resolve_seek(SeekFrom::Current(-6), 5, Some(10)),
            Err(StreamError::InvalidSeek(_))
        ));
        assert!(matches!(
            resolve_seek(SeekFrom::Start(11), 0, Some(10)),
            Err(StreamError::InvalidSeek(_))
        ));
        assert!(matches!(
            resolve_seek(SeekFrom::End(0), 0, None),
            Err(StreamError::InvalidSeek(_))
        ));
        assert_eq!(resolve_seek(SeekFrom::Start(1 << 40), 0, None).unwrap(), 1 << 40);
    }

    #[test]
    fn check_read_reports_available_samples() {
        let info = StreamInfo::new(0.0, 1.0, vec![1], Dtype::Float32, Some(8));
        assert!(check_read(&info, 3, 5).is_ok());
        assert_eq!(
            check_read(&info, 3, 6),
            Err(StreamError::EndOfStream {
                requested: 6,
                available: 5
            })
        );
    }

    #[test]
    fn column_frequencies_repeat_across_trailing_axes() {
        let info = StreamInfo::new(0.0, 1.0, vec![2, 3], Dtype::Complex64, None)
            .with_frequency(vec![100.0, 200.0], vec![1, -1]);
        assert_eq!(
            info.column_frequencies().unwrap(),
            vec![100.0, 100.0, 100.0, 200.0, 200.0, 200.0]
        );
        assert_eq!(info.column_sidebands(), vec![1, 1, 1, -1, -1, -1]);
        assert!(info.validate().is_ok());
    }

    #[test]
    fn validate_rejects_inconsistent_frequency() {
        let info = StreamInfo::new(0.0, 1.0, vec![2], Dtype::Complex64, None)
            .with_frequency(vec![100.0], vec![1]);
        assert!(matches!(info.validate(), Err(StreamError::Configuration(_))));
        let info = StreamInfo::new(0.0, 0.0, vec![2], Dtype::Complex64, None);
        assert!(matches!(info.validate(), Err(StreamError::Configuration(_))));
    }

    #[test]
    fn stream_info_round_trips_through_json() {
        let info = StreamInfo::new(1.5, 4.0, vec![2], Dtype::Complex64, Some(16))
            .with_frequency(vec![1.0e8, 1.1e8], vec![1, 1]);
        let text = serde_json::to_string(&info).unwrap();
        let back: StreamInfo = serde_json::from_str(&text).unwrap();
        assert_eq!(back, info);
    }
}
