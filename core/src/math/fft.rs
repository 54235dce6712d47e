use num_complex::Complex32;
use rustfft::{num_traits::Zero, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FftDirection {
    Forward,
    Inverse,
}

/// Helper that wraps a `rustfft` plan and its scratch space for reuse.
///
/// Transforms are unnormalised in both directions.
pub struct FftHelper {
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
}

impl FftHelper {
    pub fn new(size: usize, direction: FftDirection) -> Self {
        let mut planner = FftPlanner::new();
        let fft = match direction {
            FftDirection::Forward => planner.plan_fft_forward(size),
            FftDirection::Inverse => planner.plan_fft_inverse(size),
        };
        let scratch = vec![Complex32::zero(); fft.get_inplace_scratch_len()];
        Self { fft, scratch }
    }

    pub fn forward(size: usize) -> Self {
        Self::new(size, FftDirection::Forward)
    }

    pub fn inverse(size: usize) -> Self {
        Self::new(size, FftDirection::Inverse)
    }

    pub fn len(&self) -> usize {
        self.fft.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fft.len() == 0
    }

    /// Transforms every consecutive `len()`-sized chunk of `buffer` in place.
    pub fn process(&mut self, buffer: &mut [Complex32]) {
        debug_assert_eq!(buffer.len() % self.fft.len(), 0);
        if buffer.is_empty() {
            return;
        }
        self.fft.process_with_scratch(buffer, &mut self.scratch);
    }
}

/// Frequency of FFT bin `bin` for a transform of `size` samples at `sample_rate`.
pub fn bin_frequency(bin: usize, size: usize, sample_rate: f64) -> f64 {
    let signed = if bin < (size + 1) / 2 {
        bin as f64
    } else {
        bin as f64 - size as f64
    };
    signed * sample_rate / size as f64
}

/// FFT bin holding the `index`-th entry of the frequency-ordered spectrum.
pub fn shifted_bin(index: usize, size: usize) -> usize {
    (index + (size + 1) / 2) % size
}

/// Offset, in bins, of the `index`-th entry of the frequency-ordered spectrum.
pub fn shifted_offset(index: usize, size: usize) -> i64 {
    index as i64 - (size / 2) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_helper_processes_batched_frames() {
        let mut helper = FftHelper::forward(4);
        let mut buffer = vec![
            Complex32::new(1.0, 0.0),
            Complex32::zero(),
            Complex32::zero(),
            Complex32::zero(),
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
            Complex32::new(1.0, 0.0),
        ];
        helper.process(&mut buffer);
        for value in &buffer[..4] {
            assert!((*value - Complex32::new(1.0, 0.0)).norm() < 1e-6);
        }
        assert!((buffer[4] - Complex32::new(4.0, 0.0)).norm() < 1e-6);
        for value in &buffer[5..] {
            assert!(value.norm() < 1e-6);
        }
    }

    #[test]
    fn inverse_undoes_forward_up_to_scale() {
        let original: Vec<Complex32> = (0..8)
            .map(|i| Complex32::new(i as f32, -(i as f32) * 0.5))
            .collect();
        let mut buffer = original.clone();
        FftHelper::forward(8).process(&mut buffer);
        FftHelper::inverse(8).process(&mut buffer);
        for (value, expected) in buffer.iter().zip(&original) {
            assert!((*value / 8.0 - *expected).norm() < 1e-5);
        }
    }

    #[test]
    fn frequency_ordering_matches_fftshift() {
        let bins: Vec<usize> = (0..4).map(|k| shifted_bin(k, 4)).collect();
        assert_eq!(bins, vec![2, 3, 0, 1]);
        let bins: Vec<usize> = (0..5).map(|k| shifted_bin(k, 5)).collect();
        assert_eq!(bins, vec![3, 4, 0, 1, 2]);
        assert_eq!(shifted_offset(0, 5), -2);
        assert_eq!(bin_frequency(3, 5, 5.0), -2.0);
        assert_eq!(bin_frequency(2, 4, 4.0), -2.0);
        assert_eq!(bin_frequency(1, 4, 4.0), 1.0);
    }
}
