//! Coherent (de)dispersion as a configuration of [`Convolve`].

use crate::math::dispersion::DispersionMeasure;
use crate::math::fft::bin_frequency;
use crate::prelude::{StreamError, StreamInfo, StreamResult};
use crate::processing::convolve::{
    Convolve, ConvolveConfig, EdgePolicy, FilterResponse, FilterSupport,
};
use ndarray::Array2;
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DispersionConfig {
    pub dm: DispersionMeasure,
    /// Frequency (Hz) left undelayed; the highest channel centre when unset.
    #[serde(default)]
    pub reference_frequency: Option<f64>,
    #[serde(default)]
    pub frame_size: Option<usize>,
    #[serde(default)]
    pub edge: EdgePolicy,
}

impl DispersionConfig {
    pub fn new(dm: f64) -> Self {
        Self {
            dm: DispersionMeasure::new(dm),
            reference_frequency: None,
            frame_size: None,
            edge: EdgePolicy::Trim,
        }
    }

    pub fn with_reference(mut self, frequency: f64) -> Self {
        self.reference_frequency = Some(frequency);
        self
    }

    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = Some(frame_size);
        self
    }

    pub fn with_edge(mut self, edge: EdgePolicy) -> Self {
        self.edge = edge;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChirpSense {
    /// Imposes the delays of a cold plasma.
    Disperse,
    /// Removes them.
    Dedisperse,
}

/// Per-channel chirp filter of a given dispersion measure.
#[derive(Debug, Clone, PartialEq)]
pub struct DispersionChirp {
    dm: DispersionMeasure,
    sense: ChirpSense,
    configured_reference: Option<f64>,
    reference: Option<f64>,
}

impl DispersionChirp {
    pub fn new(dm: DispersionMeasure, sense: ChirpSense, reference: Option<f64>) -> Self {
        Self {
            dm,
            sense,
            configured_reference: reference,
            reference: None,
        }
    }

    pub fn dm(&self) -> DispersionMeasure {
        self.dm
    }

    pub fn sense(&self) -> ChirpSense {
        self.sense
    }

    /// Reference frequency in use, known once attached to a parent.
    pub fn reference_frequency(&self) -> Option<f64> {
        self.reference.or(self.configured_reference)
    }
}

impl FilterResponse for DispersionChirp {
    fn name(&self) -> &'static str {
        match self.sense {
            ChirpSense::Disperse => "disperse",
            ChirpSense::Dedisperse => "dedisperse",
        }
    }

    fn support(&mut self, parent: &StreamInfo) -> StreamResult<FilterSupport> {
        if !parent.dtype.is_complex() {
            return Err(StreamError::Configuration(
                "coherent dispersion needs complex baseband samples".into(),
            ));
        }
        let frequency = parent.frequency.as_ref().ok_or_else(|| {
            StreamError::Configuration("coherent dispersion needs channel frequencies".into())
        })?;
        let reference = match self.configured_reference {
            Some(reference) => reference,
            None => frequency.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        let half_band = parent.sample_rate / 2.0;
        if !(reference.is_finite() && reference > 0.0)
            || frequency.iter().any(|&centre| centre - half_band <= 0.0)
        {
            return Err(StreamError::Configuration(format!(
                "band {:?} with reference {} Hz is not strictly positive",
                frequency, reference
            )));
        }
        self.reference = Some(reference);

        // Delay, in samples, at either edge of every channel.
        let (mut earliest, mut latest) = (0.0f64, 0.0f64);
        for &centre in frequency {
            for edge in [centre - half_band, centre + half_band] {
                let delay = self.dm.time_delay(edge, reference) * parent.sample_rate;
                earliest = earliest.min(delay);
                latest = latest.max(delay);
            }
        }
        let ahead = (-earliest).ceil() as usize;
        let behind = latest.ceil() as usize;
        Ok(match self.sense {
            ChirpSense::Disperse => FilterSupport::new(behind, ahead),
            ChirpSense::Dedisperse => FilterSupport::new(ahead, behind),
        })
    }

    fn response(&self, parent: &StreamInfo, size: usize) -> StreamResult<Array2<Complex32>> {
        let reference = self
            .reference
            .ok_or_else(|| StreamError::Internal("chirp built before its support".into()))?;
        let frequency = parent
            .column_frequencies()
            .ok_or_else(|| StreamError::Internal("chirp without channel frequencies".into()))?;
        let sideband = parent.column_sidebands();

        let mut chirp = Array2::zeros((size, frequency.len()));
        for (column, (&centre, &sideband)) in frequency.iter().zip(&sideband).enumerate() {
            for bin in 0..size {
                let sky = centre + sideband as f64 * bin_frequency(bin, size, parent.sample_rate);
                let mut factor = self.dm.phase_factor(sky, reference);
                if sideband < 0 {
                    factor = factor.conj();
                }
                if self.sense == ChirpSense::Dedisperse {
                    factor = factor.conj();
                }
                chirp[[bin, column]] = factor;
            }
        }
        Ok(chirp)
    }
}

pub type Disperse = Convolve<DispersionChirp>;
pub type Dedisperse = Convolve<DispersionChirp>;

impl Convolve<DispersionChirp> {
    fn dispersion(config: DispersionConfig, sense: ChirpSense) -> Self {
        Convolve::new(
            DispersionChirp::new(config.dm, sense, config.reference_frequency),
            ConvolveConfig {
                frame_size: config.frame_size,
                edge: config.edge,
            },
        )
    }

    /// Removes the dispersive delays of `config.dm`.
    pub fn dedisperse(config: DispersionConfig) -> Self {
        Self::dispersion(config, ChirpSense::Dedisperse)
    }

    /// Imposes the dispersive delays of `config.dm`.
    pub fn disperse(config: DispersionConfig) -> Self {
        Self::dispersion(config, ChirpSense::Disperse)
    }
}
