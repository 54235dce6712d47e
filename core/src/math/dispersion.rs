use num_complex::Complex32;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

/// Dispersion delay constant in s Hz² per (pc cm⁻³).
pub const DISPERSION_CONSTANT: f64 = 1.0e12 / 2.41e-4;

/// Integrated electron column density along the line of sight, in pc cm⁻³.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispersionMeasure(pub f64);

impl DispersionMeasure {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Arrival delay in seconds at `frequency` relative to `reference` (Hz).
    /// Positive when `frequency` is below `reference`.
    pub fn time_delay(self, frequency: f64, reference: f64) -> f64 {
        DISPERSION_CONSTANT
            * self.0
            * (1.0 / (frequency * frequency) - 1.0 / (reference * reference))
    }

    /// Dispersive phase rotation in cycles at `frequency`, relative to `reference`.
    pub fn phase_delay(self, frequency: f64, reference: f64) -> f64 {
        let offset = frequency - reference;
        DISPERSION_CONSTANT * self.0 * offset * offset / (reference * reference * frequency)
    }

    /// `exp(2πi · phase_delay)`, the transfer function of the dispersing medium.
    pub fn phase_factor(self, frequency: f64, reference: f64) -> Complex32 {
        let cycles = self.phase_delay(frequency, reference);
        let angle = TAU * (cycles - cycles.floor());
        Complex32::new(angle.cos() as f32, angle.sin() as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_vanishes_at_reference_and_grows_below_it() {
        let dm = DispersionMeasure::new(10.0);
        assert_eq!(dm.time_delay(400e6, 400e6), 0.0);
        assert!(dm.time_delay(390e6, 400e6) > 0.0);
        assert!(dm.time_delay(410e6, 400e6) < 0.0);
        // Roughly 0.26 s between 400 MHz and infinite frequency for DM 10.
        let infinite = DISPERSION_CONSTANT * 10.0 / (400e6 * 400e6);
        assert!((infinite - 0.2593).abs() < 1e-3);
    }

    #[test]
    fn phase_derivative_matches_negative_delay() {
        let dm = DispersionMeasure::new(3.0);
        let (f, reference, df) = (420e6, 400e6, 1.0);
        let slope =
            (dm.phase_delay(f + df, reference) - dm.phase_delay(f - df, reference)) / (2.0 * df);
        let delay = dm.time_delay(f, reference);
        assert!((slope + delay).abs() < 1e-6 * delay.abs().max(1e-9));
    }

    #[test]
    fn phase_factor_has_unit_magnitude() {
        let factor = DispersionMeasure::new(50.0).phase_factor(350e6, 400e6);
        assert!((factor.norm() - 1.0).abs() < 1e-6);
    }
}
