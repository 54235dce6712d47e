use serde::{Deserialize, Serialize};

/// Predicts pulsar rotational phase, in cycles, at an absolute time.
///
/// The returned phase includes the cycle count; only its fractional part
/// selects a profile bin.
pub trait PhaseModel {
    fn phase(&self, time: f64) -> f64;
}

impl<F: Fn(f64) -> f64> PhaseModel for F {
    fn phase(&self, time: f64) -> f64 {
        self(time)
    }
}

/// Taylor-series spin model around a reference epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpinModel {
    /// Reference epoch, in the same time scale as the stream start times.
    pub epoch: f64,
    /// Phase at the epoch, in cycles.
    #[serde(default)]
    pub phase0: f64,
    /// Spin frequency at the epoch, in Hz.
    pub f0: f64,
    /// Spin frequency derivative, in Hz/s.
    #[serde(default)]
    pub f1: f64,
}

impl SpinModel {
    pub fn new(epoch: f64, f0: f64) -> Self {
        Self {
            epoch,
            phase0: 0.0,
            f0,
            f1: 0.0,
        }
    }

    pub fn with_phase0(mut self, phase0: f64) -> Self {
        self.phase0 = phase0;
        self
    }

    pub fn with_f1(mut self, f1: f64) -> Self {
        self.f1 = f1;
        self
    }

    pub fn frequency_at(&self, time: f64) -> f64 {
        self.f0 + self.f1 * (time - self.epoch)
    }
}

impl PhaseModel for SpinModel {
    fn phase(&self, time: f64) -> f64 {
        let dt = time - self.epoch;
        self.phase0 + dt * (self.f0 + 0.5 * self.f1 * dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_model_counts_rotations() {
        let model = SpinModel::new(100.0, 2.0).with_phase0(0.25);
        assert_eq!(model.phase(100.0), 0.25);
        assert!((model.phase(101.5) - 3.25).abs() < 1e-12);
        assert!((model.phase(99.0) + 1.75).abs() < 1e-12);
    }

    #[test]
    fn spin_model_includes_spin_down() {
        let model = SpinModel::new(0.0, 10.0).with_f1(-0.5);
        assert!((model.phase(2.0) - 19.0).abs() < 1e-12);
        assert!((model.frequency_at(2.0) - 9.0).abs() < 1e-12);
    }

    #[test]
    fn closures_are_phase_models() {
        let model = |time: f64| 3.0 * time;
        assert_eq!(PhaseModel::phase(&model, 2.0), 6.0);
    }

    #[test]
    fn spin_model_reads_yaml_like_json() {
        let model: SpinModel = serde_json::from_str(r#"{"epoch": 5.0, "f0": 1.5}"#).unwrap();
        assert_eq!(model, SpinModel::new(5.0, 1.5));
    }
}
