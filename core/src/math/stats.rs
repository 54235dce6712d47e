pub struct StatsHelper;

impl StatsHelper {
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|&v| v * v).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    /// Mean of the finite entries; NaN when there are none.
    pub fn finite_mean(samples: &[f32]) -> f32 {
        let (sum, count) = samples
            .iter()
            .filter(|v| v.is_finite())
            .fold((0.0f64, 0usize), |(sum, count), &v| (sum + v as f64, count + 1));
        if count == 0 {
            f32::NAN
        } else {
            (sum / count as f64) as f32
        }
    }

    /// Peak signal-to-noise of a pulse profile: peak above the median, in
    /// units of the median absolute deviation scaled to a Gaussian sigma.
    pub fn profile_snr(profile: &[f32]) -> f32 {
        let mut finite: Vec<f32> = profile.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.len() < 3 {
            return 0.0;
        }
        finite.sort_by(|a, b| a.total_cmp(b));
        let median = finite[finite.len() / 2];
        let mut deviations: Vec<f32> = finite.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(|a, b| a.total_cmp(b));
        let sigma = 1.4826 * deviations[deviations.len() / 2];
        let peak = finite[finite.len() - 1];
        if sigma > 0.0 {
            (peak - median) / sigma
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_zero_sequence_yields_zero() {
        assert_eq!(StatsHelper::rms(&[]), 0.0);
        assert_eq!(StatsHelper::rms(&[0.0, 0.0]), 0.0);
    }

    #[test]
    fn rms_handles_single_value() {
        assert_eq!(StatsHelper::rms(&[4.0]), 4.0);
    }

    #[test]
    fn finite_mean_skips_nan() {
        assert_eq!(StatsHelper::finite_mean(&[1.0, f32::NAN, 3.0]), 2.0);
        assert!(StatsHelper::finite_mean(&[f32::NAN]).is_nan());
    }

    #[test]
    fn profile_snr_flags_a_spike() {
        let mut profile = vec![1.0, 1.1, 0.9, 1.05, 0.95, 1.0, 1.02, 0.98];
        assert!(StatsHelper::profile_snr(&profile) < 5.0);
        profile[3] = 10.0;
        assert!(StatsHelper::profile_snr(&profile) > 20.0);
    }
}
