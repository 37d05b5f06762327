//! Pure DSP building blocks shared across the receive chain.
//!
//! Everything in here is stateful-but-synchronous: no threads, no
//! channels, no clocks. The worker modules own the scheduling.

pub mod demodulation;
pub mod filters;
pub mod mixer;
pub mod resample;
pub mod spectrum;

/// Measure mean power of a complex block in dBFS (full scale = 1.0).
/// Returns `None` for empty or silent input.
pub fn measure_power_dbfs(samples: &[num_complex::Complex32]) -> Option<f32> {
    if samples.is_empty() {
        return None;
    }
    let mean_power =
        samples.iter().map(|s| s.norm_sqr()).sum::<f32>() / samples.len() as f32;
    if mean_power <= 0.0 || !mean_power.is_finite() {
        return None;
    }
    Some(10.0 * mean_power.log10())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use num_complex::Complex32;

    #[test]
    fn test_full_scale_is_zero_dbfs() {
        let samples = vec![Complex32::new(1.0, 0.0); 256];
        assert_abs_diff_eq!(measure_power_dbfs(&samples).unwrap(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_half_scale_is_minus_six_dbfs() {
        let samples = vec![Complex32::new(0.5, 0.0); 256];
        assert_abs_diff_eq!(
            measure_power_dbfs(&samples).unwrap(),
            -6.0206,
            epsilon = 1e-3
        );
    }

    #[test]
    fn test_empty_and_silent_are_none() {
        assert!(measure_power_dbfs(&[]).is_none());
        assert!(measure_power_dbfs(&[Complex32::new(0.0, 0.0)]).is_none());
    }
}
