//! Robust statistics and progress smoothing.
//!
//! The dwell-time filter relies on a median / median-absolute-deviation
//! estimate of per-chunk mean dwell, which is far less sensitive to the
//! long-dwell outliers that motivate the filter in the first place than a
//! mean / standard-deviation pair would be.

use crate::error::{FlipflopError, Result};

/// Scale factor making the MAD a consistent estimator of the standard
/// deviation under normality.
pub const MAD_NORMAL_FACTOR: f64 = 1.4826;

/// Median of a sample. Returns `None` on an empty slice.
///
/// Even-length samples return the midpoint of the two central values,
/// matching the usual convention.
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some(0.5 * (sorted[mid - 1] + sorted[mid]))
    } else {
        Some(sorted[mid])
    }
}

/// Median and scaled median absolute deviation of a sample.
///
/// The returned pair is (location, scale) where scale is
/// `factor * median(|x - location|)`. With `factor = 1.4826` the scale is
/// consistent with the standard deviation for normal data. Returns `None`
/// on an empty slice.
///
/// # Example
///
/// ```rust
/// use flipflop_rs::stats::med_mad;
///
/// let (loc, scale) = med_mad(&[0.5, 0.5, 0.5, 0.5], 1.0).unwrap();
/// assert_eq!(loc, 0.5);
/// assert_eq!(scale, 0.0);
/// ```
#[must_use]
pub fn med_mad(values: &[f64], factor: f64) -> Option<(f64, f64)> {
    let loc = median(values)?;
    let deviations: Vec<f64> = values.iter().map(|v| (v - loc).abs()).collect();
    let scale = factor * median(&deviations)?;
    Some((loc, scale))
}

/// Exponentially weighted running estimate of a stream of values.
///
/// Maintains decayed `val` and `weight` accumulators so that the exposed
/// [`value`](ExponentialSmoother::value) is unbiased from the first update
/// onwards: the near-zero initial weight means early updates dominate
/// rather than being dragged toward the initial value.
#[derive(Debug, Clone)]
pub struct ExponentialSmoother {
    factor: f64,
    val: f64,
    weight: f64,
}

impl ExponentialSmoother {
    /// Create a smoother with the given decay factor.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `0.0 <= factor <= 1.0`.
    pub fn new(factor: f64) -> Result<Self> {
        Self::with_initial(factor, 0.0, 1e-30)
    }

    /// Create a smoother with explicit initial accumulators.
    ///
    /// # Errors
    ///
    /// Returns a configuration error unless `0.0 <= factor <= 1.0`.
    pub fn with_initial(factor: f64, val: f64, weight: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&factor) {
            return Err(FlipflopError::Config(format!(
                "smoothing factor was {factor}, should be between 0.0 and 1.0"
            )));
        }
        Ok(Self {
            factor,
            val,
            weight,
        })
    }

    /// Current smoothed estimate.
    #[must_use]
    pub fn value(&self) -> f64 {
        self.val / self.weight
    }

    /// Fold in a new observation with unit weight.
    pub fn update(&mut self, val: f64) {
        self.update_weighted(val, 1.0);
    }

    /// Fold in a new observation with the given weight.
    pub fn update_weighted(&mut self, val: f64, weight: f64) {
        self.val = self.factor * self.val + (1.0 - self.factor) * val;
        self.weight = self.factor * self.weight + (1.0 - self.factor) * weight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
    }

    #[test]
    fn test_median_even() {
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), Some(2.5));
    }

    #[test]
    fn test_median_empty() {
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_med_mad_constant_sample() {
        // A constant sample has zero spread whatever the factor.
        let (loc, scale) = med_mad(&[0.5; 12], MAD_NORMAL_FACTOR).unwrap();
        assert_eq!(loc, 0.5);
        assert_eq!(scale, 0.0);
    }

    #[test]
    fn test_med_mad_unit_factor() {
        let (loc, scale) = med_mad(&[0.5, 0.5, 1.0, 1.0, 0.0, 0.5, 0.5, 1.0], 1.0).unwrap();
        assert_relative_eq!(loc, 0.5);
        assert_relative_eq!(scale, 0.25);
    }

    #[test]
    fn test_smoother_rejects_bad_factor() {
        assert!(ExponentialSmoother::new(1.5).is_err());
        assert!(ExponentialSmoother::new(-0.1).is_err());
        assert!(ExponentialSmoother::new(0.45).is_ok());
    }

    #[test]
    fn test_smoother_single_update() {
        let factor = 0.45;
        let initial_weight = 1e-30;
        let mut smoother = ExponentialSmoother::new(factor).unwrap();
        smoother.update(3.0);

        let expected =
            (1.0 - factor) * 3.0 / ((1.0 - factor) * 1.0 + factor * initial_weight);
        assert_relative_eq!(smoother.value(), expected);
        // With a tiny initial weight the first update is essentially exact.
        assert_relative_eq!(smoother.value(), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_smoother_converges_on_constant_stream() {
        let mut smoother = ExponentialSmoother::new(0.9).unwrap();
        for _ in 0..500 {
            smoother.update(7.25);
        }
        assert_relative_eq!(smoother.value(), 7.25, epsilon = 1e-9);
    }

    #[test]
    fn test_smoother_tracks_recent_values() {
        let mut smoother = ExponentialSmoother::new(0.5).unwrap();
        for _ in 0..50 {
            smoother.update(10.0);
        }
        for _ in 0..50 {
            smoother.update(2.0);
        }
        assert!((smoother.value() - 2.0).abs() < 1e-6);
    }
}
