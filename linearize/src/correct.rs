//! Piecewise-linear correction of detected counts through a curve.
//!
//! Every entry point (scalar, slice, N-D array, image stack, partitioned
//! batch) goes through the same interpolator, and so does the curve
//! builder's prefix correction. A value exactly on a knot always lands at the
//! start of the interval above it.

use ndarray::{Array, Array4, ArrayBase, ArrayView1, Data, Dimension, Zip};
use rayon::prelude::*;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::channels::ImageStack;
use crate::curve::CorrectionCurve;
use crate::error::{LinearizeError, Result};

/// Knots of a curve plus a synthetic terminal point one unit past the largest
/// requested value, so every lookup has an upper neighbour
struct Interpolator<'a> {
    xs: &'a [f64],
    ys: &'a [f64],
    tail: (f64, f64),
}

impl<'a> Interpolator<'a> {
    fn new(xs: &'a [f64], ys: &'a [f64], max_requested: f64) -> Self {
        let n = xs.len();
        let slope = if n >= 2 {
            (ys[n - 1] - ys[n - 2]) / (xs[n - 1] - xs[n - 2])
        } else {
            1.0
        };
        let tail_x = max_requested.max(xs[n - 1]) + 1.0;
        let tail_y = ys[n - 1] + slope * (tail_x - xs[n - 1]);
        Self {
            xs,
            ys,
            tail: (tail_x, tail_y),
        }
    }

    /// `value` must already be inside `[xs[0], xs[last]]`
    fn eval(&self, value: f64) -> f64 {
        // insertion point to the right, minus one
        let idx = self.xs.partition_point(|&knot| knot <= value) - 1;
        let (x0, y0) = (self.xs[idx], self.ys[idx]);
        let (x1, y1) = if idx + 1 < self.xs.len() {
            (self.xs[idx + 1], self.ys[idx + 1])
        } else {
            self.tail
        };
        let fraction = (value - x0) / (x1 - x0);
        y0 + fraction * (y1 - y0)
    }
}

/// Why a single value could not be corrected
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum CorrectionFailure {
    #[error("value {value} outside the correctable range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("value is NaN")]
    NotANumber,
}

impl From<CorrectionFailure> for LinearizeError {
    fn from(failure: CorrectionFailure) -> Self {
        match failure {
            CorrectionFailure::OutOfRange { value, min, max } => {
                LinearizeError::Range { value, min, max }
            }
            CorrectionFailure::NotANumber => LinearizeError::Range {
                value: f64::NAN,
                min: 0.0,
                max: f64::NAN,
            },
        }
    }
}

fn check_domain(xs: &[f64], value: f64) -> std::result::Result<(), CorrectionFailure> {
    let (min, max) = (xs[0], xs[xs.len() - 1]);
    if value.is_nan() {
        Err(CorrectionFailure::NotANumber)
    } else if value < min || value > max {
        Err(CorrectionFailure::OutOfRange { value, min, max })
    } else {
        Ok(())
    }
}

/// Correct one value against raw knots, failing outside `[xs[0], xs[last]]`
pub(crate) fn interpolate_checked(xs: &[f64], ys: &[f64], value: f64) -> Result<f64> {
    check_domain(xs, value)?;
    Ok(Interpolator::new(xs, ys, value).eval(value))
}

/// Result of correcting a batch value by value
///
/// Failed values are `NaN` in `values` and listed with their reason in
/// `failed`; nothing is dropped.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionBatch {
    pub values: Vec<f64>,
    pub succeeded: Vec<usize>,
    pub failed: Vec<(usize, CorrectionFailure)>,
}

impl CorrectionBatch {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Percentage of values that could not be corrected
    pub fn percentage_failed(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.failed.len() as f64 / self.values.len() as f64 * 100.0
    }
}

impl CorrectionCurve {
    /// Correct a single detected value
    ///
    /// # Errors
    /// `Range` when the value is outside `[0, max_detected]` (or NaN), unless
    /// `allow_override` is set, in which case the result is `+inf`.
    pub fn correct(&self, value: f64, allow_override: bool) -> Result<f64> {
        match check_domain(self.detected_photons(), value) {
            Ok(()) => Ok(
                Interpolator::new(self.detected_photons(), self.true_photons(), value).eval(value),
            ),
            Err(failure) if allow_override => {
                warn!("{}; returning +inf", failure);
                Ok(f64::INFINITY)
            }
            Err(failure) => Err(failure.into()),
        }
    }

    /// Correct a slice of detected values
    pub fn correct_slice(&self, values: &[f64], allow_override: bool) -> Result<Vec<f64>> {
        Ok(self
            .correct_array(&ArrayView1::from(values), allow_override)?
            .to_vec())
    }

    /// Correct an array of any dimension, keeping its shape
    ///
    /// The whole array is validated first; if any value is out of range the
    /// call fails with the first offending value, unless `allow_override` is
    /// set, in which case every offending element becomes `+inf` and a single
    /// warning with the count is logged.
    pub fn correct_array<S, D>(
        &self,
        values: &ArrayBase<S, D>,
        allow_override: bool,
    ) -> Result<Array<f64, D>>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let detected = self.detected_photons();
        let mut n_out_of_range = 0usize;
        let mut max_requested = 0.0f64;

        for &value in values.iter() {
            match check_domain(detected, value) {
                Ok(()) => max_requested = max_requested.max(value),
                Err(_) if allow_override => n_out_of_range += 1,
                Err(failure) => return Err(failure.into()),
            }
        }

        if n_out_of_range > 0 {
            warn!(
                count = n_out_of_range,
                max = self.max_detected(),
                "Values outside the correctable range were set to +inf"
            );
        }

        let interpolator = Interpolator::new(detected, self.true_photons(), max_requested);
        Ok(Zip::from(values).par_map_collect(|&value| {
            if check_domain(detected, value).is_ok() {
                interpolator.eval(value)
            } else {
                f64::INFINITY
            }
        }))
    }

    /// Linearize every channel of an image stack
    pub fn correct_stack(&self, stack: &ImageStack, allow_override: bool) -> Result<Array4<f64>> {
        self.correct_array(&stack.to_f64(), allow_override)
    }

    /// Correct value by value, recording failures instead of stopping
    pub fn correct_partitioned(&self, values: &[f64]) -> CorrectionBatch {
        let detected = self.detected_photons();
        let max_requested = values
            .iter()
            .copied()
            .filter(|&v| check_domain(detected, v).is_ok())
            .fold(0.0f64, f64::max);
        let interpolator = Interpolator::new(detected, self.true_photons(), max_requested);

        let outcomes: Vec<std::result::Result<f64, CorrectionFailure>> = values
            .par_iter()
            .map(|&value| check_domain(detected, value).map(|()| interpolator.eval(value)))
            .collect();

        let mut batch = CorrectionBatch {
            values: Vec::with_capacity(values.len()),
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for (i, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(corrected) => {
                    batch.values.push(corrected);
                    batch.succeeded.push(i);
                }
                Err(failure) => {
                    batch.values.push(f64::NAN);
                    batch.failed.push((i, failure));
                }
            }
        }

        if !batch.is_complete() {
            warn!(
                failed = batch.failed.len(),
                total = values.len(),
                "Some values could not be corrected"
            );
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    fn curve() -> CorrectionCurve {
        CorrectionCurve::new(
            vec![0.0, 10.0, 20.0, 30.0],
            vec![0.0, 10.0, 25.0, 45.0],
        )
        .unwrap()
    }

    #[test]
    fn test_interpolates_within_intervals() {
        let curve = curve();
        assert_relative_eq!(curve.correct(5.0, false).unwrap(), 5.0);
        assert_relative_eq!(curve.correct(15.0, false).unwrap(), 17.5);
        assert_relative_eq!(curve.correct(25.0, false).unwrap(), 35.0);
    }

    #[test]
    fn test_knots_map_exactly() {
        let curve = curve();
        for (d, t) in curve.detected_photons().iter().zip(curve.true_photons()) {
            assert_relative_eq!(curve.correct(*d, false).unwrap(), *t);
        }
    }

    #[test]
    fn test_upper_bound_is_inclusive() {
        let curve = curve();
        assert_relative_eq!(curve.correct(30.0, false).unwrap(), 45.0);
        assert!(matches!(
            curve.correct(31.0, false),
            Err(LinearizeError::Range { max, .. }) if max == 30.0
        ));
    }

    #[test]
    fn test_override_gives_infinity() {
        let curve = curve();
        assert_eq!(curve.correct(31.0, true).unwrap(), f64::INFINITY);
        assert_eq!(curve.correct(-1.0, true).unwrap(), f64::INFINITY);
        assert!(curve.correct(-1.0, false).is_err());
        assert!(curve.correct(f64::NAN, false).is_err());
    }

    #[test]
    fn test_array_keeps_shape() {
        let curve = curve();
        let values: Array2<f64> = array![[0.0, 5.0], [15.0, 30.0]];
        let corrected = curve.correct_array(&values, false).unwrap();
        assert_eq!(corrected.dim(), (2, 2));
        assert_relative_eq!(corrected[[1, 0]], 17.5);
        assert_relative_eq!(corrected[[1, 1]], 45.0);
    }

    #[test]
    fn test_array_fails_whole_batch_without_override() {
        let curve = curve();
        let values = array![1.0, 2.0, 99.0];
        assert!(curve.correct_array(&values, false).is_err());

        let corrected = curve.correct_array(&values, true).unwrap();
        assert_relative_eq!(corrected[0], 1.0);
        assert_eq!(corrected[2], f64::INFINITY);
    }

    #[test]
    fn test_scalar_slice_and_array_agree() {
        let curve = curve();
        let values = vec![0.0, 3.0, 10.0, 12.5, 29.9, 30.0];
        let from_slice = curve.correct_slice(&values, false).unwrap();
        for (v, s) in values.iter().zip(&from_slice) {
            assert_relative_eq!(curve.correct(*v, false).unwrap(), *s);
        }
    }

    #[test]
    fn test_partitioned_reports_failures() {
        let curve = curve();
        let batch = curve.correct_partitioned(&[5.0, 40.0, f64::NAN, 30.0]);
        assert_eq!(batch.succeeded, vec![0, 3]);
        assert_eq!(batch.failed.len(), 2);
        assert_eq!(batch.failed[0].0, 1);
        assert!(matches!(batch.failed[0].1, CorrectionFailure::OutOfRange { .. }));
        assert_eq!(batch.failed[1].1, CorrectionFailure::NotANumber);
        assert!(batch.values[1].is_nan());
        assert_relative_eq!(batch.values[3], 45.0);
        assert_relative_eq!(batch.percentage_failed(), 50.0);
    }

    #[test]
    fn test_single_point_curve() {
        let curve = CorrectionCurve::new(vec![0.0], vec![0.0]).unwrap();
        assert_relative_eq!(curve.correct(0.0, false).unwrap(), 0.0);
        assert!(curve.correct(0.5, false).is_err());
    }
}
