//! Averaging several correction curves into one master curve.

use std::collections::BTreeMap;

use itertools::Itertools;
use tracing::{info, warn};

use crate::curve::CorrectionCurve;
use crate::error::{LinearizeError, Result};

/// Average curves on a common integer grid of true photon counts
///
/// Each curve is read backwards (true → detected), the detected values are
/// averaged at every grid point `0, 1, 2, ...` and the result is turned back
/// into a detected → true curve. The grid stops at `grid_len - 1` or at the
/// smallest `max_true` among the inputs, whichever comes first, so every grid
/// point is covered by every curve.
///
/// # Errors
/// `InvalidInput` for an empty map or `grid_len == 0`, `InvalidCurve` (naming
/// the curve) when a curve cannot be inverted.
pub fn average_curves(
    curves: &BTreeMap<String, CorrectionCurve>,
    grid_len: usize,
) -> Result<CorrectionCurve> {
    if curves.is_empty() {
        return Err(LinearizeError::invalid_input("no curves to average"));
    }
    if grid_len == 0 {
        return Err(LinearizeError::invalid_input("averaging grid is empty"));
    }

    let inverses: Vec<(&String, CorrectionCurve)> = curves
        .iter()
        .map(|(name, curve)| {
            curve
                .inverse()
                .map(|inverse| (name, inverse))
                .map_err(|e| LinearizeError::invalid_curve(format!("{name}: {e}")))
        })
        .collect::<Result<_>>()?;

    let common_max = inverses
        .iter()
        .map(|(_, inverse)| inverse.max_detected())
        .fold(f64::INFINITY, f64::min);
    let last = (grid_len - 1).min(common_max.floor() as usize);
    if last + 1 < grid_len {
        warn!(
            grid_len,
            covered = last + 1,
            "Averaging grid truncated to the range covered by every curve"
        );
    }

    let grid: Vec<f64> = (0..=last).map(|t| t as f64).collect();
    let mut detected = vec![0.0; grid.len()];
    for (_, inverse) in &inverses {
        let column = inverse.correct_slice(&grid, false)?;
        for (sum, value) in detected.iter_mut().zip(column) {
            *sum += value;
        }
    }
    let n = inverses.len() as f64;
    detected.iter_mut().for_each(|sum| *sum /= n);

    info!(
        "Averaged {} curves ({}) over {} grid points",
        curves.len(),
        curves.keys().join(", "),
        grid.len()
    );

    CorrectionCurve::new(detected, grid)
}
