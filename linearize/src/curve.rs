//! PMT correction curves and their construction from a calibration pair.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::canonical::canonicalize;
use crate::channels::ChannelPair;
use crate::config::LinearizeConfig;
use crate::correct::interpolate_checked;
use crate::error::{LinearizeError, Result};
use crate::ratio::UnmixingRatio;

/// Monotone mapping from detected counts to true photon counts
///
/// Always anchored at `(0, 0)`; `detected_photons` is strictly increasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCurve")]
pub struct CorrectionCurve {
    detected_photons: Vec<f64>,
    true_photons: Vec<f64>,
}

#[derive(Deserialize)]
struct RawCurve {
    detected_photons: Vec<f64>,
    true_photons: Vec<f64>,
}

impl TryFrom<RawCurve> for CorrectionCurve {
    type Error = LinearizeError;

    fn try_from(raw: RawCurve) -> Result<Self> {
        Self::new(raw.detected_photons, raw.true_photons)
    }
}

impl CorrectionCurve {
    /// Build a curve from raw point lists
    ///
    /// The first point is overwritten with `(0, 0)`. Repeated detected values
    /// keep their first occurrence.
    ///
    /// # Errors
    /// `InvalidCurve` for empty or unequal lists, non-finite entries, or
    /// detected values that go down.
    pub fn new(detected_photons: Vec<f64>, true_photons: Vec<f64>) -> Result<Self> {
        if detected_photons.len() != true_photons.len() {
            return Err(LinearizeError::invalid_curve(format!(
                "{} detected values but {} true values",
                detected_photons.len(),
                true_photons.len()
            )));
        }
        if detected_photons.is_empty() {
            return Err(LinearizeError::invalid_curve("curve has no points"));
        }
        if detected_photons
            .iter()
            .chain(true_photons.iter())
            .any(|v| !v.is_finite())
        {
            return Err(LinearizeError::invalid_curve("curve contains non-finite values"));
        }

        let mut detected = Vec::with_capacity(detected_photons.len());
        let mut truth = Vec::with_capacity(true_photons.len());
        detected.push(0.0);
        truth.push(0.0);

        for (&d, &t) in detected_photons.iter().zip(&true_photons).skip(1) {
            let last = detected[detected.len() - 1];
            if d < last {
                return Err(LinearizeError::invalid_curve(format!(
                    "detected photons must not decrease ({d} after {last})"
                )));
            }
            if d > last {
                detected.push(d);
                truth.push(t);
            }
        }

        Ok(Self {
            detected_photons: detected,
            true_photons: truth,
        })
    }

    pub fn detected_photons(&self) -> &[f64] {
        &self.detected_photons
    }

    pub fn true_photons(&self) -> &[f64] {
        &self.true_photons
    }

    pub fn len(&self) -> usize {
        self.detected_photons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detected_photons.is_empty()
    }

    /// Upper end of the correctable domain
    pub fn max_detected(&self) -> f64 {
        self.detected_photons[self.detected_photons.len() - 1]
    }

    pub fn max_true(&self) -> f64 {
        self.true_photons.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// True when `true_photons` never decreases
    pub fn is_monotone(&self) -> bool {
        self.true_photons.windows(2).all(|w| w[1] >= w[0])
    }

    /// The curve read backwards: true photons to detected counts
    ///
    /// # Errors
    /// `InvalidCurve` when `true_photons` is not monotone.
    pub fn inverse(&self) -> Result<Self> {
        if !self.is_monotone() {
            return Err(LinearizeError::invalid_curve(
                "true photons are not monotone, the curve cannot be inverted",
            ));
        }
        Self::new(self.true_photons.clone(), self.detected_photons.clone())
    }
}

/// An incrementally growing curve
///
/// Points are appended in strictly increasing detected order. While the curve
/// grows, readings can be corrected against the prefix built so far, which is
/// how points above the linear ceiling are bootstrapped from lower ones.
#[derive(Debug, Clone)]
pub struct CurveBuilder {
    detected: Vec<f64>,
    truth: Vec<f64>,
}

impl Default for CurveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CurveBuilder {
    /// Start a curve at `(0, 0)`
    pub fn new() -> Self {
        Self {
            detected: vec![0.0],
            truth: vec![0.0],
        }
    }

    pub fn len(&self) -> usize {
        self.detected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detected.is_empty()
    }

    pub fn last_detected(&self) -> f64 {
        self.detected[self.detected.len() - 1]
    }

    pub fn last_true(&self) -> f64 {
        self.truth[self.truth.len() - 1]
    }

    /// Append a point; `detected` must exceed every point already present
    pub fn push(&mut self, detected: f64, true_photons: f64) -> Result<()> {
        if !detected.is_finite() || !true_photons.is_finite() {
            return Err(LinearizeError::invalid_curve(format!(
                "non-finite point ({detected}, {true_photons})"
            )));
        }
        if detected <= self.last_detected() {
            return Err(LinearizeError::invalid_curve(format!(
                "detected value {detected} does not extend the curve past {}",
                self.last_detected()
            )));
        }
        self.detected.push(detected);
        self.truth.push(true_photons);
        Ok(())
    }

    /// Correct a reading against the points pushed so far
    pub fn correct_prefix(&self, value: f64) -> Result<f64> {
        interpolate_checked(&self.detected, &self.truth, value)
    }

    pub fn finish(self) -> Result<CorrectionCurve> {
        CorrectionCurve::new(self.detected, self.truth)
    }
}

/// A primary level that could not be placed on the curve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedLevel {
    pub level: f64,
    pub reference: f64,
    pub reason: String,
}

/// Result of curve construction
#[derive(Debug, Clone)]
pub struct CurveBuild {
    pub curve: CorrectionCurve,
    /// Ratio in curve-building order (primary per reference)
    pub xs_per_y: UnmixingRatio,
    /// True when the caller's channels were exchanged before building
    pub swapped: bool,
    /// Levels left out because their reference reading could not be corrected
    pub skipped: Vec<SkippedLevel>,
    /// Levels where the reference read above the primary or the true value dropped
    pub non_monotone_levels: Vec<f64>,
}

/// Build a PMT correction curve from a calibration pair
///
/// # Algorithm
/// 1. Put the brighter channel first (inverting the ratio if needed)
/// 2. Walk the unique primary levels in ascending order
/// 3. Below `max_lin_val / 2` a level maps to itself
/// 4. Above it, reduce the reference readings at that level; when the
///    reference is itself above `max_lin_val`, correct it through the curve
///    built so far; the true value is `ratio * reference`
///
/// The walk is sequential: each point may depend on the ones below it.
pub fn build_curve(
    pair: &ChannelPair,
    xs_per_y: UnmixingRatio,
    config: &LinearizeConfig,
) -> Result<CurveBuild> {
    config.validate()?;

    let canonical = canonicalize(pair, xs_per_y)?;
    let ratio = canonical.xs_per_y.value();
    let identity_limit = config.identity_limit();

    let mut builder = CurveBuilder::new();
    let mut skipped = Vec::new();
    let mut non_monotone_levels = Vec::new();

    for level in canonical.pair.levels().iter() {
        let x = level.value;
        if x == 0.0 {
            continue;
        }
        if x < identity_limit {
            builder.push(x, x)?;
            continue;
        }

        let mut y = level.reduce(config.reduction);
        if y > x {
            warn!(
                level = x,
                reference = y,
                "Reference channel reads above the primary; curve may be non-monotone here"
            );
            non_monotone_levels.push(x);
        }

        if y > config.max_lin_val {
            let rounded = config.round_to_resolution(y);
            match builder.correct_prefix(rounded) {
                Ok(corrected) => y = corrected,
                Err(e) => {
                    warn!(level = x, reference = rounded, "Skipping level: {}", e);
                    skipped.push(SkippedLevel {
                        level: x,
                        reference: rounded,
                        reason: e.to_string(),
                    });
                    continue;
                }
            }
        }

        let expected = ratio * y;
        if expected < builder.last_true() && non_monotone_levels.last() != Some(&x) {
            warn!(
                level = x,
                expected,
                previous = builder.last_true(),
                "True photon estimate dropped below the previous level"
            );
            non_monotone_levels.push(x);
        }
        builder.push(x, expected)?;
    }

    let curve = builder.finish()?;
    info!(
        points = curve.len(),
        swapped = canonical.swapped,
        skipped = skipped.len(),
        "Built PMT correction curve up to {} detected photons",
        curve.max_detected()
    );

    Ok(CurveBuild {
        curve,
        xs_per_y: canonical.xs_per_y,
        swapped: canonical.swapped,
        skipped,
        non_monotone_levels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Reduction;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_point_forced_to_origin() {
        let curve = CorrectionCurve::new(vec![2.0, 5.0, 9.0], vec![3.0, 5.0, 12.0]).unwrap();
        assert_eq!(curve.detected_photons(), &[0.0, 5.0, 9.0]);
        assert_eq!(curve.true_photons(), &[0.0, 5.0, 12.0]);
    }

    #[test]
    fn test_duplicates_keep_first_occurrence() {
        let curve =
            CorrectionCurve::new(vec![0.0, 4.0, 4.0, 8.0], vec![0.0, 4.0, 5.0, 9.0]).unwrap();
        assert_eq!(curve.detected_photons(), &[0.0, 4.0, 8.0]);
        assert_eq!(curve.true_photons(), &[0.0, 4.0, 9.0]);
    }

    #[test]
    fn test_decreasing_detected_rejected() {
        let result = CorrectionCurve::new(vec![0.0, 5.0, 3.0], vec![0.0, 5.0, 3.0]);
        assert!(matches!(result, Err(LinearizeError::InvalidCurve(_))));
        assert!(CorrectionCurve::new(vec![], vec![]).is_err());
        assert!(CorrectionCurve::new(vec![0.0], vec![0.0, 1.0]).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"detected_photons":[1.0,2.0],"true_photons":[1.0,4.0]}"#;
        let curve: CorrectionCurve = serde_json::from_str(json).unwrap();
        assert_eq!(curve.detected_photons(), &[0.0, 2.0]);

        let bad = r#"{"detected_photons":[0.0,2.0,1.0],"true_photons":[0.0,1.0,2.0]}"#;
        assert!(serde_json::from_str::<CorrectionCurve>(bad).is_err());
    }

    #[test]
    fn test_inverse_swaps_axes() {
        let curve = CorrectionCurve::new(vec![0.0, 10.0, 20.0], vec![0.0, 10.0, 40.0]).unwrap();
        let inverse = curve.inverse().unwrap();
        assert_eq!(inverse.detected_photons(), &[0.0, 10.0, 40.0]);
        assert_eq!(inverse.true_photons(), &[0.0, 10.0, 20.0]);

        let bent = CorrectionCurve::new(vec![0.0, 10.0, 20.0], vec![0.0, 10.0, 8.0]).unwrap();
        assert!(!bent.is_monotone());
        assert!(bent.inverse().is_err());
    }

    #[test]
    fn test_builder_requires_increasing_detected() {
        let mut builder = CurveBuilder::new();
        builder.push(5.0, 5.0).unwrap();
        assert!(builder.push(5.0, 6.0).is_err());
        assert!(builder.push(3.0, 6.0).is_err());
        assert!(builder.push(f64::NAN, 6.0).is_err());
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_builder_prefix_correction_grows_with_curve() {
        let mut builder = CurveBuilder::new();
        builder.push(10.0, 10.0).unwrap();
        assert!(builder.correct_prefix(15.0).is_err());

        builder.push(20.0, 30.0).unwrap();
        assert_relative_eq!(builder.correct_prefix(15.0).unwrap(), 20.0);
        assert_relative_eq!(builder.correct_prefix(20.0).unwrap(), 30.0);
    }

    #[test]
    fn test_build_curve_identity_band_and_scaled_points() {
        // Primary reads twice the reference; reference stays below the ceiling
        let xs: Vec<f64> = (0..=40).map(f64::from).collect();
        let ys: Vec<f64> = xs.iter().map(|x| x / 2.0).collect();
        let pair = ChannelPair::new(xs, ys).unwrap();
        let config = LinearizeConfig::default();

        let build = build_curve(&pair, UnmixingRatio::new(2.0).unwrap(), &config).unwrap();
        assert!(!build.swapped);
        assert!(build.skipped.is_empty());
        assert!(build.non_monotone_levels.is_empty());

        let curve = build.curve;
        assert_eq!(curve.len(), 41);
        // 0..=12 are inside the identity band (limit 12.5), the rest are 2 * (x / 2)
        for (d, t) in curve.detected_photons().iter().zip(curve.true_photons()) {
            assert_relative_eq!(d, t, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_build_curve_swaps_dimmer_primary() {
        let ys: Vec<f64> = (0..=30).map(f64::from).collect();
        let xs: Vec<f64> = ys.iter().map(|y| y / 2.0).collect();
        let pair = ChannelPair::new(xs, ys).unwrap();

        let build =
            build_curve(&pair, UnmixingRatio::new(0.5).unwrap(), &LinearizeConfig::default())
                .unwrap();
        assert!(build.swapped);
        assert_relative_eq!(build.xs_per_y.value(), 2.0);
        assert_relative_eq!(build.curve.max_detected(), 30.0);
    }

    #[test]
    fn test_build_curve_bootstraps_above_ceiling() {
        // Reference 30 at level 60 is above the ceiling (25) and gets corrected
        // through the lower part of the curve, which is linear up to 40
        let xs = vec![0.0, 5.0, 10.0, 20.0, 30.0, 40.0, 60.0];
        let ys = vec![0.0, 2.5, 5.0, 10.0, 15.0, 20.0, 30.0];
        let pair = ChannelPair::new(xs, ys).unwrap();
        let config = LinearizeConfig::default();

        let build = build_curve(&pair, UnmixingRatio::new(2.0).unwrap(), &config).unwrap();
        let curve = build.curve;
        assert_eq!(curve.detected_photons(), &[0.0, 5.0, 10.0, 20.0, 30.0, 40.0, 60.0]);
        // level 30 -> 2 * 15 = 30, level 40 -> 2 * 20 = 40, level 60 -> 2 * correct(30) = 60
        assert_relative_eq!(curve.true_photons()[6], 60.0, epsilon = 1e-12);
    }

    #[test]
    fn test_build_curve_reports_uncorrectable_levels() {
        // Reference above primary and above the ceiling cannot be corrected
        let xs = vec![0.0, 5.0, 10.0, 14.0, 30.0];
        let ys = vec![0.0, 5.0, 10.0, 14.0, 31.0];
        let pair = ChannelPair::new(xs, ys).unwrap();

        let build =
            build_curve(&pair, UnmixingRatio::new(1.0).unwrap(), &LinearizeConfig::default())
                .unwrap();
        assert_eq!(build.skipped.len(), 1);
        assert_eq!(build.skipped[0].level, 30.0);
        assert_eq!(build.non_monotone_levels, vec![30.0]);
        assert_relative_eq!(build.curve.max_detected(), 14.0);
    }

    #[test]
    fn test_reduction_policy_changes_reference() {
        // Two readings at level 20: first 8, mean 10
        let xs = vec![0.0, 20.0, 20.0];
        let ys = vec![0.0, 8.0, 12.0];
        let pair = ChannelPair::new(xs, ys).unwrap();
        let ratio = UnmixingRatio::new(2.0).unwrap();

        let mean_config = LinearizeConfig::default();
        let first_config = LinearizeConfig {
            reduction: Reduction::First,
            ..Default::default()
        };
        let mean_curve = build_curve(&pair, ratio, &mean_config).unwrap().curve;
        let first_curve = build_curve(&pair, ratio, &first_config).unwrap().curve;
        assert_relative_eq!(mean_curve.true_photons()[1], 20.0);
        assert_relative_eq!(first_curve.true_photons()[1], 16.0);
    }
}
