//! Unmixing-ratio estimation from the linear band of two channels.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::channels::{ChannelPair, LevelTable};
use crate::config::LinearizeConfig;
use crate::error::{LinearizeError, Result};
use crate::stats::{mean, unit_vector};

/// True signal of channel X per unit of channel Y
///
/// Always strictly positive and finite.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct UnmixingRatio(f64);

impl UnmixingRatio {
    pub fn new(xs_per_y: f64) -> Result<Self> {
        if xs_per_y.is_finite() && xs_per_y > 0.0 {
            Ok(Self(xs_per_y))
        } else {
            Err(LinearizeError::DegenerateRatio { xs_per_y })
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// Y per unit of X
    pub fn inverse(&self) -> Self {
        Self(1.0 / self.0)
    }
}

impl TryFrom<f64> for UnmixingRatio {
    type Error = LinearizeError;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<UnmixingRatio> for f64 {
    fn from(ratio: UnmixingRatio) -> Self {
        ratio.0
    }
}

/// Which escalation step produced the estimate
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimationStage {
    /// Both readings inside the linear band
    Bounded,
    /// Band constraint on Y dropped, NaNs still excluded
    Relaxed,
    /// Y used as the level channel, band constraint dropped
    Swapped,
}

/// Result of ratio estimation
#[derive(Debug, Clone)]
pub struct RatioEstimate {
    /// Accepted points, normalized to unit length, X component
    pub valid_xs: Vec<f64>,
    /// Accepted points, normalized to unit length, Y component
    pub valid_ys: Vec<f64>,
    pub xs_per_y: UnmixingRatio,
    pub stage: EstimationStage,
}

impl RatioEstimate {
    pub fn n_points(&self) -> usize {
        self.valid_xs.len()
    }
}

/// Estimate how much X signal corresponds to one unit of Y
///
/// # Algorithm
/// 1. For every integer level `x` strictly inside `(min_lin_val, max_lin_val)`,
///    take the mean Y reading of the pixels where X reads `x`
/// 2. Keep `(x, y)` when `y` is a number and also inside the band
/// 3. Normalize each kept pair to unit length and take
///    `mean(xs) / mean(ys)`
///
/// With fewer than `min_points` pairs the band constraint on `y` is dropped,
/// then the channels are swapped. The returned ratio is always X per Y of the
/// pair as given.
///
/// # Errors
/// `InsufficientData` (with the largest partial point set) when every step
/// comes up short, `DegenerateRatio` when the means do not give a finite,
/// positive ratio.
pub fn estimate_ratio(pair: &ChannelPair, config: &LinearizeConfig) -> Result<RatioEstimate> {
    config.validate()?;

    let levels = pair.levels();
    let mut best: Vec<(f64, f64)> = Vec::new();

    let bounded = collect_linear_points(&levels, config, false);
    debug!("Bounded pass accepted {} points", bounded.len());
    if bounded.len() >= config.min_points {
        return finish(bounded, EstimationStage::Bounded);
    }
    keep_largest(&mut best, bounded);

    warn!(
        "Only {} points inside the linear band (need {}), relaxing the bounds on Y",
        best.len(),
        config.min_points
    );
    let relaxed = collect_linear_points(&levels, config, true);
    if relaxed.len() >= config.min_points {
        return finish(relaxed, EstimationStage::Relaxed);
    }
    keep_largest(&mut best, relaxed);

    warn!("Still short of points with relaxed bounds, retrying with the channels swapped");
    let swapped: Vec<(f64, f64)> = collect_linear_points(&pair.swapped().levels(), config, true)
        .into_iter()
        .map(|(y, x)| (x, y))
        .collect();
    if swapped.len() >= config.min_points {
        return finish(swapped, EstimationStage::Swapped);
    }
    keep_largest(&mut best, swapped);

    Err(LinearizeError::InsufficientData {
        needed: config.min_points,
        found: best.len(),
        partial: best,
    })
}

/// Estimate the ratio between two channels of an image that was already
/// linearized
///
/// Corrected readings are continuous, so X is rounded to whole levels before
/// grouping. Pixels where either reading is NaN, infinite or negative (values
/// a partitioned correction could not place) are dropped. The linear band is
/// `config.coefficient_range` instead of `(min_lin_val, max_lin_val)`.
pub fn estimate_linearized_ratio(
    xs: &[f64],
    ys: &[f64],
    config: &LinearizeConfig,
) -> Result<RatioEstimate> {
    if xs.len() != ys.len() {
        return Err(LinearizeError::invalid_input(format!(
            "channel lengths differ: {} vs {}",
            xs.len(),
            ys.len()
        )));
    }
    let (kept_xs, kept_ys): (Vec<f64>, Vec<f64>) = xs
        .iter()
        .zip(ys)
        .filter(|&(&x, &y)| x.is_finite() && y.is_finite() && x >= 0.0 && y >= 0.0)
        .map(|(&x, &y)| (x.round(), y))
        .unzip();
    let dropped = xs.len() - kept_xs.len();
    if dropped > 0 {
        debug!(dropped, "Ignoring pixels without a valid linearized reading");
    }

    let pair = ChannelPair::new(kept_xs, kept_ys)?;
    estimate_ratio(&pair, &config.for_linearized())
}

/// Unit-length `(x, y)` points for every integer `x` strictly inside the band
fn collect_linear_points(
    levels: &LevelTable,
    config: &LinearizeConfig,
    override_bounds: bool,
) -> Vec<(f64, f64)> {
    let (min_lin, max_lin) = (config.min_lin_val, config.max_lin_val);
    let first = min_lin.floor() as i64 + 1;
    let last = max_lin.ceil() as i64 - 1;

    (first..=last)
        .filter_map(|x| {
            let x = x as f64;
            let y = levels.mean_at(x);
            if y.is_nan() {
                return None;
            }
            if !override_bounds && !(y > min_lin && y < max_lin) {
                return None;
            }
            Some(unit_vector(x, y))
        })
        .collect()
}

fn keep_largest(best: &mut Vec<(f64, f64)>, candidate: Vec<(f64, f64)>) {
    if candidate.len() > best.len() {
        *best = candidate;
    }
}

fn finish(points: Vec<(f64, f64)>, stage: EstimationStage) -> Result<RatioEstimate> {
    let (valid_xs, valid_ys): (Vec<f64>, Vec<f64>) = points.into_iter().unzip();
    let xs_per_y = UnmixingRatio::new(mean(&valid_xs) / mean(&valid_ys))?;

    info!(
        stage = %stage,
        points = valid_xs.len(),
        "Estimated unmixing ratio {:.4}",
        xs_per_y.value()
    );

    Ok(RatioEstimate {
        valid_xs,
        valid_ys,
        xs_per_y,
        stage,
    })
}
