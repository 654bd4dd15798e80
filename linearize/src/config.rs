//! Run configuration shared by every estimator.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::path::Path;
use strum_macros::{Display, EnumString};

use crate::error::{LinearizeError, Result};

/// How repeated readings of the reference channel at one primary level are
/// reduced to a single value while building a curve.
#[derive(
    Default, Display, EnumString, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// First sample at the level, in acquisition order
    First,
    /// Mean of all samples at the level
    #[default]
    Mean,
}

/// Thresholds for one calibration / correction / unmixing run
///
/// The value is immutable once built and passed explicitly into every
/// estimator, so several channel pairs can be calibrated side by side with
/// different settings.
///
/// # Example
///
/// ```rust
/// use pmt_linearize::{LinearizeConfig, Reduction};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LinearizeConfig::builder()
///     .min_lin_val(4.0)
///     .max_lin_val(14.0)
///     .reduction(Reduction::First)
///     .build()?;
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Builder, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[builder(default)]
#[serde(default)]
pub struct LinearizeConfig {
    /// Lower bound (exclusive) of the trusted linear band
    pub min_lin_val: f64,

    /// Upper bound (exclusive) of the trusted linear band; also the linear
    /// ceiling above which reference readings are corrected before use
    pub max_lin_val: f64,

    /// Minimum number of accepted (x, y) pairs for a ratio estimate
    pub min_points: usize,

    /// Decimal places kept when correcting a non-integer reading (a mean)
    pub resolution: u32,

    /// Reduction of repeated reference readings at one level
    pub reduction: Reduction,

    /// Size of the integer grid used when averaging curves
    pub grid_len: usize,

    /// Inferred abundances below this value trigger a warning during unmixing
    pub negative_warning_threshold: f64,

    /// Linear band used when estimating unmixing coefficients on images that
    /// have already been linearized
    pub coefficient_range: (f64, f64),
}

impl Default for LinearizeConfig {
    fn default() -> Self {
        Self {
            min_lin_val: 10.0,
            max_lin_val: 25.0,
            min_points: 5,
            resolution: 3,
            reduction: Reduction::Mean,
            grid_len: 300,
            negative_warning_threshold: -10.0,
            coefficient_range: (10.0, 250.0),
        }
    }
}

impl LinearizeConfig {
    /// Create a new builder for LinearizeConfig
    pub fn builder() -> LinearizeConfigBuilder {
        LinearizeConfigBuilder::default()
    }

    /// Read a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the thresholds describe a usable linear band
    pub fn validate(&self) -> Result<()> {
        if !(self.min_lin_val.is_finite() && self.max_lin_val.is_finite()) {
            return Err(LinearizeError::Config(
                "linear band bounds must be finite".to_string(),
            ));
        }
        if self.min_lin_val < 0.0 {
            return Err(LinearizeError::Config(format!(
                "min_lin_val must be >= 0, got {}",
                self.min_lin_val
            )));
        }
        if self.min_lin_val >= self.max_lin_val {
            return Err(LinearizeError::Config(format!(
                "min_lin_val ({}) must be below max_lin_val ({})",
                self.min_lin_val, self.max_lin_val
            )));
        }
        if self.min_points == 0 {
            return Err(LinearizeError::Config(
                "min_points must be at least 1".to_string(),
            ));
        }
        if self.grid_len < 2 {
            return Err(LinearizeError::Config(format!(
                "grid_len must be at least 2, got {}",
                self.grid_len
            )));
        }
        let (lo, hi) = self.coefficient_range;
        if !(lo.is_finite() && hi.is_finite()) || lo < 0.0 || lo >= hi {
            return Err(LinearizeError::Config(format!(
                "coefficient_range ({lo}, {hi}) is not a valid band"
            )));
        }
        Ok(())
    }

    /// Identity-band threshold: levels below this are taken as already linear
    pub fn identity_limit(&self) -> f64 {
        self.max_lin_val / 2.0
    }

    /// Copy of this configuration whose linear band is `coefficient_range`,
    /// for ratio estimation on images that were already linearized
    pub fn for_linearized(&self) -> Self {
        let (lo, hi) = self.coefficient_range;
        Self {
            min_lin_val: lo,
            max_lin_val: hi,
            ..self.clone()
        }
    }

    /// Round a reading to `resolution` decimals
    pub fn round_to_resolution(&self, value: f64) -> f64 {
        let scale = 10f64.powi(self.resolution as i32);
        (value * scale).round() / scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_default_is_valid() {
        assert!(LinearizeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_keeps_defaults_for_unset_fields() {
        let config = LinearizeConfig::builder()
            .min_lin_val(4.0)
            .max_lin_val(14.0)
            .build()
            .unwrap();
        assert_eq!(config.min_points, 5);
        assert_eq!(config.reduction, Reduction::Mean);
        assert_eq!(config.identity_limit(), 7.0);
    }

    #[test]
    fn test_inverted_band_rejected() {
        let config = LinearizeConfig {
            min_lin_val: 30.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(LinearizeError::Config(_))));
    }

    #[test]
    fn test_zero_min_points_rejected() {
        let config = LinearizeConfig {
            min_points: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: LinearizeConfig =
            serde_json::from_str(r#"{"min_lin_val": 4, "reduction": "first"}"#).unwrap();
        assert_eq!(config.min_lin_val, 4.0);
        assert_eq!(config.max_lin_val, 25.0);
        assert_eq!(config.reduction, Reduction::First);
    }

    #[test]
    fn test_reduction_parses_from_str() {
        assert_eq!(Reduction::from_str("mean").unwrap(), Reduction::Mean);
        assert_eq!(Reduction::from_str("first").unwrap(), Reduction::First);
        assert_eq!(Reduction::First.to_string(), "first");
    }

    #[test]
    fn test_for_linearized_swaps_band() {
        let config = LinearizeConfig::default().for_linearized();
        assert_eq!(config.min_lin_val, 10.0);
        assert_eq!(config.max_lin_val, 250.0);
    }

    #[test]
    fn test_round_to_resolution() {
        let config = LinearizeConfig::default();
        assert_eq!(config.round_to_resolution(12.34567), 12.346);
    }
}
