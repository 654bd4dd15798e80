//! A deterministic saturating PMT model for generating calibration data.

use serde::{Deserialize, Serialize};

use crate::channels::ChannelPair;
use crate::error::{LinearizeError, Result};
use crate::ratio::UnmixingRatio;

/// Detector that is linear up to `knee` and then saturates exponentially
/// toward `ceiling`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PmtResponse {
    pub knee: f64,
    pub ceiling: f64,
}

impl Default for PmtResponse {
    fn default() -> Self {
        Self {
            knee: 20.0,
            ceiling: 150.0,
        }
    }
}

impl PmtResponse {
    pub fn new(knee: f64, ceiling: f64) -> Result<Self> {
        if !(knee.is_finite() && ceiling.is_finite()) || knee < 0.0 || ceiling <= knee {
            return Err(LinearizeError::invalid_input(format!(
                "detector needs 0 <= knee < ceiling, got knee {knee}, ceiling {ceiling}"
            )));
        }
        Ok(Self { knee, ceiling })
    }

    /// Detected signal for `true_photons`
    pub fn detect(&self, true_photons: f64) -> f64 {
        if true_photons <= self.knee {
            return true_photons;
        }
        let span = self.ceiling - self.knee;
        self.knee + span * (1.0 - (-(true_photons - self.knee) / span).exp())
    }

    /// Detected signal rounded to integer counts
    pub fn detect_counts(&self, true_photons: f64) -> f64 {
        self.detect(true_photons).round()
    }

    /// Two channels looking at the same pixels: the bright one receives
    /// `true_counts`, the dim one `true_counts / ratio`
    pub fn simulate_pair(&self, true_counts: &[f64], ratio: UnmixingRatio) -> Result<ChannelPair> {
        let bright = true_counts.iter().map(|&t| self.detect_counts(t)).collect();
        let dim = true_counts
            .iter()
            .map(|&t| self.detect_counts(t / ratio.value()))
            .collect();
        ChannelPair::new(bright, dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_below_knee() {
        let pmt = PmtResponse::default();
        assert_relative_eq!(pmt.detect(0.0), 0.0);
        assert_relative_eq!(pmt.detect(12.5), 12.5);
        assert_relative_eq!(pmt.detect(20.0), 20.0);
    }

    #[test]
    fn test_saturates_monotonically() {
        let pmt = PmtResponse::default();
        let samples: Vec<f64> = (0..2000).map(|t| pmt.detect(t as f64)).collect();
        assert!(samples.windows(2).all(|w| w[1] >= w[0]));
        assert!(samples[1999] < 150.0);
        assert!(pmt.detect(40.0) < 40.0);
    }

    #[test]
    fn test_simulated_pair() {
        let pmt = PmtResponse::default();
        let pair = pmt
            .simulate_pair(&[0.0, 10.0, 60.0], UnmixingRatio::new(2.0).unwrap())
            .unwrap();
        assert_eq!(pair.xs()[1], 10.0);
        assert_eq!(pair.ys(), &[0.0, 5.0, 30.0]);
        assert!(pair.xs()[2] < 60.0);
    }

    #[test]
    fn test_invalid_detector() {
        assert!(PmtResponse::new(50.0, 20.0).is_err());
        assert!(PmtResponse::new(-1.0, 20.0).is_err());
    }
}
