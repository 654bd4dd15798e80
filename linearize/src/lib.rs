//! PMT nonlinearity calibration, correction and spectral unmixing
//!
//! Photomultiplier tubes respond linearly to light only up to a point; above
//! it a channel under-reports photons. This crate estimates that response
//! empirically from two co-registered channels that see the same signal,
//! corrects images through the resulting curve, and unmixes the linearized
//! channels into per-fluorophore abundances.
//!
//! # Quick Start
//!
//! ```rust
//! use pmt_linearize::{
//!     build_curve, estimate_ratio, LinearizeConfig, PmtResponse, UnmixingRatio,
//! };
//!
//! # fn main() -> pmt_linearize::Result<()> {
//! // A bright channel that saturates and a dim one reading half the signal
//! let truth: Vec<f64> = (0..400).map(|t| t as f64 * 0.25).collect();
//! let pair = PmtResponse::default().simulate_pair(&truth, UnmixingRatio::new(2.0)?)?;
//!
//! let config = LinearizeConfig::default();
//! let estimate = estimate_ratio(&pair, &config)?;
//! let build = build_curve(&pair, estimate.xs_per_y, &config)?;
//!
//! let corrected = build.curve.correct(build.curve.max_detected(), false)?;
//! assert!(corrected >= build.curve.max_detected());
//! # Ok(())
//! # }
//! ```
//!
//! # Unmixing
//!
//! ```rust
//! use ndarray::array;
//! use pmt_linearize::{unmix, MixingMatrix, UnmixOptions};
//!
//! # fn main() -> pmt_linearize::Result<()> {
//! let matrix = MixingMatrix::new(array![[1.0, 0.0], [0.0, 1.0], [0.5, 0.5]])?;
//! let pixels = array![[10.0, 20.0, 15.0]];
//! let unmixed = unmix(&matrix, &pixels, &UnmixOptions::default())?;
//! assert!((unmixed.abundances[[0, 1]] - 20.0).abs() < 1e-9);
//! # Ok(())
//! # }
//! ```

pub mod average;
pub mod canonical;
pub mod channels;
pub mod config;
pub mod correct;
pub mod curve;
pub mod error;
mod lstsq;
pub mod mixing;
pub mod ratio;
pub mod stats;
pub mod store;
pub mod synthetic;
pub mod unmix;

pub use average::average_curves;
pub use canonical::{Canonical, canonicalize};
pub use channels::{ChannelPair, ImageStack, Level, LevelTable};
pub use config::{LinearizeConfig, LinearizeConfigBuilder, Reduction};
pub use correct::{CorrectionBatch, CorrectionFailure};
pub use curve::{CorrectionCurve, CurveBuild, CurveBuilder, SkippedLevel, build_curve};
pub use error::{LinearizeError, Result};
pub use mixing::{
    Fluorophore, MockUnmixing, Session, Spectrum, bandpass_filter, filtered_signal,
    mixing_matrix_from_spectra, mock_unmixing,
};
pub use ratio::{
    EstimationStage, RatioEstimate, UnmixingRatio, estimate_linearized_ratio, estimate_ratio,
};
pub use store::{CurveKey, CurveStore};
pub use synthetic::PmtResponse;
pub use unmix::{MixingMatrix, UnmixOptions, Unmixed, unmix};
