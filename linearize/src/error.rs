//! Error types for calibration, correction and unmixing.
//!
//! Per-item failures (a channel pair without enough linear points, a pixel
//! outside the curve domain) are ordinary `Err` values. Batch callers are
//! expected to log them and move on to the next pair or image.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LinearizeError {
    /// Not enough valid (x, y) pairs after every escalation step.
    /// `partial` holds the largest set of normalized points that was collected.
    #[error("Insufficient data: need at least {needed} valid points, got {found}")]
    InsufficientData {
        needed: usize,
        found: usize,
        partial: Vec<(f64, f64)>,
    },

    #[error("Degenerate unmixing ratio: {xs_per_y} (must be finite and > 0)")]
    DegenerateRatio { xs_per_y: f64 },

    #[error("Value {value} outside the correctable range [{min}, {max}]")]
    Range { value: f64, min: f64, max: f64 },

    #[error("Dimension error: {0}")]
    Dimension(String),

    #[error("Singular system: {0}")]
    Singular(String),

    #[error("Invalid curve: {0}")]
    InvalidCurve(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Curve already stored: {0}")]
    CurveExists(String),

    #[error("Curve not found: {0}")]
    CurveNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LinearizeError {
    /// Create a Dimension error with a message
    pub fn dimension(message: impl Into<String>) -> Self {
        Self::Dimension(message.into())
    }

    /// Create an InvalidInput error with a message
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an InvalidCurve error with a message
    pub fn invalid_curve(message: impl Into<String>) -> Self {
        Self::InvalidCurve(message.into())
    }

    /// True for errors that only concern one item of a batch (one channel
    /// pair, one value) and should not stop the rest of the run.
    pub fn is_per_item(&self) -> bool {
        matches!(
            self,
            Self::InsufficientData { .. }
                | Self::DegenerateRatio { .. }
                | Self::Range { .. }
                | Self::InvalidCurve(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LinearizeError>;
