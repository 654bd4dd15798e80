//! Small descriptive statistics.

use crate::error::{LinearizeError, Result};

/// Arithmetic mean; NaN for an empty slice
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return f64::NAN;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Calculate median of a slice of f64 values
pub fn median(data: &[f64]) -> Result<f64> {
    if data.is_empty() {
        return Err(LinearizeError::invalid_input("median of empty data"));
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let len = sorted.len();
    let median_value = if len % 2 == 0 {
        (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
    } else {
        sorted[len / 2]
    };

    Ok(median_value)
}

/// Scale `(x, y)` to unit length so pairs at different intensities but the
/// same ratio land on the same point
pub fn unit_vector(x: f64, y: f64) -> (f64, f64) {
    let length = x.hypot(y);
    (x / length, y / length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_odd() {
        let data = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        assert_relative_eq!(median(&data).unwrap(), 3.0);
    }

    #[test]
    fn test_median_even() {
        let data = vec![1.0, 2.0, 3.0, 4.0];
        assert_relative_eq!(median(&data).unwrap(), 2.5);
    }

    #[test]
    fn test_median_empty_is_error() {
        assert!(median(&[]).is_err());
    }

    #[test]
    fn test_mean_empty_is_nan() {
        assert!(mean(&[]).is_nan());
        assert_relative_eq!(mean(&[1.0, 2.0, 6.0]), 3.0);
    }

    #[test]
    fn test_unit_vector() {
        let (x, y) = unit_vector(3.0, 4.0);
        assert_relative_eq!(x, 0.6);
        assert_relative_eq!(y, 0.8);
    }
}
