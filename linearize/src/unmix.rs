//! Linear spectral unmixing of multi-channel pixels.

use ndarray::{Array1, Array2, ArrayBase, ArrayD, Axis, Data, Dimension, IxDyn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LinearizeConfig;
use crate::error::{LinearizeError, Result};
use crate::lstsq::{check_full_column_rank, least_squares, nnls};

/// Fraction of each fluorophore's emission collected by each channel
///
/// Shape (channels, fluorophores) with at least as many channels as
/// fluorophores and at least one fluorophore. Serialized as a list of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Vec<f64>>", into = "Vec<Vec<f64>>")]
pub struct MixingMatrix {
    data: Array2<f64>,
}

impl MixingMatrix {
    /// # Errors
    /// `Dimension` when there are fewer channels than fluorophores or no
    /// fluorophore at all, `InvalidInput` for non-finite entries.
    pub fn new(data: Array2<f64>) -> Result<Self> {
        let (channels, fluorophores) = data.dim();
        if fluorophores == 0 {
            return Err(LinearizeError::dimension(
                "mixing matrix needs at least one fluorophore",
            ));
        }
        if channels < fluorophores {
            return Err(LinearizeError::dimension(format!(
                "mixing matrix has {channels} channels for {fluorophores} fluorophores; \
                 need at least as many channels as fluorophores"
            )));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(LinearizeError::invalid_input(
                "mixing matrix contains non-finite entries",
            ));
        }
        Ok(Self { data })
    }

    /// One row per channel
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != n_cols) {
            return Err(LinearizeError::dimension("mixing matrix rows differ in length"));
        }
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((n_rows, n_cols), flat)
            .map_err(|e| LinearizeError::dimension(e.to_string()))?;
        Self::new(data)
    }

    pub fn as_array(&self) -> &Array2<f64> {
        &self.data
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_fluorophores(&self) -> usize {
        self.data.ncols()
    }

    /// Each column scaled to sum to 1
    ///
    /// # Errors
    /// `InvalidInput` when a column sums to zero.
    pub fn normalized_columns(&self) -> Result<Self> {
        let sums = self.data.sum_axis(Axis(0));
        if let Some(n) = sums.iter().position(|&s| s == 0.0) {
            return Err(LinearizeError::invalid_input(format!(
                "fluorophore {n} has no signal in any channel"
            )));
        }
        Ok(Self {
            data: &self.data / &sums.insert_axis(Axis(0)),
        })
    }
}

impl TryFrom<Vec<Vec<f64>>> for MixingMatrix {
    type Error = LinearizeError;

    fn try_from(rows: Vec<Vec<f64>>) -> Result<Self> {
        Self::from_rows(rows)
    }
}

impl From<MixingMatrix> for Vec<Vec<f64>> {
    fn from(matrix: MixingMatrix) -> Self {
        matrix.data.rows().into_iter().map(|row| row.to_vec()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UnmixOptions {
    /// Constrain abundances to be non-negative (NNLS)
    pub nonnegative: bool,
    /// Abundances below this value are reported in a warning
    pub negative_warning_threshold: f64,
}

impl Default for UnmixOptions {
    fn default() -> Self {
        Self {
            nonnegative: false,
            negative_warning_threshold: -10.0,
        }
    }
}

impl UnmixOptions {
    pub fn from_config(config: &LinearizeConfig, nonnegative: bool) -> Self {
        Self {
            nonnegative,
            negative_warning_threshold: config.negative_warning_threshold,
        }
    }
}

/// Unmixing output
#[derive(Debug, Clone)]
pub struct Unmixed {
    /// Shape (..., fluorophores); `NaN` for pixels with a non-finite channel
    pub abundances: ArrayD<f64>,
    /// Sum of squared residuals per pixel, shape (...)
    pub residuals: ArrayD<f64>,
    /// Abundances below the warning threshold
    pub n_below_threshold: usize,
    /// Pixels left unmixed because a channel value was NaN or infinite
    pub n_non_finite: usize,
}

/// Recover fluorophore abundances from mixed channel intensities
///
/// `pixels` has channels on its last axis; any leading shape is kept. Every
/// pixel solves `min ‖A x − b‖²`, optionally with `x ≥ 0`. Pixels holding a
/// NaN or infinite channel value (for instance values a partitioned
/// correction could not place on the curve) get `NaN` abundances and
/// residuals in both modes, and are counted in a single warning.
///
/// # Errors
/// `Dimension` when the last axis does not match the matrix's channel count,
/// `Singular` when the matrix does not have full column rank.
pub fn unmix<S, D>(
    matrix: &MixingMatrix,
    pixels: &ArrayBase<S, D>,
    options: &UnmixOptions,
) -> Result<Unmixed>
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    let a = matrix.as_array();
    let (channels, fluorophores) = a.dim();

    let shape = pixels.shape();
    let Some((&last, lead)) = shape.split_last() else {
        return Err(LinearizeError::dimension("cannot unmix a 0-dimensional array"));
    };
    if last != channels {
        return Err(LinearizeError::dimension(format!(
            "pixels have {last} channels but the mixing matrix has {channels}"
        )));
    }
    let lead = lead.to_vec();
    let n_pixels: usize = lead.iter().product();

    let table = pixels
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n_pixels, channels))
        .map_err(|e| LinearizeError::dimension(e.to_string()))?;

    let finite: Vec<bool> = table
        .rows()
        .into_iter()
        .map(|row| row.iter().all(|v| v.is_finite()))
        .collect();
    let n_non_finite = finite.iter().filter(|&&ok| !ok).count();
    if n_non_finite > 0 {
        warn!(
            count = n_non_finite,
            total = n_pixels,
            "Pixels with non-finite channel values were not unmixed (NaN abundances)"
        );
    }

    // (channels, pixels); non-finite pixels are zeroed for the solve and
    // overwritten with NaN afterwards
    let mut b = table.t().to_owned();
    for (p, _) in finite.iter().enumerate().filter(|&(_, &ok)| !ok) {
        b.column_mut(p).fill(0.0);
    }

    let mut x: Array2<f64> = if options.nonnegative {
        check_full_column_rank(a.view())?;
        let columns: Vec<Array1<f64>> = (0..n_pixels)
            .into_par_iter()
            .map(|p| {
                if finite[p] {
                    nnls(a.view(), b.column(p))
                } else {
                    Ok(Array1::from_elem(fluorophores, f64::NAN))
                }
            })
            .collect::<Result<_>>()?;
        let mut x = Array2::zeros((fluorophores, n_pixels));
        for (p, column) in columns.into_iter().enumerate() {
            x.column_mut(p).assign(&column);
        }
        x
    } else {
        least_squares(a.view(), b.view())?
    };
    for (p, _) in finite.iter().enumerate().filter(|&(_, &ok)| !ok) {
        x.column_mut(p).fill(f64::NAN);
    }
    debug!(pixels = n_pixels, fluorophores, "Unmixed pixel batch");

    let fitted: Array2<f64> = a.dot(&x);
    let residuals = (&fitted - &b).mapv(|r| r * r).sum_axis(Axis(0));

    let below: Vec<f64> = x
        .iter()
        .copied()
        .filter(|&v| v < options.negative_warning_threshold)
        .collect();
    if !below.is_empty() {
        let minimum = below.iter().copied().fold(f64::INFINITY, f64::min);
        warn!(
            count = below.len(),
            minimum,
            threshold = options.negative_warning_threshold,
            "Large negative abundances inferred; the mixing matrix may not fit this data"
        );
    }

    let mut out_shape = lead.clone();
    out_shape.push(fluorophores);
    let abundances = x
        .t()
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(&out_shape))
        .map_err(|e| LinearizeError::dimension(e.to_string()))?;
    let residuals = residuals
        .into_shape_with_order(IxDyn(&lead))
        .map_err(|e| LinearizeError::dimension(e.to_string()))?;

    Ok(Unmixed {
        abundances,
        residuals,
        n_below_threshold: below.len(),
        n_non_finite,
    })
}
