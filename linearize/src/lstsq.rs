//! Least squares for tall, full-column-rank systems.
//!
//! Unconstrained solves go through LAPACK's SVD driver, many right-hand sides
//! at once. Non-negative solutions use Lawson-Hanson, solving each passive
//! sub-problem with the same driver.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{LeastSquaresSvd, SVD};

use crate::error::{LinearizeError, Result};

/// Columns whose singular value falls below `s_max * max(rows, cols) * eps`
/// count as dependent
fn check_rank(singular_values: &Array1<f64>, rows: usize, cols: usize) -> Result<()> {
    let s_max = singular_values.iter().fold(0.0f64, |m, s| m.max(s.abs()));
    let tolerance = s_max * rows.max(cols) as f64 * f64::EPSILON;
    let rank = singular_values.iter().filter(|s| s.abs() > tolerance).count();
    if rank < cols {
        return Err(LinearizeError::Singular(format!(
            "the {rows}x{cols} system has rank {rank}; its columns are linearly dependent"
        )));
    }
    Ok(())
}

fn check_tall(rows: usize, cols: usize) -> Result<()> {
    if rows < cols {
        return Err(LinearizeError::dimension(format!(
            "least squares needs at least as many rows as columns, got {rows}x{cols}"
        )));
    }
    Ok(())
}

/// `Singular` unless `a` has full column rank
pub(crate) fn check_full_column_rank(a: ArrayView2<f64>) -> Result<()> {
    let (rows, cols) = a.dim();
    check_tall(rows, cols)?;
    let (_, singular_values, _) = a
        .svd(false, false)
        .map_err(|e| LinearizeError::Singular(format!("SVD failed: {e:?}")))?;
    check_rank(&singular_values, rows, cols)
}

/// Least-squares solution for every column of `b` (rows x k), returns
/// (cols x k)
pub(crate) fn least_squares(a: ArrayView2<f64>, b: ArrayView2<f64>) -> Result<Array2<f64>> {
    let (rows, cols) = a.dim();
    check_tall(rows, cols)?;
    if b.nrows() != rows {
        return Err(LinearizeError::dimension(format!(
            "right-hand side has {} rows for a {rows}x{cols} system",
            b.nrows()
        )));
    }
    if b.ncols() == 0 {
        check_full_column_rank(a)?;
        return Ok(Array2::zeros((cols, 0)));
    }

    let result = a
        .least_squares(&b.as_standard_layout())
        .map_err(|e| LinearizeError::Singular(format!("least squares failed: {e:?}")))?;
    check_rank(&result.singular_values, rows, cols)?;
    Ok(result.solution)
}

/// Lawson-Hanson non-negative least squares for one right-hand side
///
/// `a` must have full column rank, so every subset of its columns can be
/// solved.
pub(crate) fn nnls(a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>> {
    let (rows, cols) = a.dim();
    if b.iter().any(|v| !v.is_finite()) {
        return Err(LinearizeError::invalid_input(
            "non-negative least squares needs finite observations",
        ));
    }
    let column_norm = a
        .columns()
        .into_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0f64, f64::max);
    let tolerance = 10.0 * f64::EPSILON * column_norm * rows.max(cols) as f64;

    let mut x = Array1::<f64>::zeros(cols);
    let mut passive = vec![false; cols];

    for _ in 0..30 * cols.max(1) {
        let fitted: Array1<f64> = a.dot(&x);
        let residual: Array1<f64> = &b - &fitted;
        let gradient: Array1<f64> = a.t().dot(&residual);

        let candidate = (0..cols)
            .filter(|&j| !passive[j])
            .max_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
        let Some(t) = candidate.filter(|&t| gradient[t] > tolerance) else {
            break;
        };
        passive[t] = true;

        loop {
            let active: Vec<usize> = (0..cols).filter(|&j| passive[j]).collect();
            if active.is_empty() {
                break;
            }
            let sub = a.select(Axis(1), &active);
            let z = sub
                .least_squares(&b)
                .map_err(|e| LinearizeError::Singular(format!("least squares failed: {e:?}")))?
                .solution;

            if z.iter().all(|&v| v > tolerance) {
                for (&j, &zj) in active.iter().zip(&z) {
                    x[j] = zj;
                }
                break;
            }

            // step toward z until the first passive variable hits zero
            let alpha = active
                .iter()
                .zip(&z)
                .filter(|&(&j, &zj)| zj <= tolerance && x[j] - zj > 0.0)
                .map(|(&j, &zj)| x[j] / (x[j] - zj))
                .fold(f64::INFINITY, f64::min);
            let alpha = if alpha.is_finite() { alpha } else { 0.0 };
            for (&j, &zj) in active.iter().zip(&z) {
                x[j] += alpha * (zj - x[j]);
            }
            for &j in &active {
                if x[j] <= tolerance {
                    x[j] = 0.0;
                    passive[j] = false;
                }
            }
        }
    }

    Ok(x)
}
