//! Mixing-matrix assembly from emission spectra and bandpass filters.

use std::path::Path;

use ndarray::{Array1, Array2};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LinearizeError, Result};
use crate::unmix::{MixingMatrix, UnmixOptions, Unmixed, unmix};

/// Excitation used for every fluorophore when a session names no wavelength
pub const DEFAULT_EXCITATION_SCALE: f64 = 100.0;

/// Values sampled on a wavelength grid (nanometres)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    pub wavelengths: Vec<f64>,
    pub values: Vec<f64>,
}

impl Spectrum {
    pub fn new(wavelengths: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if wavelengths.len() != values.len() {
            return Err(LinearizeError::invalid_input(format!(
                "spectrum has {} wavelengths but {} values",
                wavelengths.len(),
                values.len()
            )));
        }
        Ok(Self {
            wavelengths,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.wavelengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wavelengths.is_empty()
    }

    /// Value at exactly `wavelength`, if sampled
    pub fn at(&self, wavelength: f64) -> Option<f64> {
        self.wavelengths
            .iter()
            .position(|&w| w == wavelength)
            .map(|i| self.values[i])
    }
}

/// Transmission of a bandpass filter with logistic edges
///
/// Sampled every nanometre over `center ± max(bandwidth, 50)`. Each edge is
/// `1 / (1 + steepness^-(λ - edge))`; the filter is the lower of the rising
/// and falling edge, scaled by `max_transmission`.
///
/// # Errors
/// `InvalidInput` when `steepness <= 1` or `bandwidth` is not positive.
pub fn bandpass_filter(
    center: f64,
    bandwidth: f64,
    max_transmission: f64,
    steepness: f64,
) -> Result<Spectrum> {
    if steepness <= 1.0 {
        return Err(LinearizeError::invalid_input(format!(
            "filter steepness must be greater than 1, got {steepness}"
        )));
    }
    if bandwidth <= 0.0 || !bandwidth.is_finite() {
        return Err(LinearizeError::invalid_input(format!(
            "filter bandwidth must be positive, got {bandwidth}"
        )));
    }

    let half_range = bandwidth.max(50.0);
    let start = center - half_range;
    let n = (2.0 * half_range).ceil() as usize;
    let (low_edge, high_edge) = (center - bandwidth / 2.0, center + bandwidth / 2.0);
    let logistic = |lambda: f64, edge: f64| 1.0 / (1.0 + steepness.powf(-(lambda - edge)));

    let wavelengths: Vec<f64> = (0..n).map(|i| start + i as f64).collect();
    let values = wavelengths
        .iter()
        .map(|&lambda| {
            let rising = logistic(lambda, low_edge);
            let falling = 1.0 - logistic(lambda, high_edge);
            rising.min(falling) * max_transmission
        })
        .collect();

    Spectrum::new(wavelengths, values)
}

/// Signal collected through `filter`: dot product over shared wavelengths
pub fn filtered_signal(emission: &Spectrum, filter: &Spectrum) -> f64 {
    let transmission: FxHashMap<u64, f64> = filter
        .wavelengths
        .iter()
        .zip(&filter.values)
        .map(|(w, t)| (w.to_bits(), *t))
        .collect();

    emission
        .wavelengths
        .iter()
        .zip(&emission.values)
        .filter_map(|(w, e)| transmission.get(&w.to_bits()).map(|t| e * t))
        .sum()
}

/// Emission and (optionally) excitation spectrum of one fluorophore
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fluorophore {
    pub name: String,
    pub emission: Spectrum,
    pub excitation: Option<Spectrum>,
}

#[derive(Debug, Deserialize)]
struct SpectrumRow {
    #[serde(rename = "Wavelength")]
    wavelength: f64,
    #[serde(rename = "Emission")]
    emission: Option<f64>,
    #[serde(rename = "Excitation")]
    excitation: Option<f64>,
}

impl Fluorophore {
    /// Read a spectrum table with `Wavelength`, `Emission` and an optional
    /// `Excitation` column; empty cells are skipped
    pub fn from_csv(name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut emission = (Vec::new(), Vec::new());
        let mut excitation = (Vec::new(), Vec::new());

        for row in reader.deserialize() {
            let row: SpectrumRow = row?;
            if let Some(e) = row.emission {
                emission.0.push(row.wavelength);
                emission.1.push(e);
            }
            if let Some(x) = row.excitation {
                excitation.0.push(row.wavelength);
                excitation.1.push(x);
            }
        }

        let excitation = if excitation.0.is_empty() {
            None
        } else {
            Some(Spectrum::new(excitation.0, excitation.1)?)
        };
        Ok(Self {
            name: name.into(),
            emission: Spectrum::new(emission.0, emission.1)?,
            excitation,
        })
    }

    fn excitation_scale(&self, wavelength: Option<f64>) -> Result<f64> {
        let Some(wavelength) = wavelength else {
            return Ok(DEFAULT_EXCITATION_SCALE);
        };
        self.excitation
            .as_ref()
            .and_then(|spectrum| spectrum.at(wavelength))
            .ok_or_else(|| {
                LinearizeError::invalid_input(format!(
                    "{} has no excitation value at {wavelength} nm",
                    self.name
                ))
            })
    }
}

/// One acquisition: a set of emission filters read under one excitation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub filters: Vec<Spectrum>,
    /// Excitation wavelength in nm; `None` weighs every fluorophore equally
    pub excitation: Option<f64>,
}

/// Build the (channels x fluorophores) mixing matrix of one or more sessions
///
/// Every filter of every session is one channel. Entry `(c, n)` is the
/// fluorophore's emission through filter `c`, times its excitation at the
/// session's wavelength. Columns are normalized to sum to 1.
pub fn mixing_matrix_from_spectra(
    sessions: &[Session],
    fluorophores: &[Fluorophore],
) -> Result<MixingMatrix> {
    let channels: usize = sessions.iter().map(|s| s.filters.len()).sum();
    let mut a = Array2::zeros((channels, fluorophores.len()));

    let mut row = 0;
    for session in sessions {
        let scales: Vec<f64> = fluorophores
            .iter()
            .map(|fp| fp.excitation_scale(session.excitation))
            .collect::<Result<_>>()?;
        for filter in &session.filters {
            for (n, (fp, scale)) in fluorophores.iter().zip(&scales).enumerate() {
                a[[row, n]] = filtered_signal(&fp.emission, filter) * scale;
            }
            row += 1;
        }
    }

    let matrix = MixingMatrix::new(a)?.normalized_columns()?;
    info!(
        channels = matrix.n_channels(),
        fluorophores = matrix.n_fluorophores(),
        "Assembled mixing matrix"
    );
    Ok(matrix)
}

/// Forward model plus inversion for a known abundance vector
#[derive(Debug, Clone)]
pub struct MockUnmixing {
    /// Detected signal per channel, `A x`
    pub detected: Array1<f64>,
    pub inferred: Array1<f64>,
    pub residual: f64,
}

/// Mix `known` through `matrix`, then unmix it again
///
/// Useful to check how well a filter configuration separates a set of
/// fluorophores before acquiring anything.
pub fn mock_unmixing(matrix: &MixingMatrix, known: &Array1<f64>) -> Result<MockUnmixing> {
    if known.len() != matrix.n_fluorophores() {
        return Err(LinearizeError::dimension(format!(
            "{} abundances given for {} fluorophores",
            known.len(),
            matrix.n_fluorophores()
        )));
    }
    let detected: Array1<f64> = matrix.as_array().dot(known);
    let Unmixed {
        abundances,
        residuals,
        ..
    } = unmix(matrix, &detected, &UnmixOptions::default())?;

    Ok(MockUnmixing {
        detected,
        inferred: abundances.iter().copied().collect(),
        residual: residuals.sum(),
    })
}
