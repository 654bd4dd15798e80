//! Directory-backed storage of correction curves.
//!
//! Layout of a store directory:
//!
//! ```text
//! detected_photons_<key>.csv   one value per row
//! true_photons_<key>.csv       one value per row
//! valid_curves.json            { "<key>": true | false, ... }
//! ```
//!
//! `<key>` is `<fluorophore>_ch<i>_ch<j>_<run>`. A curve is written once and
//! never updated in place; new curves start out untrusted until they are
//! marked valid.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::curve::CorrectionCurve;
use crate::error::{LinearizeError, Result};

const VALIDITY_FILE: &str = "valid_curves.json";
const DETECTED_PREFIX: &str = "detected_photons_";
const TRUE_PREFIX: &str = "true_photons_";
const KEY_PATTERN: &str = r"^(?P<fluorophore>.+?)_ch(?P<i>\d+)_ch(?P<j>\d+)_(?P<run>.+)$";

/// Compiled once; `keys()` parses every file name in the store
static KEY_REGEX: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(KEY_PATTERN));

/// Identifies one stored curve
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CurveKey {
    pub fluorophore: String,
    pub channel_i: usize,
    pub channel_j: usize,
    pub run: String,
}

impl CurveKey {
    pub fn new(
        fluorophore: impl Into<String>,
        channel_i: usize,
        channel_j: usize,
        run: impl Into<String>,
    ) -> Self {
        Self {
            fluorophore: fluorophore.into(),
            channel_i,
            channel_j,
            run: run.into(),
        }
    }

    pub fn name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CurveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_ch{}_ch{}_{}",
            self.fluorophore, self.channel_i, self.channel_j, self.run
        )
    }
}

impl FromStr for CurveKey {
    type Err = LinearizeError;

    fn from_str(name: &str) -> Result<Self> {
        let pattern = KEY_REGEX
            .as_ref()
            .map_err(|e| LinearizeError::invalid_input(format!("curve key pattern: {e}")))?;
        let captures = pattern.captures(name).ok_or_else(|| {
            LinearizeError::invalid_input(format!(
                "'{name}' is not a curve name of the form <fluorophore>_ch<i>_ch<j>_<run>"
            ))
        })?;
        let channel = |group: &str| {
            captures[group].parse::<usize>().map_err(|e| {
                LinearizeError::invalid_input(format!("bad channel in '{name}': {e}"))
            })
        };
        Ok(Self {
            fluorophore: captures["fluorophore"].to_string(),
            channel_i: channel("i")?,
            channel_j: channel("j")?,
            run: captures["run"].to_string(),
        })
    }
}

/// Curves persisted in one directory, plus their validity flags
#[derive(Debug, Clone)]
pub struct CurveStore {
    root: PathBuf,
}

impl CurveStore {
    /// Open a store, creating the directory if needed
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn detected_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{DETECTED_PREFIX}{name}.csv"))
    }

    fn true_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{TRUE_PREFIX}{name}.csv"))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.detected_path(name).is_file() && self.true_path(name).is_file()
    }

    /// Persist a new curve and register it as not yet valid
    ///
    /// # Errors
    /// `CurveExists` when a curve with this key is already stored.
    pub fn save(&self, key: &CurveKey, curve: &CorrectionCurve) -> Result<()> {
        let name = key.name();
        if self.contains(&name) {
            return Err(LinearizeError::CurveExists(name));
        }

        write_column(&self.detected_path(&name), curve.detected_photons())?;
        write_column(&self.true_path(&name), curve.true_photons())?;

        let mut validity = self.validity()?;
        validity.insert(name.clone(), false);
        self.write_validity(&validity)?;

        info!(curve = %name, points = curve.len(), "Saved correction curve");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<CorrectionCurve> {
        if !self.contains(name) {
            return Err(LinearizeError::CurveNotFound(name.to_string()));
        }
        let detected = read_column(&self.detected_path(name))?;
        let truth = read_column(&self.true_path(name))?;
        debug!(curve = name, points = detected.len(), "Loaded correction curve");
        CorrectionCurve::new(detected, truth)
    }

    /// Every stored curve, sorted
    pub fn keys(&self) -> Result<Vec<CurveKey>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let file_name = entry?.file_name();
            let Some(name) = file_name
                .to_str()
                .and_then(|f| f.strip_prefix(DETECTED_PREFIX))
                .and_then(|f| f.strip_suffix(".csv"))
            else {
                continue;
            };
            if !self.true_path(name).is_file() {
                continue;
            }
            match name.parse::<CurveKey>() {
                Ok(key) => keys.push(key),
                Err(e) => debug!("Ignoring {}: {}", name, e),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Curve name to validity flag; empty when nothing was saved yet
    pub fn validity(&self) -> Result<BTreeMap<String, bool>> {
        let path = self.root.join(VALIDITY_FILE);
        if !path.is_file() {
            return Ok(BTreeMap::new());
        }
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    fn write_validity(&self, validity: &BTreeMap<String, bool>) -> Result<()> {
        let writer = BufWriter::new(File::create(self.root.join(VALIDITY_FILE))?);
        serde_json::to_writer_pretty(writer, validity)?;
        Ok(())
    }

    /// Mark a stored curve as trusted or not
    pub fn set_validity(&self, name: &str, valid: bool) -> Result<()> {
        if !self.contains(name) {
            return Err(LinearizeError::CurveNotFound(name.to_string()));
        }
        let mut validity = self.validity()?;
        validity.insert(name.to_string(), valid);
        self.write_validity(&validity)?;
        info!(curve = name, valid, "Updated curve validity");
        Ok(())
    }

    /// All curves flagged valid, by name
    pub fn load_valid(&self) -> Result<BTreeMap<String, CorrectionCurve>> {
        self.validity()?
            .into_iter()
            .filter(|(_, valid)| *valid)
            .map(|(name, _)| {
                let curve = self.load(&name)?;
                Ok((name, curve))
            })
            .collect()
    }
}

fn write_column(path: &Path, values: &[f64]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for value in values {
        writer.serialize(value)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_column(path: &Path) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    reader
        .deserialize::<f64>()
        .map(|value| value.map_err(LinearizeError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn curve() -> CorrectionCurve {
        CorrectionCurve::new(vec![0.0, 10.0, 20.5], vec![0.0, 10.0, 31.25]).unwrap()
    }

    #[test]
    fn test_key_round_trips_through_name() {
        let key = CurveKey::new("td_tomato", 0, 2, "2022_08_08");
        assert_eq!(key.name(), "td_tomato_ch0_ch2_2022_08_08");
        assert_eq!(key.name().parse::<CurveKey>().unwrap(), key);
        assert!("no-channels-here".parse::<CurveKey>().is_err());
    }

    #[test]
    fn test_key_pattern_parses_many_names() {
        assert!(KEY_REGEX.is_ok());
        for run in 0..50 {
            let key: CurveKey = format!("cfp_ch1_ch3_run{run}").parse().unwrap();
            assert_eq!(key.channel_j, 3);
            assert_eq!(key.run, format!("run{run}"));
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = CurveStore::open(dir.path().join("curves")).unwrap();
        let key = CurveKey::new("yfp", 0, 1, "run1");

        store.save(&key, &curve()).unwrap();
        assert!(store.contains("yfp_ch0_ch1_run1"));
        assert_eq!(store.load("yfp_ch0_ch1_run1").unwrap(), curve());
        assert_eq!(store.keys().unwrap(), vec![key]);
    }

    #[test]
    fn test_save_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let store = CurveStore::open(dir.path()).unwrap();
        let key = CurveKey::new("yfp", 0, 1, "run1");
        store.save(&key, &curve()).unwrap();
        assert!(matches!(
            store.save(&key, &curve()),
            Err(LinearizeError::CurveExists(_))
        ));
    }

    #[test]
    fn test_new_curves_start_invalid() {
        let dir = TempDir::new().unwrap();
        let store = CurveStore::open(dir.path()).unwrap();
        store.save(&CurveKey::new("cfp", 0, 1, "a"), &curve()).unwrap();
        store.save(&CurveKey::new("yfp", 1, 2, "a"), &curve()).unwrap();

        assert_eq!(store.validity().unwrap().get("cfp_ch0_ch1_a"), Some(&false));
        assert!(store.load_valid().unwrap().is_empty());

        store.set_validity("yfp_ch1_ch2_a", true).unwrap();
        let valid = store.load_valid().unwrap();
        assert_eq!(valid.keys().collect::<Vec<_>>(), vec!["yfp_ch1_ch2_a"]);
    }

    #[test]
    fn test_missing_curve() {
        let dir = TempDir::new().unwrap();
        let store = CurveStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.load("cfp_ch0_ch1_a"),
            Err(LinearizeError::CurveNotFound(_))
        ));
        assert!(store.set_validity("cfp_ch0_ch1_a", true).is_err());
    }
}
