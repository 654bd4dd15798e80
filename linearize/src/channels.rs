//! Channel data: paired readings, per-level reductions and image stacks.

use ndarray::{Array2, Array4, ArrayView3, Axis};
use rustc_hash::FxHashMap;

use crate::config::Reduction;
use crate::error::{LinearizeError, Result};

/// Paired readings from two detector channels, same pixel at the same index
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPair {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl ChannelPair {
    /// Pair two channels. Both must have the same length and hold finite,
    /// non-negative readings.
    pub fn new(xs: Vec<f64>, ys: Vec<f64>) -> Result<Self> {
        if xs.len() != ys.len() {
            return Err(LinearizeError::invalid_input(format!(
                "channel lengths differ: {} vs {}",
                xs.len(),
                ys.len()
            )));
        }
        if let Some(bad) = xs.iter().chain(ys.iter()).find(|v| !v.is_finite() || **v < 0.0) {
            return Err(LinearizeError::invalid_input(format!(
                "channel readings must be finite and non-negative, found {bad}"
            )));
        }
        Ok(Self { xs, ys })
    }

    /// Pair two integer-valued channels
    pub fn from_counts(xs: &[u16], ys: &[u16]) -> Result<Self> {
        Self::new(
            xs.iter().map(|&v| f64::from(v)).collect(),
            ys.iter().map(|&v| f64::from(v)).collect(),
        )
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// The same pair with X and Y exchanged
    pub fn swapped(&self) -> Self {
        Self {
            xs: self.ys.clone(),
            ys: self.xs.clone(),
        }
    }

    /// Group Y readings by X level
    pub fn levels(&self) -> LevelTable {
        LevelTable::from_pairs(&self.xs, &self.ys)
    }
}

/// Reference-channel readings collected at one primary-channel level
#[derive(Debug, Clone, PartialEq)]
pub struct Level {
    /// Primary-channel reading
    pub value: f64,
    /// First reference reading at this level, in acquisition order
    pub first: f64,
    pub sum: f64,
    pub count: usize,
}

impl Level {
    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    pub fn reduce(&self, reduction: Reduction) -> f64 {
        match reduction {
            Reduction::First => self.first,
            Reduction::Mean => self.mean(),
        }
    }
}

/// Unique primary levels in ascending order with their reference readings
#[derive(Debug, Clone, Default)]
pub struct LevelTable {
    levels: Vec<Level>,
}

impl LevelTable {
    fn from_pairs(xs: &[f64], ys: &[f64]) -> Self {
        let mut index: FxHashMap<u64, usize> = FxHashMap::default();
        let mut levels: Vec<Level> = Vec::new();

        for (&x, &y) in xs.iter().zip(ys) {
            // -0.0 and 0.0 are the same level
            let x = if x == 0.0 { 0.0 } else { x };
            match index.get(&x.to_bits()) {
                Some(&i) => {
                    levels[i].sum += y;
                    levels[i].count += 1;
                }
                None => {
                    index.insert(x.to_bits(), levels.len());
                    levels.push(Level {
                        value: x,
                        first: y,
                        sum: y,
                        count: 1,
                    });
                }
            }
        }

        levels.sort_by(|a, b| a.value.total_cmp(&b.value));
        Self { levels }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Level with exactly this primary reading
    pub fn get(&self, value: f64) -> Option<&Level> {
        self.levels
            .binary_search_by(|level| level.value.total_cmp(&value))
            .ok()
            .map(|i| &self.levels[i])
    }

    /// Mean reference reading at `value`, NaN when the level never occurs
    pub fn mean_at(&self, value: f64) -> f64 {
        self.get(value).map_or(f64::NAN, Level::mean)
    }
}

/// A multi-channel image stack, axes (Z, Y, X, channel)
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStack {
    data: Array4<u16>,
}

impl ImageStack {
    pub fn new(data: Array4<u16>) -> Self {
        Self { data }
    }

    /// Build a stack from an array stored as (Z, C, Y, X)
    pub fn from_zcyx(data: Array4<u16>) -> Self {
        let data = data.permuted_axes([0, 2, 3, 1]).as_standard_layout().into_owned();
        Self { data }
    }

    /// Build a stack from a pixel table (pixels x channels); Z and Y are 1
    pub fn from_pixel_table(table: Array2<u16>) -> Result<Self> {
        let (pixels, channels) = table.dim();
        let data = table
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((1, 1, pixels, channels))
            .map_err(|e| LinearizeError::dimension(format!("pixel table reshape failed: {e}")))?;
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array4<u16> {
        &self.data
    }

    /// (Z, Y, X, channel)
    pub fn dim(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn n_channels(&self) -> usize {
        self.data.len_of(Axis(3))
    }

    pub fn n_pixels(&self) -> usize {
        let (z, y, x, _) = self.dim();
        z * y * x
    }

    /// One channel as a (Z, Y, X) view
    pub fn channel(&self, channel: usize) -> Result<ArrayView3<'_, u16>> {
        if channel >= self.n_channels() {
            return Err(LinearizeError::dimension(format!(
                "channel {channel} requested from a stack with {} channels",
                self.n_channels()
            )));
        }
        Ok(self.data.index_axis(Axis(3), channel))
    }

    /// Flattened readings of one channel in (Z, Y, X) order
    pub fn channel_values(&self, channel: usize) -> Result<Vec<f64>> {
        Ok(self.channel(channel)?.iter().map(|&v| f64::from(v)).collect())
    }

    /// Pair two channels pixel by pixel
    pub fn channel_pair(&self, i: usize, j: usize) -> Result<ChannelPair> {
        ChannelPair::new(self.channel_values(i)?, self.channel_values(j)?)
    }

    pub fn to_f64(&self) -> Array4<f64> {
        self.data.mapv(f64::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn test_pair_rejects_length_mismatch() {
        let result = ChannelPair::new(vec![1.0, 2.0], vec![1.0]);
        assert!(matches!(result, Err(LinearizeError::InvalidInput(_))));
    }

    #[test]
    fn test_pair_rejects_negative_readings() {
        assert!(ChannelPair::new(vec![1.0, -2.0], vec![1.0, 2.0]).is_err());
        assert!(ChannelPair::new(vec![1.0, f64::NAN], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_levels_sorted_with_first_and_mean() {
        let pair = ChannelPair::new(
            vec![5.0, 2.0, 5.0, 2.0, 9.0],
            vec![10.0, 3.0, 20.0, 5.0, 7.0],
        )
        .unwrap();
        let levels = pair.levels();
        let values: Vec<f64> = levels.iter().map(|l| l.value).collect();
        assert_eq!(values, vec![2.0, 5.0, 9.0]);

        let five = levels.get(5.0).unwrap();
        assert_eq!(five.first, 10.0);
        assert_eq!(five.count, 2);
        assert_eq!(five.reduce(Reduction::Mean), 15.0);
        assert_eq!(five.reduce(Reduction::First), 10.0);
        assert!(levels.mean_at(3.0).is_nan());
    }

    #[test]
    fn test_zcyx_permutation() {
        // Z=1, C=2, Y=2, X=3
        let zcyx = Array::from_shape_fn((1, 2, 2, 3), |(_, c, y, x)| (c * 100 + y * 10 + x) as u16);
        let stack = ImageStack::from_zcyx(zcyx);
        assert_eq!(stack.dim(), (1, 2, 3, 2));
        assert_eq!(stack.data()[[0, 1, 2, 1]], 112);
        assert_eq!(stack.n_channels(), 2);
    }

    #[test]
    fn test_pixel_table_and_channel_pair() {
        let table = Array2::from_shape_vec((3, 2), vec![1u16, 10, 2, 20, 3, 30]).unwrap();
        let stack = ImageStack::from_pixel_table(table).unwrap();
        assert_eq!(stack.n_pixels(), 3);
        let pair = stack.channel_pair(1, 0).unwrap();
        assert_eq!(pair.xs(), &[10.0, 20.0, 30.0]);
        assert_eq!(pair.ys(), &[1.0, 2.0, 3.0]);
        assert!(stack.channel(2).is_err());
    }
}
