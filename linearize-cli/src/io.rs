//! Thin image readers and writers: pixel-table CSVs and raw `.i16` stacks.

use anyhow::{Context, Result, anyhow, bail};
use byteorder::{LittleEndian, ReadBytesExt};
use ndarray::{Array2, Array4, ArrayView2, Axis};
use pmt_linearize::ImageStack;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Pixels x channels, with channel names from the header
#[derive(Debug, Clone)]
pub struct PixelTable {
    pub channels: Vec<String>,
    pub values: Array2<f64>,
}

impl PixelTable {
    /// Integer counts as an image stack (Z = Y = 1)
    pub fn to_stack(&self) -> Result<ImageStack> {
        let mut counts = Array2::<u16>::zeros(self.values.dim());
        for (count, &value) in counts.iter_mut().zip(self.values.iter()) {
            if !(0.0..=f64::from(u16::MAX)).contains(&value) || value.fract() != 0.0 {
                bail!("pixel value {value} is not a detector count (0..=65535)");
            }
            *count = value as u16;
        }
        Ok(ImageStack::from_pixel_table(counts)?)
    }

    pub fn from_stack(stack: &ImageStack) -> Result<Self> {
        let (_, _, _, c) = stack.dim();
        let values = stack
            .to_f64()
            .into_shape_with_order((stack.n_pixels(), c))
            .map_err(|e| anyhow!("flattening stack: {e}"))?;
        Ok(Self {
            channels: default_channel_names(c),
            values,
        })
    }
}

pub fn default_channel_names(n: usize) -> Vec<String> {
    (0..n).map(|c| format!("ch{c}")).collect()
}

/// Read a CSV with one header row of channel names and one row per pixel
pub fn read_pixel_table(path: &Path) -> Result<PixelTable> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("opening pixel table {}", path.display()))?;
    let channels: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if channels.is_empty() {
        bail!("{} has no channel columns", path.display());
    }

    let mut flat = Vec::new();
    let mut n_rows = 0;
    for record in reader.deserialize::<Vec<f64>>() {
        let row = record.with_context(|| format!("reading {}", path.display()))?;
        if row.len() != channels.len() {
            bail!(
                "row {} of {} has {} values for {} channels",
                n_rows + 1,
                path.display(),
                row.len(),
                channels.len()
            );
        }
        flat.extend(row);
        n_rows += 1;
    }

    let values = Array2::from_shape_vec((n_rows, channels.len()), flat)?;
    Ok(PixelTable { channels, values })
}

pub fn write_pixel_table(path: &Path, channels: &[String], values: ArrayView2<f64>) -> Result<()> {
    if channels.len() != values.ncols() {
        bail!(
            "{} channel names for {} columns",
            channels.len(),
            values.ncols()
        );
    }
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(channels)?;
    for row in values.axis_iter(Axis(0)) {
        writer.serialize(row.to_vec())?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a raw little-endian 16-bit stack stored as (Z, C, Y, X)
pub fn read_i16_stack(path: &Path, shape: [usize; 4]) -> Result<ImageStack> {
    let expected: usize = shape.iter().product();
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let actual = file.metadata()?.len() as usize;
    if actual != expected * 2 {
        bail!(
            "{} holds {} bytes but shape {:?} needs {}",
            path.display(),
            actual,
            shape,
            expected * 2
        );
    }

    let mut samples = vec![0i16; expected];
    BufReader::new(file).read_i16_into::<LittleEndian>(&mut samples)?;

    let counts = samples
        .into_iter()
        .map(|v| {
            u16::try_from(v).map_err(|_| anyhow!("negative sample {v} in {}", path.display()))
        })
        .collect::<Result<Vec<u16>>>()?;
    let data = Array4::from_shape_vec(shape, counts)?;
    Ok(ImageStack::from_zcyx(data))
}

/// An input image of either supported format
#[derive(Debug, Clone)]
pub enum ImageInput {
    PixelTable(PathBuf),
    RawStack(PathBuf, [usize; 4]),
}

impl ImageInput {
    /// Pick the reader from the extension; `.i16` needs an explicit shape
    pub fn from_path(path: &Path, shape: Option<[usize; 4]>) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match (extension.as_deref(), shape) {
            (Some("csv"), _) => Ok(Self::PixelTable(path.to_path_buf())),
            (Some("i16"), Some(shape)) => Ok(Self::RawStack(path.to_path_buf(), shape)),
            (Some("i16"), None) => bail!(
                "{} is a raw stack; pass --shape Z,C,Y,X",
                path.display()
            ),
            _ => bail!("unsupported image format: {}", path.display()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::PixelTable(path) | Self::RawStack(path, _) => path,
        }
    }

    pub fn read_table(&self) -> Result<PixelTable> {
        match self {
            Self::PixelTable(path) => read_pixel_table(path),
            Self::RawStack(path, shape) => PixelTable::from_stack(&read_i16_stack(path, *shape)?),
        }
    }

    pub fn read_stack(&self) -> Result<(Vec<String>, ImageStack)> {
        match self {
            Self::PixelTable(path) => {
                let table = read_pixel_table(path)?;
                let stack = table.to_stack()?;
                Ok((table.channels, stack))
            }
            Self::RawStack(path, shape) => {
                let stack = read_i16_stack(path, *shape)?;
                Ok((default_channel_names(stack.n_channels()), stack))
            }
        }
    }
}

/// Every supported image under the given files and directories
pub fn collect_input_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let is_image = |path: &Path| {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv") || e.eq_ignore_ascii_case("i16"))
    };

    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            files.push(input.clone());
        } else if input.is_dir() {
            for entry in walkdir::WalkDir::new(input).sort_by_file_name() {
                let entry = entry?;
                if entry.path().is_file() && is_image(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else {
            bail!("Path does not exist: {}", input.display());
        }
    }
    Ok(files)
}
