mod io;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use dialoguer::Confirm;
use io::{ImageInput, collect_input_files, write_pixel_table};
use ndarray::{Array1, Axis};
use pmt_linearize::{
    CurveKey, CurveStore, LinearizeConfig, MixingMatrix, PmtResponse, Reduction, UnmixOptions,
    UnmixingRatio, average_curves, build_curve, estimate_linearized_ratio, estimate_ratio, unmix,
};
use rayon::prelude::*;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// PMT linearization and spectral unmixing for multi-channel microscopy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "pmt-linearize")]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate a correction curve for every channel pair of the input images
    Calibrate(CalibrateArgs),
    /// Average the curves marked valid into a master curve
    Average(AverageArgs),
    /// List stored curves and mark them valid or invalid
    Curves(CurvesArgs),
    /// Linearize every channel of an image through a stored curve
    Correct(CorrectArgs),
    /// Estimate channel-pair unmixing coefficients on a linearized image
    Coefficients(CoefficientsArgs),
    /// Unmix channels into fluorophore abundances
    Unmix(UnmixArgs),
    /// Write a synthetic two-channel pixel table from a saturating detector model
    Simulate(SimulateArgs),
}

/// Thresholds shared by the commands that estimate ratios or build curves
#[derive(clap::Args, Debug, Clone)]
struct ConfigArgs {
    /// JSON configuration file; missing fields take their defaults
    #[arg(long, value_name = "CONFIG_JSON")]
    config: Option<PathBuf>,

    /// Lower bound of the trusted linear band
    #[arg(long)]
    min_lin_val: Option<f64>,

    /// Upper bound of the trusted linear band
    #[arg(long)]
    max_lin_val: Option<f64>,

    /// Minimum number of points for a ratio estimate
    #[arg(long)]
    min_points: Option<usize>,

    /// Reduction of repeated reference readings at one level
    #[arg(long, value_enum)]
    reduction: Option<ReductionArg>,
}

impl ConfigArgs {
    fn resolve(&self) -> Result<LinearizeConfig> {
        let mut config = match &self.config {
            Some(path) => LinearizeConfig::from_json_file(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => LinearizeConfig::default(),
        };
        if let Some(v) = self.min_lin_val {
            config.min_lin_val = v;
        }
        if let Some(v) = self.max_lin_val {
            config.max_lin_val = v;
        }
        if let Some(v) = self.min_points {
            config.min_points = v;
        }
        if let Some(reduction) = self.reduction.clone() {
            config.reduction = reduction.into();
        }
        config.validate()?;
        debug!("Configuration: {:?}", config);
        Ok(config)
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum ReductionArg {
    /// First reading at each level
    First,
    /// Mean of all readings at each level
    Mean,
}

impl From<ReductionArg> for Reduction {
    fn from(arg: ReductionArg) -> Self {
        match arg {
            ReductionArg::First => Reduction::First,
            ReductionArg::Mean => Reduction::Mean,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PairSelection {
    /// Every ordered pair (i, j) with i != j
    All,
    /// Only pairs with i < j
    Upper,
}

/// Parse "Z,C,Y,X"
fn parse_shape(text: &str) -> std::result::Result<[usize; 4], String> {
    let dims: Vec<usize> = text
        .split(',')
        .map(|d| d.trim().parse::<usize>().map_err(|e| e.to_string()))
        .collect::<std::result::Result<_, _>>()?;
    <[usize; 4]>::try_from(dims).map_err(|d| format!("expected 4 dimensions, got {}", d.len()))
}

#[derive(clap::Args, Debug)]
struct CalibrateArgs {
    /// Image files (.csv pixel tables or .i16 stacks) or directories of them
    #[arg(value_name = "INPUT", required = true)]
    input: Vec<PathBuf>,

    /// Fluorophore imaged in the calibration sample
    #[arg(short, long)]
    fluorophore: String,

    /// Curve store directory
    #[arg(short, long, value_name = "STORE_DIR")]
    store: PathBuf,

    /// Run tag for the curve names (defaults to the input file stem)
    #[arg(long)]
    run: Option<String>,

    /// Which channel pairs to calibrate
    #[arg(long, value_enum, default_value = "upper")]
    pairs: PairSelection,

    /// Shape of raw .i16 stacks as Z,C,Y,X
    #[arg(long, value_parser = parse_shape)]
    shape: Option<[usize; 4]>,

    /// Save a JSON report of every pair
    #[arg(long, value_name = "REPORT_PATH")]
    report: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args, Debug)]
struct AverageArgs {
    /// Curve store directory
    #[arg(short, long, value_name = "STORE_DIR")]
    store: PathBuf,

    /// Size of the true-photon grid (defaults to the configured grid_len)
    #[arg(long)]
    grid: Option<usize>,

    /// Run tag of the master curve
    #[arg(long, default_value = "master")]
    run: String,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args, Debug)]
struct CurvesArgs {
    /// Curve store directory
    #[arg(short, long, value_name = "STORE_DIR")]
    store: PathBuf,

    /// Mark curves as valid
    #[arg(long, value_name = "NAME")]
    set_valid: Vec<String>,

    /// Mark curves as invalid
    #[arg(long, value_name = "NAME")]
    set_invalid: Vec<String>,

    /// Ask about every curve interactively
    #[arg(long)]
    review: bool,
}

#[derive(clap::Args, Debug)]
struct CorrectArgs {
    /// Image to linearize (.csv pixel table or .i16 stack)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Curve store directory
    #[arg(short, long, value_name = "STORE_DIR")]
    store: PathBuf,

    /// Name of the curve to apply
    #[arg(short, long)]
    curve: String,

    /// Output pixel table
    #[arg(short, long, value_name = "OUTPUT_CSV")]
    output: PathBuf,

    /// Map values beyond the curve to +inf instead of failing them
    #[arg(long)]
    allow_override: bool,

    /// Shape of a raw .i16 stack as Z,C,Y,X
    #[arg(long, value_parser = parse_shape)]
    shape: Option<[usize; 4]>,
}

#[derive(clap::Args, Debug)]
struct CoefficientsArgs {
    /// Linearized pixel table (output of `correct`)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Which channel pairs to estimate
    #[arg(long, value_enum, default_value = "upper")]
    pairs: PairSelection,

    /// Save the coefficients as JSON
    #[arg(short, long, value_name = "OUTPUT_JSON")]
    output: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args, Debug)]
struct UnmixArgs {
    /// Linearized image (.csv pixel table or .i16 stack)
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Mixing matrix as a JSON list of rows (one row per channel)
    #[arg(short, long, value_name = "MATRIX_JSON")]
    matrix: PathBuf,

    /// Output pixel table of abundances
    #[arg(short, long, value_name = "OUTPUT_CSV")]
    output: PathBuf,

    /// Constrain abundances to be non-negative
    #[arg(long)]
    nonnegative: bool,

    /// Fluorophore names for the output columns (comma-separated)
    #[arg(long, value_delimiter = ',')]
    names: Option<Vec<String>>,

    /// Write per-pixel squared residuals to this CSV
    #[arg(long, value_name = "RESIDUALS_CSV")]
    residuals: Option<PathBuf>,

    /// Shape of a raw .i16 stack as Z,C,Y,X
    #[arg(long, value_parser = parse_shape)]
    shape: Option<[usize; 4]>,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Output pixel table
    #[arg(short, long, value_name = "OUTPUT_CSV")]
    output: PathBuf,

    /// True signal of the bright channel per unit of the dim one
    #[arg(long, default_value = "2.0")]
    ratio: f64,

    /// Largest true photon count
    #[arg(long, default_value = "200.0")]
    max: f64,

    /// Spacing of the true photon grid
    #[arg(long, default_value = "0.25")]
    step: f64,

    /// Detector response is linear up to here
    #[arg(long, default_value = "20.0")]
    knee: f64,

    /// Detector saturation level
    #[arg(long, default_value = "150.0")]
    ceiling: f64,
}

/// Outcome of calibrating one channel pair
#[derive(Debug, serde::Serialize)]
struct PairResult {
    file: String,
    channel_i: usize,
    channel_j: usize,
    curve: Option<String>,
    xs_per_y: Option<f64>,
    stage: Option<String>,
    ratio_points: Option<usize>,
    curve_points: Option<usize>,
    swapped: Option<bool>,
    skipped_levels: usize,
    non_monotone_levels: usize,
    error: Option<String>,
}

fn channel_pairs(n_channels: usize, selection: PairSelection) -> Vec<(usize, usize)> {
    (0..n_channels)
        .flat_map(|i| (0..n_channels).map(move |j| (i, j)))
        .filter(|&(i, j)| match selection {
            PairSelection::All => i != j,
            PairSelection::Upper => i < j,
        })
        .collect()
}

fn calibrate(args: CalibrateArgs) -> Result<()> {
    let config = args.config.resolve()?;
    let store = CurveStore::open(&args.store)?;
    let files = collect_input_files(&args.input)?;
    if files.is_empty() {
        bail!("No images found");
    }
    println!("Found {} image(s) to calibrate\n", files.len());

    let mut results: Vec<PairResult> = Vec::new();
    for path in &files {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let run = match &args.run {
            Some(run) => run.clone(),
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("run")
                .to_string(),
        };

        let stack = match ImageInput::from_path(path, args.shape).and_then(|i| i.read_stack()) {
            Ok((_, stack)) => stack,
            Err(e) => {
                warn!("Skipping {}: {:#}", filename, e);
                results.push(PairResult::failed(&filename, 0, 0, &e));
                continue;
            }
        };
        let pairs = channel_pairs(stack.n_channels(), args.pairs);
        info!("{}: calibrating {} channel pairs", filename, pairs.len());

        // Pairs are independent; curves are saved afterwards, one at a time
        let built: Vec<_> = pairs
            .par_iter()
            .map(|&(i, j)| {
                let outcome = stack
                    .channel_pair(i, j)
                    .and_then(|pair| {
                        let estimate = estimate_ratio(&pair, &config)?;
                        let build = build_curve(&pair, estimate.xs_per_y, &config)?;
                        Ok((estimate, build))
                    });
                (i, j, outcome)
            })
            .collect();

        for (i, j, outcome) in built {
            let (estimate, build) = match outcome {
                Ok(ok) => ok,
                Err(e) if e.is_per_item() => {
                    let e = anyhow!(e);
                    warn!("{} ch{} vs ch{}: {:#}", filename, i, j, e);
                    results.push(PairResult::failed(&filename, i, j, &e));
                    continue;
                }
                Err(e) => {
                    return Err(anyhow!(e))
                        .with_context(|| format!("{filename} ch{i} vs ch{j}"));
                }
            };
            let key = CurveKey::new(&args.fluorophore, i, j, &run);
            let name = key.name();
            if let Err(e) = store.save(&key, &build.curve) {
                let e = anyhow!(e);
                warn!("{}: {:#}", name, e);
                results.push(PairResult::failed(&filename, i, j, &e));
                continue;
            }
            results.push(PairResult {
                file: filename.clone(),
                channel_i: i,
                channel_j: j,
                curve: Some(name),
                xs_per_y: Some(estimate.xs_per_y.value()),
                stage: Some(estimate.stage.to_string()),
                ratio_points: Some(estimate.n_points()),
                curve_points: Some(build.curve.len()),
                swapped: Some(build.swapped),
                skipped_levels: build.skipped.len(),
                non_monotone_levels: build.non_monotone_levels.len(),
                error: None,
            });
        }
    }

    let failed = results.iter().filter(|r| r.error.is_some()).count();
    println!("Calibration complete");
    println!("   Curves saved: {}", results.len() - failed);
    if failed > 0 {
        println!("   Failed pairs: {}", failed);
    }
    for result in results.iter().filter(|r| r.error.is_none()) {
        println!(
            "   {}: ratio {:.4} ({}), {} points",
            result.curve.as_deref().unwrap_or("?"),
            result.xs_per_y.unwrap_or(f64::NAN),
            result.stage.as_deref().unwrap_or("?"),
            result.curve_points.unwrap_or(0)
        );
    }

    if let Some(report_path) = &args.report {
        let report = serde_json::json!({
            "fluorophore": args.fluorophore,
            "store": args.store,
            "config": config,
            "successful": results.len() - failed,
            "failed": failed,
            "pairs": results,
        });
        std::fs::write(report_path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to {}", report_path.display());
    }

    println!("\nNew curves are untrusted; review them with `pmt-linearize curves --review`");
    Ok(())
}

impl PairResult {
    fn failed(file: &str, channel_i: usize, channel_j: usize, error: &anyhow::Error) -> Self {
        Self {
            file: file.to_string(),
            channel_i,
            channel_j,
            curve: None,
            xs_per_y: None,
            stage: None,
            ratio_points: None,
            curve_points: None,
            swapped: None,
            skipped_levels: 0,
            non_monotone_levels: 0,
            error: Some(format!("{error:#}")),
        }
    }
}

fn average(args: AverageArgs) -> Result<()> {
    let config = args.config.resolve()?;
    let store = CurveStore::open(&args.store)?;
    let valid = store.load_valid()?;
    if valid.is_empty() {
        bail!(
            "No curves are marked valid in {}; use `curves --set-valid`",
            args.store.display()
        );
    }

    let grid_len = args.grid.unwrap_or(config.grid_len);
    let master = average_curves(&valid, grid_len)?;
    let key = CurveKey::new("mean", 0, 0, &args.run);
    store.save(&key, &master)?;

    println!(
        "Averaged {} curves into {} ({} points, up to {:.1} detected photons)",
        valid.len(),
        key,
        master.len(),
        master.max_detected()
    );
    Ok(())
}

fn curves(args: CurvesArgs) -> Result<()> {
    let store = CurveStore::open(&args.store)?;
    for name in &args.set_valid {
        store.set_validity(name, true)?;
    }
    for name in &args.set_invalid {
        store.set_validity(name, false)?;
    }

    let validity = store.validity()?;
    for key in store.keys()? {
        let name = key.name();
        let curve = store.load(&name)?;
        let valid = validity.get(&name).copied().unwrap_or(false);
        println!(
            "{:<40} {:>5} points  max detected {:>8.1}  max true {:>8.1}  {}",
            name,
            curve.len(),
            curve.max_detected(),
            curve.max_true(),
            if valid { "valid" } else { "-" }
        );

        if args.review {
            let answer = Confirm::new()
                .with_prompt(format!("Trust {name}?"))
                .default(valid)
                .interact()
                .with_context(|| format!("reviewing {name}"))?;
            if answer != valid {
                store.set_validity(&name, answer)?;
            }
        }
    }
    Ok(())
}

fn correct(args: CorrectArgs) -> Result<()> {
    let store = CurveStore::open(&args.store)?;
    let curve = store.load(&args.curve)?;
    let input = ImageInput::from_path(&args.input, args.shape)?;
    let (channels, stack) = input.read_stack()?;
    let (z, y, x, c) = stack.dim();
    info!(
        "Correcting {} ({}x{}x{} pixels, {} channels) through {}",
        input.path().display(),
        z,
        y,
        x,
        c,
        args.curve
    );

    let values: Vec<f64> = stack.to_f64().iter().copied().collect();
    let corrected: Vec<f64> = if args.allow_override {
        curve.correct_slice(&values, true)?
    } else {
        let batch = curve.correct_partitioned(&values);
        println!(
            "{} of {} values corrected, {} failed ({:.2}%)",
            batch.succeeded.len(),
            values.len(),
            batch.failed.len(),
            batch.percentage_failed()
        );
        if let Some((index, failure)) = batch.failed.first() {
            println!("   first failure at value {}: {}", index, failure);
        }
        batch.values
    };

    let table = ndarray::Array2::from_shape_vec((stack.n_pixels(), c), corrected)?;
    write_pixel_table(&args.output, &channels, table.view())?;
    println!("Wrote {}", args.output.display());
    Ok(())
}

/// Unmixing coefficient of one channel pair
#[derive(Debug, serde::Serialize)]
struct Coefficient {
    channel_i: String,
    channel_j: String,
    xs_per_y: Option<f64>,
    stage: Option<String>,
    points: Option<usize>,
    error: Option<String>,
}

fn coefficients(args: CoefficientsArgs) -> Result<Vec<Coefficient>> {
    let config = args.config.resolve()?;
    let table = ImageInput::from_path(&args.input, None)?.read_table()?;
    let pairs = channel_pairs(table.channels.len(), args.pairs);
    info!(
        "Estimating {} coefficients between {:.0} and {:.0} linearized photons",
        pairs.len(),
        config.coefficient_range.0,
        config.coefficient_range.1
    );

    let mut results = Vec::with_capacity(pairs.len());
    for (i, j) in pairs {
        let xs = table.values.column(i).to_vec();
        let ys = table.values.column(j).to_vec();
        let (channel_i, channel_j) = (table.channels[i].clone(), table.channels[j].clone());
        match estimate_linearized_ratio(&xs, &ys, &config) {
            Ok(estimate) => {
                println!(
                    "   {} per {}: {:.4} ({}, {} points)",
                    channel_i,
                    channel_j,
                    estimate.xs_per_y.value(),
                    estimate.stage,
                    estimate.n_points()
                );
                results.push(Coefficient {
                    channel_i,
                    channel_j,
                    xs_per_y: Some(estimate.xs_per_y.value()),
                    stage: Some(estimate.stage.to_string()),
                    points: Some(estimate.n_points()),
                    error: None,
                });
            }
            Err(e) if e.is_per_item() => {
                warn!("{} vs {}: {}", channel_i, channel_j, e);
                results.push(Coefficient {
                    channel_i,
                    channel_j,
                    xs_per_y: None,
                    stage: None,
                    points: None,
                    error: Some(e.to_string()),
                });
            }
            Err(e) => return Err(anyhow!(e)).with_context(|| format!("{channel_i} vs {channel_j}")),
        }
    }

    if let Some(path) = &args.output {
        let report = serde_json::json!({
            "input": args.input,
            "coefficient_range": config.coefficient_range,
            "coefficients": results,
        });
        std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
        println!("Wrote {}", path.display());
    }
    Ok(results)
}

fn unmix_command(args: UnmixArgs) -> Result<()> {
    let config = args.config.resolve()?;
    let text = std::fs::read_to_string(&args.matrix)
        .with_context(|| format!("reading {}", args.matrix.display()))?;
    let matrix: MixingMatrix = serde_json::from_str(&text)
        .with_context(|| format!("parsing mixing matrix {}", args.matrix.display()))?;

    let table = ImageInput::from_path(&args.input, args.shape)?.read_table()?;
    let options = UnmixOptions::from_config(&config, args.nonnegative);
    let start = Instant::now();
    let unmixed = unmix(&matrix, &table.values, &options)?;
    info!(
        "Unmixed {} pixels in {:.2}s",
        table.values.nrows(),
        start.elapsed().as_secs_f64()
    );

    let names = match args.names {
        Some(names) if names.len() == matrix.n_fluorophores() => names,
        Some(names) => bail!(
            "{} names given for {} fluorophores",
            names.len(),
            matrix.n_fluorophores()
        ),
        None => (0..matrix.n_fluorophores()).map(|n| format!("fluorophore{n}")).collect(),
    };
    let abundances = unmixed
        .abundances
        .into_dimensionality::<ndarray::Ix2>()?;
    write_pixel_table(&args.output, &names, abundances.view())?;

    if let Some(path) = &args.residuals {
        let residuals: Array1<f64> = unmixed.residuals.into_dimensionality()?;
        write_pixel_table(
            path,
            &["residual".to_string()],
            residuals.insert_axis(Axis(1)).view(),
        )?;
    }
    println!("Wrote {}", args.output.display());
    Ok(())
}

fn simulate(args: SimulateArgs) -> Result<()> {
    if !(args.step > 0.0 && args.max > 0.0) {
        bail!("--max and --step must be positive");
    }
    let pmt = PmtResponse::new(args.knee, args.ceiling)?;
    let ratio = UnmixingRatio::new(args.ratio)?;
    let n = (args.max / args.step).ceil() as usize;
    let truth: Vec<f64> = (0..n).map(|k| k as f64 * args.step).collect();
    let pair = pmt.simulate_pair(&truth, ratio)?;

    let mut table = ndarray::Array2::<f64>::zeros((pair.len(), 2));
    table.column_mut(0).assign(&Array1::from(pair.xs().to_vec()));
    table.column_mut(1).assign(&Array1::from(pair.ys().to_vec()));
    write_pixel_table(
        &args.output,
        &["bright".to_string(), "dim".to_string()],
        table.view(),
    )?;
    println!("Wrote {} simulated pixels to {}", pair.len(), args.output.display());
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing subscriber with environment filter
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let start_time = Instant::now();
    match args.command {
        Command::Calibrate(args) => calibrate(args)?,
        Command::Average(args) => average(args)?,
        Command::Curves(args) => curves(args)?,
        Command::Correct(args) => correct(args)?,
        Command::Coefficients(args) => {
            coefficients(args)?;
        }
        Command::Unmix(args) => unmix_command(args)?,
        Command::Simulate(args) => simulate(args)?,
    }
    debug!("Finished in {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
