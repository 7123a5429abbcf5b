use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, ValueEnum};
use log::info;
use ndarray_npy::{write_npy, WritableElement};
use serde_json::json;

use cryo_recon::source::{AmplitudeModel, OffsetModel};
use cryo_recon::utils::num_procs_suggestion;
use cryo_recon::{
    EstimatorConfig, ImageSource, MeanEstimator, Real, Simulation, SimulationParams, SymmetryGroup,
    SyntheticVolume, WeightedVolumesEstimator,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Precision {
    F32,
    F64,
}

/// Simulate projections of a synthetic volume, estimate it back and report
/// the FSC against ground truth.
///
/// The estimated volume(s) are written as a (C, L, L, L) .npy array; the FSC
/// report is printed as JSON (or written to --report).
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Grid side length L
    #[arg(long, default_value_t = 32)]
    resolution: usize,

    /// Number of simulated images
    #[arg(long, default_value_t = 200)]
    n_images: usize,

    /// Number of ground-truth volumes (states); >1 runs the weighted estimator
    #[arg(long, default_value_t = 1)]
    n_vols: usize,

    /// Point group of the synthetic volume: c1, c<n>, d<n>, t, o
    #[arg(long, default_value = "c1", value_parser = parse_symmetry)]
    symmetry: SymmetryGroup,

    #[arg(long, default_value_t = 23)]
    seed: u64,

    /// Variance of additive Gaussian noise
    #[arg(long, default_value_t = 0.0)]
    noise_variance: f64,

    /// Maximum in-plane shift in pixels (0 disables shifts)
    #[arg(long, default_value_t = 0.0)]
    max_shift: f64,

    #[arg(long, value_enum, default_value_t = Precision::F32)]
    precision: Precision,

    /// JSON file with estimator settings
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    pixel_size: f64,

    #[arg(long, default_value_t = 0.5)]
    cutoff: f64,

    /// Output path for the estimated volume(s) (.npy)
    #[arg(long)]
    output: PathBuf,

    /// Output path for the FSC report (.json); printed to stdout when absent
    #[arg(long)]
    report: Option<PathBuf>,

    /// Cap on worker threads
    #[arg(long)]
    threads: Option<usize>,
}

fn parse_symmetry(s: &str) -> Result<SymmetryGroup, String> {
    let lower = s.to_ascii_lowercase();
    let order = |digits: &str| {
        digits
            .parse::<usize>()
            .ok()
            .filter(|&n| n > 0)
            .ok_or_else(|| format!("invalid symmetry order in {s:?}"))
    };
    match lower.as_str() {
        "c1" => Ok(SymmetryGroup::Identity),
        "t" => Ok(SymmetryGroup::Tetrahedral),
        "o" => Ok(SymmetryGroup::Octahedral),
        _ => {
            if let Some(n) = lower.strip_prefix('c') {
                order(n).map(SymmetryGroup::Cyclic)
            } else if let Some(n) = lower.strip_prefix('d') {
                order(n).map(SymmetryGroup::Dihedral)
            } else {
                Err(format!("unknown symmetry {s:?}, expected c1, c<n>, d<n>, t or o"))
            }
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EstimatorConfig> {
    let Some(path) = path else {
        return Ok(EstimatorConfig::default());
    };
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open config {:?}: {}", path, e))?;
    let config = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| anyhow::anyhow!("Invalid estimator config {:?}: {}", path, e))?;
    Ok(config)
}

fn run<T: Real + WritableElement>(args: &Args, config: EstimatorConfig) -> Result<()> {
    let truth = SyntheticVolume::new(args.resolution, args.n_vols, args.symmetry, args.seed)
        .generate::<T>()?;

    let params = SimulationParams {
        n: args.n_images,
        seed: args.seed,
        offsets: if args.max_shift > 0.0 {
            OffsetModel::Uniform {
                max_shift: args.max_shift,
            }
        } else {
            OffsetModel::Zero
        },
        amplitudes: AmplitudeModel::Unit,
        noise_variance: args.noise_variance,
    };
    let sim = Simulation::new(truth.clone(), params)?.cache();
    info!(
        "simulated {} images of {} volume(s), symmetry {:?}",
        sim.n(),
        args.n_vols,
        args.symmetry
    );

    let estimate = if args.n_vols == 1 {
        MeanEstimator::new(&sim, config)?.estimate_with_report()?
    } else {
        WeightedVolumesEstimator::new(&sim, sim.vol_weights(), config)?.estimate_with_report()?
    };

    write_npy(&args.output, estimate.volume.data())
        .map_err(|e| anyhow::anyhow!("Failed to write output NPY {:?}: {}", args.output, e))?;
    info!("volume written to {:?}", args.output);

    let fsc = estimate.volume.fsc(&truth, args.pixel_size, args.cutoff)?;
    let correlations: Vec<Vec<f64>> = fsc.correlations.rows().into_iter().map(|r| r.to_vec()).collect();
    let report = json!({
        "resolution": fsc.resolution,
        "shell_resolutions": fsc.shell_resolutions,
        "correlations": correlations,
        "pixel_size": args.pixel_size,
        "cutoff": args.cutoff,
        "iterations": estimate.report.iterations,
        "relative_residual": estimate.report.relative_residual,
        "converged": estimate.report.converged,
        "warning": estimate.report.warning.map(|w| w.to_string()),
    });
    let text = serde_json::to_string_pretty(&report)?;

    match &args.report {
        Some(path) => std::fs::write(path, text)
            .map_err(|e| anyhow::anyhow!("Failed to write report {:?}: {}", path, e))?,
        None => println!("{text}"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let _logger = flexi_logger::Logger::try_with_env_or_str("info")?.start()?;

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_procs_suggestion(args.threads))
        .build_global()
        .map_err(|e| anyhow::anyhow!("Failed to start thread pool: {}", e))?;

    let config = load_config(args.config.as_deref())?;
    match args.precision {
        Precision::F32 => run::<f32>(&args, config),
        Precision::F64 => run::<f64>(&args, config),
    }
}
