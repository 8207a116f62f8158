// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueHint};
use geneval::{
    compare_caches, evaluate_distance, extract_to_cache, load_backbone,
    pairwise_similarity_summary, DirectorySource, EvaluationConfig, FeatureCache, FrechetConfig,
    Modality, MsSsimConfig, RunConfig, StorageFormat,
};
use serde::Serialize;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Feature-distance and structural-similarity metrics for generated scans"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Embed every sample of a directory into a feature cache
    Extract(ExtractArgs),

    /// Extract real and generated samples and report their Fréchet distance
    Distance(DistanceArgs),

    /// Fréchet distance between two caches that are already complete
    Compare(CompareArgs),

    /// Mean pairwise MS-SSIM within one sample directory
    Msssim(MsSsimArgs),

    /// Execute a JSON run file
    Run(RunArgs),
}

#[derive(Args)]
struct BackboneArgs {
    /// `volumetric` or `2d-slice`
    #[arg(long)]
    modality: Modality,

    /// Pretrained weights checkpoint (.json or .bin)
    #[arg(long, value_hint = ValueHint::FilePath)]
    weights: PathBuf,
}

#[derive(Args)]
struct CacheOptions {
    /// Keep records that already exist instead of recomputing them
    #[arg(long, action = ArgAction::SetTrue)]
    skip_existing: bool,

    /// Record encoding for newly written features
    #[arg(long, default_value_t = StorageFormat::Json)]
    format: StorageFormat,

    /// Seed for the background noise of volumetric normalisation
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args)]
struct FrechetOptions {
    /// Ridge added to ill-conditioned covariances
    #[arg(long, default_value_t = 1e-6)]
    epsilon: f64,

    /// Condition number above which covariances are regularised
    #[arg(long, default_value_t = 1e12)]
    condition_limit: f64,
}

impl FrechetOptions {
    fn config(&self) -> FrechetConfig {
        FrechetConfig {
            epsilon: self.epsilon,
            condition_limit: self.condition_limit,
        }
    }
}

#[derive(Args)]
struct ExtractArgs {
    #[command(flatten)]
    backbone: BackboneArgs,

    #[command(flatten)]
    cache: CacheOptions,

    /// Directory of stored samples
    #[arg(long, value_hint = ValueHint::DirPath)]
    samples: PathBuf,

    /// Destination feature cache
    #[arg(long = "cache", value_hint = ValueHint::DirPath)]
    cache_dir: PathBuf,
}

#[derive(Args)]
struct DistanceArgs {
    #[command(flatten)]
    backbone: BackboneArgs,

    #[command(flatten)]
    cache: CacheOptions,

    #[command(flatten)]
    frechet: FrechetOptions,

    #[arg(long, value_hint = ValueHint::DirPath)]
    real: PathBuf,

    #[arg(long, value_hint = ValueHint::DirPath)]
    fake: PathBuf,

    #[arg(long, value_hint = ValueHint::DirPath)]
    real_cache: PathBuf,

    #[arg(long, value_hint = ValueHint::DirPath)]
    fake_cache: PathBuf,

    /// Also write the report to this file
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    frechet: FrechetOptions,

    #[arg(long, value_hint = ValueHint::DirPath)]
    real_cache: PathBuf,

    #[arg(long, value_hint = ValueHint::DirPath)]
    fake_cache: PathBuf,

    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct MsSsimArgs {
    #[arg(long, value_hint = ValueHint::DirPath)]
    samples: PathBuf,

    /// Maximum number of ordered pairs to score
    #[arg(long, default_value_t = 1000)]
    budget: usize,

    #[arg(long, default_value_t = 9)]
    kernel_size: usize,

    #[arg(long, default_value_t = 1.5)]
    kernel_sigma: f64,

    /// Number of scales, taking the first entries of the standard weights
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=5))]
    scales: u8,
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        geneval_config::flush_chrome_trace();
        std::process::exit(1);
    }
    geneval_config::flush_chrome_trace();
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    geneval_config::init_tracing().context("failed to initialise logging")?;
    match cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Distance(args) => run_distance(args),
        Command::Compare(args) => run_compare(args),
        Command::Msssim(args) => run_msssim(args),
        Command::Run(args) => {
            let config = RunConfig::from_path(&args.config)
                .with_context(|| format!("failed to read run file {}", args.config.display()))?;
            let report = config.execute().context("evaluation failed")?;
            emit(&report, None)
        }
    }
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let modality = args.backbone.modality;
    let backbone = load_backbone(modality, &args.backbone.weights)?;
    let source = DirectorySource::open(&args.samples)
        .with_context(|| format!("failed to open samples {}", args.samples.display()))?;
    let cache = FeatureCache::create(&args.cache_dir, args.cache.format)?;
    let rng = geneval_config::rng_from_optional(args.cache.seed, "preprocess/extract");
    let mut preprocessor = modality.preprocessor(rng);
    let summary = extract_to_cache(
        &source,
        &cache,
        backbone.as_ref(),
        preprocessor.as_mut(),
        args.cache.skip_existing,
    )
    .with_context(|| format!("extraction into {} failed", args.cache_dir.display()))?;
    emit(&summary, None)
}

fn run_distance(args: DistanceArgs) -> Result<()> {
    let modality = args.backbone.modality;
    let backbone = load_backbone(modality, &args.backbone.weights)?;
    let real = DirectorySource::open(&args.real)
        .with_context(|| format!("failed to open real samples {}", args.real.display()))?;
    let fake = DirectorySource::open(&args.fake)
        .with_context(|| format!("failed to open generated samples {}", args.fake.display()))?;
    let config = EvaluationConfig {
        modality,
        skip_existing: args.cache.skip_existing,
        record_format: args.cache.format,
        seed: args.cache.seed,
        frechet: args.frechet.config(),
    };
    let report = evaluate_distance(
        &real,
        &fake,
        &args.real_cache,
        &args.fake_cache,
        backbone.as_ref(),
        &config,
    )?;
    emit(&report, args.output.as_deref())
}

fn run_compare(args: CompareArgs) -> Result<()> {
    let report = compare_caches(&args.real_cache, &args.fake_cache, &args.frechet.config())?;
    emit(&report, args.output.as_deref())
}

fn run_msssim(args: MsSsimArgs) -> Result<()> {
    let source = DirectorySource::open(&args.samples)
        .with_context(|| format!("failed to open samples {}", args.samples.display()))?;
    let mut config = MsSsimConfig {
        kernel_size: args.kernel_size,
        kernel_sigma: args.kernel_sigma,
        ..MsSsimConfig::default()
    };
    config.weights.truncate(usize::from(args.scales));
    let summary = pairwise_similarity_summary(&source, args.budget, &config)?;
    emit(&summary, None)
}

fn emit<T: Serialize>(value: &T, destination: Option<&Path>) -> Result<()> {
    let payload = serde_json::to_string_pretty(value)?;
    if let Some(path) = destination {
        fs::write(path, &payload)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote report");
    }
    println!("{payload}");
    Ok(())
}
