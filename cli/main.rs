#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use iecv::IecvConfig;
use iecv::impute::{MarginalImputer, complete_checked};
use iecv::orchestrator::{FoldProgressObserver, run_iecv};
use iecv::partition::fold_seed;
use iecv::projector::{event_probability, project};
use iecv::report::{summarize, write_report, write_table};
use iecv::trainer::FittedModel;
use serde::Serialize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::OnceLock;

#[derive(Args)]
pub struct RunArgs {
    /// Subject-level cohort table (tab-separated, or comma-separated for .csv)
    #[arg(long, value_name = "PATH")]
    pub data: PathBuf,

    /// Run configuration (.toml); defaults apply to omitted keys
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Output directory for tables, summary and final model
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Process held-out clusters concurrently, overriding the config
    #[arg(long)]
    pub parallel: bool,
}

#[derive(Args)]
pub struct ScoreArgs {
    /// Saved model (final_model.toml from `iecv run`)
    #[arg(long, value_name = "PATH")]
    pub model: PathBuf,

    /// Cohort table to score
    #[arg(long, value_name = "PATH")]
    pub data: PathBuf,

    /// Configuration naming the columns and the prediction horizon
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Output table of prognostic index and horizon risk
    #[arg(long, value_name = "PATH")]
    pub out: PathBuf,
}

#[derive(Parser)]
#[command(
    name = "iecv",
    about = "Internal-external cross-validation of penalized Cox risk models",
    long_about = "Fits a penalized Cox model with every cluster held out in turn, reports \
                 discrimination, calibration and net benefit per held-out cluster, and fits \
                 a final model on the full cohort."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run leave-one-cluster-out validation
    #[command(about = "Run IECV (outputs: coefficients.tsv, external.tsv, summary.toml, ...)")]
    Run(RunArgs),

    /// Apply a saved model to a cohort
    #[command(about = "Score subjects with a saved model (outputs: one TSV)")]
    Score(ScoreArgs),

    /// Print the default configuration
    #[command(about = "Print the default configuration as TOML")]
    DefaultConfig,
}

/// Progress bar over held-out clusters, created when the run starts.
#[derive(Default)]
struct FoldProgressBar {
    bar: OnceLock<ProgressBar>,
}

impl FoldProgressObserver for FoldProgressBar {
    fn on_run_start(&self, total_folds: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_folds as u64), draw_target);
        let template = "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} folds {msg}";
        if let Ok(style) = ProgressStyle::with_template(template) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        let _ = self.bar.set(bar);
    }

    fn on_fold_start(&self, cluster: &str) {
        if let Some(bar) = self.bar.get() {
            bar.set_message(format!("fitting '{cluster}'"));
        }
    }

    fn on_fold_finish(&self, cluster: &str, completed: bool) {
        if let Some(bar) = self.bar.get() {
            if !completed {
                bar.println(format!("> fold '{cluster}' did not complete"));
            }
            bar.inc(1);
        }
    }

    fn on_run_finish(&self) {
        if let Some(bar) = self.bar.get() {
            bar.finish_and_clear();
        }
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = IecvConfig::load(&args.config)?;
    if args.parallel {
        config.parallel_folds = true;
    }
    let records = iecv::data::load_records(&args.data, &config)?;
    let progress = FoldProgressBar::default();
    let report = run_iecv(&records, &config, &MarginalImputer, &progress)?;
    write_report(&report, &args.out)?;

    let summary = summarize(&report);
    println!(
        "Completed {} of {} folds. Pooled external C = {:.3} (random effects, tau^2 = {:.4}).",
        summary.completed_folds,
        summary.completed_folds + summary.failed_folds,
        summary.concordance.random_effects,
        summary.concordance.tau_squared
    );
    println!("Results written to {}", args.out.display());
    Ok(())
}

#[derive(Serialize)]
struct ScoreRow {
    cluster: String,
    prognostic_index: f64,
    event_probability: f64,
}

fn score(args: ScoreArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = IecvConfig::load(&args.config)?;
    let model = FittedModel::load(&args.model)?;
    let records = iecv::data::load_records(&args.data, &config)?;
    let records = complete_checked(&MarginalImputer, &records, fold_seed(config.seed, "score"))?;

    let pi = project(&model, &model.schema, &records)?;
    let horizon = config.outcome.prediction_horizon_days;
    let probability = event_probability(&model, pi.view(), horizon);
    let rows: Vec<ScoreRow> = records
        .records()
        .iter()
        .zip(pi.iter().zip(probability.iter()))
        .map(|(record, (&eta, &p))| ScoreRow {
            cluster: record.cluster.clone(),
            prognostic_index: eta,
            event_probability: p,
        })
        .collect();
    ensure_parent(&args.out)?;
    write_table(&args.out, &rows)?;
    println!(
        "Scored {} subjects at {} days; predictions written to {}",
        rows.len(),
        horizon,
        args.out.display()
    );
    Ok(())
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Score(args)) => score(args),
        Some(Commands::DefaultConfig) => IecvConfig::default()
            .to_toml()
            .map(|text| print!("{text}"))
            .map_err(Into::into),
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
