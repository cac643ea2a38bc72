#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;

use netpheno::config::{RunSettings, TASK_ID_VAR, resolve_seed};
use netpheno::data::{Dataset, TableSpec, load_dataset};
use netpheno::lesion::run_lesion_pipeline;
use netpheno::output::{RunLabel, write_lesion_result, write_nested_result};
use netpheno::regressors::{Algorithm, get_regressors};
use netpheno::scoring::{Metric, Scoring};
use netpheno::search::run_nested_cv;

#[derive(Clone, Copy, ValueEnum)]
pub enum AlgorithmCli {
    /// Ridge regression
    #[value(name = "rr")]
    Rr,
    /// Lasso regression
    #[value(name = "lr")]
    Lr,
    /// Kernel ridge, linear kernel
    #[value(name = "krr_lin")]
    KrrLin,
    /// Kernel ridge, RBF kernel
    #[value(name = "krr_rbf")]
    KrrRbf,
    /// Support vector regression, linear kernel
    #[value(name = "svr_lin")]
    SvrLin,
    /// Support vector regression, RBF kernel
    #[value(name = "svr_rbf")]
    SvrRbf,
}

impl From<AlgorithmCli> for Algorithm {
    fn from(value: AlgorithmCli) -> Self {
        match value {
            AlgorithmCli::Rr => Algorithm::Ridge,
            AlgorithmCli::Lr => Algorithm::Lasso,
            AlgorithmCli::KrrLin => Algorithm::KernelRidgeLinear,
            AlgorithmCli::KrrRbf => Algorithm::KernelRidgeRbf,
            AlgorithmCli::SvrLin => Algorithm::SvrLinear,
            AlgorithmCli::SvrRbf => Algorithm::SvrRbf,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MetricCli {
    R2,
    Mse,
    Mae,
    Corr,
}

impl From<MetricCli> for Metric {
    fn from(value: MetricCli) -> Self {
        match value {
            MetricCli::R2 => Metric::R2,
            MetricCli::Mse => Metric::NegMse,
            MetricCli::Mae => Metric::NegMae,
            MetricCli::Corr => Metric::Corr,
        }
    }
}

/// Inputs and labels shared by every prediction mode.
#[derive(Args)]
pub struct RunArgs {
    /// Feature table (CSV) with subject key columns and brain features
    #[arg(short = 'x', long = "features", value_name = "CSV")]
    pub features: PathBuf,

    /// Phenotype table (CSV) keyed by the same subject columns
    #[arg(short = 'y', long = "phenotypes", value_name = "CSV")]
    pub phenotypes: PathBuf,

    /// Brain feature name pattern used to select columns (e.g. ac)
    #[arg(long)]
    pub metric: String,

    /// Phenotype column to predict
    #[arg(long)]
    pub pheno: String,

    /// Shuffle seed; defaults to SGE_TASK_ID - 1
    #[arg(long)]
    pub seed: Option<u64>,

    /// Regression algorithm
    #[arg(long, value_enum)]
    pub alg: AlgorithmCli,

    /// Root directory for results
    #[arg(short = 'o', long = "outroot", value_name = "DIR")]
    pub outroot: PathBuf,

    /// Optional TOML file overriding run settings
    #[arg(long, value_name = "TOML")]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "netpheno",
    about = "Cross-validated phenotype prediction from brain network features",
    long_about = "Predicts phenotype scores from brain network features with regularized \
                 regression, using nested cross-validation or feature lesioning."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Nested cross-validation with a hyperparameter grid search
    #[command(about = "Run nested cross-validation (outputs: best_params.json, best_scores.json, nested_score.csv)")]
    Nested {
        #[command(flatten)]
        run: RunArgs,

        /// Metric that selects the best hyperparameters; all metrics are reported
        #[arg(long, value_enum, default_value = "r2")]
        primary: MetricCli,
    },
    /// Stratified search followed by single-feature lesioning
    #[command(about = "Run the feature lesion analysis")]
    Lesion {
        #[command(flatten)]
        run: RunArgs,

        /// Metric used for selection and lesion scoring
        #[arg(long, value_enum, default_value = "r2")]
        score: MetricCli,
    },
    /// Print the hyperparameter grid of every algorithm
    #[command(about = "List the search grid of every algorithm")]
    Grids {
        /// Points per grid axis
        #[arg(long, default_value_t = 10)]
        points: usize,
    },
}

struct PreparedRun {
    dataset: Dataset,
    settings: RunSettings,
    seed: u64,
}

fn prepare_run(args: &RunArgs) -> Result<PreparedRun, Box<dyn std::error::Error>> {
    let settings = match &args.config {
        Some(path) => RunSettings::load(path)?,
        None => RunSettings::default(),
    };
    let task_id = std::env::var(TASK_ID_VAR).ok();
    let seed = resolve_seed(args.seed, task_id.as_deref())?;
    log::info!("Using seed {seed}");

    let spec = TableSpec {
        subject_key: &settings.subject_key,
        feature_pattern: &args.metric,
        phenotype: &args.pheno,
    };
    let dataset = load_dataset(&args.features, &args.phenotypes, &spec)?;
    log::info!(
        "Loaded {} subjects with {} features",
        dataset.n_samples(),
        dataset.n_features()
    );
    log::debug!("Feature columns: {}", dataset.feature_names().join(", "));
    Ok(PreparedRun {
        dataset,
        settings,
        seed,
    })
}

fn label(args: &RunArgs, seed: u64) -> RunLabel<'_> {
    RunLabel {
        algorithm: args.alg.into(),
        feature_metric: &args.metric,
        phenotype: &args.pheno,
        seed,
    }
}

fn run_nested(run: RunArgs, primary: MetricCli) -> Result<(), Box<dyn std::error::Error>> {
    let prepared = prepare_run(&run)?;
    let scoring = Scoring::full_report(primary.into());
    let result = run_nested_cv(
        &prepared.dataset,
        run.alg.into(),
        &scoring,
        &prepared.settings,
        prepared.seed,
    )?;
    if result.dropped_rows > 0 {
        println!(
            "Dropped {} subjects without a '{}' value",
            result.dropped_rows, run.pheno
        );
    }
    println!("Best configuration: {}", result.best);
    for (metric, value) in result.best_scores.iter() {
        println!("  mean {metric}: {value:.4}");
    }
    println!(
        "Nested {} across {} folds: {:.4}",
        scoring.primary(),
        result.nested_scores.len(),
        result.mean_nested_score()
    );

    let dir = label(&run, prepared.seed).nested_dir(&run.outroot);
    write_nested_result(&dir, &result)?;
    println!("Results saved to {}", dir.display());
    Ok(())
}

fn run_lesion(run: RunArgs, score: MetricCli) -> Result<(), Box<dyn std::error::Error>> {
    let prepared = prepare_run(&run)?;
    let metric: Metric = score.into();
    let result = run_lesion_pipeline(
        &prepared.dataset,
        run.alg.into(),
        metric,
        &prepared.settings,
        prepared.seed,
    )?;
    println!(
        "Best configuration: {} ({metric} = {:.4}, {} components explaining {:.4})",
        result.best(),
        result.search.best_score,
        result.search.n_components,
        result.search.explained_variance
    );
    println!(
        "Baseline {metric}: {:.4}; lesioned {} features",
        result.lesion.baseline_score,
        result.lesion.lesioned_scores.len()
    );

    let dir = label(&run, prepared.seed).lesion_dir(&run.outroot, metric);
    write_lesion_result(&dir, &result)?;
    println!("Results saved to {}", dir.display());
    Ok(())
}

fn print_grids(points: usize) -> Result<(), Box<dyn std::error::Error>> {
    for (algorithm, grid) in get_regressors(points)? {
        println!("{algorithm} ({} candidates)", grid.len());
        for (hyper, values) in grid.axes() {
            let rendered: Vec<String> = values.iter().map(|v| format!("{v:.4e}")).collect();
            println!("  {hyper}: {}", rendered.join(" "));
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Nested { run, primary }) => run_nested(run, primary),
        Some(Commands::Lesion { run, score }) => run_lesion(run, score),
        Some(Commands::Grids { points }) => print_grids(points),
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
