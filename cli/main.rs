#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process;

use icu_bench::config::ConfigStore;
use icu_bench::data::{SequenceDataset, Split, Splits, load_tables};
use icu_bench::logging;
use icu_bench::train::{CrossValidationTrainer, FoldRequest, FoldTrainer};
use icu_bench::tune::{TuneOutcome, TuneSettings, choose_and_bind_hyperparameters};
use icu_bench::tune_log;

/// File the final, fully resolved configuration is written to.
const FINAL_BINDINGS_FILE: &str = "final_bindings.toml";

#[derive(Args)]
pub struct TrainArgs {
    /// Path to the TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: PathBuf,

    /// Directory holding sta.csv, dyn.csv and outc.csv
    #[arg(long, value_name = "DIR")]
    pub data_dir: PathBuf,

    /// Directory for the tuning checkpoint, fold metrics and final bindings
    #[arg(long, value_name = "DIR")]
    pub log_dir: PathBuf,

    /// Seed for fold assignment and the hyperparameter search
    #[arg(long, default_value = "1111")]
    pub seed: u64,

    /// Tune hyperparameters before the final training run
    #[arg(long)]
    pub tune: bool,

    /// Log directory of an earlier run to resume tuning from
    #[arg(long, value_name = "DIR")]
    pub checkpoint: Option<PathBuf>,

    /// Use fewer stays and keep INFO logging on while tuning
    #[arg(long)]
    pub debug: bool,
}

#[derive(Args)]
pub struct WindowsArgs {
    /// Directory holding sta.csv, dyn.csv and outc.csv
    #[arg(long, value_name = "DIR")]
    pub data_dir: PathBuf,

    /// Split name reported for the tables (train, val or test)
    #[arg(long, default_value = "train")]
    pub split: Split,

    /// Optional TOML configuration providing the column roles
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "icu-bench",
    about = "Benchmark harness for ICU time-series prediction models",
    long_about = "Builds windowed sequence datasets from ICU stay tables, tunes model \
                 hyperparameters with cross-validated Bayesian optimisation, and trains \
                 the final models."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tune (optionally) and train a model on cross-validation folds
    #[command(about = "Tune and train a model (outputs: fold metrics, final_bindings.toml)")]
    Train(TrainArgs),

    /// Report the windowing statistics of a dataset
    #[command(about = "Print dataset statistics: stays, measurements, maxlen, class balance")]
    Windows(WindowsArgs),
}

fn main() {
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Windows(args)) => windows(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(args.debug)?;
    let mut config = ConfigStore::load(&args.config)?;
    fs::create_dir_all(&args.log_dir)?;
    let mut trainer = CrossValidationTrainer::new();

    if config.is_bound("tune_hyperparameters.scopes") {
        let mut settings =
            TuneSettings::from_config(&config, &args.data_dir, &args.log_dir, args.seed)?;
        settings.do_tune |= args.tune;
        settings.debug |= args.debug;
        if args.checkpoint.is_some() {
            settings.checkpoint = args.checkpoint.clone();
        }
        match choose_and_bind_hyperparameters(&mut config, &settings, &mut trainer)? {
            TuneOutcome::Tuned {
                best_loss,
                evaluations,
                ..
            } => tune_log!("Best validation loss {best_loss:.6} after {evaluations} evaluations."),
            TuneOutcome::BudgetExhausted { best_loss, .. } => {
                tune_log!("Resumed with the best recorded validation loss {best_loss:.6}.")
            }
            TuneOutcome::RandomDraw { .. } | TuneOutcome::NothingToTune => {}
        }
    } else if args.tune {
        log::warn!("--tune was given but the configuration declares no tuning scopes.");
    }

    let request = FoldRequest {
        data_dir: args.data_dir.clone(),
        output_dir: args.log_dir.clone(),
        seed: args.seed,
        num_folds_to_train: config.get_or("train.cv_folds", 5)?,
        use_cache: true,
        test_on: Split::Test,
        debug: args.debug,
    };
    let loss = trainer.train_for_folds(&config, &request)?;
    println!("Mean test loss: {loss:.6}");

    let bindings_path = args.log_dir.join(FINAL_BINDINGS_FILE);
    config.save(&bindings_path)?;
    log::info!("Final bindings written to '{}'", bindings_path.display());
    Ok(())
}

fn windows(args: WindowsArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init(false)?;
    let config = match &args.config {
        Some(path) => ConfigStore::load(path)?,
        None => ConfigStore::new(),
    };
    let tables = load_tables(&args.data_dir)?;
    let splits = Splits::from([(args.split, tables)]);
    let dataset = SequenceDataset::from_config(&splits, args.split, &config)?;

    println!("split:            {}", dataset.split());
    println!("num_stays:        {}", dataset.len());
    println!("num_measurements: {}", dataset.num_measurements());
    println!("num_features:     {}", dataset.num_features());
    println!("maxlen:           {}", dataset.maxlen());
    for class in dataset.get_balance() {
        println!(
            "label {:>6}: {:>8} rows, weight {:.4}",
            class.label, class.count, class.weight
        );
    }
    Ok(())
}
