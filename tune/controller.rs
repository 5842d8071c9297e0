//! # Tuning Controller
//!
//! Turns the declarative `hyperparameter` candidates of the configured scopes into a
//! black-box search, drives the optimizer with cross-validated losses from a
//! [`FoldTrainer`], and binds the winning point into the configuration so the final
//! training run uses it.
//!
//! A run proceeds in order:
//!
//! 1. collect candidates from every scope in `tune_hyperparameters.scopes`, binding
//!    fixed values immediately;
//! 2. stop if nothing is left to search;
//! 3. resume from a checkpoint when one is given, deducting its evaluations from the
//!    budget, and stop with the best recorded point when the budget is spent;
//! 4. search, checkpointing and logging a table row after every evaluation;
//! 5. bind the best point.
//!
//! With tuning disabled the optimizer is still called once, so the variable parameters
//! receive one seeded random draw from their bounds, but nothing is trained.

use crate::config::{ConfigError, ConfigStore, ParamValue};
use crate::data::Split;
use crate::logging::{InfoSuppression, log_full_line, log_table_row};
use crate::train::{FoldRequest, FoldTrainer, TrainError};
use crate::tune_log;
use super::checkpoint::{CHECKPOINT_FILE, CheckpointError, TuningCheckpoint};
use super::optimizer::{GpMinimizer, OptimizeResult, OptimizerError};
use super::space::{SearchSpace, SpaceError, collect_from_scope};
use serde::{Deserialize, Serialize};
use std::fs;
use std::iter;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Observation noise handed to the surrogate. Losses are deterministic; the term only
/// keeps the kernel matrix well conditioned.
const OBJECTIVE_NOISE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum TuneError {
    #[error("No checkpoint found in {0} to restart from.")]
    CheckpointNotFound(PathBuf),
    #[error(
        "The checkpoint holds points with {found} values, but {expected} hyperparameters are being tuned."
    )]
    CheckpointMismatch { expected: usize, found: usize },
    #[error("Checkpoint error: {0}")]
    CheckpointError(#[from] CheckpointError),
    #[error("Search space error: {0}")]
    SpaceError(#[from] SpaceError),
    #[error("Optimizer error: {0}")]
    OptimizerError(#[from] OptimizerError),
    #[error("The tuning budget is spent and no evaluation was recorded to choose from.")]
    NoEvaluationsToChooseFrom,
    #[error("Training failed during tuning: {0}")]
    TrainingError(#[from] TrainError),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Failed to prepare a tuning directory: {0}")]
    IoError(#[from] std::io::Error),
}

/// Parameters of one tuning session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuneSettings {
    pub do_tune: bool,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub seed: u64,
    /// Directory of an earlier run whose checkpoint seeds the search.
    pub checkpoint: Option<PathBuf>,
    pub scopes: Vec<String>,
    pub n_initial_points: usize,
    pub n_calls: usize,
    pub folds_to_tune_on: usize,
    pub debug: bool,
}

impl TuneSettings {
    /// Reads `tune_hyperparameters.*` from the store. `scopes` and `folds_to_tune_on` are
    /// required; `n_initial_points` defaults to 3 and `n_calls` to 20.
    pub fn from_config(
        config: &ConfigStore,
        data_dir: &Path,
        log_dir: &Path,
        seed: u64,
    ) -> Result<Self, ConfigError> {
        let checkpoint: Option<String> = config.get_as("tune_hyperparameters.checkpoint")?;
        Ok(Self {
            do_tune: config.get_or("tune_hyperparameters.do_tune", false)?,
            data_dir: data_dir.to_path_buf(),
            log_dir: log_dir.to_path_buf(),
            seed,
            checkpoint: checkpoint.map(PathBuf::from),
            scopes: config.require("tune_hyperparameters.scopes")?,
            n_initial_points: config.get_or("tune_hyperparameters.n_initial_points", 3)?,
            n_calls: config.get_or("tune_hyperparameters.n_calls", 20)?,
            folds_to_tune_on: config.require("tune_hyperparameters.folds_to_tune_on")?,
            debug: config.get_or("tune_hyperparameters.debug", false)?,
        })
    }
}

/// How a tuning session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TuneOutcome {
    /// No candidate was a range or choice list; only fixed values were bound.
    NothingToTune,
    /// The checkpoint already used the whole budget; its best point was bound.
    BudgetExhausted { best: Vec<ParamValue>, best_loss: f64 },
    /// Tuning was disabled; a single random draw was bound.
    RandomDraw { point: Vec<ParamValue> },
    /// The search ran; its best point was bound.
    Tuned {
        best: Vec<ParamValue>,
        best_loss: f64,
        evaluations: usize,
    },
}

/// Binds `values` to `names` pairwise and logs each binding.
pub fn bind_params(config: &mut ConfigStore, names: &[String], values: &[ParamValue]) {
    for (name, value) in names.iter().zip(values) {
        config.bind(name, value.clone());
        log::info!("{name} = {value}");
    }
}

/// Chooses hyperparameters for the scopes in `settings` and binds them into `config`.
pub fn choose_and_bind_hyperparameters(
    config: &mut ConfigStore,
    settings: &TuneSettings,
    trainer: &mut dyn FoldTrainer,
) -> Result<TuneOutcome, TuneError> {
    let mut space = SearchSpace::new();
    for scope in &settings.scopes {
        let mut scoped = config.scoped(scope);
        space.merge(collect_from_scope(&mut scoped)?);
    }
    if space.is_empty() {
        log::info!("No hyperparameters to tune, skipping tuning.");
        return Ok(TuneOutcome::NothingToTune);
    }
    let names: Vec<String> = space.names().cloned().collect();

    let mut n_calls = settings.n_calls;
    let (x0, y0) = match &settings.checkpoint {
        Some(dir) => {
            let history = load_history(dir, names.len())?;
            tune_log!("Restarting hyperparameter tuning from {} points.", history.len());
            if history.len() >= n_calls {
                if let Some((best, best_loss)) = history.best() {
                    tune_log!("No more hyperparameter tuning iterations left, skipping tuning.");
                    log::info!("Training with these hyperparameters:");
                    bind_params(config, &names, best);
                    return Ok(TuneOutcome::BudgetExhausted {
                        best: best.to_vec(),
                        best_loss,
                    });
                }
            }
            n_calls = n_calls.saturating_sub(history.len());
            (history.x_iters, history.func_vals)
        }
        None => (Vec::new(), Vec::new()),
    };
    if settings.do_tune && n_calls == 0 {
        return Err(TuneError::NoEvaluationsToChooseFrom);
    }

    let header: Vec<String> = iter::once("ITERATION".to_string())
        .chain(names.iter().cloned())
        .chain(iter::once("LOSS AT ITERATION".to_string()))
        .collect();
    let minimizer = if settings.do_tune {
        fs::create_dir_all(&settings.log_dir)?;
        log_full_line("STARTING TUNING", '=', 0);
        tune_log!(
            "Tuning from {} points in {} iterations on {} folds.",
            settings.n_initial_points,
            n_calls,
            settings.folds_to_tune_on
        );
        log_table_row(&header, None, false);
        GpMinimizer {
            n_calls,
            n_initial_points: settings.n_initial_points,
            seed: settings.seed,
            noise: OBJECTIVE_NOISE,
            ..GpMinimizer::default()
        }
    } else {
        tune_log!("Hyperparameter tuning disabled, choosing randomly from bounds.");
        GpMinimizer {
            n_calls: 1,
            n_initial_points: 1,
            seed: settings.seed,
            noise: OBJECTIVE_NOISE,
            ..GpMinimizer::default()
        }
    };

    let work_dir = tempfile::tempdir()?;
    let request = FoldRequest {
        data_dir: settings.data_dir.clone(),
        output_dir: work_dir.path().to_path_buf(),
        seed: settings.seed,
        num_folds_to_train: settings.folds_to_tune_on,
        use_cache: true,
        test_on: Split::Val,
        debug: settings.debug,
    };
    let checkpoint_path = settings.log_dir.join(CHECKPOINT_FILE);

    let result = {
        let _quiet = InfoSuppression::engage(!settings.debug);
        minimizer.minimize(
            &space,
            x0,
            y0,
            |point: &[ParamValue]| -> Result<f64, TuneError> {
                bind_params(config, &names, point);
                if !settings.do_tune {
                    return Ok(0.0);
                }
                Ok(trainer.train_for_folds(config, &request)?)
            },
            |res: &OptimizeResult| -> Result<(), TuneError> {
                if settings.do_tune {
                    record_progress(res, &checkpoint_path, &header)?;
                }
                Ok(())
            },
        )?
    };

    if settings.do_tune {
        log_full_line("FINISHED TUNING", '=', 4);
    }
    log::info!("Training with these hyperparameters:");
    bind_params(config, &names, &result.x);

    if settings.do_tune {
        Ok(TuneOutcome::Tuned {
            evaluations: result.func_vals.len(),
            best: result.x,
            best_loss: result.fun,
        })
    } else {
        Ok(TuneOutcome::RandomDraw { point: result.x })
    }
}

fn load_history(dir: &Path, num_params: usize) -> Result<TuningCheckpoint, TuneError> {
    let path = dir.join(CHECKPOINT_FILE);
    if !path.exists() {
        return Err(TuneError::CheckpointNotFound(path));
    }
    let history = TuningCheckpoint::load(&path)?;
    if let Some(point) = history.x_iters.iter().find(|x| x.len() != num_params) {
        return Err(TuneError::CheckpointMismatch {
            expected: num_params,
            found: point.len(),
        });
    }
    Ok(history)
}

/// Rewrites the checkpoint and logs the latest evaluation as a table row, highlighted
/// when it is the best so far.
fn record_progress(
    res: &OptimizeResult,
    checkpoint_path: &Path,
    header: &[String],
) -> Result<(), TuneError> {
    TuningCheckpoint::new(res.x_iters.clone(), res.func_vals.clone()).save(checkpoint_path)?;
    if let (Some(last_x), Some(last_loss)) = (res.x_iters.last(), res.func_vals.last()) {
        let cells: Vec<String> = iter::once(res.x_iters.len().to_string())
            .chain(last_x.iter().map(ToString::to_string))
            .chain(iter::once(last_loss.to_string()))
            .collect();
        log_table_row(&cells, Some(header), *last_x == res.x);
    }
    Ok(())
}
