//! # Cross-Validation Fold Orchestrator
//!
//! Trains and evaluates the configured model on one or more cross-validation folds and
//! reports the mean loss. The tuner only depends on the [`FoldTrainer`] trait, so any
//! training backend that honours the contract can be tuned.
//!
//! Stays are assigned to `train.cv_folds` folds by a seeded shuffle. For fold `k`, fold
//! `k` is the test split, fold `k + 1` (wrapping) the validation split and the rest the
//! training split. Identical bindings, seed and data always give the identical loss.

use crate::config::{ConfigError, ConfigStore};
use crate::data::{DataError, SequenceDataset, Split, SplitTables, Splits, VarRoles, load_tables};
use crate::models::{ModelError, build_model, run_mode_from_config};
use ndarray::{Array1, Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stays kept when training in debug mode.
const DEBUG_STAY_LIMIT: usize = 100;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("Data error: {0}")]
    DataError(#[from] DataError),
    #[error("Model error: {0}")]
    ModelError(#[from] ModelError),
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Failed to write training artifacts: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to serialize fold metrics: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Cross-validation needs at least 3 folds (train, val, test); got {0}.")]
    TooFewFolds(usize),
    #[error("Cannot split {stays} stays into {folds} folds.")]
    TooFewStays { stays: usize, folds: usize },
    #[error("Asked to train on 0 folds.")]
    NoFoldsRequested,
    #[error("The {0} split of fold {1} contains no labeled rows.")]
    NoLabeledRows(Split, usize),
}

/// Arguments of one fold-training invocation.
#[derive(Debug, Clone)]
pub struct FoldRequest {
    pub data_dir: PathBuf,
    pub output_dir: PathBuf,
    pub seed: u64,
    pub num_folds_to_train: usize,
    pub use_cache: bool,
    pub test_on: Split,
    pub debug: bool,
}

/// Something that trains on cross-validation folds and reports a scalar loss.
pub trait FoldTrainer {
    fn train_for_folds(
        &mut self,
        config: &ConfigStore,
        request: &FoldRequest,
    ) -> Result<f64, TrainError>;
}

/// Per-fold metrics written next to the fold's artifacts.
#[derive(Debug, Clone, Serialize)]
pub struct FoldMetrics {
    pub fold: usize,
    pub model: String,
    pub evaluated_on: Split,
    pub loss: f64,
    pub num_train_rows: usize,
    pub num_eval_rows: usize,
}

/// The default fold orchestrator.
#[derive(Debug, Default)]
pub struct CrossValidationTrainer {
    cache: Option<(PathBuf, SplitTables)>,
}

impl CrossValidationTrainer {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&mut self, data_dir: &Path, use_cache: bool) -> Result<SplitTables, DataError> {
        if use_cache {
            if let Some((cached_dir, tables)) = &self.cache {
                if cached_dir == data_dir {
                    log::debug!("Using cached tables for '{}'", data_dir.display());
                    return Ok(tables.clone());
                }
            }
        }
        let tables = load_tables(data_dir)?;
        if use_cache {
            self.cache = Some((data_dir.to_path_buf(), tables.clone()));
        }
        Ok(tables)
    }
}

impl FoldTrainer for CrossValidationTrainer {
    fn train_for_folds(
        &mut self,
        config: &ConfigStore,
        request: &FoldRequest,
    ) -> Result<f64, TrainError> {
        if request.num_folds_to_train == 0 {
            return Err(TrainError::NoFoldsRequested);
        }
        let vars = VarRoles::from_config(config)?;
        let use_static: bool = config.get_or("Dataset.use_static", true)?;
        let cv_folds: usize = config.get_or("train.cv_folds", 5)?;
        let mode = run_mode_from_config(config)?;
        if cv_folds < 3 {
            return Err(TrainError::TooFewFolds(cv_folds));
        }

        let tables = self.tables(&request.data_dir, request.use_cache)?;
        let mut stays = tables.stay_ids(&vars)?;
        if request.debug && stays.len() > DEBUG_STAY_LIMIT {
            log::info!("Debug mode: keeping the first {DEBUG_STAY_LIMIT} stays.");
            stays.truncate(DEBUG_STAY_LIMIT);
        }
        if stays.len() < cv_folds {
            return Err(TrainError::TooFewStays {
                stays: stays.len(),
                folds: cv_folds,
            });
        }
        let assignment = assign_folds(stays.len(), cv_folds, request.seed);

        let num_folds = request.num_folds_to_train.min(cv_folds);
        let mut losses = Vec::with_capacity(num_folds);
        for fold in 0..num_folds {
            let splits = fold_splits(&tables, &vars, &stays, &assignment, fold, cv_folds)?;
            let train = SequenceDataset::new(&splits, Split::Train, &vars, use_static)?;
            let eval = SequenceDataset::new(&splits, request.test_on, &vars, use_static)?;

            let (train_x, train_y) = labeled_rows(train.get_data_and_labels())
                .ok_or(TrainError::NoLabeledRows(Split::Train, fold))?;
            let (eval_x, eval_y) = labeled_rows(eval.get_data_and_labels())
                .ok_or(TrainError::NoLabeledRows(request.test_on, fold))?;

            let mut model = build_model(config, mode)?;
            model.fit(train_x.view(), train_y.view())?;
            let predictions = model.predict(eval_x.view())?;
            let loss = model.loss(eval_y.view(), predictions.view());
            log::info!(
                "Fold {fold}: {} {} loss {loss:.6} ({} train rows, {} {} rows)",
                model.name(),
                request.test_on,
                train_y.len(),
                eval_y.len(),
                request.test_on
            );

            let metrics = FoldMetrics {
                fold,
                model: model.name().to_string(),
                evaluated_on: request.test_on,
                loss,
                num_train_rows: train_y.len(),
                num_eval_rows: eval_y.len(),
            };
            write_metrics(&request.output_dir.join(format!("fold_{fold}")), &metrics)?;
            losses.push(loss);
        }

        let mean_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        log::info!("Mean {} loss over {num_folds} folds: {mean_loss:.6}", request.test_on);
        Ok(mean_loss)
    }
}

/// Trains with a fresh [`CrossValidationTrainer`].
pub fn preprocess_and_train_for_folds(
    config: &ConfigStore,
    request: &FoldRequest,
) -> Result<f64, TrainError> {
    CrossValidationTrainer::new().train_for_folds(config, request)
}

/// Fold index of every stay position, balanced to within one stay.
fn assign_folds(num_stays: usize, num_folds: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..num_stays).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let mut assignment = vec![0; num_stays];
    for (rank, &position) in order.iter().enumerate() {
        assignment[position] = rank % num_folds;
    }
    assignment
}

fn fold_splits(
    tables: &SplitTables,
    vars: &VarRoles,
    stays: &[String],
    assignment: &[usize],
    fold: usize,
    num_folds: usize,
) -> Result<Splits, DataError> {
    let val_fold = (fold + 1) % num_folds;
    let mut members: [Vec<String>; 3] = Default::default();
    for (stay, &assigned) in stays.iter().zip(assignment) {
        let slot = if assigned == fold {
            2
        } else if assigned == val_fold {
            1
        } else {
            0
        };
        members[slot].push(stay.clone());
    }
    let mut splits = Splits::new();
    for (split, stays) in Split::ALL.into_iter().zip(members.iter()) {
        splits.insert(split, tables.select_stays(vars, stays)?);
    }
    Ok(splits)
}

/// Drops rows whose label is missing. `None` when nothing is left.
fn labeled_rows((features, labels): (Array2<f64>, Array1<f64>)) -> Option<(Array2<f64>, Array1<f64>)> {
    let keep: Vec<usize> = (0..labels.len()).filter(|&i| labels[i].is_finite()).collect();
    if keep.is_empty() {
        return None;
    }
    Some((features.select(Axis(0), &keep), labels.select(Axis(0), &keep)))
}

fn write_metrics(dir: &Path, metrics: &FoldMetrics) -> Result<(), TrainError> {
    fs::create_dir_all(dir)?;
    let mut file = BufWriter::new(fs::File::create(dir.join("metrics.json"))?);
    serde_json::to_writer_pretty(&mut file, metrics)?;
    file.flush()?;
    Ok(())
}
