//! Model backends behind a common capability interface.
//!
//! Every backend implements [`ModelWrapper`]; the fold orchestrator only ever talks to
//! the trait. Hyperparameters are read from the [`ConfigStore`] under
//! `"{ModelName}.{param}"` when the model is built, so whatever the tuner bound last is
//! what the next model sees.

use crate::config::{ConfigError, ConfigStore};
use ndarray::{Array1, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod linear;

pub use linear::{LogisticClassifier, RidgeRegressor};

/// The prediction task a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Classification,
    Regression,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classification => f.write_str("classification"),
            Self::Regression => f.write_str("regression"),
        }
    }
}

impl FromStr for RunMode {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "classification" => Ok(Self::Classification),
            "regression" => Ok(Self::Regression),
            _ => Err(ModelError::UnknownRunMode(s.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Unknown model '{0}'. Available models: LogisticClassifier, RidgeRegressor.")]
    UnknownModel(String),
    #[error("Unknown run mode '{0}'. Use classification or regression.")]
    UnknownRunMode(String),
    #[error("{model} does not support {mode}.")]
    UnsupportedRunMode { model: &'static str, mode: RunMode },
    #[error("{0} must be fitted before it can predict.")]
    NotFitted(&'static str),
    #[error("Expected {expected} feature columns but found {found}.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Training data has {features} rows but {labels} labels.")]
    LabelLengthMismatch { features: usize, labels: usize },
    #[error("Cannot fit a model on an empty training set.")]
    EmptyTrainingSet,
    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// Capability interface shared by all backends.
pub trait ModelWrapper {
    fn name(&self) -> &'static str;

    fn supported_run_modes(&self) -> &'static [RunMode];

    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<f64>) -> Result<(), ModelError>;

    /// Predictions for each row. Classifiers return the probability of label `1`.
    fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ModelError>;

    /// The loss minimised during tuning.
    fn loss(&self, labels: ArrayView1<f64>, predictions: ArrayView1<f64>) -> f64;

    fn supports(&self, mode: RunMode) -> bool {
        self.supported_run_modes().contains(&mode)
    }
}

/// Builds the backend named by `train.model` (default `LogisticClassifier`) for `mode`.
pub fn build_model(
    config: &ConfigStore,
    mode: RunMode,
) -> Result<Box<dyn ModelWrapper>, ModelError> {
    let name: String = config.get_or("train.model", LogisticClassifier::NAME.to_string())?;
    let model: Box<dyn ModelWrapper> = match name.as_str() {
        LogisticClassifier::NAME => Box::new(LogisticClassifier::from_config(config)?),
        RidgeRegressor::NAME => Box::new(RidgeRegressor::from_config(config)?),
        _ => return Err(ModelError::UnknownModel(name)),
    };
    if !model.supports(mode) {
        return Err(ModelError::UnsupportedRunMode {
            model: model.name(),
            mode,
        });
    }
    Ok(model)
}

/// Reads `train.run_mode` (default classification).
pub fn run_mode_from_config(config: &ConfigStore) -> Result<RunMode, ModelError> {
    let mode: String = config.get_or("train.run_mode", RunMode::Classification.to_string())?;
    mode.parse()
}
