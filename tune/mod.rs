//! Hyperparameter tuning: search-space collection, the sequential Bayesian optimizer,
//! checkpointing, and the controller that ties them to a [`crate::train::FoldTrainer`].

pub mod checkpoint;
pub mod controller;
pub(crate) mod gp;
pub mod optimizer;
pub mod space;

pub use checkpoint::{CHECKPOINT_FILE, CheckpointError, TuningCheckpoint};
pub use controller::{
    TuneError, TuneOutcome, TuneSettings, bind_params, choose_and_bind_hyperparameters,
};
pub use optimizer::{GpMinimizer, OptimizeResult, OptimizerError};
pub use space::{
    Dimension, Prior, SearchSpace, SpaceError, collect_from_scope, hyperparameters_to_tune,
};
