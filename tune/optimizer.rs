//! Sequential Bayesian optimisation over a [`SearchSpace`].
//!
//! The first points are drawn at random; after that each proposal maximises expected
//! improvement under a Gaussian-process surrogate fitted to every evaluation so far,
//! including the history the search was seeded with.

use super::gp::{GaussianProcess, expected_improvement};
use super::space::{Dimension, SearchSpace};
use crate::config::ParamValue;
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Cannot optimise over an empty search space.")]
    EmptySpace,
    #[error("The search finished without a single evaluation.")]
    NoEvaluations,
    #[error("The initial history has {points} points but {losses} losses.")]
    Misaligned { points: usize, losses: usize },
    #[error("Point {index} of the history has {found} values for a {expected}-dimensional space.")]
    WrongPointLength {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("Value '{value}' of '{name}' lies outside the search space.")]
    OutsideSpace { name: String, value: String },
}

/// The state of a search: every evaluation so far and the best one.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeResult {
    /// The evaluated point with the lowest loss.
    pub x: Vec<ParamValue>,
    pub fun: f64,
    pub x_iters: Vec<Vec<ParamValue>>,
    pub func_vals: Vec<f64>,
}

impl OptimizeResult {
    fn from_history(
        x_iters: &[Vec<ParamValue>],
        func_vals: &[f64],
    ) -> Result<Self, OptimizerError> {
        let (best_index, &fun) = func_vals
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or(OptimizerError::NoEvaluations)?;
        Ok(Self {
            x: x_iters[best_index].clone(),
            fun,
            x_iters: x_iters.to_vec(),
            func_vals: func_vals.to_vec(),
        })
    }
}

/// Gaussian-process minimiser with expected-improvement acquisition.
#[derive(Debug, Clone)]
pub struct GpMinimizer {
    /// Evaluations made by this call to [`GpMinimizer::minimize`].
    pub n_calls: usize,
    /// Random proposals made before the surrogate takes over, counting seeded history.
    pub n_initial_points: usize,
    pub seed: u64,
    /// Observation noise added to the surrogate's kernel diagonal.
    pub noise: f64,
    /// Random candidates scored by the acquisition function per proposal.
    pub n_candidates: usize,
    /// Exploration margin of expected improvement.
    pub xi: f64,
}

impl Default for GpMinimizer {
    fn default() -> Self {
        Self {
            n_calls: 20,
            n_initial_points: 3,
            seed: 0,
            noise: 1e-10,
            n_candidates: 2000,
            xi: 0.01,
        }
    }
}

impl GpMinimizer {
    /// Runs `n_calls` evaluations of `objective`, starting from the history
    /// `(x0, y0)`. `callback` sees the full state after every evaluation.
    pub fn minimize<F, C, E>(
        &self,
        space: &SearchSpace,
        x0: Vec<Vec<ParamValue>>,
        y0: Vec<f64>,
        mut objective: F,
        mut callback: C,
    ) -> Result<OptimizeResult, E>
    where
        F: FnMut(&[ParamValue]) -> Result<f64, E>,
        C: FnMut(&OptimizeResult) -> Result<(), E>,
        E: From<OptimizerError>,
    {
        if space.is_empty() {
            return Err(OptimizerError::EmptySpace.into());
        }
        if x0.len() != y0.len() {
            return Err(OptimizerError::Misaligned {
                points: x0.len(),
                losses: y0.len(),
            }
            .into());
        }
        let dimensions: Vec<(&String, &Dimension)> = space.iter().collect();
        for (index, point) in x0.iter().enumerate() {
            if point.len() != dimensions.len() {
                return Err(OptimizerError::WrongPointLength {
                    index,
                    expected: dimensions.len(),
                    found: point.len(),
                }
                .into());
            }
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut x_iters = x0;
        let mut func_vals = y0;
        for call in 0..self.n_calls {
            let point = if x_iters.len() < self.n_initial_points.max(2) {
                log::debug!("Call {call}: random proposal");
                random_point(&dimensions, &mut rng)
            } else {
                self.guided_point(&dimensions, &x_iters, &func_vals, &mut rng)?
            };
            let loss = objective(&point)?;
            x_iters.push(point);
            func_vals.push(loss);
            callback(&OptimizeResult::from_history(&x_iters, &func_vals)?)?;
        }
        Ok(OptimizeResult::from_history(&x_iters, &func_vals)?)
    }

    /// Proposes the candidate with the highest expected improvement. Falls back to a
    /// random point when the surrogate cannot be fitted.
    fn guided_point<R: Rng>(
        &self,
        dimensions: &[(&String, &Dimension)],
        x_iters: &[Vec<ParamValue>],
        func_vals: &[f64],
        rng: &mut R,
    ) -> Result<Vec<ParamValue>, OptimizerError> {
        let mut train_x = Array2::<f64>::zeros((x_iters.len(), dimensions.len()));
        for (row, point) in x_iters.iter().enumerate() {
            for (col, ((name, dimension), value)) in dimensions.iter().zip(point).enumerate() {
                train_x[[row, col]] =
                    dimension
                        .to_unit(value)
                        .ok_or_else(|| OptimizerError::OutsideSpace {
                            name: (*name).clone(),
                            value: value.to_string(),
                        })?;
            }
        }
        let train_y = Array1::from(func_vals.to_vec());

        let gp = match GaussianProcess::fit(train_x, &train_y, self.noise) {
            Ok(gp) => gp,
            Err(e) => {
                log::warn!("Surrogate fit failed ({e}); proposing a random point instead.");
                return Ok(random_point(dimensions, rng));
            }
        };
        let best = func_vals
            .iter()
            .map(|&y| gp.standardize(y))
            .fold(f64::INFINITY, f64::min);

        let mut proposal = None;
        let mut best_score = f64::NEG_INFINITY;
        let mut encoded = Array1::<f64>::zeros(dimensions.len());
        for _ in 0..self.n_candidates.max(1) {
            let candidate = random_point(dimensions, rng);
            for (col, ((_, dimension), value)) in dimensions.iter().zip(&candidate).enumerate() {
                encoded[col] = dimension.to_unit(value).unwrap_or(0.5);
            }
            let (mean, std) = gp.predict_standardized(encoded.view());
            let score = expected_improvement(mean, std, best, self.xi);
            if score > best_score {
                best_score = score;
                proposal = Some(candidate);
            }
        }
        log::debug!("Guided proposal with expected improvement {best_score:.4e}");
        Ok(proposal.unwrap_or_else(|| random_point(dimensions, rng)))
    }
}

fn random_point<R: Rng + ?Sized>(
    dimensions: &[(&String, &Dimension)],
    rng: &mut R,
) -> Vec<ParamValue> {
    dimensions
        .iter()
        .map(|(_, dimension)| dimension.sample(rng))
        .collect()
}
