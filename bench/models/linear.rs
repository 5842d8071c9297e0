//! Penalised linear baselines: ridge regression and logistic regression.
//!
//! Both fit an unpenalised intercept. Non-finite feature values are zero-filled when the
//! design matrix is assembled.

use super::{ModelError, ModelWrapper, RunMode};
use crate::config::{ConfigError, ConfigStore};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, s};
use ndarray_linalg::Solve;

/// Prepends the intercept column.
fn design_matrix(features: ArrayView2<f64>) -> Array2<f64> {
    let mut design = Array2::<f64>::ones((features.nrows(), features.ncols() + 1));
    design
        .slice_mut(s![.., 1..])
        .assign(&features.mapv(|v| if v.is_finite() { v } else { 0.0 }));
    design
}

/// Ridge penalty on every coefficient except the intercept.
fn ridge_penalty(num_coefficients: usize, strength: f64) -> Array2<f64> {
    let mut penalty = Array2::<f64>::eye(num_coefficients) * strength;
    penalty[[0, 0]] = 0.0;
    penalty
}

fn check_training_inputs(
    features: &ArrayView2<f64>,
    labels: &ArrayView1<f64>,
) -> Result<(), ModelError> {
    if features.nrows() == 0 {
        return Err(ModelError::EmptyTrainingSet);
    }
    if features.nrows() != labels.len() {
        return Err(ModelError::LabelLengthMismatch {
            features: features.nrows(),
            labels: labels.len(),
        });
    }
    Ok(())
}

fn fitted<'a>(
    coefficients: &'a Option<Array1<f64>>,
    name: &'static str,
    features: &ArrayView2<f64>,
) -> Result<&'a Array1<f64>, ModelError> {
    let beta = coefficients.as_ref().ok_or(ModelError::NotFitted(name))?;
    if features.ncols() + 1 != beta.len() {
        return Err(ModelError::DimensionMismatch {
            expected: beta.len() - 1,
            found: features.ncols(),
        });
    }
    Ok(beta)
}

#[derive(Debug, Clone)]
pub struct RidgeRegressor {
    pub alpha: f64,
    coefficients: Option<Array1<f64>>,
}

impl RidgeRegressor {
    pub const NAME: &'static str = "RidgeRegressor";
    const RUN_MODES: &'static [RunMode] = &[RunMode::Regression];

    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            coefficients: None,
        }
    }

    /// Reads `RidgeRegressor.alpha` (default 1.0).
    pub fn from_config(config: &ConfigStore) -> Result<Self, ConfigError> {
        Ok(Self::new(config.get_or("RidgeRegressor.alpha", 1.0)?))
    }

    /// Intercept followed by one coefficient per feature.
    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coefficients.as_ref()
    }
}

impl ModelWrapper for RidgeRegressor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supported_run_modes(&self) -> &'static [RunMode] {
        Self::RUN_MODES
    }

    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_inputs(&features, &labels)?;
        let x = design_matrix(features);
        let gram = x.t().dot(&x) + ridge_penalty(x.ncols(), self.alpha);
        let rhs = x.t().dot(&labels);
        self.coefficients = Some(gram.solve(&rhs)?);
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let beta = fitted(&self.coefficients, Self::NAME, &features)?;
        Ok(design_matrix(features).dot(beta))
    }

    /// Mean squared error.
    fn loss(&self, labels: ArrayView1<f64>, predictions: ArrayView1<f64>) -> f64 {
        let residuals = &labels - &predictions;
        residuals.mapv(|r| r * r).mean().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone)]
pub struct LogisticClassifier {
    pub l2: f64,
    pub max_iter: usize,
    pub tolerance: f64,
    coefficients: Option<Array1<f64>>,
}

impl LogisticClassifier {
    pub const NAME: &'static str = "LogisticClassifier";
    const RUN_MODES: &'static [RunMode] = &[RunMode::Classification];

    pub fn new(l2: f64, max_iter: usize, tolerance: f64) -> Self {
        Self {
            l2,
            max_iter,
            tolerance,
            coefficients: None,
        }
    }

    /// Reads `LogisticClassifier.l2` (1.0), `.max_iter` (100) and `.tolerance` (1e-8).
    pub fn from_config(config: &ConfigStore) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.get_or("LogisticClassifier.l2", 1.0)?,
            config.get_or("LogisticClassifier.max_iter", 100)?,
            config.get_or("LogisticClassifier.tolerance", 1e-8)?,
        ))
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coefficients.as_ref()
    }
}

fn sigmoid(eta: &Array1<f64>) -> Array1<f64> {
    // Clamp eta to keep exp() finite, and probabilities away from 0 and 1.
    eta.mapv(|e| {
        let e = e.clamp(-700.0, 700.0);
        (1.0 / (1.0 + f64::exp(-e))).clamp(1e-8, 1.0 - 1e-8)
    })
}

impl ModelWrapper for LogisticClassifier {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn supported_run_modes(&self) -> &'static [RunMode] {
        Self::RUN_MODES
    }

    /// Penalised IRLS (Newton) iterations from a zero start.
    fn fit(&mut self, features: ArrayView2<f64>, labels: ArrayView1<f64>) -> Result<(), ModelError> {
        check_training_inputs(&features, &labels)?;
        let x = design_matrix(features);
        let penalty = ridge_penalty(x.ncols(), self.l2);
        let mut beta = Array1::<f64>::zeros(x.ncols());

        let mut converged = false;
        for iteration in 0..self.max_iter {
            let mu = sigmoid(&x.dot(&beta));
            let weights = &mu * &(1.0 - &mu);
            let weighted = &x * &weights.view().insert_axis(Axis(1));
            let hessian = weighted.t().dot(&x) + &penalty;
            let gradient = x.t().dot(&(&labels - &mu)) - penalty.dot(&beta);
            let step = hessian.solve(&gradient)?;
            beta += &step;

            let change = step.iter().fold(0.0_f64, |max, v| max.max(v.abs()));
            log::trace!("IRLS iteration {iteration}: max coefficient change {change:.3e}");
            if change < self.tolerance {
                converged = true;
                break;
            }
        }
        if !converged {
            log::warn!(
                "{} did not converge within {} iterations.",
                Self::NAME,
                self.max_iter
            );
        }

        self.coefficients = Some(beta);
        Ok(())
    }

    fn predict(&self, features: ArrayView2<f64>) -> Result<Array1<f64>, ModelError> {
        let beta = fitted(&self.coefficients, Self::NAME, &features)?;
        Ok(sigmoid(&design_matrix(features).dot(beta)))
    }

    /// Mean binary cross-entropy.
    fn loss(&self, labels: ArrayView1<f64>, predictions: ArrayView1<f64>) -> f64 {
        let n = labels.len();
        if n == 0 {
            return 0.0;
        }
        let total: f64 = labels
            .iter()
            .zip(predictions.iter())
            .map(|(&y, &p)| {
                let p = p.clamp(1e-8, 1.0 - 1e-8);
                -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
            })
            .sum();
        total / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn ridge_recovers_linear_relation_with_small_penalty() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let y = array![1.0, 3.0, 5.0, 7.0, 9.0];
        let mut model = RidgeRegressor::new(1e-9);
        model.fit(x.view(), y.view()).unwrap();

        let beta = model.coefficients().unwrap();
        assert_abs_diff_eq!(beta[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(beta[1], 2.0, epsilon = 1e-6);

        let predictions = model.predict(x.view()).unwrap();
        assert_abs_diff_eq!(model.loss(y.view(), predictions.view()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn logistic_orders_probabilities_by_feature() {
        let x = array![[-2.0], [-1.0], [-0.5], [0.5], [1.0], [2.0], [-0.2], [0.2]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let mut model = LogisticClassifier::new(0.1, 100, 1e-10);
        model.fit(x.view(), y.view()).unwrap();

        let probs = model.predict(array![[-3.0], [0.0], [3.0]].view()).unwrap();
        assert!(probs[0] < probs[1] && probs[1] < probs[2]);
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));

        let fitted = model.predict(x.view()).unwrap();
        let loss = model.loss(y.view(), fitted.view());
        assert!(loss < std::f64::consts::LN_2);
    }

    #[test]
    fn predicting_before_fit_fails() {
        let model = LogisticClassifier::new(1.0, 10, 1e-8);
        assert!(matches!(
            model.predict(array![[1.0]].view()),
            Err(ModelError::NotFitted("LogisticClassifier"))
        ));
    }

    #[test]
    fn feature_count_must_match_fit() {
        let mut model = RidgeRegressor::new(1.0);
        model
            .fit(array![[1.0, 2.0], [2.0, 1.0]].view(), array![1.0, 2.0].view())
            .unwrap();
        assert!(matches!(
            model.predict(array![[1.0]].view()),
            Err(ModelError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn missing_features_are_zero_filled() {
        let x = array![[f64::NAN, 1.0]];
        let design = design_matrix(x.view());
        assert_eq!(design, array![[1.0, 0.0, 1.0]]);
    }

    #[test]
    fn hyperparameters_come_from_configuration() {
        let mut config = ConfigStore::new();
        config.bind("LogisticClassifier.l2", 0.25);
        config.bind("LogisticClassifier.max_iter", 7_i64);
        let model = LogisticClassifier::from_config(&config).unwrap();
        assert_eq!(model.l2, 0.25);
        assert_eq!(model.max_iter, 7);
        assert_eq!(model.tolerance, 1e-8);
    }
}
