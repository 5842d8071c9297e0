//! Gaussian-process surrogate used by the optimizer.
//!
//! Inputs live in the unit hypercube. The kernel is Matern 5/2 with one length-scale per
//! dimension (ARD) and unit signal variance; targets are standardised before fitting.
//! Length-scales are chosen by minimising the negative log marginal likelihood over
//! `log(length_scale)` with BFGS.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Zip};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{FactorizeC, InverseC, SolveC, UPLO};
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// Added to the kernel diagonal on top of the observation noise.
const JITTER: f64 = 1e-6;
/// Log length-scales are kept in `[-LOG_SCALE_BOUND, LOG_SCALE_BOUND]`.
const LOG_SCALE_BOUND: f64 = 5.0;
const SQRT_5: f64 = 2.236_067_977_499_79;

pub(crate) struct GaussianProcess {
    train_x: Array2<f64>,
    length_scales: Array1<f64>,
    alpha: Array1<f64>,
    k_inv: Array2<f64>,
    y_mean: f64,
    y_std: f64,
}

/// Factorisation of the kernel matrix at one set of length-scales.
struct KernelFit {
    alpha: Array1<f64>,
    k_inv: Array2<f64>,
    log_det: f64,
}

fn scaled_distance(a: ArrayView1<f64>, b: ArrayView1<f64>, length_scales: &Array1<f64>) -> f64 {
    let mut r2 = 0.0;
    Zip::from(a).and(b).and(length_scales).for_each(|&a, &b, &l| {
        let d = (a - b) / l;
        r2 += d * d;
    });
    r2.sqrt()
}

fn matern52(r: f64) -> f64 {
    let s = SQRT_5 * r;
    (1.0 + s + s * s / 3.0) * (-s).exp()
}

fn kernel_matrix(x: ArrayView2<f64>, length_scales: &Array1<f64>, diagonal: f64) -> Array2<f64> {
    let n = x.nrows();
    let mut k = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        k[[i, i]] = 1.0 + diagonal;
        for j in 0..i {
            let v = matern52(scaled_distance(x.row(i), x.row(j), length_scales));
            k[[i, j]] = v;
            k[[j, i]] = v;
        }
    }
    k
}

fn factorize(
    x: ArrayView2<f64>,
    y: &Array1<f64>,
    length_scales: &Array1<f64>,
    diagonal: f64,
) -> Result<KernelFit, LinalgError> {
    let k = kernel_matrix(x, length_scales, diagonal);
    let chol = k.factorizec(UPLO::Lower)?;
    let log_det = 2.0 * chol.factor.diag().mapv(f64::ln).sum();
    let alpha = chol.solvec(y)?;
    let k_inv = chol.invc()?;
    Ok(KernelFit {
        alpha,
        k_inv,
        log_det,
    })
}

/// Negative log marginal likelihood and its gradient with respect to the log
/// length-scales.
fn nlml_and_gradient(
    x: ArrayView2<f64>,
    y: &Array1<f64>,
    log_scales: &Array1<f64>,
    diagonal: f64,
) -> Result<(f64, Array1<f64>), LinalgError> {
    let length_scales = log_scales.mapv(f64::exp);
    let fit = factorize(x, y, &length_scales, diagonal)?;
    let n = x.nrows();
    let cost = 0.5 * y.dot(&fit.alpha)
        + 0.5 * fit.log_det
        + 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();

    // dK_ij / dlog(l_d) = 5/3 (1 + sqrt5 r) exp(-sqrt5 r) (dx_d / l_d)^2
    let mut gradient = Array1::<f64>::zeros(log_scales.len());
    for i in 0..n {
        for j in 0..i {
            let r = scaled_distance(x.row(i), x.row(j), &length_scales);
            let common = 5.0 / 3.0 * (1.0 + SQRT_5 * r) * (-SQRT_5 * r).exp();
            let weight = fit.alpha[i] * fit.alpha[j] - fit.k_inv[[i, j]];
            for d in 0..log_scales.len() {
                let scaled = (x[[i, d]] - x[[j, d]]) / length_scales[d];
                // Off-diagonal pairs appear twice in the trace.
                gradient[d] -= weight * common * scaled * scaled;
            }
        }
    }
    Ok((cost, gradient))
}

impl GaussianProcess {
    /// Fits the surrogate to `(x, y)`. `x` must be in the unit hypercube.
    pub(crate) fn fit(x: Array2<f64>, y: &Array1<f64>, noise: f64) -> Result<Self, LinalgError> {
        let y_mean = y.mean().unwrap_or(0.0);
        let spread = y.std(0.0);
        let y_std = if spread > 1e-12 { spread } else { 1.0 };
        let targets = y.mapv(|v| (v - y_mean) / y_std);
        let diagonal = noise + JITTER;

        let initial = Array1::<f64>::zeros(x.ncols());
        let (x_search, y_search) = (x.clone(), targets.clone());
        let cost_and_grad = move |log_scales: &Array1<f64>| -> (f64, Array1<f64>) {
            let safe = log_scales.mapv(|v| v.clamp(-LOG_SCALE_BOUND, LOG_SCALE_BOUND));
            match nlml_and_gradient(x_search.view(), &y_search, &safe, diagonal) {
                Ok((cost, gradient)) if cost.is_finite() => (cost, gradient),
                Ok((cost, _)) => {
                    log::debug!("Non-finite marginal likelihood {cost}; returning a large value");
                    (1e10, Array1::zeros(safe.len()))
                }
                Err(e) => {
                    log::debug!("Kernel factorisation failed: {e}; returning a large value");
                    (1e10, Array1::zeros(safe.len()))
                }
            }
        };
        let log_scales = match Bfgs::new(initial.clone(), cost_and_grad)
            .with_tolerance(1e-6)
            .with_max_iterations(50)
            .run()
        {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) => {
                log::trace!(
                    "Length-scale search finished in {iterations} iterations at {final_value:.4}"
                );
                final_point.mapv(|v| v.clamp(-LOG_SCALE_BOUND, LOG_SCALE_BOUND))
            }
            Err(e) => {
                log::debug!("Length-scale search failed ({e:?}); using unit length-scales");
                initial
            }
        };

        let length_scales = log_scales.mapv(f64::exp);
        let fit = factorize(x.view(), &targets, &length_scales, diagonal)?;
        Ok(Self {
            train_x: x,
            length_scales,
            alpha: fit.alpha,
            k_inv: fit.k_inv,
            y_mean,
            y_std,
        })
    }

    /// Posterior mean and standard deviation at `point`, in standardised units.
    pub(crate) fn predict_standardized(&self, point: ArrayView1<f64>) -> (f64, f64) {
        let k_star: Array1<f64> = self
            .train_x
            .rows()
            .into_iter()
            .map(|row| matern52(scaled_distance(row, point, &self.length_scales)))
            .collect();
        let mean = k_star.dot(&self.alpha);
        let variance = 1.0 - k_star.dot(&self.k_inv.dot(&k_star));
        (mean, variance.max(1e-12).sqrt())
    }

    /// Maps an observed loss into the standardised units of the surrogate.
    pub(crate) fn standardize(&self, y: f64) -> f64 {
        (y - self.y_mean) / self.y_std
    }
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Expected improvement below `best` for a minimisation problem.
pub(crate) fn expected_improvement(mean: f64, std: f64, best: f64, xi: f64) -> f64 {
    let improvement = best - mean - xi;
    if std <= 0.0 {
        return improvement.max(0.0);
    }
    let z = improvement / std;
    improvement * normal_cdf(z) + std * normal_pdf(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn erf_matches_reference_values() {
        assert_abs_diff_eq!(erf(0.0), 0.0, epsilon = 1e-7);
        assert_abs_diff_eq!(erf(0.5), 0.520_499_877_8, epsilon = 1e-6);
        assert_abs_diff_eq!(erf(-1.0), -0.842_700_792_9, epsilon = 1e-6);
        assert_abs_diff_eq!(normal_cdf(0.0), 0.5, epsilon = 1e-7);
    }

    #[test]
    fn kernel_is_one_on_the_diagonal_and_decays() {
        assert_abs_diff_eq!(matern52(0.0), 1.0);
        assert!(matern52(0.5) > matern52(1.0));
        let k = kernel_matrix(array![[0.0], [0.5]].view(), &array![1.0], 0.0);
        assert_abs_diff_eq!(k[[0, 1]], k[[1, 0]]);
        assert_abs_diff_eq!(k[[0, 0]], 1.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let x = array![[0.1, 0.9], [0.4, 0.2], [0.7, 0.6], [0.95, 0.05]];
        let y = array![0.3, -1.2, 0.8, 0.1];
        let theta = array![-0.3, 0.2];
        let (_, gradient) = nlml_and_gradient(x.view(), &y, &theta, 1e-6).unwrap();
        let h = 1e-5;
        for d in 0..theta.len() {
            let mut up = theta.clone();
            up[d] += h;
            let mut down = theta.clone();
            down[d] -= h;
            let (f_up, _) = nlml_and_gradient(x.view(), &y, &up, 1e-6).unwrap();
            let (f_down, _) = nlml_and_gradient(x.view(), &y, &down, 1e-6).unwrap();
            assert_abs_diff_eq!(gradient[d], (f_up - f_down) / (2.0 * h), epsilon = 1e-4);
        }
    }

    #[test]
    fn posterior_interpolates_observations() {
        let x = array![[0.0], [0.25], [0.5], [0.75], [1.0]];
        let y = array![1.0, 0.2, 0.0, 0.3, 1.1];
        let gp = GaussianProcess::fit(x.clone(), &y, 1e-10).unwrap();
        for (row, &target) in x.rows().into_iter().zip(y.iter()) {
            let (mean, std) = gp.predict_standardized(row);
            assert_abs_diff_eq!(mean, gp.standardize(target), epsilon = 1e-2);
            assert!(std < 0.05);
        }
    }

    #[test]
    fn improvement_prefers_low_mean_and_high_uncertainty() {
        let best = 0.0;
        assert!(expected_improvement(-1.0, 0.1, best, 0.01) > expected_improvement(1.0, 0.1, best, 0.01));
        assert!(expected_improvement(0.5, 2.0, best, 0.01) > expected_improvement(0.5, 0.1, best, 0.01));
        assert!(expected_improvement(3.0, 1e-9, best, 0.01) >= 0.0);
    }
}
