//! # Regularized Regression Estimators
//!
//! The closed set of regression models available to the search. Each
//! [`Estimator`] is an unfitted description of a model with its
//! hyperparameters; [`Estimator::fit`] returns a [`FittedModel`] that can
//! predict on new rows.
//!
//! - **Ridge:** `||y - Xw - b||^2 + alpha ||w||^2`, intercept by centering.
//! - **Lasso:** `(1 / 2n) ||y - Xw - b||^2 + alpha ||w||_1`, cyclic coordinate
//!   descent with soft thresholding, stopped on the duality gap.
//! - **Kernel ridge:** dual coefficients `(K + alpha I)^-1 y`, no intercept.
//! - **Support vector regression:** epsilon-insensitive loss with box
//!   constraint `C`, solved in the dual by sequential minimal optimization
//!   with second-order working set selection. The bias comes from the KKT
//!   conditions at the optimum.
//!
//! An iterative solver that exhausts its iteration cap is an error, never a
//! silently returned approximation.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::Solve;
use thiserror::Error;

const LASSO_MAX_SWEEPS: usize = 10_000;
/// Relative to `||y - mean(y)||^2` for the duality gap, and to the largest
/// coefficient for the cheaper per-sweep change check.
const LASSO_TOLERANCE: f64 = 1e-4;
/// Largest tolerated KKT violation of the SVR dual.
const SVR_TOLERANCE: f64 = 1e-3;
const SVR_MIN_ITERATION_CAP: usize = 10_000_000;
const CURVATURE_FLOOR: f64 = 1e-12;

/// Width of the insensitive tube for support vector regression.
pub const SVR_EPSILON: f64 = 0.1;

#[derive(Error, Debug)]
pub enum EstimatorError {
    #[error("A linear system solve failed while fitting {model}. The system may be singular: {source}")]
    LinearSystemSolveFailed {
        model: &'static str,
        source: ndarray_linalg::error::LinalgError,
    },

    #[error(
        "{model} did not converge within {max_iterations} iterations. The remaining optimality gap was {gap:.6e}."
    )]
    DidNotConverge {
        model: &'static str,
        max_iterations: usize,
        gap: f64,
    },

    #[error("Training matrix has {rows} rows but the target has {targets} values.")]
    ShapeMismatch { rows: usize, targets: usize },

    #[error("Cannot fit a model on an empty training set.")]
    EmptyTrainingSet,

    #[error("The model was fitted on {expected} features but prediction data has {found}.")]
    FeatureMismatch { expected: usize, found: usize },

    #[error("Hyperparameter '{name}' must be positive and finite, got {value}.")]
    InvalidHyperparameter { name: &'static str, value: f64 },
}

/// Kernel function for the kernel-based estimators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    Linear,
    Rbf { gamma: f64 },
}

impl Kernel {
    /// Gram matrix between the rows of `a` and the rows of `b`.
    pub fn gram(&self, a: ArrayView2<f64>, b: ArrayView2<f64>) -> Array2<f64> {
        let cross = a.dot(&b.t());
        match *self {
            Kernel::Linear => cross,
            Kernel::Rbf { gamma } => {
                let a_norms = a.map_axis(Axis(1), |row| row.dot(&row));
                let b_norms = b.map_axis(Axis(1), |row| row.dot(&row));
                let mut gram = cross;
                for ((i, j), value) in gram.indexed_iter_mut() {
                    let sq_dist = (a_norms[i] + b_norms[j] - 2.0 * *value).max(0.0);
                    *value = (-gamma * sq_dist).exp();
                }
                gram
            }
        }
    }
}

/// An unfitted regression model with fixed hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Estimator {
    Ridge { alpha: f64 },
    Lasso { alpha: f64 },
    KernelRidge { alpha: f64, kernel: Kernel },
    Svr { c: f64, epsilon: f64, kernel: Kernel },
}

impl Estimator {
    pub fn name(&self) -> &'static str {
        match self {
            Estimator::Ridge { .. } => "ridge regression",
            Estimator::Lasso { .. } => "lasso regression",
            Estimator::KernelRidge { .. } => "kernel ridge regression",
            Estimator::Svr { .. } => "support vector regression",
        }
    }

    /// Checks that every hyperparameter is usable.
    pub fn validate(&self) -> Result<(), EstimatorError> {
        fn positive(name: &'static str, value: f64) -> Result<(), EstimatorError> {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(EstimatorError::InvalidHyperparameter { name, value })
            }
        }
        fn kernel_ok(kernel: Kernel) -> Result<(), EstimatorError> {
            match kernel {
                Kernel::Linear => Ok(()),
                Kernel::Rbf { gamma } => positive("gamma", gamma),
            }
        }

        match *self {
            Estimator::Ridge { alpha } | Estimator::Lasso { alpha } => positive("alpha", alpha),
            Estimator::KernelRidge { alpha, kernel } => {
                positive("alpha", alpha)?;
                kernel_ok(kernel)
            }
            Estimator::Svr { c, epsilon, kernel } => {
                positive("C", c)?;
                if !(epsilon.is_finite() && epsilon >= 0.0) {
                    return Err(EstimatorError::InvalidHyperparameter {
                        name: "epsilon",
                        value: epsilon,
                    });
                }
                kernel_ok(kernel)
            }
        }
    }

    pub fn fit(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<FittedModel, EstimatorError> {
        if x.nrows() != y.len() {
            return Err(EstimatorError::ShapeMismatch {
                rows: x.nrows(),
                targets: y.len(),
            });
        }
        if x.nrows() == 0 {
            return Err(EstimatorError::EmptyTrainingSet);
        }
        self.validate()?;

        let model = match *self {
            Estimator::Ridge { alpha } => FittedModel::Linear(fit_ridge(x, y, alpha)?),
            Estimator::Lasso { alpha } => FittedModel::Linear(fit_lasso(x, y, alpha)?),
            Estimator::KernelRidge { alpha, kernel } => {
                FittedModel::Kernel(fit_kernel_ridge(x, y, alpha, kernel)?)
            }
            Estimator::Svr { c, epsilon, kernel } => {
                FittedModel::Kernel(fit_svr(x, y, c, epsilon, kernel)?)
            }
        };
        Ok(model)
    }
}

/// `y = x . coef + intercept`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    pub coef: Array1<f64>,
    pub intercept: f64,
}

/// `y = sum_i dual_coef[i] * K(support[i], x) + offset`.
#[derive(Debug, Clone)]
pub struct KernelModel {
    pub kernel: Kernel,
    pub support: Array2<f64>,
    pub dual_coef: Array1<f64>,
    pub offset: f64,
}

#[derive(Debug, Clone)]
pub enum FittedModel {
    Linear(LinearModel),
    Kernel(KernelModel),
}

impl FittedModel {
    pub fn n_features(&self) -> usize {
        match self {
            FittedModel::Linear(model) => model.coef.len(),
            FittedModel::Kernel(model) => model.support.ncols(),
        }
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, EstimatorError> {
        if x.ncols() != self.n_features() {
            return Err(EstimatorError::FeatureMismatch {
                expected: self.n_features(),
                found: x.ncols(),
            });
        }
        let predictions = match self {
            FittedModel::Linear(model) => x.dot(&model.coef) + model.intercept,
            FittedModel::Kernel(model) => {
                model
                    .kernel
                    .gram(x, model.support.view())
                    .dot(&model.dual_coef)
                    + model.offset
            }
        };
        Ok(predictions)
    }
}

/// Column means of `x`, the centred copy of `x`, the mean of `y` and the
/// centred copy of `y`.
fn center(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
) -> (Array1<f64>, Array2<f64>, f64, Array1<f64>) {
    let n = x.nrows() as f64;
    let x_mean = x.sum_axis(Axis(0)) / n;
    let y_mean = y.sum() / n;
    let x_centered = &x - &x_mean;
    let y_centered = y.mapv(|v| v - y_mean);
    (x_mean, x_centered, y_mean, y_centered)
}

fn fit_ridge(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> Result<LinearModel, EstimatorError> {
    let (x_mean, xc, y_mean, yc) = center(x, y);
    let mut gram = xc.t().dot(&xc);
    gram.diag_mut().mapv_inplace(|d| d + alpha);
    let rhs = xc.t().dot(&yc);
    let coef = gram
        .solve(&rhs)
        .map_err(|source| EstimatorError::LinearSystemSolveFailed {
            model: "ridge regression",
            source,
        })?;
    let intercept = y_mean - x_mean.dot(&coef);
    Ok(LinearModel { coef, intercept })
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    value.signum() * (value.abs() - threshold).max(0.0)
}

/// Duality gap of `0.5 ||y - Xw||^2 + penalty ||w||_1` at `coef`, where
/// `residual = y - Xw`.
fn lasso_duality_gap(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    residual: ArrayView1<f64>,
    coef: ArrayView1<f64>,
    penalty: f64,
) -> f64 {
    let dual_norm = x
        .t()
        .dot(&residual)
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let residual_norm2 = residual.dot(&residual);
    // The residual is rescaled into the dual feasible set when it leaves it.
    let (scale, gap) = if dual_norm > penalty {
        let scale = penalty / dual_norm;
        (scale, 0.5 * residual_norm2 * (1.0 + scale * scale))
    } else {
        (1.0, residual_norm2)
    };
    let l1_norm = coef.fold(0.0, |acc, v| acc + v.abs());
    gap + penalty * l1_norm - scale * residual.dot(&y)
}

fn fit_lasso(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> Result<LinearModel, EstimatorError> {
    let (x_mean, xc, y_mean, yc) = center(x, y);
    let n_features = xc.ncols();
    let penalty = alpha * xc.nrows() as f64;
    let gap_tolerance = LASSO_TOLERANCE * yc.dot(&yc);
    let column_norms: Array1<f64> = xc.axis_iter(Axis(1)).map(|col| col.dot(&col)).collect();

    let mut coef = Array1::<f64>::zeros(n_features);
    let mut residual = yc.clone();
    let mut gap = f64::INFINITY;

    for sweep in 0..LASSO_MAX_SWEEPS {
        let mut max_change: f64 = 0.0;
        let mut max_coef: f64 = 0.0;
        for j in 0..n_features {
            let norm = column_norms[j];
            let old = coef[j];
            let column = xc.column(j);
            let updated = if norm > 0.0 {
                let rho = column.dot(&residual) + norm * old;
                soft_threshold(rho, penalty) / norm
            } else {
                0.0
            };
            let delta = updated - old;
            if delta != 0.0 {
                residual.scaled_add(-delta, &column);
                coef[j] = updated;
            }
            max_change = max_change.max(delta.abs());
            max_coef = max_coef.max(updated.abs());
        }

        // The gap costs a full pass over the data, so it is only checked once
        // the coefficients have settled.
        let settled = max_coef == 0.0 || max_change / max_coef < LASSO_TOLERANCE;
        if settled || sweep + 1 == LASSO_MAX_SWEEPS {
            gap = lasso_duality_gap(xc.view(), yc.view(), residual.view(), coef.view(), penalty);
            if gap <= gap_tolerance {
                log::trace!("Lasso converged after {} sweeps (gap {gap:.3e})", sweep + 1);
                let intercept = y_mean - x_mean.dot(&coef);
                return Ok(LinearModel { coef, intercept });
            }
        }
    }

    Err(EstimatorError::DidNotConverge {
        model: "lasso regression",
        max_iterations: LASSO_MAX_SWEEPS,
        gap,
    })
}

fn fit_kernel_ridge(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    alpha: f64,
    kernel: Kernel,
) -> Result<KernelModel, EstimatorError> {
    let mut gram = kernel.gram(x, x);
    gram.diag_mut().mapv_inplace(|d| d + alpha);
    let dual_coef = gram
        .solve(&y.to_owned())
        .map_err(|source| EstimatorError::LinearSystemSolveFailed {
            model: "kernel ridge regression",
            source,
        })?;
    Ok(KernelModel {
        kernel,
        support: x.to_owned(),
        dual_coef,
        offset: 0.0,
    })
}

/// Dual of epsilon-insensitive support vector regression over `2n` variables:
/// `alpha[s]` pushes sample `s` up and `alpha[s + n]` pushes it down.
///
/// Minimizes `0.5 a'Qa + p'a` subject to `0 <= a <= C` and
/// `sum(a[..n]) = sum(a[n..])`, with `Q[t][u] = sign(t) sign(u) K(t, u)`,
/// `p[s] = epsilon - y[s]` and `p[s + n] = epsilon + y[s]`.
struct SvrDual {
    n: usize,
    /// Row-major `n x n` kernel matrix.
    gram: Vec<f64>,
    c: f64,
    alpha: Vec<f64>,
    grad: Vec<f64>,
}

/// Pair of dual variables to optimize next, or `None` once the maximal
/// violating pair is within tolerance.
struct WorkingSet {
    pair: Option<(usize, usize)>,
    gap: f64,
}

impl SvrDual {
    fn new(gram: &Array2<f64>, y: ArrayView1<f64>, c: f64, epsilon: f64) -> Self {
        let n = y.len();
        let grad = y
            .iter()
            .map(|&target| epsilon - target)
            .chain(y.iter().map(|&target| epsilon + target))
            .collect();
        Self {
            n,
            gram: gram.iter().copied().collect(),
            c,
            alpha: vec![0.0; 2 * n],
            grad,
        }
    }

    fn sign(&self, t: usize) -> f64 {
        if t < self.n { 1.0 } else { -1.0 }
    }

    fn kernel(&self, t: usize, u: usize) -> f64 {
        self.gram[(t % self.n) * self.n + u % self.n]
    }

    fn at_upper(&self, t: usize) -> bool {
        self.alpha[t] >= self.c
    }

    fn at_lower(&self, t: usize) -> bool {
        self.alpha[t] <= 0.0
    }

    /// Second-order working set selection (Fan, Chen and Lin, 2005).
    fn select_working_set(&self) -> WorkingSet {
        let len = 2 * self.n;
        let mut g_max = f64::NEG_INFINITY;
        let mut first = None;
        for t in 0..len {
            let candidate = if self.sign(t) > 0.0 {
                (!self.at_upper(t)).then(|| -self.grad[t])
            } else {
                (!self.at_lower(t)).then(|| self.grad[t])
            };
            match candidate {
                Some(value) if value >= g_max => {
                    g_max = value;
                    first = Some(t);
                }
                _ => {}
            }
        }
        let Some(i) = first else {
            return WorkingSet { pair: None, gap: 0.0 };
        };

        let mut g_max2 = f64::NEG_INFINITY;
        let mut second = None;
        let mut best_decrease = f64::INFINITY;
        for t in 0..len {
            let grad_diff = if self.sign(t) > 0.0 {
                if self.at_lower(t) {
                    continue;
                }
                g_max2 = g_max2.max(self.grad[t]);
                g_max + self.grad[t]
            } else {
                if self.at_upper(t) {
                    continue;
                }
                g_max2 = g_max2.max(-self.grad[t]);
                g_max - self.grad[t]
            };
            if grad_diff > 0.0 {
                let curvature = positive_curvature(
                    self.kernel(i, i) + self.kernel(t, t) - 2.0 * self.kernel(i, t),
                );
                let decrease = -(grad_diff * grad_diff) / curvature;
                if decrease <= best_decrease {
                    best_decrease = decrease;
                    second = Some(t);
                }
            }
        }

        let gap = g_max + g_max2;
        let pair = second.filter(|_| gap >= SVR_TOLERANCE).map(|j| (i, j));
        WorkingSet { pair, gap }
    }

    /// Analytic minimization over the pair, clipped to the box.
    fn update_pair(&mut self, i: usize, j: usize) {
        let c = self.c;
        let (old_i, old_j) = (self.alpha[i], self.alpha[j]);
        let curvature =
            positive_curvature(self.kernel(i, i) + self.kernel(j, j) - 2.0 * self.kernel(i, j));
        let (sign_i, sign_j) = (self.sign(i), self.sign(j));
        let (grad_i, grad_j) = (self.grad[i], self.grad[j]);
        let alpha = &mut self.alpha;

        if sign_i != sign_j {
            let delta = (-grad_i - grad_j) / curvature;
            let diff = old_i - old_j;
            alpha[i] += delta;
            alpha[j] += delta;
            if diff > 0.0 {
                if alpha[j] < 0.0 {
                    alpha[j] = 0.0;
                    alpha[i] = diff;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = -diff;
            }
            if diff > 0.0 {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = c - diff;
                }
            } else if alpha[j] > c {
                alpha[j] = c;
                alpha[i] = c + diff;
            }
        } else {
            let delta = (grad_i - grad_j) / curvature;
            let sum = old_i + old_j;
            alpha[i] -= delta;
            alpha[j] += delta;
            if sum > c {
                if alpha[i] > c {
                    alpha[i] = c;
                    alpha[j] = sum - c;
                }
            } else if alpha[j] < 0.0 {
                alpha[j] = 0.0;
                alpha[i] = sum;
            }
            if sum > c {
                if alpha[j] > c {
                    alpha[j] = c;
                    alpha[i] = sum - c;
                }
            } else if alpha[i] < 0.0 {
                alpha[i] = 0.0;
                alpha[j] = sum;
            }
        }

        let step_i = sign_i * (self.alpha[i] - old_i);
        let step_j = sign_j * (self.alpha[j] - old_j);
        let (row_i, row_j) = ((i % self.n) * self.n, (j % self.n) * self.n);
        for s in 0..self.n {
            let change = step_i * self.gram[row_i + s] + step_j * self.gram[row_j + s];
            self.grad[s] += change;
            self.grad[s + self.n] -= change;
        }
    }

    /// Bias from the free variables, or the midpoint of the feasible interval
    /// when every variable sits at a bound.
    fn rho(&self) -> f64 {
        let mut upper = f64::INFINITY;
        let mut lower = f64::NEG_INFINITY;
        let mut free_sum = 0.0;
        let mut free_count = 0usize;
        for t in 0..2 * self.n {
            let signed_grad = self.sign(t) * self.grad[t];
            let positive = self.sign(t) > 0.0;
            if self.at_upper(t) {
                if positive {
                    lower = lower.max(signed_grad);
                } else {
                    upper = upper.min(signed_grad);
                }
            } else if self.at_lower(t) {
                if positive {
                    upper = upper.min(signed_grad);
                } else {
                    lower = lower.max(signed_grad);
                }
            } else {
                free_count += 1;
                free_sum += signed_grad;
            }
        }
        if free_count > 0 {
            free_sum / free_count as f64
        } else {
            (upper + lower) / 2.0
        }
    }

    fn coefficients(&self) -> Array1<f64> {
        (0..self.n)
            .map(|s| self.alpha[s] - self.alpha[s + self.n])
            .collect()
    }
}

fn positive_curvature(value: f64) -> f64 {
    if value > 0.0 { value } else { CURVATURE_FLOOR }
}

fn fit_svr(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    c: f64,
    epsilon: f64,
    kernel: Kernel,
) -> Result<KernelModel, EstimatorError> {
    let gram = kernel.gram(x, x);
    let mut dual = SvrDual::new(&gram, y, c, epsilon);
    let max_iterations = SVR_MIN_ITERATION_CAP.max(200 * x.nrows());

    let mut gap = f64::INFINITY;
    for iteration in 0..max_iterations {
        let selection = dual.select_working_set();
        gap = selection.gap;
        let Some((i, j)) = selection.pair else {
            log::trace!("SVR converged after {iteration} iterations (gap {gap:.3e})");
            return Ok(KernelModel {
                kernel,
                support: x.to_owned(),
                dual_coef: dual.coefficients(),
                offset: -dual.rho(),
            });
        };
        dual.update_pair(i, j);
    }

    Err(EstimatorError::DidNotConverge {
        model: "support vector regression",
        max_iterations,
        gap,
    })
}
