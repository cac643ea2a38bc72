//! # Per-Fold Feature Transforms
//!
//! Standardization and principal component analysis are always fitted on a
//! training fold and then applied to that fold's held-out rows. The fitted
//! parameters live inside a [`FoldTransform`] that is created for one fold and
//! dropped with it, so no statistic computed on test rows can leak into a fit.
//!
//! [`select_components`] answers the separate question of how many components
//! are needed to retain a target fraction of the total variance.

use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::{Eigh, UPLO};
use thiserror::Error;

/// Scales below this are treated as constant columns and left unscaled.
const CONSTANT_SCALE_EPSILON: f64 = 10.0 * f64::EPSILON;

/// Slack applied to the cumulative variance comparison so that a threshold of
/// exactly 1.0 is reachable despite rounding in the eigenvalue sum.
const CUMULATIVE_VARIANCE_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("Cannot fit a transform on an empty matrix ({rows} rows x {cols} columns).")]
    EmptyInput { rows: usize, cols: usize },

    #[error("The transform was fitted on {expected} columns but received {found}.")]
    ColumnMismatch { expected: usize, found: usize },

    #[error("Principal component analysis requires at least two samples, found {0}.")]
    TooFewSamples(usize),

    #[error("Requested {requested} principal components but at most {available} are available.")]
    TooManyComponents { requested: usize, available: usize },

    #[error("At least one principal component must be requested.")]
    NoComponents,

    #[error("Variance threshold must lie in (0, 1], got {0}.")]
    InvalidThreshold(f64),

    #[error("The input has zero total variance; principal components are undefined.")]
    ZeroVariance,

    #[error("Eigendecomposition of the covariance matrix failed: {0}")]
    EigendecompositionFailed(#[from] ndarray_linalg::error::LinalgError),
}

fn check_non_empty(x: ArrayView2<f64>) -> Result<(), TransformError> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(TransformError::EmptyInput {
            rows: x.nrows(),
            cols: x.ncols(),
        });
    }
    Ok(())
}

fn check_columns(expected: usize, x: ArrayView2<f64>) -> Result<(), TransformError> {
    if x.ncols() != expected {
        return Err(TransformError::ColumnMismatch {
            expected,
            found: x.ncols(),
        });
    }
    Ok(())
}

/// Zero-mean, unit-variance scaling using the population standard deviation.
#[derive(Debug, Clone)]
pub struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    pub fn fit(x: ArrayView2<f64>) -> Result<Self, TransformError> {
        check_non_empty(x)?;
        let n = x.nrows() as f64;
        let mean = x.sum_axis(Axis(0)) / n;
        let scale = x
            .axis_iter(Axis(1))
            .zip(mean.iter())
            .map(|(column, &mu)| {
                let variance = column.iter().map(|&v| (v - mu).powi(2)).sum::<f64>() / n;
                let sd = variance.sqrt();
                if sd < CONSTANT_SCALE_EPSILON { 1.0 } else { sd }
            })
            .collect();
        Ok(Self { mean, scale })
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        check_columns(self.mean.len(), x)?;
        Ok((&x - &self.mean) / &self.scale)
    }

    pub fn fit_transform(x: ArrayView2<f64>) -> Result<(Self, Array2<f64>), TransformError> {
        let scaler = Self::fit(x)?;
        let transformed = scaler.transform(x)?;
        Ok((scaler, transformed))
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }
}

/// Principal component analysis via the eigendecomposition of the sample
/// covariance matrix.
#[derive(Debug, Clone)]
pub struct Pca {
    mean: Array1<f64>,
    /// Shape `[n_features, n_components]`, one principal axis per column.
    components: Array2<f64>,
    /// Variance along every available axis, descending.
    explained_variance: Array1<f64>,
    total_variance: f64,
}

impl Pca {
    /// Fits the leading `n_components` axes. At most `min(n_samples, n_features)`
    /// components can be requested.
    pub fn fit(x: ArrayView2<f64>, n_components: usize) -> Result<Self, TransformError> {
        check_non_empty(x)?;
        let (n_samples, n_features) = x.dim();
        if n_samples < 2 {
            return Err(TransformError::TooFewSamples(n_samples));
        }
        if n_components == 0 {
            return Err(TransformError::NoComponents);
        }
        let available = n_samples.min(n_features);
        if n_components > available {
            return Err(TransformError::TooManyComponents {
                requested: n_components,
                available,
            });
        }

        let mean = x.sum_axis(Axis(0)) / n_samples as f64;
        let centered = &x - &mean;
        let covariance = centered.t().dot(&centered) / (n_samples - 1) as f64;

        // eigh returns ascending eigenvalues; flip to descending.
        let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Lower)?;
        let explained_variance: Array1<f64> = eigenvalues
            .slice(s![..;-1])
            .iter()
            .take(available)
            .map(|&lambda| lambda.max(0.0))
            .collect();
        let total_variance: f64 = eigenvalues.iter().map(|&lambda| lambda.max(0.0)).sum();
        if total_variance <= 0.0 {
            return Err(TransformError::ZeroVariance);
        }

        let components = eigenvectors
            .slice(s![.., ..;-1])
            .slice(s![.., ..n_components])
            .to_owned();

        Ok(Self {
            mean,
            components,
            explained_variance,
            total_variance,
        })
    }

    pub fn n_components(&self) -> usize {
        self.components.ncols()
    }

    /// Fraction of total variance carried by each available axis, descending.
    pub fn explained_variance_ratio(&self) -> Array1<f64> {
        &self.explained_variance / self.total_variance
    }

    /// Cumulative variance fraction retained by the fitted components.
    pub fn retained_variance(&self) -> f64 {
        self.explained_variance
            .iter()
            .take(self.n_components())
            .sum::<f64>()
            / self.total_variance
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        check_columns(self.mean.len(), x)?;
        Ok((&x - &self.mean).dot(&self.components))
    }
}

/// Outcome of choosing a component count for a variance threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentSelection {
    pub n_components: usize,
    pub achieved_variance: f64,
}

/// Finds the smallest number of principal components whose cumulative
/// explained-variance ratio reaches `variance_threshold`.
///
/// The input is expected to be standardized already.
pub fn select_components(
    standardized: ArrayView2<f64>,
    variance_threshold: f64,
) -> Result<ComponentSelection, TransformError> {
    if !(variance_threshold > 0.0 && variance_threshold <= 1.0) {
        return Err(TransformError::InvalidThreshold(variance_threshold));
    }
    check_non_empty(standardized)?;
    let available = standardized.nrows().min(standardized.ncols());
    let pca = Pca::fit(standardized, available)?;

    let mut cumulative = 0.0;
    let mut selection = ComponentSelection {
        n_components: available,
        achieved_variance: 0.0,
    };
    for (idx, ratio) in pca.explained_variance_ratio().iter().enumerate() {
        cumulative += ratio;
        selection = ComponentSelection {
            n_components: idx + 1,
            achieved_variance: cumulative,
        };
        if cumulative >= variance_threshold - CUMULATIVE_VARIANCE_TOLERANCE {
            break;
        }
    }

    log::debug!(
        "Selected {} of {} components retaining {:.4} of the variance (threshold {:.2})",
        selection.n_components,
        available,
        selection.achieved_variance,
        variance_threshold
    );
    Ok(selection)
}

/// Dimensionality reduction applied after standardization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    None,
    Components(usize),
}

/// The fitted transforms of one training fold.
#[derive(Debug, Clone)]
pub struct FoldTransform {
    scaler: Standardizer,
    pca: Option<Pca>,
}

impl FoldTransform {
    /// Fits the standardizer, then the optional PCA, on the training rows only.
    pub fn fit(train: ArrayView2<f64>, reduction: Reduction) -> Result<Self, TransformError> {
        let (scaler, scaled) = Standardizer::fit_transform(train)?;
        let pca = match reduction {
            Reduction::None => None,
            Reduction::Components(k) => Some(Pca::fit(scaled.view(), k)?),
        };
        Ok(Self { scaler, pca })
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        let scaled = self.scaler.transform(x)?;
        match &self.pca {
            Some(pca) => pca.transform(scaled.view()),
            None => Ok(scaled),
        }
    }

    /// Variance fraction kept by the reduction step; 1.0 without one.
    pub fn retained_variance(&self) -> f64 {
        self.pca.as_ref().map_or(1.0, Pca::retained_variance)
    }

    pub fn scaler(&self) -> &Standardizer {
        &self.scaler
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng))
    }

    #[test]
    fn standardizer_centres_and_scales_columns() {
        let x = array![[1.0, 10.0], [2.0, 20.0], [3.0, 30.0], [4.0, 40.0]];
        let (scaler, z) = Standardizer::fit_transform(x.view()).unwrap();
        assert_abs_diff_eq!(scaler.mean()[0], 2.5);
        for column in z.axis_iter(Axis(1)) {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-12);
            let var = column.mapv(|v| v * v).sum() / 4.0;
            assert_abs_diff_eq!(var, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn constant_columns_are_not_divided_by_zero() {
        let x = array![[1.0, 5.0], [2.0, 5.0], [3.0, 5.0]];
        let (scaler, z) = Standardizer::fit_transform(x.view()).unwrap();
        assert_eq!(scaler.scale()[1], 1.0);
        assert!(z.column(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn transform_rejects_wrong_column_count() {
        let scaler = Standardizer::fit(array![[1.0, 2.0], [3.0, 4.0]].view()).unwrap();
        let err = scaler.transform(array![[1.0, 2.0, 3.0]].view()).unwrap_err();
        assert!(matches!(
            err,
            TransformError::ColumnMismatch {
                expected: 2,
                found: 3
            }
        ));
    }

    #[test]
    fn variance_ratios_are_descending_and_sum_to_one() {
        let x = random_matrix(80, 6, 7);
        let (_, z) = Standardizer::fit_transform(x.view()).unwrap();
        let pca = Pca::fit(z.view(), 6).unwrap();
        let ratios = pca.explained_variance_ratio();
        assert_abs_diff_eq!(ratios.sum(), 1.0, epsilon = 1e-10);
        for pair in ratios.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
        assert_abs_diff_eq!(pca.retained_variance(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn selection_returns_the_smallest_sufficient_count() {
        // Three independent columns with variances 9 : 4 : 1 (ratios 9/14, 4/14, 1/14).
        let base = random_matrix(400, 3, 11);
        let (_, white) = Standardizer::fit_transform(base.view()).unwrap();
        let mut x = white.clone();
        x.column_mut(0).mapv_inplace(|v| 3.0 * v);
        x.column_mut(1).mapv_inplace(|v| 2.0 * v);

        let pca = Pca::fit(x.view(), 3).unwrap();
        let ratios = pca.explained_variance_ratio();
        let threshold = ratios[0] + 0.5 * ratios[1];

        let selection = select_components(x.view(), threshold).unwrap();
        assert_eq!(selection.n_components, 2);
        assert!(selection.achieved_variance >= threshold);
        assert!(ratios[0] < threshold);
    }

    #[test]
    fn full_threshold_keeps_every_feature_of_a_full_rank_input() {
        let x = random_matrix(50, 5, 3);
        let (_, z) = Standardizer::fit_transform(x.view()).unwrap();
        let selection = select_components(z.view(), 1.0).unwrap();
        assert_eq!(selection.n_components, 5);
        assert_abs_diff_eq!(selection.achieved_variance, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn thresholds_outside_the_unit_interval_are_rejected() {
        let x = random_matrix(10, 3, 1);
        assert!(matches!(
            select_components(x.view(), 0.0),
            Err(TransformError::InvalidThreshold(_))
        ));
        assert!(matches!(
            select_components(x.view(), 1.5),
            Err(TransformError::InvalidThreshold(_))
        ));
    }

    #[test]
    fn too_many_components_are_rejected() {
        let x = random_matrix(4, 6, 2);
        assert!(matches!(
            Pca::fit(x.view(), 5),
            Err(TransformError::TooManyComponents {
                requested: 5,
                available: 4
            })
        ));
    }

    #[test]
    fn fold_transform_is_fitted_on_training_rows_only() {
        let train = array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]];
        let test = array![[100.0, -50.0]];
        let context = FoldTransform::fit(train.view(), Reduction::Components(1)).unwrap();
        assert_abs_diff_eq!(context.scaler().mean()[0], 2.0);
        assert_abs_diff_eq!(context.scaler().mean()[1], 3.0);

        let projected = context.transform(test.view()).unwrap();
        assert_eq!(projected.dim(), (1, 1));
        // Perfectly correlated columns: one component keeps everything.
        assert_abs_diff_eq!(context.retained_variance(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn projection_preserves_distances_with_all_components() {
        let x = random_matrix(30, 4, 5);
        let pca = Pca::fit(x.view(), 4).unwrap();
        let scores = pca.transform(x.view()).unwrap();
        let d_orig = (&x.row(0) - &x.row(1)).mapv(|v| v * v).sum();
        let d_proj = (&scores.row(0) - &scores.row(1)).mapv(|v| v * v).sum();
        assert_abs_diff_eq!(d_orig, d_proj, epsilon = 1e-9);
    }
}
