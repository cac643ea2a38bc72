//! # Hyperparameter Search and Cross-Validated Evaluation
//!
//! Grid search scores every candidate of an algorithm's grid over a fixed set
//! of folds and keeps the candidate with the highest mean primary-metric
//! score. Two evaluation modes are built on it:
//!
//! - **Nested**: an outer K-fold loop scores a model whose hyperparameters were
//!   chosen by an inner grid search on the outer training rows only.
//! - **Stratified**: a single-level search over outcome-stratified folds with a
//!   PCA reduction sized to a variance threshold on the whole sample.
//!
//! Per-fold transforms are fitted once per fold and shared by every candidate,
//! since they do not depend on the hyperparameters.

use crate::config::{ConfigError, RunSettings};
use crate::data::{DataError, Dataset};
use crate::estimators::{Estimator, EstimatorError};
use crate::folds::{FoldError, FoldSet, build_plain_folds, build_stratified_folds};
use crate::output::OutputError;
use crate::regressors::{Algorithm, HyperGrid, HyperParams, ModelConfiguration, RegistryError};
use crate::scoring::{Metric, ScoreError, ScoreRecord, Scoring, score};
use crate::transform::{
    FoldTransform, Reduction, Standardizer, TransformError, select_components,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use thiserror::Error;

/// Every failure a prediction run can end with.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Fold construction failed: {0}")]
    Fold(#[from] FoldError),
    #[error("Model registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Feature transform failed: {0}")]
    Transform(#[from] TransformError),
    #[error("Model fitting failed: {0}")]
    Estimator(#[from] EstimatorError),
    #[error("Scoring failed: {0}")]
    Score(#[from] ScoreError),
    #[error("Input data error: {0}")]
    Data(#[from] DataError),
    #[error("Invalid run settings: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to write results: {0}")]
    Output(#[from] OutputError),
    #[error("The search grid for {0} has no candidates.")]
    EmptyGrid(Algorithm),
    #[error(
        "Nested cross-validation with {n_splits} folds needs at least {required} samples with an observed target, found {n_samples}."
    )]
    InsufficientData {
        n_samples: usize,
        n_splits: usize,
        required: usize,
    },
}

/// Transformed matrices of one fold, ready for any estimator.
#[derive(Debug, Clone)]
pub(crate) struct PreparedFold {
    pub x_train: Array2<f64>,
    pub y_train: Array1<f64>,
    pub x_test: Array2<f64>,
    pub y_test: Array1<f64>,
    pub retained_variance: f64,
}

/// Fits each fold's transform on its training rows and applies it to both
/// sides of the split.
pub(crate) fn prepare_folds(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    folds: &FoldSet,
    reduction: Reduction,
) -> Result<Vec<PreparedFold>, PipelineError> {
    folds
        .iter()
        .map(|fold| -> Result<PreparedFold, PipelineError> {
            let raw_train = x.select(Axis(0), &fold.train);
            let transform = FoldTransform::fit(raw_train.view(), reduction)?;
            Ok(PreparedFold {
                x_train: transform.transform(raw_train.view())?,
                y_train: y.select(Axis(0), &fold.train),
                x_test: transform.transform(x.select(Axis(0), &fold.test).view())?,
                y_test: y.select(Axis(0), &fold.test),
                retained_variance: transform.retained_variance(),
            })
        })
        .collect()
}

/// Fits `estimator` on every prepared fold and scores the held-out rows.
pub(crate) fn score_folds(
    prepared: &[PreparedFold],
    estimator: &Estimator,
    scoring: &Scoring,
) -> Result<Vec<ScoreRecord>, PipelineError> {
    prepared
        .iter()
        .map(|fold| -> Result<ScoreRecord, PipelineError> {
            let model = estimator.fit(fold.x_train.view(), fold.y_train.view())?;
            let predictions = model.predict(fold.x_test.view())?;
            scoring
                .metrics()
                .map(|metric| -> Result<(Metric, f64), PipelineError> {
                    Ok((
                        metric,
                        score(predictions.view(), fold.y_test.view(), metric)?,
                    ))
                })
                .collect()
        })
        .collect()
}

/// Mean of each metric across folds. A `NaN` in any fold propagates.
fn mean_scores(per_fold: &[ScoreRecord], scoring: &Scoring) -> ScoreRecord {
    let n = per_fold.len() as f64;
    scoring
        .metrics()
        .map(|metric| {
            let total: f64 = per_fold
                .iter()
                .map(|record| record.get(metric).unwrap_or(f64::NAN))
                .sum();
            (metric, total / n)
        })
        .collect()
}

/// Index of the highest score. `NaN` ranks below every number and ties keep
/// the earliest index.
pub(crate) fn best_index(scores: &[f64]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, &value) in scores.iter().enumerate() {
        best = match best {
            None => Some(idx),
            Some(current) => {
                let incumbent = scores[current];
                if !value.is_nan() && (incumbent.is_nan() || value > incumbent) {
                    Some(idx)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// Mean cross-validated scores of one grid candidate.
#[derive(Debug, Clone)]
pub struct CandidateResult {
    pub params: HyperParams,
    pub mean_scores: ScoreRecord,
}

#[derive(Debug, Clone)]
pub struct GridSearchOutcome {
    pub best_index: usize,
    pub best: ModelConfiguration,
    /// Every requested metric's mean score at the best candidate.
    pub best_scores: ScoreRecord,
    pub candidates: Vec<CandidateResult>,
}

impl GridSearchOutcome {
    pub fn best_primary_score(&self, scoring: &Scoring) -> f64 {
        self.best_scores
            .get(scoring.primary())
            .unwrap_or(f64::NAN)
    }
}

/// Exhaustive search over `grid`, selecting by the mean primary-metric score.
pub fn grid_search(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    algorithm: Algorithm,
    grid: &HyperGrid,
    folds: &FoldSet,
    reduction: Reduction,
    scoring: &Scoring,
) -> Result<GridSearchOutcome, PipelineError> {
    if grid.is_empty() {
        return Err(PipelineError::EmptyGrid(algorithm));
    }
    let prepared = prepare_folds(x, y, folds, reduction)?;
    let candidates = grid.candidates();
    log::debug!(
        "Searching {} {} candidates over {} folds",
        candidates.len(),
        algorithm,
        folds.len()
    );

    let mut results = Vec::with_capacity(candidates.len());
    for params in candidates {
        let estimator = algorithm.estimator(&params)?;
        let per_fold = score_folds(&prepared, &estimator, scoring)?;
        let mean_scores = mean_scores(&per_fold, scoring);
        log::debug!(
            "{algorithm} [{params}]: mean {} = {:.6}",
            scoring.primary(),
            mean_scores.get(scoring.primary()).unwrap_or(f64::NAN)
        );
        results.push(CandidateResult {
            params,
            mean_scores,
        });
    }

    let primary: Vec<f64> = results
        .iter()
        .map(|r| r.mean_scores.get(scoring.primary()).unwrap_or(f64::NAN))
        .collect();
    let best_index = best_index(&primary).ok_or(PipelineError::EmptyGrid(algorithm))?;
    let chosen = &results[best_index];
    let best = ModelConfiguration::new(algorithm, chosen.params.clone())?;
    log::debug!("Best candidate: {best} ({} = {:.6})", scoring.primary(), primary[best_index]);

    Ok(GridSearchOutcome {
        best_index,
        best,
        best_scores: chosen.mean_scores.clone(),
        candidates: results,
    })
}

/// Result bundle of a nested cross-validation run.
#[derive(Debug, Clone)]
pub struct NestedResult {
    /// Configuration chosen by a search on the full cleaned sample.
    pub best: ModelConfiguration,
    pub best_scores: ScoreRecord,
    /// Primary-metric score of each outer test fold.
    pub nested_scores: Vec<f64>,
    pub dropped_rows: usize,
    pub n_samples: usize,
}

impl NestedResult {
    pub fn mean_nested_score(&self) -> f64 {
        self.nested_scores.iter().sum::<f64>() / self.nested_scores.len() as f64
    }
}

/// Smallest sample count for which every outer training set can itself be
/// split into `n_splits` inner folds.
fn nested_minimum_samples(n_splits: usize) -> usize {
    // Outer training sets lose at most ceil(n / k) rows.
    (n_splits..)
        .find(|&n| n - n.div_ceil(n_splits) >= n_splits)
        .unwrap_or(usize::MAX)
}

/// Nested K-fold evaluation of one algorithm.
pub fn run_nested_cv(
    dataset: &Dataset,
    algorithm: Algorithm,
    scoring: &Scoring,
    settings: &RunSettings,
    seed: u64,
) -> Result<NestedResult, PipelineError> {
    settings.validate()?;
    let n_splits = settings.n_splits;
    let (clean, dropped_rows) = dataset.drop_missing_targets();
    let sample = clean.shuffled(seed);
    let n_samples = sample.n_samples();

    let required = nested_minimum_samples(n_splits);
    if n_samples < required {
        return Err(PipelineError::InsufficientData {
            n_samples,
            n_splits,
            required,
        });
    }

    let grid = algorithm.grid(settings.nested_grid_points)?;
    let x = sample.features().view();
    let y = sample.target().view();
    log::info!(
        "Nested CV for {algorithm}: {n_samples} samples, {} features, {} candidates, {n_splits} folds",
        sample.n_features(),
        grid.len()
    );

    let folds = build_plain_folds(n_samples, n_splits)?;
    let search = grid_search(x, y, algorithm, &grid, &folds, Reduction::None, scoring)?;
    log::info!(
        "Selected {} with mean {} = {:.4}",
        search.best,
        scoring.primary(),
        search.best_primary_score(scoring)
    );

    let inner_scoring = Scoring::single(scoring.primary());
    let mut nested_scores = Vec::with_capacity(n_splits);
    for (outer_idx, fold) in folds.iter().enumerate() {
        let x_train = x.select(Axis(0), &fold.train);
        let y_train = y.select(Axis(0), &fold.train);
        let inner_folds = build_plain_folds(fold.train.len(), n_splits)?;
        let inner = grid_search(
            x_train.view(),
            y_train.view(),
            algorithm,
            &grid,
            &inner_folds,
            Reduction::None,
            &inner_scoring,
        )?;

        let transform = FoldTransform::fit(x_train.view(), Reduction::None)?;
        let model = inner
            .best
            .estimator()
            .fit(transform.transform(x_train.view())?.view(), y_train.view())?;
        let x_test = transform.transform(x.select(Axis(0), &fold.test).view())?;
        let predictions = model.predict(x_test.view())?;
        let outer_score = score(
            predictions.view(),
            y.select(Axis(0), &fold.test).view(),
            scoring.primary(),
        )?;
        log::debug!(
            "Outer fold {}/{}: {} with {} = {:.4}",
            outer_idx + 1,
            n_splits,
            inner.best,
            scoring.primary(),
            outer_score
        );
        nested_scores.push(outer_score);
    }

    let result = NestedResult {
        best: search.best,
        best_scores: search.best_scores,
        nested_scores,
        dropped_rows,
        n_samples,
    };
    log::info!(
        "Nested {} across {} outer folds: {:.4}",
        scoring.primary(),
        n_splits,
        result.mean_nested_score()
    );
    Ok(result)
}

/// Result of a single-level search over stratified folds.
#[derive(Debug, Clone)]
pub struct StratifiedResult {
    pub best: ModelConfiguration,
    pub best_score: f64,
    pub n_components: usize,
    /// Variance fraction retained by `n_components` on the whole sample.
    pub explained_variance: f64,
}

/// Largest component count every fold can support, capped at `requested`.
pub(crate) fn cap_components(requested: usize, n_features: usize, folds: &FoldSet) -> usize {
    let smallest_train = folds.iter().map(|f| f.train.len()).min().unwrap_or(0);
    let available = n_features.min(smallest_train);
    if requested > available {
        log::debug!(
            "Reducing PCA from {requested} to {available} components to fit {n_features} features and {smallest_train} training rows"
        );
        available
    } else {
        requested
    }
}

/// Stratified single-level evaluation. The caller is responsible for removing
/// missing targets first.
pub fn run_stratified_cv(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    algorithm: Algorithm,
    metric: Metric,
    settings: &RunSettings,
) -> Result<StratifiedResult, PipelineError> {
    settings.validate()?;
    let (_, standardized) = Standardizer::fit_transform(x)?;
    let selection = select_components(standardized.view(), settings.variance_threshold)?;
    log::info!(
        "{} components explain {:.4} of the variance (threshold {})",
        selection.n_components,
        selection.achieved_variance,
        settings.variance_threshold
    );

    let stratified = build_stratified_folds(y, settings.n_splits)?;
    let sorted_x = x.select(Axis(0), &stratified.order);
    let n_components = cap_components(
        selection.n_components,
        sorted_x.ncols(),
        &stratified.folds,
    );
    if n_components < selection.n_components {
        log::info!(
            "Using {n_components} of {} components, the most the smallest training fold supports",
            selection.n_components
        );
    }

    let grid = algorithm.grid(settings.lesion_grid_points)?;
    let scoring = Scoring::single(metric);
    let search = grid_search(
        sorted_x.view(),
        stratified.sorted_target.view(),
        algorithm,
        &grid,
        &stratified.folds,
        Reduction::Components(n_components),
        &scoring,
    )?;
    let best_score = search.best_primary_score(&scoring);
    log::info!(
        "Stratified CV selected {} with mean {metric} = {best_score:.4}",
        search.best
    );

    Ok(StratifiedResult {
        best: search.best,
        best_score,
        n_components,
        explained_variance: selection.achieved_variance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regressors::Hyper;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn linear_dataset(rows: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, 0.1).unwrap();
        let weights = [1.5, -2.0, 0.5, 1.0, -0.75];
        let x = Array2::from_shape_fn((rows, weights.len()), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(rows, |i| {
            x.row(i)
                .iter()
                .zip(weights.iter())
                .map(|(a, w)| a * w)
                .sum::<f64>()
                + noise.sample(&mut rng)
        });
        Dataset::from_arrays(x, y).unwrap()
    }

    /// Target built from two of `p` features plus Gaussian noise.
    fn two_feature_dataset(rows: usize, p: usize, noise_sd: f64, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let noise = Normal::new(0.0, noise_sd).unwrap();
        let x = Array2::from_shape_fn((rows, p), |_| normal.sample(&mut rng));
        let y = Array1::from_shape_fn(rows, |i| {
            3.0 * x[[i, 0]] - 2.0 * x[[i, 1]] + noise.sample(&mut rng)
        });
        Dataset::from_arrays(x, y).unwrap()
    }

    /// Features sharing one latent factor, so every pair is strongly correlated.
    fn correlated_dataset(rows: usize, p: usize, seed: u64) -> Dataset {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let latent: Vec<f64> = (0..rows).map(|_| normal.sample(&mut rng)).collect();
        let x = Array2::from_shape_fn((rows, p), |(i, _)| latent[i] + 0.3 * normal.sample(&mut rng));
        let y = Array1::from_shape_fn(rows, |i| {
            x[[i, 0]] - 0.5 * x[[i, 2]] + normal.sample(&mut rng)
        });
        Dataset::from_arrays(x, y).unwrap()
    }

    fn settings(n_splits: usize, grid_points: usize) -> RunSettings {
        RunSettings {
            n_splits,
            nested_grid_points: grid_points,
            lesion_grid_points: grid_points,
            ..RunSettings::default()
        }
    }

    #[test]
    fn nan_scores_rank_last_and_ties_keep_the_first() {
        assert_eq!(best_index(&[f64::NAN, 0.2, 0.5, 0.5]), Some(2));
        assert_eq!(best_index(&[f64::NAN, f64::NAN]), Some(0));
        assert_eq!(best_index(&[-3.0, f64::NAN, -1.0]), Some(2));
        assert_eq!(best_index(&[]), None);
    }

    #[test]
    fn nested_ridge_recovers_a_linear_signal() {
        let data = two_feature_dataset(100, 5, 1e-3, 11);
        let result = run_nested_cv(
            &data,
            Algorithm::Ridge,
            &Scoring::default(),
            &settings(10, 20),
            0,
        )
        .unwrap();

        assert_eq!(result.nested_scores.len(), 10);
        assert_eq!(result.dropped_rows, 0);
        assert!(result.mean_nested_score() > 0.5);
        // Nearly noiseless data leaves nothing for the penalty to do.
        let alpha = result.best.params().get(Hyper::Alpha).unwrap();
        assert!(alpha <= 1e-2, "selected alpha {alpha}");
        for metric in Metric::ALL {
            assert!(result.best_scores.get(metric).is_some());
        }
        assert!(result.best_scores.get(Metric::R2).unwrap() > 0.9);
    }

    #[test]
    fn nested_run_drops_missing_targets() {
        let data = linear_dataset(50, 5);
        let mut target = data.target().clone();
        target[3] = f64::NAN;
        target[40] = f64::NAN;
        let data = Dataset::from_arrays(data.features().clone(), target).unwrap();

        let result = run_nested_cv(
            &data,
            Algorithm::Ridge,
            &Scoring::single(Metric::R2),
            &settings(5, 4),
            1,
        )
        .unwrap();
        assert_eq!(result.dropped_rows, 2);
        assert_eq!(result.n_samples, 48);
        assert_eq!(result.nested_scores.len(), 5);
    }

    #[test]
    fn nested_run_is_reproducible_for_a_seed() {
        let data = linear_dataset(40, 8);
        let run = || {
            run_nested_cv(
                &data,
                Algorithm::Lasso,
                &Scoring::single(Metric::NegMse),
                &settings(4, 3),
                7,
            )
            .unwrap()
        };
        let (a, b) = (run(), run());
        assert_eq!(a.nested_scores, b.nested_scores);
        assert_eq!(a.best, b.best);
    }

    #[test]
    fn nested_run_rejects_too_few_samples() {
        let data = linear_dataset(10, 2);
        let err = run_nested_cv(
            &data,
            Algorithm::Ridge,
            &Scoring::default(),
            &settings(10, 3),
            0,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::InsufficientData {
                n_samples: 10,
                n_splits: 10,
                ..
            }
        ));
    }

    #[test]
    fn nested_minimum_leaves_enough_rows_for_inner_folds() {
        assert_eq!(nested_minimum_samples(2), 4);
        // 7 samples in 5 folds leave outer training sets of 5 rows.
        assert_eq!(nested_minimum_samples(5), 7);
        for k in 2..12 {
            let n = nested_minimum_samples(k);
            assert!(n - n.div_ceil(k) >= k);
        }
    }

    #[test]
    fn stratified_search_reports_components_and_variance() {
        let data = linear_dataset(60, 3);
        let result = run_stratified_cv(
            data.features().view(),
            data.target().view(),
            Algorithm::KernelRidgeLinear,
            Metric::R2,
            &settings(5, 3),
        )
        .unwrap();
        assert!(result.n_components >= 1 && result.n_components <= 5);
        assert!(result.explained_variance >= 0.9 - 1e-12);
        assert!(result.best_score.is_finite());
    }

    #[test]
    fn stratified_search_survives_single_sample_test_folds() {
        let data = linear_dataset(6, 4);
        let result = run_stratified_cv(
            data.features().view(),
            data.target().view(),
            Algorithm::Ridge,
            Metric::R2,
            &settings(6, 2),
        )
        .unwrap();
        // R2 is undefined on one held-out sample.
        assert!(result.best_score.is_nan());
        assert_eq!(result.best.params().get(Hyper::Alpha), Some(1.0));

        let mse = run_stratified_cv(
            data.features().view(),
            data.target().view(),
            Algorithm::Ridge,
            Metric::NegMse,
            &settings(6, 2),
        )
        .unwrap();
        assert!(mse.best_score.is_finite());
    }

    #[test]
    fn grid_search_records_every_candidate() {
        let data = linear_dataset(30, 9);
        let grid = Algorithm::KernelRidgeRbf.grid(3).unwrap();
        let folds = build_plain_folds(30, 3).unwrap();
        let outcome = grid_search(
            data.features().view(),
            data.target().view(),
            Algorithm::KernelRidgeRbf,
            &grid,
            &folds,
            Reduction::None,
            &Scoring::full_report(Metric::Corr),
        )
        .unwrap();
        assert_eq!(outcome.candidates.len(), 9);
        let chosen = &outcome.candidates[outcome.best_index];
        assert_eq!(&chosen.params, outcome.best.params());
        assert_eq!(outcome.best_scores.len(), 4);
        for candidate in &outcome.candidates {
            let corr = candidate.mean_scores.get(Metric::Corr).unwrap();
            assert!(corr.is_nan() || corr <= outcome.best_scores.get(Metric::Corr).unwrap());
        }
    }

    #[test]
    fn every_algorithm_completes_a_stratified_search_on_its_default_grid() {
        let data = two_feature_dataset(48, 6, 1.0, 31);
        let settings = RunSettings {
            n_splits: 4,
            ..RunSettings::default()
        };
        for algorithm in Algorithm::ALL {
            let result = run_stratified_cv(
                data.features().view(),
                data.target().view(),
                algorithm,
                Metric::R2,
                &settings,
            )
            .unwrap_or_else(|err| panic!("{algorithm}: {err}"));
            assert!(result.best_score.is_finite(), "{algorithm}: {}", result.best_score);
            assert_eq!(result.best.algorithm(), algorithm);
        }
    }

    #[test]
    fn iterative_solvers_complete_nested_runs_on_correlated_features() {
        let data = correlated_dataset(60, 8, 32);
        let settings = RunSettings {
            n_splits: 3,
            ..RunSettings::default()
        };
        for algorithm in [Algorithm::Lasso, Algorithm::SvrLinear] {
            let result = run_nested_cv(&data, algorithm, &Scoring::default(), &settings, 0)
                .unwrap_or_else(|err| panic!("{algorithm}: {err}"));
            assert_eq!(result.nested_scores.len(), 3);
            assert!(
                result.nested_scores.iter().all(|s| s.is_finite()),
                "{algorithm}: {:?}",
                result.nested_scores
            );
        }
    }

    #[test]
    fn rbf_svr_grid_search_covers_every_candidate() {
        let data = two_feature_dataset(40, 4, 0.5, 33);
        let grid = Algorithm::SvrRbf
            .grid(RunSettings::default().lesion_grid_points)
            .unwrap();
        let folds = build_plain_folds(40, 4).unwrap();
        let outcome = grid_search(
            data.features().view(),
            data.target().view(),
            Algorithm::SvrRbf,
            &grid,
            &folds,
            Reduction::None,
            &Scoring::single(Metric::NegMse),
        )
        .unwrap();
        assert_eq!(outcome.candidates.len(), 100);
        assert!(outcome.best_scores.get(Metric::NegMse).unwrap().is_finite());
    }
}
