//! # Feature Lesion Analysis
//!
//! Measures how much each feature contributes to a fixed model configuration
//! by removing it and re-running the same cross-validated evaluation. The
//! difference between the baseline score and a lesioned score estimates the
//! feature's importance.

use crate::config::RunSettings;
use crate::data::Dataset;
use crate::folds::{FoldSet, build_plain_folds};
use crate::regressors::{Algorithm, ModelConfiguration};
use crate::scoring::{Metric, Scoring};
use crate::search::{
    PipelineError, StratifiedResult, cap_components, prepare_folds, run_stratified_cv,
    score_folds,
};
use crate::transform::Reduction;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

/// Mean held-out score and mean retained variance across folds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrossValScore {
    pub score: f64,
    pub retained_variance: f64,
}

/// Standardize, reduce to `n_components`, fit and score on every fold.
pub fn cross_val_score(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    configuration: &ModelConfiguration,
    n_components: usize,
    metric: Metric,
    folds: &FoldSet,
) -> Result<CrossValScore, PipelineError> {
    let n_components = cap_components(n_components, x.ncols(), folds);
    let prepared = prepare_folds(x, y, folds, Reduction::Components(n_components))?;
    let per_fold = score_folds(&prepared, configuration.estimator(), &Scoring::single(metric))?;

    let n = prepared.len() as f64;
    let score = per_fold
        .iter()
        .map(|record| record.get(metric).unwrap_or(f64::NAN))
        .sum::<f64>()
        / n;
    let retained_variance = prepared.iter().map(|f| f.retained_variance).sum::<f64>() / n;
    Ok(CrossValScore {
        score,
        retained_variance,
    })
}

/// Baseline and per-feature lesioned evaluations.
///
/// Index `i` of the lesioned vectors corresponds to column `i` of the feature
/// matrix passed to [`run_lesion`].
#[derive(Debug, Clone, PartialEq)]
pub struct LesionOutcome {
    pub baseline_score: f64,
    pub baseline_variance: f64,
    pub lesioned_scores: Array1<f64>,
    pub lesioned_variance: Array1<f64>,
}

impl LesionOutcome {
    /// Baseline score minus each lesioned score.
    pub fn score_drops(&self) -> Array1<f64> {
        self.lesioned_scores.mapv(|s| self.baseline_score - s)
    }
}

/// Evaluates `configuration` with all features, then once per removed column.
///
/// The rows are used in the order given, so callers shuffle beforehand.
pub fn run_lesion(
    features: ArrayView2<f64>,
    target: ArrayView1<f64>,
    configuration: &ModelConfiguration,
    n_components: usize,
    metric: Metric,
    n_splits: usize,
) -> Result<LesionOutcome, PipelineError> {
    let folds = build_plain_folds(features.nrows(), n_splits)?;
    let baseline = cross_val_score(
        features,
        target,
        configuration,
        n_components,
        metric,
        &folds,
    )?;
    log::info!(
        "Baseline {metric} = {:.4} retaining {:.4} of the variance",
        baseline.score,
        baseline.retained_variance
    );

    let n_features = features.ncols();
    let lesioned_components = cap_components(n_components, n_features.saturating_sub(1), &folds);
    if lesioned_components < n_components {
        log::info!(
            "Lesioned evaluations use {lesioned_components} of {n_components} components, the most {} features support",
            n_features - 1
        );
    }
    let mut lesioned_scores = Array1::<f64>::zeros(n_features);
    let mut lesioned_variance = Array1::<f64>::zeros(n_features);
    for removed in 0..n_features {
        let kept: Vec<usize> = (0..n_features).filter(|&j| j != removed).collect();
        let lesioned = features.select(Axis(1), &kept);
        let result = cross_val_score(
            lesioned.view(),
            target,
            configuration,
            n_components,
            metric,
            &folds,
        )?;
        log::debug!(
            "Lesioned feature {}/{}: {metric} = {:.4}",
            removed + 1,
            n_features,
            result.score
        );
        lesioned_scores[removed] = result.score;
        lesioned_variance[removed] = result.retained_variance;
    }

    Ok(LesionOutcome {
        baseline_score: baseline.score,
        baseline_variance: baseline.retained_variance,
        lesioned_scores,
        lesioned_variance,
    })
}

/// Shuffles rows once with `seed`, keeping features and target paired.
pub fn prepare_lesion_sample(
    features: ArrayView2<f64>,
    target: ArrayView1<f64>,
    seed: u64,
) -> (Array2<f64>, Array1<f64>) {
    let mut order: Vec<usize> = (0..target.len()).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    (
        features.select(Axis(0), &order),
        target.select(Axis(0), &order),
    )
}

/// Everything a lesion run produces.
#[derive(Debug, Clone)]
pub struct LesionResult {
    pub search: StratifiedResult,
    pub lesion: LesionOutcome,
    pub dropped_rows: usize,
    pub n_samples: usize,
}

impl LesionResult {
    pub fn best(&self) -> &ModelConfiguration {
        &self.search.best
    }
}

/// Stratified search for the best configuration followed by a lesion run on
/// a seeded shuffle of the same subjects.
pub fn run_lesion_pipeline(
    dataset: &Dataset,
    algorithm: Algorithm,
    metric: Metric,
    settings: &RunSettings,
    seed: u64,
) -> Result<LesionResult, PipelineError> {
    let (clean, dropped_rows) = dataset.drop_missing_targets();
    let x = clean.features().view();
    let y = clean.target().view();
    log::info!(
        "Lesion analysis for {algorithm}: {} samples, {} features",
        clean.n_samples(),
        clean.n_features()
    );

    let search = run_stratified_cv(x, y, algorithm, metric, settings)?;
    let (shuffled_x, shuffled_y) = prepare_lesion_sample(x, y, seed);
    let lesion = run_lesion(
        shuffled_x.view(),
        shuffled_y.view(),
        &search.best,
        search.n_components,
        metric,
        settings.n_splits,
    )?;

    Ok(LesionResult {
        search,
        lesion,
        dropped_rows,
        n_samples: clean.n_samples(),
    })
}
