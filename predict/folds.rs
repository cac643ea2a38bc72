//! # Cross-Validation Fold Construction
//!
//! Two partitioning schemes are provided:
//!
//! - **Plain K-fold:** sequential, unshuffled blocks. The first
//!   `n_samples % n_splits` folds receive one extra sample, so every sample is
//!   tested exactly once and the test sets partition `0..n_samples`.
//! - **Outcome-stratified K-fold:** samples are sorted by target value and the
//!   sample at sorted position `i` is assigned to fold `i mod n_splits`. Each
//!   test set therefore spans the whole range of the outcome instead of one
//!   contiguous slice of it.
//!
//! Fold assignment is deterministic given the input order. Any shuffling
//! happens upstream with an explicit seed.

use ndarray::{Array1, ArrayView1};
use thiserror::Error;

/// Errors raised while partitioning samples into folds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FoldError {
    #[error("Cross-validation requires at least 2 splits, but {0} were requested.")]
    TooFewSplits(usize),

    #[error(
        "Cannot build {n_splits} folds from only {n_samples} samples. Provide more samples or request fewer folds."
    )]
    InsufficientSamples { n_samples: usize, n_splits: usize },

    #[error(
        "Stratified folds require a fully observed target, but position {0} is missing. Drop missing targets first."
    )]
    MissingTarget(usize),
}

/// A single train/test split expressed as row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fold {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// An ordered sequence of folds over `n_samples` rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSet {
    folds: Vec<Fold>,
    n_samples: usize,
}

impl FoldSet {
    pub fn len(&self) -> usize {
        self.folds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folds.is_empty()
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Fold> {
        self.folds.iter()
    }
}

impl<'a> IntoIterator for &'a FoldSet {
    type Item = &'a Fold;
    type IntoIter = std::slice::Iter<'a, Fold>;

    fn into_iter(self) -> Self::IntoIter {
        self.folds.iter()
    }
}

/// Folds built on the outcome-sorted sample.
///
/// `order[i]` is the original row index of the sample at sorted position `i`.
/// The indices inside `folds` refer to sorted positions, so callers must
/// reorder their feature matrix with `order` before using them.
#[derive(Debug, Clone)]
pub struct StratifiedFolds {
    pub order: Vec<usize>,
    pub sorted_target: Array1<f64>,
    pub folds: FoldSet,
}

fn validate_fold_request(n_samples: usize, n_splits: usize) -> Result<(), FoldError> {
    if n_splits < 2 {
        return Err(FoldError::TooFewSplits(n_splits));
    }
    if n_samples < n_splits {
        return Err(FoldError::InsufficientSamples {
            n_samples,
            n_splits,
        });
    }
    Ok(())
}

/// Builds sequential, unshuffled K-fold splits over `0..n_samples`.
pub fn build_plain_folds(n_samples: usize, n_splits: usize) -> Result<FoldSet, FoldError> {
    validate_fold_request(n_samples, n_splits)?;

    let base = n_samples / n_splits;
    let remainder = n_samples % n_splits;

    let mut folds = Vec::with_capacity(n_splits);
    let mut start = 0;
    for fold_idx in 0..n_splits {
        let size = if fold_idx < remainder { base + 1 } else { base };
        let stop = start + size;
        let test: Vec<usize> = (start..stop).collect();
        let train: Vec<usize> = (0..start).chain(stop..n_samples).collect();
        folds.push(Fold { train, test });
        start = stop;
    }

    Ok(FoldSet { folds, n_samples })
}

/// Sorts the sample by outcome and deals sorted positions round-robin into
/// `n_splits` folds.
pub fn build_stratified_folds(
    target: ArrayView1<f64>,
    n_splits: usize,
) -> Result<StratifiedFolds, FoldError> {
    let n_samples = target.len();
    validate_fold_request(n_samples, n_splits)?;

    if let Some(position) = target.iter().position(|v| v.is_nan()) {
        return Err(FoldError::MissingTarget(position));
    }

    let mut order: Vec<usize> = (0..n_samples).collect();
    order.sort_by(|&a, &b| target[a].total_cmp(&target[b]));
    let sorted_target: Array1<f64> = order.iter().map(|&i| target[i]).collect();

    let folds = (0..n_splits)
        .map(|k| {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..n_samples).partition(|position| position % n_splits == k);
            Fold { train, test }
        })
        .collect();

    Ok(StratifiedFolds {
        order,
        sorted_target,
        folds: FoldSet { folds, n_samples },
    })
}
