//! # Prediction Scoring
//!
//! Every metric follows a "greater is better" convention so that model
//! selection can always maximize: error metrics are negated. Degenerate inputs
//! never panic. A correlation computed on a constant vector is undefined and is
//! reported as `NaN`, which callers must treat as "undefined", not as zero.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("Cannot score {predicted} predictions against {observed} observed values.")]
    LengthMismatch { predicted: usize, observed: usize },

    #[error("Cannot score an empty prediction vector.")]
    Empty,
}

/// A performance metric comparing predictions with ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Metric {
    /// Coefficient of determination.
    #[serde(rename = "r2")]
    R2,
    /// Mean squared error, negated.
    #[serde(rename = "mse")]
    NegMse,
    /// Mean absolute error, negated.
    #[serde(rename = "mae")]
    NegMae,
    /// Pearson correlation between predictions and truth.
    #[serde(rename = "corr")]
    Corr,
}

impl Metric {
    pub const ALL: [Metric; 4] = [Metric::R2, Metric::NegMse, Metric::NegMae, Metric::Corr];

    /// Short identifier used in file names and result records.
    pub fn id(self) -> &'static str {
        match self {
            Metric::R2 => "r2",
            Metric::NegMse => "mse",
            Metric::NegMae => "mae",
            Metric::Corr => "corr",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Scores `y_pred` against `y_true` with a single metric.
pub fn score(
    y_pred: ArrayView1<f64>,
    y_true: ArrayView1<f64>,
    metric: Metric,
) -> Result<f64, ScoreError> {
    if y_pred.len() != y_true.len() {
        return Err(ScoreError::LengthMismatch {
            predicted: y_pred.len(),
            observed: y_true.len(),
        });
    }
    if y_true.is_empty() {
        return Err(ScoreError::Empty);
    }

    let n = y_true.len() as f64;
    let value = match metric {
        Metric::R2 => r2(y_pred, y_true),
        Metric::NegMse => {
            -y_pred
                .iter()
                .zip(y_true.iter())
                .map(|(&p, &t)| (t - p).powi(2))
                .sum::<f64>()
                / n
        }
        Metric::NegMae => {
            -y_pred
                .iter()
                .zip(y_true.iter())
                .map(|(&p, &t)| (t - p).abs())
                .sum::<f64>()
                / n
        }
        Metric::Corr => pearson(y_pred, y_true),
    };
    Ok(value)
}

fn r2(y_pred: ArrayView1<f64>, y_true: ArrayView1<f64>) -> f64 {
    if y_true.len() < 2 {
        return f64::NAN;
    }
    let mean = y_true.sum() / y_true.len() as f64;
    let ss_res: f64 = y_pred
        .iter()
        .zip(y_true.iter())
        .map(|(&p, &t)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|&t| (t - mean).powi(2)).sum();

    if ss_tot == 0.0 {
        // Constant truth: perfect only if the predictions hit it exactly.
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

fn pearson(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    if a.len() < 2 {
        return f64::NAN;
    }
    let n = a.len() as f64;
    let mean_a = a.sum() / n;
    let mean_b = b.sum() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    if var_a == 0.0 || var_b == 0.0 {
        return f64::NAN;
    }
    (cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0)
}

/// The set of metrics to compute during a search, with an explicit primary
/// metric that alone drives model selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scoring {
    primary: Metric,
    secondary: Vec<Metric>,
}

impl Scoring {
    /// Scores with a single metric.
    pub fn single(primary: Metric) -> Self {
        Self {
            primary,
            secondary: Vec::new(),
        }
    }

    /// Scores with `primary` plus any extra metrics. Duplicates, including a
    /// repeat of the primary metric, are ignored.
    pub fn new(primary: Metric, secondary: impl IntoIterator<Item = Metric>) -> Self {
        let mut extra: Vec<Metric> = Vec::new();
        for metric in secondary {
            if metric != primary && !extra.contains(&metric) {
                extra.push(metric);
            }
        }
        Self {
            primary,
            secondary: extra,
        }
    }

    /// All four metrics, reported alongside `primary`.
    pub fn full_report(primary: Metric) -> Self {
        Self::new(primary, Metric::ALL)
    }

    pub fn primary(&self) -> Metric {
        self.primary
    }

    /// The primary metric first, then the secondary metrics in order.
    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        std::iter::once(self.primary).chain(self.secondary.iter().copied())
    }
}

impl Default for Scoring {
    fn default() -> Self {
        Self::full_report(Metric::R2)
    }
}

/// Metric values computed from one fitted model or averaged across folds.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScoreRecord {
    values: Vec<(Metric, f64)>,
}

impl ScoreRecord {
    pub fn insert(&mut self, metric: Metric, value: f64) {
        match self.values.iter_mut().find(|(m, _)| *m == metric) {
            Some(entry) => entry.1 = value,
            None => self.values.push((metric, value)),
        }
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values
            .iter()
            .find(|(m, _)| *m == metric)
            .map(|&(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(Metric, f64)> for ScoreRecord {
    fn from_iter<I: IntoIterator<Item = (Metric, f64)>>(iter: I) -> Self {
        let mut record = ScoreRecord::default();
        for (metric, value) in iter {
            record.insert(metric, value);
        }
        record
    }
}
