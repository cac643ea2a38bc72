//! # Data Loading and Alignment
//!
//! Reads the brain-feature table and the phenotype table, keeps the feature
//! columns whose names match the requested metric pattern, and aligns both
//! tables on the composite subject key.
//!
//! - The feature table must be complete. Missing or non-finite feature values
//!   are reported as input errors, since cleaning happens upstream.
//! - The phenotype column may contain missing values. They are carried as
//!   `NaN` and removed later, together with the matching feature rows, by
//!   [`Dataset::drop_missing_targets`].
//! - Both tables must describe exactly the same subjects. Any mismatch aborts
//!   the run before fitting.

use ndarray::{Array1, Array2, Axis};
use polars::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid feature name pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("The required column '{0}' was not found in '{1}'. Please check spelling and case.")]
    ColumnNotFound(String, String),

    #[error("No feature columns in '{path}' match the pattern '{pattern}'.")]
    NoMatchingFeatures { pattern: String, path: String },

    #[error(
        "The column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },

    #[error(
        "Missing or non-finite values were found in the feature column '{0}'. Feature tables must be cleaned before prediction."
    )]
    IncompleteFeature(String),

    #[error("The subject key column '{0}' contains missing values.")]
    MissingSubjectKey(String),

    #[error("Subject {0} appears more than once in '{1}'.")]
    DuplicateSubject(SubjectKey, String),

    #[error(
        "The feature and phenotype tables describe different subjects: {missing} feature rows have no phenotype row and {extra} phenotype rows have no feature row."
    )]
    MisalignedSubjects { missing: usize, extra: usize },

    #[error("Feature matrix has {rows} rows but the target has {targets} values.")]
    ShapeMismatch { rows: usize, targets: usize },

    #[error("Expected {expected} feature names for {found} feature columns.")]
    FeatureNameMismatch { expected: usize, found: usize },
}

/// Composite subject identifier, one string per key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectKey(pub Vec<String>);

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

/// A feature matrix and target vector aligned row by row on subject keys.
#[derive(Debug, Clone)]
pub struct Dataset {
    subjects: Vec<SubjectKey>,
    feature_names: Vec<String>,
    features: Array2<f64>,
    target_name: String,
    target: Array1<f64>,
}

impl Dataset {
    pub fn new(
        subjects: Vec<SubjectKey>,
        feature_names: Vec<String>,
        features: Array2<f64>,
        target_name: impl Into<String>,
        target: Array1<f64>,
    ) -> Result<Self, DataError> {
        if features.nrows() != target.len() || subjects.len() != target.len() {
            return Err(DataError::ShapeMismatch {
                rows: features.nrows(),
                targets: target.len(),
            });
        }
        if feature_names.len() != features.ncols() {
            return Err(DataError::FeatureNameMismatch {
                expected: features.ncols(),
                found: feature_names.len(),
            });
        }
        Ok(Self {
            subjects,
            feature_names,
            features,
            target_name: target_name.into(),
            target,
        })
    }

    /// Builds a dataset with sequential subject identifiers and generated
    /// feature names.
    pub fn from_arrays(features: Array2<f64>, target: Array1<f64>) -> Result<Self, DataError> {
        let subjects = (1..=features.nrows())
            .map(|i| SubjectKey(vec![i.to_string()]))
            .collect();
        let feature_names = (0..features.ncols()).map(|j| format!("feature_{j}")).collect();
        Self::new(subjects, feature_names, features, "target", target)
    }

    pub fn n_samples(&self) -> usize {
        self.target.len()
    }

    pub fn n_features(&self) -> usize {
        self.features.ncols()
    }

    pub fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn target(&self) -> &Array1<f64> {
        &self.target
    }

    /// A copy holding only `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            subjects: rows.iter().map(|&i| self.subjects[i].clone()).collect(),
            feature_names: self.feature_names.clone(),
            features: self.features.select(Axis(0), rows),
            target_name: self.target_name.clone(),
            target: self.target.select(Axis(0), rows),
        }
    }

    /// Removes every row whose target is missing, from both the features and
    /// the target. Returns the reduced copy and the number of dropped rows.
    pub fn drop_missing_targets(&self) -> (Self, usize) {
        let keep: Vec<usize> = self
            .target
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nan())
            .map(|(i, _)| i)
            .collect();
        let dropped = self.n_samples() - keep.len();
        if dropped > 0 {
            log::info!(
                "Dropping {dropped} subjects with a missing '{}' value",
                self.target_name
            );
            let missing = self
                .target
                .iter()
                .zip(&self.subjects)
                .filter(|(v, _)| v.is_nan())
                .map(|(_, subject)| subject.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            log::debug!("Subjects without '{}': {missing}", self.target_name);
        }
        (self.select_rows(&keep), dropped)
    }

    /// A copy with rows permuted by a generator seeded with `seed`.
    pub fn shuffled(&self, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..self.n_samples()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        self.select_rows(&order)
    }
}

/// Column names of the subject key and the selection of the inputs.
#[derive(Debug, Clone)]
pub struct TableSpec<'a> {
    pub subject_key: &'a [String],
    pub feature_pattern: &'a str,
    pub phenotype: &'a str,
}

fn read_csv(path: &Path) -> Result<DataFrame, DataError> {
    log::info!("Loading table from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(CsvReadOptions::default().with_has_header(true))
        .finish()?;
    log::debug!(
        "Loaded {} rows and {} columns from '{}'",
        df.height(),
        df.width(),
        path.display()
    );
    Ok(df)
}

fn require_column(df: &DataFrame, name: &str, path: &Path) -> Result<(), DataError> {
    if df.get_column_names().iter().any(|c| c.as_str() == name) {
        Ok(())
    } else {
        Err(DataError::ColumnNotFound(
            name.to_string(),
            path.display().to_string(),
        ))
    }
}

/// Reads a numeric column, mapping nulls to `NaN`.
fn numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, DataError> {
    let column = df.column(name)?;
    let casted = column
        .cast(&DataType::Float64)
        .map_err(|_| DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        })?;
    // A failed parse surfaces as extra nulls after the cast.
    if casted.null_count() > column.null_count() {
        return Err(DataError::ColumnWrongType {
            column_name: name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", column.dtype()),
        });
    }
    let values = casted
        .f64()?
        .into_iter()
        .map(|v| v.unwrap_or(f64::NAN))
        .collect();
    Ok(values)
}

fn subject_keys(df: &DataFrame, key_columns: &[String]) -> Result<Vec<SubjectKey>, DataError> {
    let mut parts: Vec<Vec<String>> = vec![Vec::with_capacity(key_columns.len()); df.height()];
    for name in key_columns {
        let column = df.column(name)?.cast(&DataType::String)?;
        for (row, value) in column.str()?.into_iter().enumerate() {
            let value = value.ok_or_else(|| DataError::MissingSubjectKey(name.clone()))?;
            parts[row].push(value.to_string());
        }
    }
    Ok(parts.into_iter().map(SubjectKey).collect())
}

fn index_subjects(
    keys: &[SubjectKey],
    path: &Path,
) -> Result<HashMap<SubjectKey, usize>, DataError> {
    let mut index = HashMap::with_capacity(keys.len());
    for (row, key) in keys.iter().enumerate() {
        if index.insert(key.clone(), row).is_some() {
            return Err(DataError::DuplicateSubject(
                key.clone(),
                path.display().to_string(),
            ));
        }
    }
    Ok(index)
}

/// Loads and aligns the feature and phenotype tables.
pub fn load_dataset(
    features_path: &Path,
    phenotype_path: &Path,
    spec: &TableSpec<'_>,
) -> Result<Dataset, DataError> {
    let pattern = Regex::new(spec.feature_pattern).map_err(|source| DataError::InvalidPattern {
        pattern: spec.feature_pattern.to_string(),
        source,
    })?;

    let feature_df = read_csv(features_path)?;
    let phenotype_df = read_csv(phenotype_path)?;
    for name in spec.subject_key {
        require_column(&feature_df, name, features_path)?;
        require_column(&phenotype_df, name, phenotype_path)?;
    }
    require_column(&phenotype_df, spec.phenotype, phenotype_path)?;

    let feature_names: Vec<String> = feature_df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .filter(|name| !spec.subject_key.contains(name) && pattern.is_match(name))
        .collect();
    if feature_names.is_empty() {
        return Err(DataError::NoMatchingFeatures {
            pattern: spec.feature_pattern.to_string(),
            path: features_path.display().to_string(),
        });
    }
    log::info!(
        "Selected {} feature columns matching '{}'",
        feature_names.len(),
        spec.feature_pattern
    );

    let subjects = subject_keys(&feature_df, spec.subject_key)?;
    index_subjects(&subjects, features_path)?;
    let phenotype_subjects = subject_keys(&phenotype_df, spec.subject_key)?;
    let phenotype_index = index_subjects(&phenotype_subjects, phenotype_path)?;

    let missing = subjects
        .iter()
        .filter(|key| !phenotype_index.contains_key(key))
        .count();
    let extra = phenotype_subjects.len() + missing - subjects.len();
    if missing > 0 || extra > 0 {
        return Err(DataError::MisalignedSubjects { missing, extra });
    }

    let n_rows = subjects.len();
    let mut features = Array2::<f64>::zeros((n_rows, feature_names.len()));
    for (j, name) in feature_names.iter().enumerate() {
        let values = numeric_column(&feature_df, name)?;
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::IncompleteFeature(name.clone()));
        }
        features.column_mut(j).assign(&Array1::from_vec(values));
    }

    let phenotype_values = numeric_column(&phenotype_df, spec.phenotype)?;
    let target: Array1<f64> = subjects
        .iter()
        .map(|key| phenotype_values[phenotype_index[key]])
        .map(|v| if v.is_finite() { v } else { f64::NAN })
        .collect();

    Dataset::new(subjects, feature_names, features, spec.phenotype, target)
}
