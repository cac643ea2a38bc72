//! # Result Artifacts
//!
//! Each run writes its artifacts into a directory derived from the run's
//! parameters, so parallel array-job tasks never collide. Files are first
//! written to a hidden staging directory next to the destination, which is
//! renamed into place only after every file was written.

use crate::lesion::LesionResult;
use crate::regressors::{Algorithm, HyperParams};
use crate::scoring::{Metric, ScoreRecord};
use crate::search::NestedResult;
use serde_json::{Map, Number, Value};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix that downstream readers expect on hyperparameter names.
const PARAM_PREFIX: &str = "reg__";

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to serialize JSON artifact: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write CSV artifact: {0}")]
    Csv(#[from] csv::Error),
    #[error("Output directory '{0}' has no parent directory.")]
    NoParent(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> OutputError + '_ {
    move |source| OutputError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Identifies one prediction job.
#[derive(Debug, Clone)]
pub struct RunLabel<'a> {
    pub algorithm: Algorithm,
    /// Name pattern that selected the brain features.
    pub feature_metric: &'a str,
    pub phenotype: &'a str,
    pub seed: u64,
}

impl RunLabel<'_> {
    fn leaf(&self) -> String {
        format!(
            "{}_{}_{}",
            self.algorithm, self.feature_metric, self.phenotype
        )
    }

    /// `<root>/split_<seed>/<alg>_<metric>_<pheno>`
    pub fn nested_dir(&self, root: &Path) -> PathBuf {
        root.join(format!("split_{}", self.seed)).join(self.leaf())
    }

    /// `<root>/<score>/split_<seed>/<alg>_<metric>_<pheno>`
    pub fn lesion_dir(&self, root: &Path, score: Metric) -> PathBuf {
        root.join(score.id())
            .join(format!("split_{}", self.seed))
            .join(self.leaf())
    }
}

/// Formats a value the way `numpy.savetxt` does by default (`%.18e`).
pub fn format_scientific(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let formatted = format!("{value:.18e}");
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => formatted,
    }
}

fn json_number(value: f64) -> Value {
    Number::from_f64(value).map_or(Value::Null, Value::Number)
}

fn params_json(params: &HyperParams) -> Value {
    let map: Map<String, Value> = params
        .iter()
        .map(|(name, value)| (format!("{PARAM_PREFIX}{name}"), json_number(value)))
        .collect();
    Value::Object(map)
}

fn scores_json(scores: &ScoreRecord) -> Value {
    let map: Map<String, Value> = scores
        .iter()
        .map(|(metric, value)| (metric.id().to_string(), json_number(value)))
        .collect();
    Value::Object(map)
}

fn write_json(path: &Path, value: &Value) -> Result<(), OutputError> {
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_error(path))?);
    serde_json::to_writer(&mut file, value)?;
    file.flush().map_err(io_error(path))?;
    Ok(())
}

/// One value per line in `%.18e` notation.
fn write_values(path: &Path, values: impl IntoIterator<Item = f64>) -> Result<(), OutputError> {
    let mut file = BufWriter::new(fs::File::create(path).map_err(io_error(path))?);
    for value in values {
        writeln!(file, "{}", format_scientific(value)).map_err(io_error(path))?;
    }
    file.flush().map_err(io_error(path))?;
    Ok(())
}

fn write_value_csv(path: &Path, values: &[f64]) -> Result<(), OutputError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    for &value in values {
        writer.write_record([format_scientific(value)])?;
    }
    writer.flush().map_err(io_error(path))?;
    Ok(())
}

/// Runs `write` against a fresh staging directory, then moves it to `dir`,
/// replacing any earlier results there.
fn write_atomically(
    dir: &Path,
    write: impl FnOnce(&Path) -> Result<(), OutputError>,
) -> Result<(), OutputError> {
    let parent = dir
        .parent()
        .ok_or_else(|| OutputError::NoParent(dir.to_path_buf()))?;
    let name = dir
        .file_name()
        .ok_or_else(|| OutputError::NoParent(dir.to_path_buf()))?;
    fs::create_dir_all(parent).map_err(io_error(parent))?;

    let staging = parent.join(format!(
        ".{}.staging-{}",
        name.to_string_lossy(),
        std::process::id()
    ));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(io_error(&staging))?;
    }
    fs::create_dir(&staging).map_err(io_error(&staging))?;

    if let Err(err) = write(&staging) {
        if let Err(cleanup) = fs::remove_dir_all(&staging) {
            log::warn!(
                "Could not remove staging directory '{}': {cleanup}",
                staging.display()
            );
        }
        return Err(err);
    }

    if dir.exists() {
        log::warn!("Replacing existing results in '{}'", dir.display());
        fs::remove_dir_all(dir).map_err(io_error(dir))?;
    }
    fs::rename(&staging, dir).map_err(io_error(dir))?;
    log::info!("Results written to '{}'", dir.display());
    Ok(())
}

pub fn write_nested_result(dir: &Path, result: &NestedResult) -> Result<(), OutputError> {
    write_atomically(dir, |staging| {
        write_json(
            &staging.join("best_params.json"),
            &params_json(result.best.params()),
        )?;
        write_json(
            &staging.join("best_scores.json"),
            &scores_json(&result.best_scores),
        )?;
        write_value_csv(&staging.join("nested_score.csv"), &result.nested_scores)
    })
}

pub fn write_lesion_result(dir: &Path, result: &LesionResult) -> Result<(), OutputError> {
    let search = &result.search;
    let lesion = &result.lesion;
    write_atomically(dir, |staging| {
        write_json(
            &staging.join("best_params.json"),
            &params_json(search.best.params()),
        )?;
        write_values(&staging.join("scv_score.txt"), [search.best_score])?;
        write_values(
            &staging.join("n_components.txt"),
            [search.n_components as f64],
        )?;
        write_values(
            &staging.join("bench_var_exp.txt"),
            [search.explained_variance],
        )?;
        write_values(
            &staging.join("shuf_fulln_accuracy.txt"),
            [lesion.baseline_score],
        )?;
        write_values(
            &staging.join("shuf_fulln_var_exp.txt"),
            [lesion.baseline_variance],
        )?;
        write_values(
            &staging.join("shuf_lesioned_accuracy.txt"),
            lesion.lesioned_scores.iter().copied(),
        )?;
        write_values(
            &staging.join("shuf_lesioned_var_exp.txt"),
            lesion.lesioned_variance.iter().copied(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lesion::LesionOutcome;
    use crate::regressors::{Hyper, ModelConfiguration};
    use crate::search::StratifiedResult;
    use ndarray::array;
    use tempfile::tempdir;

    fn ridge_config() -> ModelConfiguration {
        ModelConfiguration::new(Algorithm::Ridge, HyperParams::new([(Hyper::Alpha, 0.5)]))
            .unwrap()
    }

    #[test]
    fn scientific_format_matches_numpy() {
        assert_eq!(format_scientific(0.5), "5.000000000000000000e-01");
        assert_eq!(format_scientific(12.0), "1.200000000000000000e+01");
        assert_eq!(format_scientific(-125000.0), "-1.250000000000000000e+05");
        assert!(format_scientific(2.0e-120).ends_with("e-120"));
        assert_eq!(format_scientific(0.0), "0.000000000000000000e+00");
        assert_eq!(format_scientific(f64::NAN), "nan");
    }

    #[test]
    fn directories_follow_the_run_label() {
        let label = RunLabel {
            algorithm: Algorithm::KernelRidgeRbf,
            feature_metric: "ac",
            phenotype: "Overall_Psychopathology",
            seed: 3,
        };
        let root = Path::new("/out");
        assert_eq!(
            label.nested_dir(root),
            PathBuf::from("/out/split_3/krr_rbf_ac_Overall_Psychopathology")
        );
        assert_eq!(
            label.lesion_dir(root, Metric::Corr),
            PathBuf::from("/out/corr/split_3/krr_rbf_ac_Overall_Psychopathology")
        );
    }

    #[test]
    fn nested_artifacts_are_written() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("split_0").join("rr_ac_pheno");
        let result = NestedResult {
            best: ridge_config(),
            best_scores: [(Metric::R2, 0.75), (Metric::Corr, f64::NAN)]
                .into_iter()
                .collect(),
            nested_scores: vec![0.5, 0.25],
            dropped_rows: 0,
            n_samples: 20,
        };
        write_nested_result(&dir, &result).unwrap();

        let params: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("best_params.json")).unwrap())
                .unwrap();
        assert_eq!(params["reg__alpha"], 0.5);
        let scores: Value =
            serde_json::from_str(&fs::read_to_string(dir.join("best_scores.json")).unwrap())
                .unwrap();
        assert_eq!(scores["r2"], 0.75);
        assert!(scores["corr"].is_null());
        assert_eq!(
            fs::read_to_string(dir.join("nested_score.csv")).unwrap(),
            "5.000000000000000000e-01\n2.500000000000000000e-01\n"
        );

        // Nothing but the destination remains in the parent.
        let entries: Vec<_> = fs::read_dir(dir.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn lesion_artifacts_replace_previous_results() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("r2").join("split_1").join("rr_ac_pheno");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("stale.txt"), "old").unwrap();

        let result = LesionResult {
            search: StratifiedResult {
                best: ridge_config(),
                best_score: 0.4,
                n_components: 3,
                explained_variance: 0.92,
            },
            lesion: LesionOutcome {
                baseline_score: 0.41,
                baseline_variance: 0.9,
                lesioned_scores: array![0.3, 0.4],
                lesioned_variance: array![0.88, 0.91],
            },
            dropped_rows: 0,
            n_samples: 30,
        };
        write_lesion_result(&dir, &result).unwrap();

        assert!(!dir.join("stale.txt").exists());
        assert_eq!(
            fs::read_to_string(dir.join("n_components.txt")).unwrap(),
            "3.000000000000000000e+00\n"
        );
        let lesioned = fs::read_to_string(dir.join("shuf_lesioned_accuracy.txt")).unwrap();
        assert_eq!(lesioned.lines().count(), 2);
        for name in [
            "best_params.json",
            "scv_score.txt",
            "bench_var_exp.txt",
            "shuf_fulln_accuracy.txt",
            "shuf_fulln_var_exp.txt",
            "shuf_lesioned_var_exp.txt",
        ] {
            assert!(dir.join(name).is_file(), "missing {name}");
        }
    }

    #[test]
    fn failed_writes_clean_up_and_keep_earlier_results() {
        let tmp = tempdir().unwrap();
        let dir = tmp.path().join("split_0").join("rr_ac_pheno");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("nested_score.csv"), "old\n").unwrap();

        let err = write_atomically(&dir, |staging| {
            fs::write(staging.join("partial.txt"), "partial").map_err(io_error(staging))?;
            Err(OutputError::NoParent(staging.to_path_buf()))
        })
        .unwrap_err();
        assert!(matches!(err, OutputError::NoParent(_)));

        assert_eq!(
            fs::read_to_string(dir.join("nested_score.csv")).unwrap(),
            "old\n"
        );
        let entries: Vec<_> = fs::read_dir(dir.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1, "staging directory left behind");
    }
}
