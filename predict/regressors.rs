//! # Regressor Registry
//!
//! Maps each algorithm identifier to its estimator family and its
//! hyperparameter search grid. The registry is a closed enum so every match on
//! [`Algorithm`] is checked for completeness by the compiler.
//!
//! Grids are log-spaced. Regularization strengths span `1` down to `1e-3`, the
//! SVR box constraint spans `1` up to `1e4`, and RBF kernel widths span `1`
//! down to `1e-3`. With a few hundred features the library default
//! `gamma = 1 / n_features` falls inside that range.

use crate::estimators::{Estimator, Kernel, SVR_EPSILON};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Algorithm '{algorithm}' requires the hyperparameter '{name}', which was not provided.")]
    MissingHyperparameter {
        algorithm: Algorithm,
        name: &'static str,
    },

    #[error("A hyperparameter grid needs at least 2 points per axis, but {0} were requested.")]
    TooFewGridPoints(usize),

    #[error("Invalid hyperparameter for '{algorithm}': {reason}")]
    InvalidConfiguration { algorithm: Algorithm, reason: String },
}

/// A tunable hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Hyper {
    /// Regularization strength of ridge, lasso and kernel ridge.
    Alpha,
    /// RBF kernel width.
    Gamma,
    /// SVR box constraint.
    C,
}

impl Hyper {
    pub fn name(self) -> &'static str {
        match self {
            Hyper::Alpha => "alpha",
            Hyper::Gamma => "gamma",
            Hyper::C => "C",
        }
    }
}

impl fmt::Display for Hyper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One point of a hyperparameter grid.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HyperParams {
    values: Vec<(Hyper, f64)>,
}

impl HyperParams {
    pub fn new(values: impl IntoIterator<Item = (Hyper, f64)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn get(&self, name: Hyper) -> Option<f64> {
        self.values
            .iter()
            .find(|(hyper, _)| *hyper == name)
            .map(|&(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Hyper, f64)> + '_ {
        self.values.iter().copied()
    }
}

impl fmt::Display for HyperParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .values
            .iter()
            .map(|(hyper, value)| format!("{hyper}={value:.4e}"))
            .join(", ");
        f.write_str(&rendered)
    }
}

/// Candidate values for each hyperparameter of one algorithm.
///
/// Candidates are enumerated as the cartesian product of the axes, in axis
/// order with the last axis varying fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperGrid {
    axes: Vec<(Hyper, Vec<f64>)>,
}

impl HyperGrid {
    pub fn axes(&self) -> &[(Hyper, Vec<f64>)] {
        &self.axes
    }

    pub fn len(&self) -> usize {
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn candidates(&self) -> Vec<HyperParams> {
        let names: Vec<Hyper> = self.axes.iter().map(|&(hyper, _)| hyper).collect();
        self.axes
            .iter()
            .map(|(_, values)| values.iter().copied())
            .multi_cartesian_product()
            .map(|point| HyperParams::new(names.iter().copied().zip(point)))
            .collect()
    }
}

/// `num` values evenly spaced in log10 space from `10^start` to `10^stop`,
/// both ends included.
pub fn logspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![10f64.powf(start)],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num)
                .map(|i| 10f64.powf(start + step * i as f64))
                .collect()
        }
    }
}

/// The regression algorithms available to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "rr")]
    Ridge,
    #[serde(rename = "lr")]
    Lasso,
    #[serde(rename = "krr_lin")]
    KernelRidgeLinear,
    #[serde(rename = "krr_rbf")]
    KernelRidgeRbf,
    #[serde(rename = "svr_lin")]
    SvrLinear,
    #[serde(rename = "svr_rbf")]
    SvrRbf,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::Ridge,
        Algorithm::Lasso,
        Algorithm::KernelRidgeLinear,
        Algorithm::KernelRidgeRbf,
        Algorithm::SvrLinear,
        Algorithm::SvrRbf,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Algorithm::Ridge => "rr",
            Algorithm::Lasso => "lr",
            Algorithm::KernelRidgeLinear => "krr_lin",
            Algorithm::KernelRidgeRbf => "krr_rbf",
            Algorithm::SvrLinear => "svr_lin",
            Algorithm::SvrRbf => "svr_rbf",
        }
    }

    /// The search grid with `num_params` points along every axis.
    pub fn grid(self, num_params: usize) -> Result<HyperGrid, RegistryError> {
        if num_params < 2 {
            return Err(RegistryError::TooFewGridPoints(num_params));
        }
        let shrinkage = || logspace(0.0, -3.0, num_params);
        let box_constraint = || logspace(0.0, 4.0, num_params);

        let axes = match self {
            Algorithm::Ridge | Algorithm::Lasso | Algorithm::KernelRidgeLinear => {
                vec![(Hyper::Alpha, shrinkage())]
            }
            Algorithm::KernelRidgeRbf => {
                vec![(Hyper::Alpha, shrinkage()), (Hyper::Gamma, shrinkage())]
            }
            Algorithm::SvrLinear => vec![(Hyper::C, box_constraint())],
            Algorithm::SvrRbf => vec![(Hyper::C, box_constraint()), (Hyper::Gamma, shrinkage())],
        };
        Ok(HyperGrid { axes })
    }

    /// Builds the estimator for one grid point.
    pub fn estimator(self, params: &HyperParams) -> Result<Estimator, RegistryError> {
        let require = |name: Hyper| {
            params
                .get(name)
                .ok_or(RegistryError::MissingHyperparameter {
                    algorithm: self,
                    name: name.name(),
                })
        };

        let estimator = match self {
            Algorithm::Ridge => Estimator::Ridge {
                alpha: require(Hyper::Alpha)?,
            },
            Algorithm::Lasso => Estimator::Lasso {
                alpha: require(Hyper::Alpha)?,
            },
            Algorithm::KernelRidgeLinear => Estimator::KernelRidge {
                alpha: require(Hyper::Alpha)?,
                kernel: Kernel::Linear,
            },
            Algorithm::KernelRidgeRbf => Estimator::KernelRidge {
                alpha: require(Hyper::Alpha)?,
                kernel: Kernel::Rbf {
                    gamma: require(Hyper::Gamma)?,
                },
            },
            Algorithm::SvrLinear => Estimator::Svr {
                c: require(Hyper::C)?,
                epsilon: SVR_EPSILON,
                kernel: Kernel::Linear,
            },
            Algorithm::SvrRbf => Estimator::Svr {
                c: require(Hyper::C)?,
                epsilon: SVR_EPSILON,
                kernel: Kernel::Rbf {
                    gamma: require(Hyper::Gamma)?,
                },
            },
        };

        estimator
            .validate()
            .map_err(|err| RegistryError::InvalidConfiguration {
                algorithm: self,
                reason: err.to_string(),
            })?;
        Ok(estimator)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Every algorithm with its search grid at `num_params` points per axis.
pub fn get_regressors(num_params: usize) -> Result<BTreeMap<Algorithm, HyperGrid>, RegistryError> {
    Algorithm::ALL
        .into_iter()
        .map(|algorithm| Ok((algorithm, algorithm.grid(num_params)?)))
        .collect()
}

/// A selected algorithm together with its chosen hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfiguration {
    algorithm: Algorithm,
    params: HyperParams,
    estimator: Estimator,
}

impl ModelConfiguration {
    pub fn new(algorithm: Algorithm, params: HyperParams) -> Result<Self, RegistryError> {
        let estimator = algorithm.estimator(&params)?;
        Ok(Self {
            algorithm,
            params,
            estimator,
        })
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn params(&self) -> &HyperParams {
        &self.params
    }

    pub fn estimator(&self) -> &Estimator {
        &self.estimator
    }
}

impl fmt::Display for ModelConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.algorithm, self.params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn logspace_includes_both_endpoints() {
        let values = logspace(0.0, -3.0, 4);
        let expected = [1.0, 0.1, 0.01, 0.001];
        for (v, e) in values.iter().zip(expected) {
            assert_relative_eq!(*v, e, max_relative = 1e-12);
        }
    }

    #[test]
    fn grids_have_the_expected_axes_and_sizes() {
        let registry = get_regressors(10).unwrap();
        assert_eq!(registry.len(), 6);
        assert_eq!(registry[&Algorithm::Ridge].len(), 10);
        assert_eq!(registry[&Algorithm::KernelRidgeRbf].len(), 100);
        assert_eq!(registry[&Algorithm::SvrRbf].len(), 100);

        let svr = &registry[&Algorithm::SvrLinear].axes()[0];
        assert_eq!(svr.0, Hyper::C);
        assert_relative_eq!(svr.1[0], 1.0);
        assert_relative_eq!(svr.1[9], 1e4, max_relative = 1e-12);
    }

    #[test]
    fn candidates_vary_the_last_axis_fastest() {
        let grid = Algorithm::KernelRidgeRbf.grid(2).unwrap();
        let candidates = grid.candidates();
        assert_eq!(candidates.len(), 4);
        let pairs: Vec<(f64, f64)> = candidates
            .iter()
            .map(|c| (c.get(Hyper::Alpha).unwrap(), c.get(Hyper::Gamma).unwrap()))
            .collect();
        assert_relative_eq!(pairs[0].0, 1.0);
        assert_relative_eq!(pairs[0].1, 1.0);
        assert_relative_eq!(pairs[1].0, 1.0);
        assert_relative_eq!(pairs[1].1, 1e-3, max_relative = 1e-12);
        assert_relative_eq!(pairs[2].0, 1e-3, max_relative = 1e-12);
    }

    #[test]
    fn every_algorithm_builds_from_its_own_grid() {
        for algorithm in Algorithm::ALL {
            let grid = algorithm.grid(3).unwrap();
            for params in grid.candidates() {
                let config = ModelConfiguration::new(algorithm, params).unwrap();
                assert_eq!(config.algorithm(), algorithm);
            }
        }
    }

    #[test]
    fn missing_hyperparameters_are_reported() {
        let params = HyperParams::new([(Hyper::Alpha, 0.1)]);
        let err = Algorithm::KernelRidgeRbf.estimator(&params).unwrap_err();
        assert_eq!(
            err,
            RegistryError::MissingHyperparameter {
                algorithm: Algorithm::KernelRidgeRbf,
                name: "gamma"
            }
        );
    }

    #[test]
    fn identifiers_match_their_serialized_names() {
        for algorithm in Algorithm::ALL {
            let json = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(json, format!("\"{}\"", algorithm.id()));
        }
    }

    #[test]
    fn an_empty_grid_is_reported_by_the_search() {
        let grid = HyperGrid {
            axes: vec![(Hyper::Alpha, Vec::new())],
        };
        assert!(grid.is_empty());
        let x = ndarray::Array2::<f64>::zeros((6, 2));
        let y = ndarray::Array1::<f64>::zeros(6);
        let folds = crate::folds::build_plain_folds(6, 2).unwrap();
        let err = crate::search::grid_search(
            x.view(),
            y.view(),
            Algorithm::Ridge,
            &grid,
            &folds,
            crate::transform::Reduction::None,
            &crate::scoring::Scoring::single(crate::scoring::Metric::R2),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            crate::search::PipelineError::EmptyGrid(Algorithm::Ridge)
        ));
    }

    #[test]
    fn single_point_grids_are_rejected() {
        assert_eq!(
            Algorithm::Ridge.grid(1).unwrap_err(),
            RegistryError::TooFewGridPoints(1)
        );
    }
}
