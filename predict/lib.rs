#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod config;
pub mod data;
pub mod estimators;
pub mod folds;
pub mod lesion;
pub mod output;
pub mod regressors;
pub mod scoring;
pub mod search;
pub mod transform;
