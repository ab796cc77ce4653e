//! # GWAS-SCAN-RUST Crate
//!
//! This library contains the core statistical logic for the `gwas-scan-rust` package.
//! The binaries `step1-fit-baseline` and `step2-scan` call functions from this library.

pub mod association;
pub mod fdr;
pub mod hwe;
pub mod io;
pub mod model;
pub mod null_model;
pub mod pca;
pub mod regression;
pub mod report;
pub mod score;

use model::{ConfigError, Formula};
use ndarray::{Array1, Array2};
use regression::GlmFit;

/// Represents the fitted baseline (covariates-only) model from Step 1.
/// This struct is serialized to disk with bincode and read by Step 2.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct BaselineFit {
    /// Response and ordered predictor terms the model was resolved from
    pub formula: Formula,
    /// Regression family used for the fit
    pub family: Family,
    /// Column names of the design matrix, intercept first
    pub column_names: Vec<String>,
    /// Complete-case design matrix (X0), intercept in column 0
    pub x: Array2<f64>,
    /// Complete-case response vector (y)
    pub y: Array1<f64>,
    /// Sample IDs of the complete-case rows, in design-matrix order
    pub sample_ids: Vec<String>,
    /// Sex codes (-1 female, +1 male, NaN unknown) aligned to `sample_ids`,
    /// when the phenotype table carried a sex column
    pub sex: Option<Vec<f64>>,
    /// Coefficients, log-likelihood and fitted means
    pub fit: GlmFit,
}

/// Regression family of the trait. Each variant carries its canonical link,
/// variance function and log-likelihood (see `regression`).
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Linear,
    Logistic,
    Poisson,
}

impl std::str::FromStr for Family {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" | "gaussian" | "quantitative" | "q" => Ok(Family::Linear),
            "logistic" | "binomial" | "binary" | "b" => Ok(Family::Logistic),
            "poisson" | "count" | "c" => Ok(Family::Poisson),
            _ => Err(ConfigError::UnknownFamily(s.to_string())),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Linear => write!(f, "linear"),
            Family::Logistic => write!(f, "logistic"),
            Family::Poisson => write!(f, "poisson"),
        }
    }
}
