//! Fast maximum-likelihood fitter for linear, logistic and Poisson regression.
//!
//! Linear models are solved in closed form from the normal equations. Logistic
//! and Poisson models use iteratively reweighted least squares on the canonical
//! link, which coincides with Newton-Raphson for these families.
use crate::Family;
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

/// Squared Cholesky pivot relative to the matching diagonal entry below which a
/// column is treated as collinear with the columns before it.
const RANK_TOLERANCE: f64 = 1e-10;
/// Residual variance (relative to mean y^2) reported as an exact fit.
const ZERO_VARIANCE_TOLERANCE: f64 = 1e-20;
/// Lower bound on IRLS working weights.
const MIN_WEIGHT: f64 = 1e-10;
const MAX_STEP_HALVINGS: usize = 10;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("Design matrix is rank deficient: column {column} is collinear with earlier columns")]
    RankDeficient { column: usize },
    #[error("IRLS failed to converge in {iterations} iterations")]
    NonConvergence { iterations: usize },
    #[error("Invalid dimensions: {0}")]
    Dimensions(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Iteration controls for IRLS.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FitOptions {
    pub max_iter: usize,
    /// Relative log-likelihood change that counts as converged
    pub tolerance: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            max_iter: 25,
            tolerance: 1e-8,
        }
    }
}

/// Result of a single model fit.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone)]
pub struct GlmFit {
    /// One coefficient per design column
    pub coefficients: Array1<f64>,
    pub standard_errors: Array1<f64>,
    /// Maximized log-likelihood; +inf for a linear model with zero residual variance
    pub log_likelihood: f64,
    /// Fitted means (mu)
    pub fitted: Array1<f64>,
    /// Residual variance MLE for linear models, 1 otherwise
    pub dispersion: f64,
    /// IRLS iterations used (0 for the closed-form linear fit)
    pub iterations: usize,
}

impl Family {
    /// Inverse of the canonical link.
    pub fn mean(&self, eta: f64) -> f64 {
        match self {
            Family::Linear => eta,
            Family::Logistic => {
                if eta >= 0.0 {
                    1.0 / (1.0 + (-eta).exp())
                } else {
                    let e = eta.exp();
                    e / (1.0 + e)
                }
            }
            Family::Poisson => eta.exp(),
        }
    }

    /// Canonical link.
    pub fn link(&self, mu: f64) -> f64 {
        match self {
            Family::Linear => mu,
            Family::Logistic => (mu / (1.0 - mu)).ln(),
            Family::Poisson => mu.ln(),
        }
    }

    /// Variance function V(mu); also the IRLS weight under the canonical link.
    pub fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Linear => 1.0,
            Family::Logistic => mu * (1.0 - mu),
            Family::Poisson => mu,
        }
    }

    fn start_mean(&self, y: f64) -> f64 {
        match self {
            Family::Linear => y,
            Family::Logistic => (y + 0.5) / 2.0,
            Family::Poisson => y + 0.1,
        }
    }

    fn validate_response(&self, y: &Array1<f64>) -> Result<(), FitError> {
        if let Some(v) = y.iter().find(|v| !v.is_finite()) {
            return Err(FitError::InvalidResponse(format!("non-finite value {}", v)));
        }
        match self {
            Family::Linear => Ok(()),
            Family::Logistic => match y.iter().find(|&&v| v != 0.0 && v != 1.0) {
                Some(v) => Err(FitError::InvalidResponse(format!(
                    "logistic response must be 0/1, found {}",
                    v
                ))),
                None => Ok(()),
            },
            Family::Poisson => match y.iter().find(|&&v| v < 0.0) {
                Some(v) => Err(FitError::InvalidResponse(format!(
                    "poisson response must be non-negative, found {}",
                    v
                ))),
                None => Ok(()),
            },
        }
    }

    /// Log-likelihood of `y` at linear predictor `eta`. For the linear family
    /// the residual variance is profiled out at its MLE.
    pub fn log_likelihood(&self, y: &Array1<f64>, eta: &Array1<f64>) -> f64 {
        match self {
            Family::Linear => {
                let n = y.len() as f64;
                let rss: f64 = y.iter().zip(eta.iter()).map(|(a, b)| (a - b).powi(2)).sum();
                let scale = y.dot(y) / n;
                if rss / n <= ZERO_VARIANCE_TOLERANCE * scale.max(f64::MIN_POSITIVE) {
                    f64::INFINITY
                } else {
                    -0.5 * n * ((2.0 * std::f64::consts::PI * rss / n).ln() + 1.0)
                }
            }
            Family::Logistic => y
                .iter()
                .zip(eta.iter())
                .map(|(&yi, &e)| yi * e - softplus(e))
                .sum(),
            Family::Poisson => y
                .iter()
                .zip(eta.iter())
                .map(|(&yi, &e)| yi * e - e.exp() - ln_gamma(yi + 1.0))
                .sum(),
        }
    }
}

/// ln(1 + e^x) without overflow.
fn softplus(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Fits `y ~ x` by maximum likelihood for the given family.
pub fn fit_glm(
    x: &Array2<f64>,
    y: &Array1<f64>,
    family: Family,
    options: &FitOptions,
) -> Result<GlmFit, FitError> {
    let (n, p) = x.dim();
    if y.len() != n {
        return Err(FitError::Dimensions(format!(
            "response has {} rows but design matrix has {}",
            y.len(),
            n
        )));
    }
    if n < p || p == 0 {
        return Err(FitError::Dimensions(format!("{} rows for {} columns", n, p)));
    }
    family.validate_response(y)?;

    match family {
        Family::Linear => fit_linear(x, y),
        Family::Logistic | Family::Poisson => fit_irls(x, y, family, options),
    }
}

fn fit_linear(x: &Array2<f64>, y: &Array1<f64>) -> Result<GlmFit, FitError> {
    let n = y.len() as f64;
    let xtx = x.t().dot(x);
    let xty = x.t().dot(y);
    let chol = factor(&xtx)?;
    let coefficients = solve(&chol, &xty);
    let fitted = x.dot(&coefficients);
    let log_likelihood = Family::Linear.log_likelihood(y, &fitted);
    let dispersion = if log_likelihood.is_finite() {
        y.iter().zip(fitted.iter()).map(|(a, b)| (a - b).powi(2)).sum::<f64>() / n
    } else {
        0.0
    };

    Ok(GlmFit {
        standard_errors: standard_errors(&chol, dispersion),
        coefficients,
        log_likelihood,
        fitted,
        dispersion,
        iterations: 0,
    })
}

fn fit_irls(
    x: &Array2<f64>,
    y: &Array1<f64>,
    family: Family,
    options: &FitOptions,
) -> Result<GlmFit, FitError> {
    let mut mu = y.mapv(|v| family.start_mean(v));
    let mut eta = mu.mapv(|m| family.link(m));
    let mut beta: Option<Array1<f64>> = None;
    let mut ll_old = f64::NEG_INFINITY;

    for iter in 1..=options.max_iter {
        let w = mu.mapv(|m| family.variance(m).max(MIN_WEIGHT));
        // Working response for a canonical link: z = eta + (y - mu) / V(mu)
        let z = &eta + &((y - &mu) / &w);
        let (xtwx, xtwz) = weighted_cross_products(x, &w, &z);
        let chol = factor(&xtwx)?;

        let mut beta_new = solve(&chol, &xtwz);
        let mut eta_new = x.dot(&beta_new);
        let mut ll = family.log_likelihood(y, &eta_new);

        if let Some(prev) = &beta {
            let mut halvings = 0;
            while (!ll.is_finite() || ll < ll_old) && halvings < MAX_STEP_HALVINGS {
                beta_new = (&beta_new + prev) / 2.0;
                eta_new = x.dot(&beta_new);
                ll = family.log_likelihood(y, &eta_new);
                halvings += 1;
            }
            if halvings > 0 {
                log::trace!("IRLS iteration {}: {} step halvings", iter, halvings);
            }
        }
        if !ll.is_finite() {
            return Err(FitError::NonConvergence { iterations: iter });
        }

        let converged = (ll - ll_old).abs() / (ll.abs() + 0.1) < options.tolerance;
        log::trace!("IRLS iteration {}: loglik = {:.10}", iter, ll);

        mu = eta_new.mapv(|e| family.mean(e));
        eta = eta_new;
        beta = Some(beta_new);
        ll_old = ll;

        if converged {
            let w = mu.mapv(|m| family.variance(m).max(MIN_WEIGHT));
            let (xtwx, _) = weighted_cross_products(x, &w, &z);
            let chol = factor(&xtwx)?;
            let coefficients = beta.unwrap_or_else(|| Array1::zeros(x.ncols()));
            return Ok(GlmFit {
                standard_errors: standard_errors(&chol, 1.0),
                coefficients,
                log_likelihood: ll,
                fitted: mu,
                dispersion: 1.0,
                iterations: iter,
            });
        }
    }

    Err(FitError::NonConvergence {
        iterations: options.max_iter,
    })
}

/// X'WX and X'Wz.
pub(crate) fn weighted_cross_products(
    x: &Array2<f64>,
    w: &Array1<f64>,
    z: &Array1<f64>,
) -> (Array2<f64>, Array1<f64>) {
    let mut xw = x.clone();
    for (mut row, &wi) in xw.rows_mut().into_iter().zip(w.iter()) {
        row *= wi;
    }
    (xw.t().dot(x), xw.t().dot(z))
}

/// Cholesky factor of a symmetric positive definite cross-product matrix,
/// rejecting collinear columns.
pub(crate) fn factor(a: &Array2<f64>) -> Result<Cholesky<f64, Dyn>, FitError> {
    let p = a.nrows();
    let m = DMatrix::from_fn(p, p, |i, j| a[[i, j]]);
    let chol = match m.clone().cholesky() {
        Some(c) => c,
        None => return Err(FitError::RankDeficient { column: first_dependent_column(&m) }),
    };
    let l = chol.l_dirty();
    for j in 0..p {
        let pivot = l[(j, j)];
        if !(pivot * pivot > RANK_TOLERANCE * m[(j, j)].abs()) {
            return Err(FitError::RankDeficient { column: j });
        }
    }
    Ok(chol)
}

// Smallest leading block that is not positive definite.
fn first_dependent_column(m: &DMatrix<f64>) -> usize {
    (1..=m.nrows())
        .find(|&k| m.view((0, 0), (k, k)).into_owned().cholesky().is_none())
        .map_or(0, |k| k - 1)
}

pub(crate) fn solve(chol: &Cholesky<f64, Dyn>, b: &Array1<f64>) -> Array1<f64> {
    let rhs = DVector::from_iterator(b.len(), b.iter().cloned());
    Array1::from_iter(chol.solve(&rhs).iter().cloned())
}

fn standard_errors(chol: &Cholesky<f64, Dyn>, dispersion: f64) -> Array1<f64> {
    let inv = chol.inverse();
    Array1::from_iter((0..inv.nrows()).map(|j| (inv[(j, j)] * dispersion).max(0.0).sqrt()))
}
