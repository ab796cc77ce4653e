//! Score test for adding one column to a fitted null GLM.
use crate::regression::{factor, solve, weighted_cross_products, FitError, GlmFit};
use crate::Family;
use nalgebra::{Cholesky, Dyn};
use ndarray::{Array1, Array2, ArrayView1};
use statrs::distribution::{ChiSquared, ContinuousCDF};

/// Efficient information below this fraction of d'Wd means the candidate column
/// is (numerically) spanned by the null design.
const MIN_RELATIVE_INFORMATION: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTest {
    /// U^2 / I, chi-squared with 1 df under the null
    pub statistic: f64,
    pub pvalue: f64,
    /// One-step effect estimate U / I
    pub beta: f64,
    /// 1 / sqrt(I)
    pub se: f64,
}

impl ScoreTest {
    fn untestable() -> Self {
        ScoreTest {
            statistic: 0.0,
            pvalue: 1.0,
            beta: f64::NAN,
            se: f64::NAN,
        }
    }
}

/// Null-model quantities shared by every candidate column.
pub struct ScoreCache {
    x: Array2<f64>,
    weights: Array1<f64>,
    residuals: Array1<f64>,
    dispersion: f64,
    xtwx: Cholesky<f64, Dyn>,
}

impl ScoreCache {
    pub fn new(
        x: &Array2<f64>,
        y: &Array1<f64>,
        family: Family,
        null_fit: &GlmFit,
    ) -> Result<Self, FitError> {
        if x.nrows() != y.len() || null_fit.fitted.len() != y.len() {
            return Err(FitError::Dimensions(format!(
                "null fit has {} fitted values for {} rows",
                null_fit.fitted.len(),
                y.len()
            )));
        }
        let weights = null_fit.fitted.mapv(|m| family.variance(m));
        let residuals = y - &null_fit.fitted;
        let (xtwx, _) = weighted_cross_products(x, &weights, &residuals);
        let xtwx = factor(&xtwx)?;

        // An exact linear null fit leaves no residual variance to scale by
        let dispersion = match family {
            Family::Linear => null_fit.dispersion.max(f64::MIN_POSITIVE),
            Family::Logistic | Family::Poisson => 1.0,
        };
        log::debug!(
            "Score cache: {} rows, {} columns, dispersion {:.6}",
            x.nrows(),
            x.ncols(),
            dispersion
        );

        Ok(ScoreCache {
            x: x.clone(),
            weights,
            residuals,
            dispersion,
            xtwx,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.x.nrows()
    }

    /// Tests the candidate column `d` (one value per null-model row).
    pub fn test(&self, d: ArrayView1<f64>) -> ScoreTest {
        debug_assert_eq!(d.len(), self.n_rows());
        let wd = &d * &self.weights;
        let score = d.dot(&self.residuals) / self.dispersion;

        let xtwd = self.x.t().dot(&wd);
        let projected = xtwd.dot(&solve(&self.xtwx, &xtwd));
        let dtwd = d.dot(&wd);
        let information = (dtwd - projected) / self.dispersion;

        if !(information > MIN_RELATIVE_INFORMATION * dtwd / self.dispersion) {
            return ScoreTest::untestable();
        }

        let statistic = score * score / information;
        ScoreTest {
            statistic,
            pvalue: chi2_sf(statistic),
            beta: score / information,
            se: 1.0 / information.sqrt(),
        }
    }
}

/// Right-tail probability of a 1-df chi-squared variable.
pub fn chi2_sf(statistic: f64) -> f64 {
    if statistic.is_nan() {
        return 1.0;
    }
    if statistic == f64::INFINITY {
        return 0.0;
    }
    if statistic <= 0.0 {
        return 1.0;
    }
    ChiSquared::new(1.0).map_or(1.0, |chi2| chi2.sf(statistic).clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regression::{fit_glm, FitOptions};
    use approx::assert_relative_eq;
    use ndarray::{array, Axis};

    fn design(covariate: &[f64]) -> Array2<f64> {
        Array2::from_shape_fn((covariate.len(), 2), |(i, j)| if j == 0 { 1.0 } else { covariate[i] })
    }

    #[test]
    fn chi2_tail_reference_values() {
        assert_relative_eq!(chi2_sf(3.841458820694124), 0.05, max_relative = 1e-9);
        assert_relative_eq!(chi2_sf(29.716785), 5e-8, max_relative = 1e-4);
        assert_eq!(chi2_sf(0.0), 1.0);
        assert_eq!(chi2_sf(f64::INFINITY), 0.0);
    }

    #[test]
    fn linear_score_equals_n_times_r2_form() {
        let cov = [0.3, -1.2, 0.8, 1.5, -0.4, 0.0, 2.1, -0.9];
        let y = array![1.2, -0.5, 0.9, 2.2, 0.1, 0.4, 2.5, -0.2];
        let d = array![0.0, 1.0, 2.0, 1.0, 0.0, 1.0, 2.0, 0.0];
        let x0 = design(&cov);
        let null_fit = fit_glm(&x0, &y, Family::Linear, &FitOptions::default()).unwrap();
        let cache = ScoreCache::new(&x0, &y, Family::Linear, &null_fit).unwrap();
        let t = cache.test(d.view());

        let mut x1 = x0.clone();
        x1.push_column(d.view()).unwrap();
        let alt = fit_glm(&x1, &y, Family::Linear, &FitOptions::default()).unwrap();
        let n = y.len() as f64;
        // Score statistic with MLE dispersion: n (RSS0 - RSS1) / RSS0
        let expected = n * (null_fit.dispersion - alt.dispersion) / null_fit.dispersion;
        assert_relative_eq!(t.statistic, expected, max_relative = 1e-8);
    }

    #[test]
    fn column_in_null_span_is_untestable() {
        let cov = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
        let y = array![0.0, 1.0, 0.0, 1.0, 1.0, 1.0];
        let x0 = design(&cov);
        let null_fit = fit_glm(&x0, &y, Family::Logistic, &FitOptions::default()).unwrap();
        let cache = ScoreCache::new(&x0, &y, Family::Logistic, &null_fit).unwrap();

        let collinear = x0.column(1).mapv(|v| 2.0 * v + 1.0);
        assert_eq!(cache.test(collinear.view()).pvalue, 1.0);
        let constant = Array1::from_elem(6, 1.0);
        assert_eq!(cache.test(constant.view()).pvalue, 1.0);
    }

    #[test]
    fn poisson_score_is_positive_for_associated_column() {
        let x0 = Array2::ones((8, 1));
        let y = array![0.0, 1.0, 0.0, 1.0, 4.0, 5.0, 3.0, 6.0];
        let d = array![0.0, 0.0, 0.0, 0.0, 2.0, 2.0, 2.0, 2.0];
        let null_fit = fit_glm(&x0, &y, Family::Poisson, &FitOptions::default()).unwrap();
        let cache = ScoreCache::new(&x0, &y, Family::Poisson, &null_fit).unwrap();
        let t = cache.test(d.view());
        assert!(t.beta > 0.0);
        assert!(t.pvalue < 0.01);
        assert_eq!(x0.len_of(Axis(0)), cache.n_rows());
    }
}
