//! Module for running the per-marker association scan (score screen + LRT escalation)
use crate::hwe::{is_x_chromosome, marker_hwe};
use crate::io::{align_samples, GenotypeSource, IoError};
use crate::model::ConfigError;
use crate::regression::{fit_glm, FitError, FitOptions, GlmFit};
use crate::score::{chi2_sf, ScoreCache, ScoreTest};
use crate::BaselineFit;
use ndarray::{Array1, Array2, Axis};
use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid scan configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Baseline model cannot be used for scanning: {0}")]
    Baseline(#[from] FitError),
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Thresholds and fitting controls for the scan.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Markers with MAF at or below this value are not tested
    pub maf_threshold: f64,
    /// Screening p-value below which the full model is refit for an LRT
    pub lrt_threshold: f64,
    /// Family-wise level for the Bonferroni reporting gate
    pub alpha: f64,
    /// Overrides `alpha / n_tested` when set
    pub reporting_threshold: Option<f64>,
    pub fit: FitOptions,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            maf_threshold: 0.01,
            lrt_threshold: 5e-8,
            alpha: 0.05,
            reporting_threshold: None,
            fit: FitOptions::default(),
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |keyword: &str, value: f64| ConfigError::InvalidValue {
            keyword: keyword.to_string(),
            value: value.to_string(),
        };
        if !(0.0..0.5).contains(&self.maf_threshold) {
            return Err(invalid("maf-threshold", self.maf_threshold));
        }
        if !(self.lrt_threshold > 0.0 && self.lrt_threshold <= 1.0) {
            return Err(invalid("lrt-threshold", self.lrt_threshold));
        }
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(invalid("alpha", self.alpha));
        }
        if let Some(t) = self.reporting_threshold {
            if !(t > 0.0 && t <= 1.0) {
                return Err(invalid("report-threshold", t));
            }
        }
        if self.fit.max_iter == 0 {
            return Err(invalid("max-iter", 0.0));
        }
        if !(self.fit.tolerance > 0.0) {
            return Err(invalid("tolerance", self.fit.tolerance));
        }
        Ok(())
    }
}

/// Terminal state of one marker.
#[derive(serde::Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    /// MAF at or below the threshold; p-value left at 1
    SkippedMaf,
    /// Score test only
    Screened,
    /// Refit with the marker and tested by likelihood ratio
    Escalated,
    /// Refit failed; screening p-value kept
    EscalationFailed,
    /// Too few genotyped rows or the null model could not be refit on them
    Untestable,
}

/// Per-marker result, one per marker in panel order.
#[derive(Debug, Clone)]
pub struct MarkerResult {
    pub index: usize,
    pub outcome: MarkerOutcome,
    /// Final p-value (LRT when escalated, otherwise score test)
    pub pvalue: f64,
    pub screen: Option<ScoreTest>,
    /// Marker effect: refit coefficient when escalated, one-step estimate otherwise
    pub beta: Option<f64>,
    pub se: Option<f64>,
    /// Log-likelihood of the model including the marker (escalated markers only)
    pub log_likelihood: Option<f64>,
    /// Rows used for the test
    pub n_samples: usize,
    pub hwe_pvalue: Option<f64>,
    pub warning: Option<String>,
}

impl MarkerResult {
    fn new(index: usize, outcome: MarkerOutcome) -> Self {
        MarkerResult {
            index,
            outcome,
            pvalue: 1.0,
            screen: None,
            beta: None,
            se: None,
            log_likelihood: None,
            n_samples: 0,
            hwe_pvalue: None,
            warning: None,
        }
    }

    fn untestable(index: usize, n_samples: usize, warning: String) -> Self {
        log::warn!("Marker {}: {}", index, warning);
        MarkerResult {
            n_samples,
            warning: Some(warning),
            ..MarkerResult::new(index, MarkerOutcome::Untestable)
        }
    }
}

/// Record written for markers passing the reporting gate.
#[derive(serde::Serialize, Debug, Clone)]
pub struct MarkerReport {
    pub id: String,
    pub chrom: String,
    pub pos: u64,
    pub pval: f64,
    pub maf: f64,
    pub hwe_pval: Option<f64>,
    pub beta: Option<f64>,
    pub se: Option<f64>,
    pub loglik: Option<f64>,
    pub n_samples: usize,
    pub outcome: MarkerOutcome,
}

pub struct ScanResult {
    /// One p-value per marker; 1.0 for markers that were not tested
    pub pvalues: Vec<f64>,
    pub markers: Vec<MarkerResult>,
    /// Markers passing the reporting gate, in panel order
    pub reports: Vec<MarkerReport>,
    /// Markers passing the MAF filter
    pub n_tested: usize,
    pub reporting_threshold: f64,
    /// (marker index, message) for per-marker fit failures
    pub warnings: Vec<(usize, String)>,
}

/// p-value of the likelihood-ratio statistic 2 (l1 - l0). None when both fits
/// are exact, so the statistic is undefined.
pub fn lrt_pvalue(null_loglik: f64, alt_loglik: f64) -> Option<f64> {
    match (null_loglik.is_infinite(), alt_loglik.is_infinite()) {
        (true, true) => None,
        (false, true) => Some(0.0),
        _ => Some(chi2_sf((2.0 * (alt_loglik - null_loglik)).max(0.0))),
    }
}

/// Read-only state shared by every marker worker.
struct MarkerContext<'a> {
    baseline: &'a BaselineFit,
    cache: &'a ScoreCache,
    config: &'a ScanConfig,
    /// Genotype-source column of each baseline row
    sample_map: &'a [usize],
    reporting_threshold: f64,
}

impl<'a> MarkerContext<'a> {
    fn test_marker<G: GenotypeSource>(&self, index: usize, genotypes: &G) -> MarkerResult {
        let info = genotypes.marker(index);
        if !(info.maf > self.config.maf_threshold) {
            log::trace!("Marker {} ({}) skipped: MAF {:.4}", index, info.id, info.maf);
            return MarkerResult::new(index, MarkerOutcome::SkippedMaf);
        }

        let row = genotypes.dosages(index);
        let d: Array1<f64> = self.sample_map.iter().map(|&j| row[j]).collect();
        let keep: Vec<usize> = (0..d.len()).filter(|&r| !d[r].is_nan()).collect();

        let mut result = if keep.len() == d.len() {
            self.screen_and_escalate(
                index,
                &d,
                &self.baseline.x,
                &self.baseline.y,
                &self.baseline.fit,
                self.cache,
            )
        } else {
            self.test_reduced(index, &d, &keep)
        };

        if result.pvalue < self.reporting_threshold {
            let sex = self.baseline.sex.as_deref();
            result.hwe_pvalue = Some(marker_hwe(d.view(), sex, is_x_chromosome(&info.chrom)));
        }

        log::trace!(
            "Marker {} ({}:{}:{}) {:?}: p = {:.3e}",
            index,
            info.chrom,
            info.pos,
            info.id,
            result.outcome,
            result.pvalue
        );
        result
    }

    /// Tests on the rows with an observed dosage, refitting the null model there
    /// so that screen and LRT compare fits on identical rows.
    fn test_reduced(&self, index: usize, d: &Array1<f64>, keep: &[usize]) -> MarkerResult {
        let p = self.baseline.x.ncols();
        if keep.len() < p + 2 {
            return MarkerResult::untestable(
                index,
                keep.len(),
                format!("only {} genotyped samples for {} covariates", keep.len(), p),
            );
        }

        let x = self.baseline.x.select(Axis(0), keep);
        let y = self.baseline.y.select(Axis(0), keep);
        let d = d.select(Axis(0), keep);
        log::trace!("Marker {}: {} of {} samples genotyped", index, keep.len(), self.baseline.y.len());

        let null_fit = match fit_glm(&x, &y, self.baseline.family, &self.config.fit) {
            Ok(fit) => fit,
            Err(e) => {
                return MarkerResult::untestable(index, keep.len(), format!("null refit failed: {}", e))
            }
        };
        let cache = match ScoreCache::new(&x, &y, self.baseline.family, &null_fit) {
            Ok(cache) => cache,
            Err(e) => {
                return MarkerResult::untestable(index, keep.len(), format!("null refit failed: {}", e))
            }
        };
        self.screen_and_escalate(index, &d, &x, &y, &null_fit, &cache)
    }

    fn screen_and_escalate(
        &self,
        index: usize,
        d: &Array1<f64>,
        x: &Array2<f64>,
        y: &Array1<f64>,
        null_fit: &GlmFit,
        cache: &ScoreCache,
    ) -> MarkerResult {
        let screen = cache.test(d.view());
        let mut result = MarkerResult {
            pvalue: screen.pvalue,
            screen: Some(screen),
            beta: Some(screen.beta).filter(|b| b.is_finite()),
            se: Some(screen.se).filter(|s| s.is_finite()),
            n_samples: d.len(),
            ..MarkerResult::new(index, MarkerOutcome::Screened)
        };

        if !(screen.pvalue < self.config.lrt_threshold) {
            return result;
        }

        let (n, p) = x.dim();
        let x1 = Array2::from_shape_fn((n, p + 1), |(r, c)| if c < p { x[[r, c]] } else { d[r] });
        match fit_glm(&x1, y, self.baseline.family, &self.config.fit) {
            Ok(alt) => match lrt_pvalue(null_fit.log_likelihood, alt.log_likelihood) {
                Some(pvalue) => {
                    result.outcome = MarkerOutcome::Escalated;
                    result.pvalue = pvalue;
                    result.beta = Some(alt.coefficients[p]);
                    result.se = Some(alt.standard_errors[p]);
                    result.log_likelihood = Some(alt.log_likelihood);
                }
                None => {
                    log::debug!("Marker {}: null and full fits both exact, keeping score p-value", index);
                }
            },
            Err(e) => {
                let message = format!("LRT refit failed ({}); keeping score p-value", e);
                log::warn!("Marker {}: {}", index, message);
                result.outcome = MarkerOutcome::EscalationFailed;
                result.warning = Some(message);
            }
        }
        result
    }
}

/// Main entry point for Step 2.
/// Screens every marker in parallel against the fixed baseline fit.
pub fn run_scan<G: GenotypeSource>(
    baseline: &BaselineFit,
    genotypes: &G,
    config: &ScanConfig,
) -> Result<ScanResult, ScanError> {
    config.validate()?;

    log::info!("Starting association scan");
    log::info!("Baseline model: {} ({})", baseline.formula, baseline.family);
    log::info!("MAF threshold: {}", config.maf_threshold);
    log::info!("LRT escalation threshold: {:e}", config.lrt_threshold);

    let sample_map = align_samples(genotypes.sample_ids(), &baseline.sample_ids)?;
    log::info!(
        "Sample alignment: {} model samples found among {} genotyped",
        sample_map.len(),
        genotypes.sample_ids().len()
    );

    let n_markers = genotypes.n_markers();
    let n_tested = (0..n_markers)
        .filter(|&i| genotypes.marker(i).maf > config.maf_threshold)
        .count();
    let reporting_threshold = config.reporting_threshold.unwrap_or_else(|| {
        config.alpha / n_tested.max(1) as f64
    });
    log::info!("{} of {} markers pass the MAF filter", n_tested, n_markers);
    log::info!("Reporting threshold: {:.3e}", reporting_threshold);

    // Shared by all workers; read-only from here on
    let cache = ScoreCache::new(&baseline.x, &baseline.y, baseline.family, &baseline.fit)?;
    let context = MarkerContext {
        baseline,
        cache: &cache,
        config,
        sample_map: &sample_map,
        reporting_threshold,
    };

    log::info!("Processing markers in parallel...");
    let markers: Vec<MarkerResult> = (0..n_markers)
        .into_par_iter()
        .map(|i| context.test_marker(i, genotypes))
        .collect();

    let pvalues: Vec<f64> = markers.iter().map(|m| m.pvalue).collect();
    let warnings: Vec<(usize, String)> = markers
        .iter()
        .filter_map(|m| m.warning.clone().map(|w| (m.index, w)))
        .collect();

    let reports: Vec<MarkerReport> = markers
        .iter()
        .filter(|m| m.pvalue < reporting_threshold)
        .map(|m| {
            let info = genotypes.marker(m.index);
            MarkerReport {
                id: info.id.clone(),
                chrom: info.chrom.clone(),
                pos: info.pos,
                pval: m.pvalue,
                maf: info.maf,
                hwe_pval: m.hwe_pvalue,
                beta: m.beta,
                se: m.se,
                loglik: m.log_likelihood,
                n_samples: m.n_samples,
                outcome: m.outcome,
            }
        })
        .collect();

    let count = |o: MarkerOutcome| markers.iter().filter(|m| m.outcome == o).count();
    log::info!("Association scan complete:");
    log::info!("  Skipped by MAF: {}", count(MarkerOutcome::SkippedMaf));
    log::info!("  Screened only: {}", count(MarkerOutcome::Screened));
    log::info!("  Escalated to LRT: {}", count(MarkerOutcome::Escalated));
    log::info!("  Escalation failures: {}", count(MarkerOutcome::EscalationFailed));
    log::info!("  Untestable: {}", count(MarkerOutcome::Untestable));
    log::info!("  Passing reporting threshold: {}", reports.len());
    if !warnings.is_empty() {
        log::warn!("{} markers had fitting problems; see the outcome column", warnings.len());
    }

    Ok(ScanResult {
        pvalues,
        markers,
        reports,
        n_tested,
        reporting_threshold,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{DosageMatrix, MarkerInfo};
    use crate::regression::fit_glm;
    use crate::model::Formula;
    use crate::Family;

    fn baseline(y: Vec<f64>, covariate: Vec<f64>, family: Family) -> BaselineFit {
        let n = y.len();
        let x = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 { 1.0 } else { covariate[i] });
        let y = Array1::from(y);
        let fit = fit_glm(&x, &y, family, &FitOptions::default()).unwrap();
        BaselineFit {
            formula: Formula::parse("y ~ cov").unwrap(),
            family,
            column_names: vec!["(Intercept)".into(), "cov".into()],
            x,
            y,
            sample_ids: (0..n).map(|i| format!("s{}", i)).collect(),
            sex: None,
            fit,
        }
    }

    fn panel(rows: Vec<Vec<f64>>, sample_ids: Vec<String>) -> DosageMatrix {
        let n = sample_ids.len();
        let markers = (0..rows.len())
            .map(|i| MarkerInfo {
                id: format!("rs{}", i),
                chrom: "1".into(),
                pos: 1000 * (i as u64 + 1),
                maf: f64::NAN,
            })
            .collect();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        DosageMatrix::new(markers, sample_ids, Array2::from_shape_vec((flat.len() / n, n), flat).unwrap())
            .unwrap()
    }

    fn linear_cohort() -> (BaselineFit, Vec<f64>) {
        let covariate: Vec<f64> = (0..40).map(|i| ((i * 7) % 11) as f64 / 3.0).collect();
        let genotype: Vec<f64> = (0..40).map(|i| ((i * 5) % 3) as f64).collect();
        let y: Vec<f64> = (0..40)
            .map(|i| 1.0 + 0.5 * covariate[i] + 2.0 * genotype[i] + ((i * 13) % 7) as f64 / 10.0)
            .collect();
        (baseline(y, covariate, Family::Linear), genotype)
    }

    #[test]
    fn rare_markers_keep_pvalue_one() {
        let (base, genotype) = linear_cohort();
        let mut rare = vec![0.0; 40];
        rare[3] = 1.0;
        let geno = panel(vec![genotype, rare], base.sample_ids.clone());
        let config = ScanConfig { maf_threshold: 0.05, ..ScanConfig::default() };
        let result = run_scan(&base, &geno, &config).unwrap();

        assert_eq!(result.markers[1].outcome, MarkerOutcome::SkippedMaf);
        assert_eq!(result.pvalues[1], 1.0);
        assert_eq!(result.n_tested, 1);
        assert_eq!(result.reporting_threshold, 0.05);
    }

    #[test]
    fn strong_marker_is_escalated_and_reported() {
        let (base, genotype) = linear_cohort();
        let geno = panel(vec![genotype], base.sample_ids.clone());
        let result = run_scan(&base, &geno, &ScanConfig::default()).unwrap();

        let m = &result.markers[0];
        assert_eq!(m.outcome, MarkerOutcome::Escalated);
        assert!(m.pvalue < 5e-8);
        assert!((m.beta.unwrap() - 2.0).abs() < 0.2);
        assert!(m.log_likelihood.unwrap() > base.fit.log_likelihood);
        assert_eq!(result.reports.len(), 1);
        assert!(result.reports[0].hwe_pval.is_some());
    }

    #[test]
    fn samples_are_aligned_by_id() {
        let (base, genotype) = linear_cohort();
        // Same dosages, genotype columns stored in reverse sample order
        let mut ids = base.sample_ids.clone();
        ids.reverse();
        let mut reversed = genotype.clone();
        reversed.reverse();
        let straight = run_scan(&base, &panel(vec![genotype], base.sample_ids.clone()), &ScanConfig::default()).unwrap();
        let shuffled = run_scan(&base, &panel(vec![reversed], ids), &ScanConfig::default()).unwrap();
        assert_eq!(straight.pvalues, shuffled.pvalues);
    }

    #[test]
    fn missing_dosages_use_reduced_rows() {
        let (base, mut genotype) = linear_cohort();
        genotype[0] = f64::NAN;
        genotype[7] = f64::NAN;
        let geno = panel(vec![genotype], base.sample_ids.clone());
        let result = run_scan(&base, &geno, &ScanConfig::default()).unwrap();
        assert_eq!(result.markers[0].n_samples, 38);
        assert!(result.markers[0].pvalue < 5e-8);
    }

    #[test]
    fn mostly_missing_marker_is_untestable() {
        let (base, _) = linear_cohort();
        let mut sparse = vec![f64::NAN; 40];
        sparse[0] = 0.0;
        sparse[1] = 1.0;
        sparse[2] = 2.0;
        let geno = panel(vec![sparse], base.sample_ids.clone());
        let result = run_scan(&base, &geno, &ScanConfig::default()).unwrap();
        assert_eq!(result.markers[0].outcome, MarkerOutcome::Untestable);
        assert_eq!(result.pvalues[0], 1.0);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn failed_refit_keeps_screening_pvalue() {
        // Perfectly separating marker: logistic refit cannot converge in 3 iterations
        let y: Vec<f64> = (0..30).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
        let covariate: Vec<f64> = (0..30).map(|i| (i % 5) as f64).collect();
        let base = baseline(y.clone(), covariate, Family::Logistic);
        let marker: Vec<f64> = y.iter().map(|&v| 2.0 * v).collect();
        let geno = panel(vec![marker], base.sample_ids.clone());
        let config = ScanConfig {
            lrt_threshold: 1.0,
            fit: FitOptions { max_iter: 3, tolerance: 1e-8 },
            ..ScanConfig::default()
        };
        let result = run_scan(&base, &geno, &config).unwrap();
        let m = &result.markers[0];
        assert_eq!(m.outcome, MarkerOutcome::EscalationFailed);
        assert_eq!(m.pvalue, m.screen.unwrap().pvalue);
        assert!(m.warning.is_some());
    }

    #[test]
    fn unusable_baseline_aborts_the_scan() {
        // Fitted means of exactly 1 give zero logistic weights, so X'WX is singular
        let mut base = baseline(
            (0..20).map(|i| (i % 2) as f64).collect(),
            (0..20).map(|i| i as f64).collect(),
            Family::Logistic,
        );
        base.fit.fitted = Array1::ones(20);
        let geno = panel(vec![(0..20).map(|i| (i % 3) as f64).collect()], base.sample_ids.clone());

        let err = run_scan(&base, &geno, &ScanConfig::default()).err().unwrap();
        assert!(matches!(err, ScanError::Baseline(FitError::RankDeficient { .. })));
    }

    #[test]
    fn lrt_handles_exact_fits() {
        assert_eq!(lrt_pvalue(-10.0, f64::INFINITY), Some(0.0));
        assert_eq!(lrt_pvalue(f64::INFINITY, f64::INFINITY), None);
        assert_eq!(lrt_pvalue(-10.0, -10.0), Some(1.0));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let config = ScanConfig { maf_threshold: 0.7, ..ScanConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
        let config = ScanConfig { reporting_threshold: Some(0.0), ..ScanConfig::default() };
        assert!(config.validate().is_err());
    }
}
