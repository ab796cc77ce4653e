//! Module for principal-component covariates derived from the
//! Genetic Relationship Matrix (GRM)
use crate::io::DosageMatrix;
use crate::model::{Formula, PhenotypeFrame};
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, Axis};
use rayon::prelude::*;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PcaError {
    #[error("No markers with non-zero variance available for the GRM")]
    NoVariableMarkers,
    #[error("Requested {requested} components but only {available} samples")]
    TooManyComponents { requested: usize, available: usize },
}

/// Principal-component scores, one row per sample.
#[derive(Debug, Clone)]
pub struct PcaComponents {
    pub sample_ids: Vec<String>,
    /// Shape (n_samples, k); column j is component j+1
    pub scores: Array2<f64>,
    /// Fraction of total GRM variance captured by each component
    pub variance_explained: Vec<f64>,
}

/// Anything able to produce the top-k principal components of a cohort.
pub trait PcaProvider {
    fn principal_components(&self, k: usize) -> Result<PcaComponents, PcaError>;
}

/// Calculates the GRM (A = Z^T Z / M) from standardized dosages.
/// `dosages` is (n_markers, n_samples); missing values are set to the marker
/// mean, which is 0 after standardization.
pub fn build_grm(dosages: &Array2<f64>, min_maf: f64) -> Result<(Array2<f64>, usize), PcaError> {
    let (n_markers, n_samples) = dosages.dim();

    // 1. Mean, variance and MAF of each marker over observed dosages
    let marker_stats: Vec<(f64, f64, f64)> = dosages
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            let mut count = 0;
            for &d in row.iter().filter(|d| !d.is_nan()) {
                sum += d;
                sum_sq += d * d;
                count += 1;
            }
            if count == 0 {
                return (0.0, 0.0, 0.0);
            }
            let mean = sum / count as f64;
            let var = (sum_sq / count as f64) - (mean * mean);
            let freq = mean / 2.0;
            (mean, var, freq.min(1.0 - freq))
        })
        .collect();

    let valid: Vec<usize> = marker_stats
        .iter()
        .enumerate()
        .filter(|(_, stats)| stats.1 > 1e-6 && stats.2 >= min_maf)
        .map(|(i, _)| i)
        .collect();
    log::info!("Markers used for GRM: {} / {}", valid.len(), n_markers);
    if valid.is_empty() {
        return Err(PcaError::NoVariableMarkers);
    }

    // 2. Standardize the selected markers
    let mut z = Array2::<f64>::zeros((valid.len(), n_samples));
    z.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(valid.par_iter())
        .for_each(|(mut out_row, &idx)| {
            let (mean, var, _) = marker_stats[idx];
            let sd = var.sqrt();
            for (out, &d) in out_row.iter_mut().zip(dosages.row(idx).iter()) {
                *out = if d.is_nan() { 0.0 } else { (d - mean) / sd };
            }
        });

    // 3. GRM = (1/M) * Z^T * Z
    log::info!("Computing GRM ({} x {})...", n_samples, n_samples);
    let grm = z.t().dot(&z) / valid.len() as f64;
    Ok((grm, valid.len()))
}

/// Top-k eigenvectors of a GRM, ordered by decreasing eigenvalue.
pub fn grm_components(grm: &Array2<f64>, k: usize) -> Result<(Array2<f64>, Vec<f64>), PcaError> {
    let n = grm.nrows();
    if k > n {
        return Err(PcaError::TooManyComponents { requested: k, available: n });
    }
    let eigen = SymmetricEigen::new(DMatrix::from_fn(n, n, |i, j| grm[[i, j]]));

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[b].total_cmp(&eigen.eigenvalues[a]));
    let trace: f64 = grm.diag().sum();

    let scores = Array2::from_shape_fn((n, k), |(i, j)| eigen.eigenvectors[(i, order[j])]);
    let variance_explained = order
        .iter()
        .take(k)
        .map(|&c| if trace > 0.0 { eigen.eigenvalues[c].max(0.0) / trace } else { 0.0 })
        .collect();
    Ok((scores, variance_explained))
}

impl PcaProvider for DosageMatrix {
    fn principal_components(&self, k: usize) -> Result<PcaComponents, PcaError> {
        log::info!("Computing {} principal components from {} markers", k, self.markers.len());
        let (grm, _) = build_grm(&self.dosages, 0.0)?;
        let (scores, variance_explained) = grm_components(&grm, k)?;
        for (j, v) in variance_explained.iter().enumerate() {
            log::info!("  PC{}: {:.2}% of variance", j + 1, 100.0 * v);
        }
        Ok(PcaComponents {
            sample_ids: self.sample_ids.clone(),
            scores,
            variance_explained,
        })
    }
}

/// Appends z-scored components `PC1..PCk` to the frame (matched by sample ID;
/// samples without scores get NaN) and to the formula's predictor list.
pub fn append_principal_components(
    frame: &PhenotypeFrame,
    formula: &Formula,
    pcs: &PcaComponents,
) -> (PhenotypeFrame, Formula) {
    let pc_row: HashMap<&str, usize> = pcs
        .sample_ids
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    let mut frame = frame.clone();
    let mut formula = formula.clone();
    for (j, component) in pcs.scores.axis_iter(Axis(1)).enumerate() {
        let name = format!("PC{}", j + 1);
        let mut values: Vec<f64> = frame
            .sample_ids
            .iter()
            .map(|id| pc_row.get(id.as_str()).map_or(f64::NAN, |&r| component[r]))
            .collect();
        z_score(&mut values);

        frame = frame.with_column(&name, values);
        if !formula.predictors.contains(&name) {
            formula = formula.with_term(&name);
        }
    }
    log::info!("Formula with principal components: {}", formula);
    (frame, formula)
}

fn z_score(values: &mut [f64]) {
    let observed: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if observed.len() < 2 {
        return;
    }
    let n = observed.len() as f64;
    let mean = observed.iter().sum::<f64>() / n;
    let sd = (observed.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
    if sd <= 0.0 {
        return;
    }
    for v in values.iter_mut().filter(|v| !v.is_nan()) {
        *v = (*v - mean) / sd;
    }
}
