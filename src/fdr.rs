//! Benjamini-Hochberg false discovery rate thresholds over the whole scan.

/// Target FDR levels summarised by default.
pub const FDR_LEVELS: [f64; 11] = [0.01, 0.05, 0.10, 0.20, 0.30, 0.40, 0.50, 0.60, 0.70, 0.80, 0.90];

#[derive(serde::Serialize, Debug, Clone, PartialEq)]
pub struct FdrRow {
    /// Target false discovery rate q
    pub level: f64,
    /// Largest p-value declared significant at this level; None if nothing passes
    pub threshold: Option<f64>,
    pub n_passing: usize,
}

/// For each level q, the largest k with p(k) <= k q / m over the sorted p-values.
/// `m` is the full length of `pvalues` (untested markers count at p = 1).
/// Rows follow the order of `levels`.
pub fn benjamini_hochberg(pvalues: &[f64], levels: &[f64]) -> Vec<FdrRow> {
    let m = pvalues.len();
    let mut sorted: Vec<f64> = pvalues
        .iter()
        .map(|&p| if p.is_nan() { 1.0 } else { p })
        .collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    levels
        .iter()
        .map(|&q| {
            let k = sorted
                .iter()
                .enumerate()
                .rev()
                .find(|&(i, &p)| p <= (i + 1) as f64 * q / m as f64)
                .map_or(0, |(i, _)| i + 1);
            let threshold = (k > 0).then(|| sorted[k - 1]);
            log::debug!("FDR {:.2}: {} markers pass (threshold {:?})", q, k, threshold);
            FdrRow {
                level: q,
                threshold,
                n_passing: k,
            }
        })
        .collect()
}
