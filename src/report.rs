//! Module for writing scan outputs: gzipped per-marker reports, the FDR table,
//! the baseline summary and Manhattan plot coordinates.
use crate::association::MarkerReport;
use crate::fdr::FdrRow;
use crate::io::MarkerInfo;
use crate::BaselineFit;
use csv::WriterBuilder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("CSV writing error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{markers} markers but {pvalues} p-values")]
    Length { markers: usize, pvalues: usize },
}

fn tsv_writer<W: Write>(inner: W) -> csv::Writer<W> {
    WriterBuilder::new().delimiter(b'\t').from_writer(inner)
}

fn gz_tsv_writer(path: &Path) -> Result<csv::Writer<GzEncoder<File>>, ReportError> {
    let file = File::create(path)?;
    Ok(tsv_writer(GzEncoder::new(file, Compression::default())))
}

fn finish_gz(writer: csv::Writer<GzEncoder<File>>) -> Result<(), ReportError> {
    let encoder = writer.into_inner().map_err(|e| ReportError::Io(e.into_error()))?;
    encoder.finish()?;
    Ok(())
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| format!("{:e}", v))
}

/// Writes the markers passing the reporting gate as a gzipped TSV.
pub fn write_marker_reports(path: &Path, reports: &[MarkerReport]) -> Result<(), ReportError> {
    log::info!("Writing {} reported markers to {:?}", reports.len(), path);
    let mut writer = gz_tsv_writer(path)?;
    writer.write_record([
        "id", "chrom", "pos", "pval", "maf", "hwe_pval", "beta", "se", "loglik", "n_samples", "outcome",
    ])?;
    for r in reports {
        writer.write_record([
            r.id.clone(),
            r.chrom.clone(),
            r.pos.to_string(),
            format!("{:e}", r.pval),
            format!("{:.6}", r.maf),
            fmt_opt(r.hwe_pval),
            fmt_opt(r.beta),
            fmt_opt(r.se),
            fmt_opt(r.loglik),
            r.n_samples.to_string(),
            format!("{:?}", r.outcome),
        ])?;
    }
    finish_gz(writer)
}

/// Plain TSV with one row per FDR level; `NA` threshold when nothing passes.
pub fn write_fdr_table(path: &Path, rows: &[FdrRow]) -> Result<(), ReportError> {
    log::info!("Writing FDR table to {:?}", path);
    let mut writer = tsv_writer(BufWriter::new(File::create(path)?));
    writer.write_record(["fdr_level", "pval_threshold", "n_passing"])?;
    for row in rows {
        writer.write_record([
            format!("{:.2}", row.level),
            fmt_opt(row.threshold),
            row.n_passing.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Key/value TSV describing the baseline fit.
pub fn write_baseline_summary(path: &Path, baseline: &BaselineFit) -> Result<(), ReportError> {
    let mut writer = tsv_writer(BufWriter::new(File::create(path)?));
    writer.write_record(["key", "value"])?;
    let entries = [
        ("family", baseline.family.to_string()),
        ("formula", baseline.formula.to_string()),
        ("n_samples", baseline.y.len().to_string()),
        ("loglik", baseline.fit.log_likelihood.to_string()),
        ("dispersion", baseline.fit.dispersion.to_string()),
        ("iterations", baseline.fit.iterations.to_string()),
    ];
    for (key, value) in entries.iter() {
        writer.write_record([*key, value.as_str()])?;
    }
    for (j, name) in baseline.column_names.iter().enumerate() {
        writer.write_record([format!("beta_{}", name), baseline.fit.coefficients[j].to_string()])?;
        writer.write_record([format!("se_{}", name), baseline.fit.standard_errors[j].to_string()])?;
    }
    writer.flush()?;
    Ok(())
}

/// One point of a Manhattan plot.
#[derive(Debug, Clone, PartialEq)]
pub struct ManhattanPoint {
    /// Position along the x axis, 0-based after ordering
    pub index: usize,
    /// Marker index in panel order
    pub marker: usize,
    pub chrom: String,
    pub pos: u64,
    pub neg_log10_p: f64,
}

/// Sort key: numeric chromosomes, then X, Y, MT, then anything else by name.
fn chromosome_rank(chrom: &str) -> (u8, u64, String) {
    let c = chrom.trim();
    let c = c.strip_prefix("chr").unwrap_or(c);
    if let Ok(n) = c.parse::<u64>() {
        return (0, n, String::new());
    }
    match c.to_ascii_uppercase().as_str() {
        "X" => (1, 0, String::new()),
        "Y" => (1, 1, String::new()),
        "MT" | "M" => (1, 2, String::new()),
        _ => (2, 0, c.to_string()),
    }
}

/// Orders markers by chromosome then position and converts p-values to
/// -log10(p); a p-value of exactly 0 is clamped to `f64::MIN_POSITIVE`.
pub fn manhattan_points(markers: &[MarkerInfo], pvalues: &[f64]) -> Result<Vec<ManhattanPoint>, ReportError> {
    if markers.len() != pvalues.len() {
        return Err(ReportError::Length { markers: markers.len(), pvalues: pvalues.len() });
    }
    let mut order: Vec<usize> = (0..markers.len()).collect();
    order.sort_by(|&a, &b| {
        chromosome_rank(&markers[a].chrom)
            .cmp(&chromosome_rank(&markers[b].chrom))
            .then(markers[a].pos.cmp(&markers[b].pos))
    });

    Ok(order
        .into_iter()
        .enumerate()
        .map(|(index, m)| ManhattanPoint {
            index,
            marker: m,
            chrom: markers[m].chrom.clone(),
            pos: markers[m].pos,
            neg_log10_p: 0.0 - pvalues[m].max(f64::MIN_POSITIVE).log10(),
        })
        .collect())
}

pub fn write_manhattan_points(path: &Path, points: &[ManhattanPoint]) -> Result<(), ReportError> {
    log::info!("Writing {} Manhattan points to {:?}", points.len(), path);
    let mut writer = gz_tsv_writer(path)?;
    writer.write_record(["index", "chrom", "pos", "neg_log10_p"])?;
    for p in points {
        writer.write_record([
            p.index.to_string(),
            p.chrom.clone(),
            p.pos.to_string(),
            format!("{:.6}", p.neg_log10_p),
        ])?;
    }
    finish_gz(writer)
}
