//! Step 2: Run Association Scan
//!
//! Loads the baseline model from Step 1, screens every marker of a dosage
//! file with a score test (escalating to a likelihood-ratio test for promising
//! markers), and writes the reported markers, FDR thresholds and Manhattan
//! plot coordinates.

use clap::Parser;
use gwas_scan_rust::{
    association::{run_scan, ScanConfig},
    fdr::{benjamini_hochberg, FDR_LEVELS},
    io::load_dosage_matrix,
    regression::FitOptions,
    report::{manhattan_points, write_fdr_table, write_manhattan_points, write_marker_reports},
    BaselineFit,
};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "step2-scan",
    version,
    about = "Runs the per-marker association scan against a fitted baseline model"
)]
struct Cli {
    /// Path to the fitted baseline model file from Step 1
    #[arg(long, required = true)]
    baseline_file: PathBuf,

    /// Path to the dosage file (tab-separated, optionally gzipped)
    #[arg(long, required = true)]
    dosage_file: PathBuf,

    /// Markers with MAF at or below this value are not tested
    #[arg(long, default_value_t = 0.01)]
    maf_threshold: f64,

    /// Screening p-value below which the full model is refit for an LRT
    #[arg(long, default_value_t = 5e-8)]
    lrt_threshold: f64,

    /// Family-wise level of the Bonferroni reporting gate
    #[arg(long, default_value_t = 0.05)]
    alpha: f64,

    /// Fixed reporting threshold, replacing alpha / tested markers
    #[arg(long)]
    report_threshold: Option<f64>,

    /// Maximum IRLS iterations for marker refits
    #[arg(long, default_value_t = 25)]
    max_iter: usize,

    /// Relative log-likelihood convergence tolerance
    #[arg(long, default_value_t = 1e-8)]
    tolerance: f64,

    /// Prefix for output files
    #[arg(long, default_value = "gwas_step2")]
    output_prefix: String,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    n_threads: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Starting Step 2: Running association scan");
    log::info!("Using {} threads", cli.n_threads);

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;

    // ===================================================================
    // 1. Load baseline model and genotypes
    // ===================================================================
    log::info!("Loading baseline model from {:?}", &cli.baseline_file);
    let file = File::open(&cli.baseline_file)?;
    let reader = BufReader::new(file);
    let baseline: BaselineFit = bincode::deserialize_from(reader)?;
    log::info!(
        "Loaded {} model '{}' on {} samples",
        baseline.family,
        baseline.formula,
        baseline.sample_ids.len()
    );

    let dosages = load_dosage_matrix(&cli.dosage_file)?;

    // ===================================================================
    // 2. Scan
    // ===================================================================
    let config = ScanConfig {
        maf_threshold: cli.maf_threshold,
        lrt_threshold: cli.lrt_threshold,
        alpha: cli.alpha,
        reporting_threshold: cli.report_threshold,
        fit: FitOptions {
            max_iter: cli.max_iter,
            tolerance: cli.tolerance,
        },
    };
    let result = run_scan(&baseline, &dosages, &config)?;

    // ===================================================================
    // 3. FDR summary and outputs
    // ===================================================================
    let fdr = benjamini_hochberg(&result.pvalues, &FDR_LEVELS);
    for row in &fdr {
        match row.threshold {
            Some(t) => log::info!("FDR {:.2}: {} markers, p <= {:.3e}", row.level, row.n_passing, t),
            None => log::info!("FDR {:.2}: no markers pass", row.level),
        }
    }
    if result.reports.is_empty() {
        log::warn!("No markers passed the reporting threshold {:.3e}", result.reporting_threshold);
    }

    write_marker_reports(&PathBuf::from(format!("{}.assoc.tsv.gz", cli.output_prefix)), &result.reports)?;
    write_fdr_table(&PathBuf::from(format!("{}.fdr.tsv", cli.output_prefix)), &fdr)?;
    let points = manhattan_points(&dosages.markers, &result.pvalues)?;
    write_manhattan_points(&PathBuf::from(format!("{}.manhattan.tsv.gz", cli.output_prefix)), &points)?;

    log::info!("Step 2 completed successfully.");
    Ok(())
}
