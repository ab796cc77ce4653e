//! Step 1: Fit Baseline Model
//!
//! Reads the phenotype/covariate table, optionally adds genotype principal
//! components as covariates, and fits the covariates-only regression model.
//!
//! The output is a serialized `BaselineFit` struct plus a TSV summary.

use clap::Parser;
use gwas_scan_rust::{
    io::{load_dosage_matrix, read_table},
    model::{Coding, Formula, ModelFrame, PhenotypeFrame},
    null_model::fit_null_model,
    pca::{append_principal_components, PcaProvider},
    regression::FitOptions,
    report::write_baseline_summary,
    Family,
};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "step1-fit-baseline",
    version,
    about = "Fits the covariates-only baseline model for a GWAS scan"
)]
struct Cli {
    /// Path to the phenotype/covariate file (tab-separated, optionally gzipped)
    #[arg(long, required = true)]
    pheno_file: PathBuf,

    /// Column name in the phenotype file for sample IDs
    #[arg(long, default_value = "IID")]
    sample_id_col: String,

    /// Model formula, e.g. "trait ~ age + sex"
    #[arg(long, required = true)]
    formula: String,

    /// Regression family ('linear', 'logistic' or 'poisson')
    #[arg(long, required = true)]
    family: Family,

    /// Column recoded as sex (female -1, male +1)
    #[arg(long, default_value = "sex")]
    sex_col: String,

    /// Response uses PLINK case/control coding (2 case, 1 control, 0/-9 missing)
    #[arg(long, default_value_t = false)]
    plink_case_control: bool,

    /// Dosage file used to compute principal components
    #[arg(long)]
    dosage_file: Option<PathBuf>,

    /// Number of principal components to add as covariates
    #[arg(long, default_value_t = 0)]
    n_pcs: usize,

    /// Maximum IRLS iterations
    #[arg(long, default_value_t = 25)]
    max_iter: usize,

    /// Relative log-likelihood convergence tolerance
    #[arg(long, default_value_t = 1e-8)]
    tolerance: f64,

    /// Prefix for output files
    #[arg(long, default_value = "gwas_step1")]
    output_prefix: String,

    /// Number of threads to use
    #[arg(long, default_value_t = 1)]
    n_threads: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    log::info!("Starting Step 1: Fitting baseline model");
    log::info!("Family: {}", cli.family);
    log::info!("Using {} threads", cli.n_threads);

    rayon::ThreadPoolBuilder::new()
        .num_threads(cli.n_threads)
        .build_global()?;

    let mut formula = Formula::parse(&cli.formula)?;

    // ===================================================================
    // 1. Load phenotypes and recode categorical columns
    // ===================================================================
    let table = read_table(&cli.pheno_file, &cli.sample_id_col)?;
    let coding = Coding {
        sex_column: cli.sex_col.clone(),
        case_control_column: (cli.family == Family::Logistic).then(|| formula.response.clone()),
        plink_case_control: cli.plink_case_control,
    };
    let mut frame = PhenotypeFrame::from_table(&table, &coding);

    // ===================================================================
    // 2. Principal components (optional)
    // ===================================================================
    if cli.n_pcs > 0 {
        let dosage_file = cli
            .dosage_file
            .as_ref()
            .ok_or("--n-pcs requires --dosage-file")?;
        let dosages = load_dosage_matrix(dosage_file)?;
        let pcs = dosages.principal_components(cli.n_pcs)?;
        let (with_pcs, extended) = append_principal_components(&frame, &formula, &pcs);
        frame = with_pcs;
        formula = extended;
    }

    // ===================================================================
    // 3. Resolve the design and fit
    // ===================================================================
    let model_frame = ModelFrame::resolve(&frame, &formula)?;
    let options = FitOptions {
        max_iter: cli.max_iter,
        tolerance: cli.tolerance,
    };
    let baseline = fit_null_model(&model_frame, &formula, cli.family, &options)?;

    // ===================================================================
    // 4. Save output
    // ===================================================================
    let output_file = PathBuf::from(format!("{}.baseline.bin", cli.output_prefix));
    log::info!("Saving fitted baseline model to {:?}", &output_file);
    let file = std::fs::File::create(&output_file)?;
    let writer = std::io::BufWriter::new(file);
    bincode::serialize_into(writer, &baseline)?;

    let summary_file = PathBuf::from(format!("{}.baseline.tsv", cli.output_prefix));
    write_baseline_summary(&summary_file, &baseline)?;

    log::info!("Step 1 completed successfully.");
    Ok(())
}
