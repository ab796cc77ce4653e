//! Module for handling I/O, data loading, and sample alignment.
use crate::model::{is_missing_token, parse_numeric};
use flate2::read::MultiGzDecoder;
use ndarray::{Array2, ArrayView1};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IoError {
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error in {file} line {line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },
    #[error("Data alignment error: {0}")]
    Alignment(String),
}

/// Descriptive attributes of one marker.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct MarkerInfo {
    pub id: String,
    pub chrom: String,
    pub pos: u64,
    /// Minor allele frequency in [0, 0.5]
    pub maf: f64,
}

/// Read access to a marker panel. Dosage rows are dense, one value per
/// sample in `sample_ids()` order, with NaN for missing genotypes.
pub trait GenotypeSource: Sync {
    fn sample_ids(&self) -> &[String];
    fn n_markers(&self) -> usize;
    fn marker(&self, index: usize) -> &MarkerInfo;
    fn dosages(&self, index: usize) -> ArrayView1<'_, f64>;
}

/// In-memory dosage panel (markers x samples).
#[derive(Debug, Clone)]
pub struct DosageMatrix {
    pub markers: Vec<MarkerInfo>,
    pub sample_ids: Vec<String>,
    /// Shape (n_markers, n_samples)
    pub dosages: Array2<f64>,
}

impl DosageMatrix {
    /// Builds a panel, computing MAF from the dosages where `maf` is NaN.
    pub fn new(
        mut markers: Vec<MarkerInfo>,
        sample_ids: Vec<String>,
        dosages: Array2<f64>,
    ) -> Result<Self, IoError> {
        if dosages.dim() != (markers.len(), sample_ids.len()) {
            return Err(IoError::Alignment(format!(
                "Dosage matrix shape {:?} does not match {} markers x {} samples",
                dosages.dim(),
                markers.len(),
                sample_ids.len()
            )));
        }
        for (marker, row) in markers.iter_mut().zip(dosages.rows()) {
            if marker.maf.is_nan() {
                marker.maf = minor_allele_frequency(row);
            }
        }
        Ok(DosageMatrix { markers, sample_ids, dosages })
    }
}

impl GenotypeSource for DosageMatrix {
    fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    fn n_markers(&self) -> usize {
        self.markers.len()
    }

    fn marker(&self, index: usize) -> &MarkerInfo {
        &self.markers[index]
    }

    fn dosages(&self, index: usize) -> ArrayView1<'_, f64> {
        self.dosages.row(index)
    }
}

/// MAF from dosages, ignoring missing values. Returns 0 when nothing is observed.
pub fn minor_allele_frequency(dosages: ArrayView1<f64>) -> f64 {
    let (sum, count) = dosages
        .iter()
        .filter(|d| !d.is_nan())
        .fold((0.0, 0usize), |(s, c), &d| (s + d, c + 1));
    if count == 0 {
        return 0.0;
    }
    let freq = sum / (2.0 * count as f64);
    freq.min(1.0 - freq)
}

/// String table keyed by sample ID: one entry per non-ID column.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub sample_ids: Vec<String>,
    pub columns: Vec<(String, Vec<String>)>,
}

fn open_maybe_gz(path: &Path) -> Result<Box<dyn Read>, IoError> {
    if !path.exists() {
        return Err(IoError::NotFound(path.to_string_lossy().into()));
    }
    let file = File::open(path)?;
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(MultiGzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Tab-separated reader. `comment` skips lines starting with that byte; the
/// phenotype table passes `None` so PLINK-style `#IID` headers survive.
fn tsv_reader(path: &Path, comment: Option<u8>) -> Result<csv::Reader<Box<dyn Read>>, IoError> {
    Ok(csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .comment(comment)
        .trim(csv::Trim::All)
        .from_reader(open_maybe_gz(path)?))
}

/// Missing dosage: the phenotype missing tokens plus PLINK's `-9`.
fn is_missing_dosage(field: &str) -> bool {
    is_missing_token(field) || field.trim() == "-9"
}

/// Reads a tab-separated phenotype/covariate table with a header row.
pub fn read_table(path: &Path, sample_id_col: &str) -> Result<RawTable, IoError> {
    log::info!("Loading phenotype/covariate file: {:?}", path);
    let file_name = path.to_string_lossy().to_string();
    let mut reader = tsv_reader(path, None)?;
    let headers = reader.headers()?.clone();

    let id_idx = headers
        .iter()
        .position(|h| h == sample_id_col)
        .ok_or_else(|| IoError::Parse {
            file: file_name.clone(),
            line: 1,
            message: format!("sample ID column '{}' not in header", sample_id_col),
        })?;

    let mut sample_ids = Vec::new();
    let mut columns: Vec<(String, Vec<String>)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != id_idx)
        .map(|(_, h)| (h.to_string(), Vec::new()))
        .collect();

    for (line, record) in reader.records().enumerate() {
        let record = record?;
        sample_ids.push(record[id_idx].to_string());
        let mut col = 0;
        for (i, field) in record.iter().enumerate() {
            if i == id_idx {
                continue;
            }
            columns[col].1.push(field.to_string());
            col += 1;
        }
        log::trace!("Read phenotype row {} ({})", line + 2, &record[id_idx]);
    }

    log::info!("Loaded {} samples and {} columns", sample_ids.len(), columns.len());
    Ok(RawTable { sample_ids, columns })
}

/// Reads a dosage table: header `id chrom pos [maf] sample1 sample2 ...`,
/// one marker per row. Plain or gzip-compressed (`.gz`).
pub fn load_dosage_matrix(path: &Path) -> Result<DosageMatrix, IoError> {
    log::info!("Loading dosage file: {:?}", path);
    let file_name = path.to_string_lossy().to_string();
    let mut reader = tsv_reader(path, Some(b'#'))?;
    let headers = reader.headers()?.clone();

    let expected = ["id", "chrom", "pos"];
    for (i, name) in expected.iter().enumerate() {
        if headers.get(i).map(|h| h.to_lowercase()) != Some(name.to_string()) {
            return Err(IoError::Parse {
                file: file_name,
                line: 1,
                message: format!("expected column {} to be '{}'", i + 1, name),
            });
        }
    }
    let has_maf = headers.get(3).map_or(false, |h| h.eq_ignore_ascii_case("maf"));
    let first_sample = if has_maf { 4 } else { 3 };
    let sample_ids: Vec<String> = headers.iter().skip(first_sample).map(String::from).collect();
    let n_samples = sample_ids.len();
    log::debug!("Dosage file has {} samples (maf column: {})", n_samples, has_maf);

    let mut markers = Vec::new();
    let mut values: Vec<f64> = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let parse_err = |message: String| IoError::Parse {
            file: file_name.clone(),
            line,
            message,
        };

        let pos = record[2]
            .parse::<u64>()
            .map_err(|e| parse_err(format!("bad position '{}': {}", &record[2], e)))?;
        let maf = if has_maf {
            parse_numeric(&record[3]).ok_or_else(|| parse_err(format!("bad maf '{}'", &record[3])))?
        } else {
            f64::NAN
        };

        for field in record.iter().skip(first_sample) {
            let d = if is_missing_dosage(field) {
                f64::NAN
            } else {
                field
                    .parse::<f64>()
                    .map_err(|_| parse_err(format!("bad dosage '{}'", field)))?
            };
            if !d.is_nan() && !(0.0..=2.0).contains(&d) {
                return Err(parse_err(format!("dosage {} outside [0, 2]", d)));
            }
            values.push(d);
        }

        markers.push(MarkerInfo {
            id: record[0].to_string(),
            chrom: record[1].to_string(),
            pos,
            maf,
        });

        if markers.len() % 100_000 == 0 {
            log::debug!("Read {} markers so far...", markers.len());
        }
    }

    let n_markers = markers.len();
    let dosages = Array2::from_shape_vec((n_markers, n_samples), values)
        .map_err(|e| IoError::Alignment(format!("Failed to shape dosage matrix: {}", e)))?;
    log::info!("Read dosage matrix: {} markers x {} samples", n_markers, n_samples);

    DosageMatrix::new(markers, sample_ids, dosages)
}

/// For each model sample, the index of the same sample in the genotype
/// source. Every model sample must be present.
pub fn align_samples(source_ids: &[String], model_ids: &[String]) -> Result<Vec<usize>, IoError> {
    let source_map: HashMap<&str, usize> = source_ids
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), i))
        .collect();

    log::debug!("Aligning {} model samples to {} genotyped samples", model_ids.len(), source_ids.len());

    let mut indices = Vec::with_capacity(model_ids.len());
    let mut missing = Vec::new();
    for id in model_ids {
        match source_map.get(id.as_str()) {
            Some(&i) => indices.push(i),
            None => missing.push(id.as_str()),
        }
    }

    if !missing.is_empty() {
        log::error!("Model samples (first 5) absent from genotypes: {:?}", &missing[..missing.len().min(5)]);
        return Err(IoError::Alignment(format!(
            "{} of {} model samples have no genotypes",
            missing.len(),
            model_ids.len()
        )));
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const DOSAGES: &str = "id\tchrom\tpos\ts1\ts2\ts3\ts4\n\
rs1\t1\t100\t0\t1\t2\t1\n\
rs2\tX\t200\tNA\t0\t0\t1.5\n";

    #[test]
    fn reads_plain_dosage_table_and_computes_maf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosage.tsv");
        std::fs::write(&path, DOSAGES).unwrap();

        let panel = load_dosage_matrix(&path).unwrap();
        assert_eq!(panel.sample_ids, vec!["s1", "s2", "s3", "s4"]);
        assert_eq!(panel.n_markers(), 2);
        assert_eq!(panel.marker(1).chrom, "X");
        assert_eq!(panel.marker(1).pos, 200);
        assert!(panel.dosages(1)[0].is_nan());
        // rs1: 4 alleles of 8 -> 0.5; rs2: 1.5 of 6 -> 0.25
        assert_abs_diff_eq!(panel.marker(0).maf, 0.5);
        assert_abs_diff_eq!(panel.marker(1).maf, 0.25);
    }

    #[test]
    fn reads_gzip_dosage_table_with_maf_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosage.tsv.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"id\tchrom\tpos\tmaf\ta\tb\nrs9\t2\t5\t0.1\t0\t2\n").unwrap();
        enc.finish().unwrap();

        let panel = load_dosage_matrix(&path).unwrap();
        assert_eq!(panel.sample_ids, vec!["a", "b"]);
        assert_abs_diff_eq!(panel.marker(0).maf, 0.1);
    }

    #[test]
    fn rejects_out_of_range_dosage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.tsv");
        std::fs::write(&path, "id\tchrom\tpos\ts1\nrs1\t1\t1\t2.5\n").unwrap();
        assert!(matches!(load_dosage_matrix(&path), Err(IoError::Parse { line: 2, .. })));
    }

    #[test]
    fn reads_phenotype_table_without_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pheno.tsv");
        std::fs::write(&path, "age\tIID\tsex\n30\tp1\tM\n41\tp2\tF\n").unwrap();
        let table = read_table(&path, "IID").unwrap();
        assert_eq!(table.sample_ids, vec!["p1", "p2"]);
        assert_eq!(table.columns[0], ("age".to_string(), vec!["30".to_string(), "41".to_string()]));
        assert_eq!(table.columns[1].0, "sex");
    }

    #[test]
    fn phenotype_header_may_start_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pheno.tsv");
        std::fs::write(&path, "#IID\ty\np1\t1.5\np2\t-9\n").unwrap();
        let table = read_table(&path, "#IID").unwrap();
        assert_eq!(table.sample_ids, vec!["p1", "p2"]);
        assert_eq!(table.columns[0].1, vec!["1.5", "-9"]);
    }

    #[test]
    fn minus_nine_dosage_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosage.tsv");
        std::fs::write(&path, "# exported panel\nid\tchrom\tpos\ts1\ts2\nrs1\t1\t1\t-9\t1\n").unwrap();
        let panel = load_dosage_matrix(&path).unwrap();
        assert!(panel.dosages(0)[0].is_nan());
        assert_eq!(panel.dosages(0)[1], 1.0);
    }

    #[test]
    fn aligns_by_id_not_position() {
        let source: Vec<String> = ["c", "a", "b"].iter().map(|s| s.to_string()).collect();
        let model: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(align_samples(&source, &model).unwrap(), vec![1, 2]);

        let model: Vec<String> = ["a", "z"].iter().map(|s| s.to_string()).collect();
        assert!(matches!(align_samples(&source, &model), Err(IoError::Alignment(_))));
    }
}
