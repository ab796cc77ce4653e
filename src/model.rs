//! Model building: formula terms, categorical recoding and the complete-case
//! design matrix handed to the regression fitter.
use crate::io::RawTable;
use ndarray::{Array1, Array2};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unknown regression family '{0}'. Use 'linear', 'logistic' or 'poisson'.")]
    UnknownFamily(String),
    #[error("Malformed formula '{formula}': {reason}")]
    Formula { formula: String, reason: String },
    #[error("Column '{0}' not found in phenotype table")]
    MissingColumn(String),
    #[error("Column '{column}' has non-numeric value '{value}' for sample '{sample}'")]
    NonNumeric {
        column: String,
        sample: String,
        value: String,
    },
    #[error("Invalid value for {keyword}: {value}")]
    InvalidValue { keyword: String, value: String },
    #[error("Only {complete} complete-case samples for {columns} design columns")]
    TooFewSamples { complete: usize, columns: usize },
}

/// Structured form of `response ~ term1 + term2 + ...`.
/// The intercept is always part of the model and is not listed.
#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct Formula {
    pub response: String,
    pub predictors: Vec<String>,
}

impl Formula {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let malformed = |reason: &str| ConfigError::Formula {
            formula: text.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, rhs) = text.split_once('~').ok_or_else(|| malformed("missing '~'"))?;
        let response = lhs.trim();
        if response.is_empty() {
            return Err(malformed("empty response"));
        }
        if rhs.contains('~') {
            return Err(malformed("more than one '~'"));
        }

        let mut formula = Formula {
            response: response.to_string(),
            predictors: Vec::new(),
        };
        let rhs = rhs.trim();
        if rhs.is_empty() {
            return Err(malformed("empty right-hand side (use '1' for intercept only)"));
        }
        for term in rhs.split('+').map(str::trim) {
            match term {
                "" => return Err(malformed("empty term")),
                "1" => continue,
                t if t == formula.response => {
                    return Err(malformed("response used as a predictor"))
                }
                t if formula.predictors.iter().any(|p| p == t) => {
                    return Err(malformed(&format!("duplicate term '{}'", t)))
                }
                t => formula.predictors.push(t.to_string()),
            }
        }
        Ok(formula)
    }

    /// Returns a copy with `term` appended to the predictor list.
    pub fn with_term(&self, term: &str) -> Self {
        let mut out = self.clone();
        out.predictors.push(term.to_string());
        out
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.predictors.is_empty() {
            write!(f, "{} ~ 1", self.response)
        } else {
            write!(f, "{} ~ {}", self.response, self.predictors.join(" + "))
        }
    }
}

/// Tokens treated as missing in phenotype and dosage tables.
pub fn is_missing_token(s: &str) -> bool {
    matches!(s.trim(), "" | "NA" | "na" | "NaN" | "nan" | ".")
}

/// female -> -1.0, male -> +1.0, anything else -> NaN.
/// Accepts PLINK codes (1 male, 2 female) and words.
pub fn recode_sex(s: &str) -> f64 {
    match s.trim().to_lowercase().as_str() {
        "f" | "female" | "2" | "-1" => -1.0,
        "m" | "male" | "1" => 1.0,
        _ => f64::NAN,
    }
}

/// Case/control coding to 1.0 / 0.0, with missing tokens as NaN.
/// With `plink` coding, `2` is a case and `1` a control (`0` and `-9` missing);
/// otherwise `1`/`0` are used as given. Any other value is `None`.
pub fn recode_case_control(s: &str, plink: bool) -> Option<f64> {
    if is_missing_token(s) {
        return Some(f64::NAN);
    }
    match (s.trim().to_lowercase().as_str(), plink) {
        ("case" | "affected", _) => Some(1.0),
        ("control" | "unaffected", _) => Some(0.0),
        ("2", true) => Some(1.0),
        ("1", true) => Some(0.0),
        ("0" | "-9", true) => Some(f64::NAN),
        ("1", false) => Some(1.0),
        ("0", false) => Some(0.0),
        _ => None,
    }
}

/// Parses a numeric cell, mapping missing tokens to NaN.
pub fn parse_numeric(s: &str) -> Option<f64> {
    if is_missing_token(s) {
        return Some(f64::NAN);
    }
    s.trim().parse::<f64>().ok()
}

/// How categorical columns of the raw table are recoded.
#[derive(Debug, Clone)]
pub struct Coding {
    /// Column holding sex; recoded with `recode_sex` when present
    pub sex_column: String,
    /// Column recoded as case/control (usually the response of a logistic model)
    pub case_control_column: Option<String>,
    /// Use PLINK 1/2 case-control coding for `case_control_column`
    pub plink_case_control: bool,
}

impl Default for Coding {
    fn default() -> Self {
        Coding {
            sex_column: "sex".to_string(),
            case_control_column: None,
            plink_case_control: false,
        }
    }
}

/// Numeric phenotype/covariate table, one row per individual.
#[derive(Debug, Clone)]
pub struct PhenotypeFrame {
    pub sample_ids: Vec<String>,
    columns: Vec<(String, Vec<f64>)>,
    sex_column: Option<String>,
    /// First non-numeric cell (sample, value) of each plain numeric column
    invalid: HashMap<String, (String, String)>,
}

impl PhenotypeFrame {
    /// Applies the recoders once to produce numeric columns.
    pub fn from_table(table: &RawTable, coding: &Coding) -> Self {
        let mut columns = Vec::with_capacity(table.columns.len());
        let mut sex_column = None;
        let mut invalid = HashMap::new();

        for (name, values) in &table.columns {
            if name.eq_ignore_ascii_case(&coding.sex_column) {
                sex_column = Some(name.clone());
                columns.push((name.clone(), values.iter().map(|v| recode_sex(v)).collect()));
                continue;
            }
            let is_case_control = coding.case_control_column.as_deref() == Some(name.as_str());
            let numeric: Vec<f64> = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let parsed = if is_case_control {
                        recode_case_control(v, coding.plink_case_control)
                    } else {
                        parse_numeric(v)
                    };
                    parsed.unwrap_or_else(|| {
                        invalid
                            .entry(name.clone())
                            .or_insert_with(|| (table.sample_ids[i].clone(), v.clone()));
                        f64::NAN
                    })
                })
                .collect();
            columns.push((name.clone(), numeric));
        }

        if !invalid.is_empty() {
            log::debug!("Non-numeric columns in phenotype table: {:?}", invalid.keys().collect::<Vec<_>>());
        }

        PhenotypeFrame {
            sample_ids: table.sample_ids.clone(),
            columns,
            sex_column,
            invalid,
        }
    }

    /// Builds a frame directly from numeric columns.
    pub fn from_columns(
        sample_ids: Vec<String>,
        columns: Vec<(String, Vec<f64>)>,
        sex_column: Option<&str>,
    ) -> Self {
        PhenotypeFrame {
            sample_ids,
            columns,
            sex_column: sex_column.map(String::from),
            invalid: HashMap::new(),
        }
    }

    /// Numeric column by name. Columns holding non-numeric text are an error.
    fn numeric_column(&self, name: &str) -> Result<&[f64], ConfigError> {
        if let Some((sample, value)) = self.invalid.get(name) {
            return Err(ConfigError::NonNumeric {
                column: name.to_string(),
                sample: sample.clone(),
                value: value.clone(),
            });
        }
        self.column(name)
            .ok_or_else(|| ConfigError::MissingColumn(name.to_string()))
    }

    pub fn n_rows(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    pub fn sex(&self) -> Option<&[f64]> {
        self.sex_column.as_deref().and_then(|c| self.column(c))
    }

    /// Returns a new frame with `column` appended.
    pub fn with_column(&self, name: &str, values: Vec<f64>) -> Self {
        let mut out = self.clone();
        out.columns.retain(|(n, _)| n != name);
        out.invalid.remove(name);
        out.columns.push((name.to_string(), values));
        out
    }
}

/// Complete-case design matrix and response for one formula.
#[derive(Debug, Clone)]
pub struct ModelFrame {
    /// Design matrix, intercept in column 0
    pub x: Array2<f64>,
    /// Response vector
    pub y: Array1<f64>,
    /// Column names of `x`
    pub column_names: Vec<String>,
    /// Frame row index of each design row
    pub rows: Vec<usize>,
    /// Inclusion flag for every frame row
    pub complete_case: Vec<bool>,
    pub sample_ids: Vec<String>,
    pub sex: Option<Vec<f64>>,
}

impl ModelFrame {
    pub fn resolve(frame: &PhenotypeFrame, formula: &Formula) -> Result<Self, ConfigError> {
        let response = frame.numeric_column(&formula.response)?;
        let predictors: Vec<&[f64]> = formula
            .predictors
            .iter()
            .map(|p| frame.numeric_column(p))
            .collect::<Result<_, _>>()?;

        let complete_case: Vec<bool> = (0..frame.n_rows())
            .map(|i| !response[i].is_nan() && predictors.iter().all(|c| !c[i].is_nan()))
            .collect();
        let rows: Vec<usize> = complete_case
            .iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect();

        let n = rows.len();
        let p = predictors.len() + 1;
        log::info!(
            "Resolved '{}': {} of {} samples complete, {} design columns",
            formula,
            n,
            frame.n_rows(),
            p
        );
        if n <= p {
            return Err(ConfigError::TooFewSamples { complete: n, columns: p });
        }

        let mut x = Array2::zeros((n, p));
        x.column_mut(0).fill(1.0);
        for (j, col) in predictors.iter().enumerate() {
            for (r, &i) in rows.iter().enumerate() {
                x[[r, j + 1]] = col[i];
            }
        }
        let y: Array1<f64> = rows.iter().map(|&i| response[i]).collect();

        let mut column_names = vec!["(Intercept)".to_string()];
        column_names.extend(formula.predictors.iter().cloned());

        Ok(ModelFrame {
            x,
            y,
            column_names,
            sample_ids: rows.iter().map(|&i| frame.sample_ids[i].clone()).collect(),
            sex: frame.sex().map(|s| rows.iter().map(|&i| s[i]).collect()),
            rows,
            complete_case,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_formula_terms_in_order() {
        let f = Formula::parse(" bmi ~ age + sex + 1 ").unwrap();
        assert_eq!(f.response, "bmi");
        assert_eq!(f.predictors, vec!["age", "sex"]);
        assert_eq!(f.to_string(), "bmi ~ age + sex");
    }

    #[test]
    fn appending_a_term_leaves_original_untouched() {
        let f = Formula::parse("y ~ age").unwrap();
        let g = f.with_term("PC1");
        assert_eq!(f.predictors, vec!["age"]);
        assert_eq!(g.predictors, vec!["age", "PC1"]);
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert!(Formula::parse("y age").is_err());
        assert!(Formula::parse(" ~ age").is_err());
        assert!(Formula::parse("y ~ age + ").is_err());
        assert!(Formula::parse("y ~ age + age").is_err());
        assert!(Formula::parse("y ~ ").is_err());
    }

    #[test]
    fn recodes_sex_and_case_control() {
        assert_eq!(recode_sex("F"), -1.0);
        assert_eq!(recode_sex("male"), 1.0);
        assert!(recode_sex("0").is_nan());
        assert_eq!(recode_case_control("2", true), Some(1.0));
        assert_eq!(recode_case_control("1", true), Some(0.0));
        assert!(recode_case_control("0", true).unwrap().is_nan());
        assert!(recode_case_control("-9", true).unwrap().is_nan());
        assert_eq!(recode_case_control("1", false), Some(1.0));
        assert_eq!(recode_case_control("control", false), Some(0.0));
        assert!(recode_case_control("NA", false).unwrap().is_nan());
        assert_eq!(recode_case_control("2", false), None);
        assert_eq!(recode_case_control("-9", false), None);
        assert_eq!(recode_case_control("yes", true), None);
    }

    #[test]
    fn unrecognised_case_control_value_is_a_config_error() {
        let table = RawTable {
            sample_ids: (0..6).map(|i| format!("s{}", i)).collect(),
            columns: vec![
                ("case".into(), ["2", "1", "2", "1", "yes", "1"].iter().map(|v| v.to_string()).collect()),
                ("age".into(), ["30", "41", "52", "38", "45", "60"].iter().map(|v| v.to_string()).collect()),
            ],
        };
        let coding = Coding {
            case_control_column: Some("case".into()),
            ..Coding::default()
        };
        let frame = PhenotypeFrame::from_table(&table, &coding);
        let err = ModelFrame::resolve(&frame, &Formula::parse("case ~ age").unwrap()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::NonNumeric { ref column, ref sample, ref value }
                if column == "case" && sample == "s0" && value == "2"
        ));

        let plink = Coding { plink_case_control: true, ..coding };
        let frame = PhenotypeFrame::from_table(&table, &plink);
        let err = ModelFrame::resolve(&frame, &Formula::parse("case ~ age").unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::NonNumeric { ref value, .. } if value == "yes"));
    }

    #[test]
    fn minus_nine_is_not_missing_in_covariates() {
        assert_eq!(parse_numeric("-9"), Some(-9.0));
        assert!(parse_numeric(".").unwrap().is_nan());
    }

    #[test]
    fn resolve_keeps_complete_cases_in_order() {
        let frame = PhenotypeFrame::from_columns(
            vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            vec![
                ("y".into(), vec![1.0, f64::NAN, 3.0, 4.0, 5.0]),
                ("age".into(), vec![10.0, 20.0, f64::NAN, 40.0, 50.0]),
                ("sex".into(), vec![1.0, -1.0, 1.0, -1.0, -1.0]),
            ],
            Some("sex"),
        );
        let formula = Formula::parse("y ~ age").unwrap();
        let mf = ModelFrame::resolve(&frame, &formula).unwrap();
        assert_eq!(mf.rows, vec![0, 3, 4]);
        assert_eq!(mf.complete_case, vec![true, false, false, true, true]);
        assert_eq!(mf.sample_ids, vec!["a", "d", "e"]);
        assert_eq!(mf.y.to_vec(), vec![1.0, 4.0, 5.0]);
        assert_eq!(mf.x.column(1).to_vec(), vec![10.0, 40.0, 50.0]);
        assert_eq!(mf.x.column(0).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(mf.sex, Some(vec![1.0, -1.0, -1.0]));
    }

    #[test]
    fn resolve_reports_missing_column() {
        let frame = PhenotypeFrame::from_columns(
            vec!["a".into()],
            vec![("y".into(), vec![1.0])],
            None,
        );
        let err = ModelFrame::resolve(&frame, &Formula::parse("y ~ height").unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingColumn(c) if c == "height"));
    }

    #[test]
    fn referenced_text_column_is_a_config_error() {
        let table = RawTable {
            sample_ids: vec!["a".into(), "b".into(), "c".into()],
            columns: vec![
                ("y".into(), vec!["1.5".into(), "2.0".into(), "NA".into()]),
                ("site".into(), vec!["north".into(), "south".into(), "north".into()]),
            ],
        };
        let frame = PhenotypeFrame::from_table(&table, &Coding::default());
        let intercept_only = ModelFrame::resolve(&frame, &Formula::parse("y ~ 1").unwrap()).unwrap();
        assert_eq!(intercept_only.rows, vec![0, 1]);
        let err = ModelFrame::resolve(&frame, &Formula::parse("y ~ site").unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::NonNumeric { ref column, .. } if column == "site"));
    }
}

