//! # Fit Table Loading and Validation
//!
//! Entry point for user-provided convergence-study results. Each input row is one
//! parameter estimate from one optimizer's fit of one simulated data set, together
//! with the fit-level diagnostics recorded for that fit.
//!
//! - Strict Schema: column names are fixed (`dataset`, `optimizer`, `log_size`,
//!   `replicate`, `parameter`, `value`, `gradient`, `min_eigenvalue`, `time`).
//!   Extra columns are ignored.
//! - User-Centric Errors: failures are assumed to be input errors and are reported
//!   through [`DataError`] with the offending column named.
//! - Files ending in `.csv` are comma separated; everything else is read as TSV.

use polars::prelude::*;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Columns every input file must provide.
pub const REQUIRED_COLUMNS: [&str; 9] = [
    "dataset",
    "optimizer",
    "log_size",
    "replicate",
    "parameter",
    "value",
    "gradient",
    "min_eigenvalue",
    "time",
];

/// One parameter estimate from one optimizer's fit.
#[derive(Debug, Clone, PartialEq)]
pub struct FitRecord {
    /// Identifier of the simulated data set the fit was run on.
    pub dataset: String,
    pub optimizer: String,
    /// Log of the data-set size.
    pub log_size: f64,
    pub replicate: u32,
    pub parameter: String,
    /// The parameter estimate.
    pub value: f64,
    /// Gradient diagnostic of the fit (repeated on every parameter row of that fit).
    pub gradient: f64,
    /// Smallest Hessian eigenvalue of the fit.
    pub min_eigenvalue: f64,
    /// Elapsed fitting time.
    pub time: f64,
}

/// Validated input rows, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitTable {
    records: Vec<FitRecord>,
}

impl FitTable {
    pub fn new(records: Vec<FitRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[FitRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct optimizer names in order of first appearance.
    pub fn optimizers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|record| seen.insert(record.optimizer.as_str()))
            .map(|record| record.optimizer.clone())
            .collect()
    }
}

impl FromIterator<FitRecord> for FitTable {
    fn from_iter<I: IntoIterator<Item = FitRecord>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A comprehensive error type for all data loading and validation failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. Every row must be complete."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in the required column '{0}'. This tool requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("The input file contains a header but no data rows.")]
    EmptyTable,
}

/// Loads and validates a convergence-study table.
pub fn load_fit_table(path: &Path) -> Result<FitTable, DataError> {
    let separator = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    };

    log::info!("Loading fit table from '{}'", path.display());
    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::EmptyTable);
    }

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for column in REQUIRED_COLUMNS {
        if !columns_set.contains(column) {
            return Err(DataError::ColumnNotFound(column.to_string()));
        }
    }

    let dataset = internal::extract_text_column(&df, "dataset")?;
    let optimizer = internal::extract_text_column(&df, "optimizer")?;
    let log_size = internal::extract_numeric_column(&df, "log_size")?;
    let replicate = internal::extract_count_column(&df, "replicate")?;
    let parameter = internal::extract_text_column(&df, "parameter")?;
    let value = internal::extract_numeric_column(&df, "value")?;
    let gradient = internal::extract_numeric_column(&df, "gradient")?;
    let min_eigenvalue = internal::extract_numeric_column(&df, "min_eigenvalue")?;
    let time = internal::extract_numeric_column(&df, "time")?;

    let records: Vec<FitRecord> = (0..df.height())
        .map(|i| FitRecord {
            dataset: dataset[i].clone(),
            optimizer: optimizer[i].clone(),
            log_size: log_size[i],
            replicate: replicate[i],
            parameter: parameter[i].clone(),
            value: value[i],
            gradient: gradient[i],
            min_eigenvalue: min_eigenvalue[i],
            time: time[i],
        })
        .collect();

    log::info!(
        "Loaded {} estimates from {} optimizers",
        records.len(),
        records
            .iter()
            .map(|r| r.optimizer.as_str())
            .collect::<HashSet<_>>()
            .len()
    );

    Ok(FitTable::new(records))
}

/// Column extraction shared by the loader.
mod internal {
    use super::*;

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let casted = series
            .cast(&DataType::Float64)
            .map_err(|_| DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            })?;

        // A non-strict cast turns unparseable text into nulls.
        if casted.null_count() > 0 {
            return Err(DataError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_count_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<u32>, DataError> {
        let values = extract_numeric_column(df, column_name)?;
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if v < 0.0 || v.fract() != 0.0 || v > u32::MAX as f64 {
                    Err(DataError::ColumnWrongType {
                        column_name: column_name.to_string(),
                        expected_type: "non-negative integer",
                        found_type: format!("value {} at row {}", v, i + 1),
                    })
                } else {
                    Ok(v as u32)
                }
            })
            .collect()
    }

    pub(super) fn extract_text_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        let chunked = casted.str()?;
        chunked
            .into_iter()
            .map(|value| {
                value
                    .map(str::to_string)
                    .ok_or_else(|| DataError::MissingValuesFound(column_name.to_string()))
            })
            .collect()
    }
}
