//! Tab-separated writers for sweep results. Missing values are written as `NA`.

use crate::consensus::BadFlag;
use crate::data::FitTable;
use crate::diagnostics::DiagnosticSummary;
use crate::heuristics::ThresholdPoint;
use crate::sweep::{AggregateRecord, ExcludedGroup, SweepReport};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write report: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to encode report row: {0}")]
    CsvError(#[from] csv::Error),
    #[error("The report has {flags} row flags but the table has {rows} rows.")]
    MismatchedRows { flags: usize, rows: usize },
}

fn tsv_writer<W: Write>(sink: W) -> csv::Writer<W> {
    csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Necessary)
        .from_writer(sink)
}

fn optional(value: Option<f64>) -> String {
    value.map_or_else(|| "NA".to_string(), |v| v.to_string())
}

pub fn write_aggregates<W: Write>(
    sink: W,
    records: &[AggregateRecord],
) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    writer.write_record(["log_size", "optimizer", "mean_bad", "count", "missing"])?;
    for record in records {
        writer.write_record([
            record.log_size.to_string(),
            record.optimizer.clone(),
            optional(record.mean_bad),
            record.count.to_string(),
            record.missing.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the input table with a trailing `bad` column holding each row's flag.
pub fn write_flagged_rows<W: Write>(
    sink: W,
    table: &FitTable,
    report: &SweepReport,
) -> Result<(), ReportError> {
    if report.row_flags.len() != table.len() {
        return Err(ReportError::MismatchedRows {
            flags: report.row_flags.len(),
            rows: table.len(),
        });
    }

    let mut writer = tsv_writer(sink);
    writer.write_record([
        "dataset",
        "optimizer",
        "log_size",
        "replicate",
        "parameter",
        "value",
        "gradient",
        "min_eigenvalue",
        "time",
        "bad",
    ])?;
    for (record, flag) in table.records().iter().zip(&report.row_flags) {
        let bad = flag.as_ref().map_or_else(|| "NA".to_string(), BadFlag::to_string);
        writer.write_record([
            record.dataset.clone(),
            record.optimizer.clone(),
            record.log_size.to_string(),
            record.replicate.to_string(),
            record.parameter.clone(),
            record.value.to_string(),
            record.gradient.to_string(),
            record.min_eigenvalue.to_string(),
            record.time.to_string(),
            bad,
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_exclusions<W: Write>(
    sink: W,
    exclusions: &[ExcludedGroup],
) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    writer.write_record(["log_size", "replicate", "parameter", "reason"])?;
    for excluded in exclusions {
        writer.write_record([
            excluded.log_size.to_string(),
            excluded.replicate.to_string(),
            excluded.parameter.clone(),
            excluded.reason.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_threshold_points<W: Write>(
    sink: W,
    points: &[ThresholdPoint],
) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    writer.write_record([
        "heuristic",
        "threshold",
        "warned",
        "true_positive_rate",
        "false_positive_rate",
        "warning_rate",
    ])?;
    for point in points {
        writer.write_record([
            point.heuristic.to_string(),
            format!("{:e}", point.threshold),
            point.warned.to_string(),
            optional(point.true_positive_rate),
            optional(point.false_positive_rate),
            optional(point.warning_rate),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_diagnostics<W: Write>(
    sink: W,
    summaries: &[DiagnosticSummary],
) -> Result<(), ReportError> {
    let mut writer = tsv_writer(sink);
    writer.write_record([
        "log_size",
        "optimizer",
        "fits",
        "mean_time",
        "median_time",
        "median_gradient",
        "median_min_eigenvalue",
    ])?;
    for summary in summaries {
        writer.write_record([
            summary.log_size.to_string(),
            summary.optimizer.clone(),
            summary.fits.to_string(),
            summary.mean_time.to_string(),
            summary.median_time.to_string(),
            format!("{:e}", summary.median_gradient),
            format!("{:e}", summary.median_min_eigenvalue),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Creates `path` and hands it to `write`.
pub fn write_to_path<F>(path: &Path, write: F) -> Result<(), ReportError>
where
    F: FnOnce(File) -> Result<(), ReportError>,
{
    let file = File::create(path)?;
    write(file)?;
    log::info!("Wrote {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::MissingReason;
    use crate::data::FitRecord;
    use crate::heuristics::Heuristic;
    use crate::sweep::{ExclusionReason, SweepOptions, run_sweep};

    fn render<F>(write: F) -> String
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), ReportError>,
    {
        let mut buffer = Vec::new();
        write(&mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn aggregates_write_na_for_missing_means() {
        let records = vec![
            AggregateRecord {
                log_size: 3.5,
                optimizer: "bobyqa".to_string(),
                mean_bad: Some(0.25),
                count: 4,
                missing: 0,
            },
            AggregateRecord {
                log_size: 3.5,
                optimizer: "nlminb".to_string(),
                mean_bad: None,
                count: 0,
                missing: 2,
            },
        ];
        let text = render(|buf| write_aggregates(buf, &records));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "log_size\toptimizer\tmean_bad\tcount\tmissing");
        assert_eq!(lines[1], "3.5\tbobyqa\t0.25\t4\t0");
        assert_eq!(lines[2], "3.5\tnlminb\tNA\t0\t2");
    }

    #[test]
    fn flagged_rows_append_bad_column() {
        let table = FitTable::new(
            [("a", 1.0), ("b", 1.0), ("c", 1.0)]
                .into_iter()
                .map(|(optimizer, value)| FitRecord {
                    dataset: "d1".to_string(),
                    optimizer: optimizer.to_string(),
                    log_size: 2.0,
                    replicate: 1,
                    parameter: "theta".to_string(),
                    value,
                    gradient: 0.001,
                    min_eigenvalue: 0.5,
                    time: 1.5,
                })
                .collect(),
        );
        let mut report = run_sweep(&table, &SweepOptions::default()).unwrap();
        report.row_flags[2] = Some(BadFlag::Missing(MissingReason::DegenerateConsensus));

        let text = render(|buf| write_flagged_rows(buf, &table, &report));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("\ttime\tbad"));
        assert_eq!(lines[1], "d1\ta\t2\t1\ttheta\t1\t0.001\t0.5\t1.5\tfalse");
        assert!(lines[3].ends_with("\tNA"));

        report.row_flags.pop();
        let mut sink = Vec::new();
        assert!(matches!(
            write_flagged_rows(&mut sink, &table, &report),
            Err(ReportError::MismatchedRows { flags: 2, rows: 3 })
        ));
    }

    #[test]
    fn exclusions_and_thresholds_render() {
        let exclusions = vec![ExcludedGroup {
            log_size: 4.0,
            replicate: 7,
            parameter: "sigma".to_string(),
            reason: ExclusionReason::InsufficientGroupSize { found: 1 },
        }];
        let text = render(|buf| write_exclusions(buf, &exclusions));
        assert_eq!(
            text.lines().nth(1),
            Some("4\t7\tsigma\tinsufficient group size (1)")
        );

        let points = vec![ThresholdPoint {
            heuristic: Heuristic::Gradient,
            threshold: 0.001,
            warned: 3,
            true_positive_rate: Some(1.0),
            false_positive_rate: None,
            warning_rate: Some(0.5),
        }];
        let text = render(|buf| write_threshold_points(buf, &points));
        assert_eq!(text.lines().nth(1), Some("gradient\t1e-3\t3\t1\tNA\t0.5"));
    }
}
