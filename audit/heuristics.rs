//! Compares gradient- and eigenvalue-based convergence warnings against the
//! consensus verdicts of a sweep.
//!
//! A fit is one (dataset, optimizer) pair. Its consensus verdict is "bad" when any
//! of its parameter estimates was flagged; fits whose flags are all missing have
//! no verdict and are left out of the rates. For a grid of warning thresholds the
//! sweep reports how many fits would warn, and how well those warnings line up
//! with the consensus verdicts.

use crate::consensus::DetectionMode;
use crate::data::{FitRecord, FitTable};
use crate::sweep::SweepReport;
use itertools::Itertools;
use ndarray::Array1;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HeuristicError {
    #[error(
        "Threshold grid needs 0 < lo < hi and at least 2 steps (got lo = {lo}, hi = {hi}, steps = {steps})."
    )]
    InvalidGrid { lo: f64, hi: f64, steps: usize },
    #[error("The sweep report covers {report_rows} rows but the table has {table_rows}.")]
    MismatchedReport {
        report_rows: usize,
        table_rows: usize,
    },
    #[error("Fit verdicts need a sweep run in cutoff mode, but it ran in {0} mode.")]
    RequiresCutoff(DetectionMode),
}

/// Fit-level view of a convergence-study table.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub dataset: String,
    pub optimizer: String,
    pub log_size: f64,
    pub max_abs_gradient: f64,
    pub min_eigenvalue: f64,
    pub time: f64,
    /// Consensus verdict; `None` when no parameter of the fit could be judged.
    pub bad: Option<bool>,
}

/// Collapses estimate rows into one [`FitSummary`] per (dataset, optimizer).
///
/// The report must come from a cutoff-mode sweep. Output is ordered by data-set
/// size, then optimizer rank, then dataset.
pub fn summarize_fits(
    table: &FitTable,
    report: &SweepReport,
) -> Result<Vec<FitSummary>, HeuristicError> {
    if report.options.mode != DetectionMode::Cutoff {
        return Err(HeuristicError::RequiresCutoff(report.options.mode));
    }
    let records = table.records();
    if report.row_flags.len() != records.len() {
        return Err(HeuristicError::MismatchedReport {
            report_rows: report.row_flags.len(),
            table_rows: records.len(),
        });
    }

    let ranks = &report.optimizers;
    let reltol = report.options.reltol;
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        let (ra, rb) = (&records[a], &records[b]);
        ra.log_size
            .total_cmp(&rb.log_size)
            .then_with(|| ranks.rank(&ra.optimizer).cmp(&ranks.rank(&rb.optimizer)))
            .then_with(|| ra.dataset.cmp(&rb.dataset))
    });

    let fits = order
        .iter()
        .chunk_by(|&&idx| (records[idx].dataset.as_str(), records[idx].optimizer.as_str()))
        .into_iter()
        .map(|(_, members)| {
            let rows: Vec<(&FitRecord, Option<bool>)> = members
                .map(|&idx| {
                    let verdict = report.row_flags[idx].and_then(|flag| flag.verdict(reltol));
                    (&records[idx], verdict)
                })
                .collect();
            let head = rows[0].0;
            let verdicts: Vec<bool> = rows.iter().filter_map(|&(_, v)| v).collect();
            FitSummary {
                dataset: head.dataset.clone(),
                optimizer: head.optimizer.clone(),
                log_size: head.log_size,
                max_abs_gradient: rows
                    .iter()
                    .map(|(r, _)| r.gradient.abs())
                    .fold(0.0, f64::max),
                min_eigenvalue: rows
                    .iter()
                    .map(|(r, _)| r.min_eigenvalue)
                    .fold(f64::INFINITY, f64::min),
                time: rows.iter().map(|(r, _)| r.time).fold(0.0, f64::max),
                bad: if verdicts.is_empty() {
                    None
                } else {
                    Some(verdicts.iter().any(|&b| b))
                },
            }
        })
        .collect();
    Ok(fits)
}

/// Convergence warning rule under calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heuristic {
    /// Warn when the largest absolute gradient exceeds the threshold.
    Gradient,
    /// Warn when the smallest Hessian eigenvalue falls below the threshold.
    Eigenvalue,
}

impl Heuristic {
    pub fn warns(self, fit: &FitSummary, threshold: f64) -> bool {
        match self {
            Self::Gradient => fit.max_abs_gradient > threshold,
            Self::Eigenvalue => fit.min_eigenvalue < threshold,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Gradient => "gradient",
            Self::Eigenvalue => "eigenvalue",
        }
    }
}

impl fmt::Display for Heuristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Warning statistics at one threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPoint {
    pub heuristic: Heuristic,
    pub threshold: f64,
    /// Judged fits that would warn.
    pub warned: usize,
    /// Share of bad fits that warn.
    pub true_positive_rate: Option<f64>,
    /// Share of good fits that warn.
    pub false_positive_rate: Option<f64>,
    /// Share of judged fits that warn.
    pub warning_rate: Option<f64>,
}

fn ratio(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Evaluates `heuristic` at each threshold over fits with a consensus verdict.
pub fn threshold_sweep(
    fits: &[FitSummary],
    heuristic: Heuristic,
    thresholds: &[f64],
) -> Vec<ThresholdPoint> {
    let judged: Vec<(&FitSummary, bool)> = fits
        .iter()
        .filter_map(|fit| fit.bad.map(|bad| (fit, bad)))
        .collect();
    let positives = judged.iter().filter(|&&(_, bad)| bad).count();
    let negatives = judged.len() - positives;

    thresholds
        .iter()
        .map(|&threshold| {
            let (warned, true_positives) = judged
                .iter()
                .filter(|(fit, _)| heuristic.warns(fit, threshold))
                .fold((0usize, 0usize), |(warned, tp), &(_, bad)| {
                    (warned + 1, tp + usize::from(bad))
                });
            ThresholdPoint {
                heuristic,
                threshold,
                warned,
                true_positive_rate: ratio(true_positives, positives),
                false_positive_rate: ratio(warned - true_positives, negatives),
                warning_rate: ratio(warned, judged.len()),
            }
        })
        .collect()
}

/// Logarithmically spaced grid from `lo` to `hi` inclusive.
pub fn log_spaced_thresholds(
    lo: f64,
    hi: f64,
    steps: usize,
) -> Result<Vec<f64>, HeuristicError> {
    if !(lo.is_finite() && hi.is_finite() && lo > 0.0 && lo < hi && steps >= 2) {
        return Err(HeuristicError::InvalidGrid { lo, hi, steps });
    }
    let grid = Array1::logspace(10.0, lo.log10(), hi.log10(), steps);
    Ok(grid.to_vec())
}
