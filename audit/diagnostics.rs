//! Descriptive summaries of the per-fit diagnostics (timing, gradient, Hessian
//! eigenvalue) by data-set size and optimizer.

use crate::heuristics::FitSummary;
use itertools::Itertools;

/// Diagnostic summary for one (data-set size, optimizer) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagnosticSummary {
    pub log_size: f64,
    pub optimizer: String,
    pub fits: usize,
    pub mean_time: f64,
    pub median_time: f64,
    pub median_gradient: f64,
    pub median_min_eigenvalue: f64,
}

/// Median of `values`, averaging the two middle elements for even lengths.
///
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Summarizes fits in the order [`crate::heuristics::summarize_fits`] yields
/// them: consecutive fits sharing a data-set size and optimizer form one cell.
pub fn summarize_diagnostics(fits: &[FitSummary]) -> Vec<DiagnosticSummary> {
    fits.iter()
        .chunk_by(|fit| (fit.log_size.to_bits(), fit.optimizer.as_str()))
        .into_iter()
        .filter_map(|(_, cell)| {
            let cell: Vec<&FitSummary> = cell.collect();
            let head = cell.first()?;
            let times: Vec<f64> = cell.iter().map(|f| f.time).collect();
            let gradients: Vec<f64> = cell.iter().map(|f| f.max_abs_gradient).collect();
            let eigenvalues: Vec<f64> = cell.iter().map(|f| f.min_eigenvalue).collect();
            Some(DiagnosticSummary {
                log_size: head.log_size,
                optimizer: head.optimizer.clone(),
                fits: cell.len(),
                mean_time: times.iter().sum::<f64>() / times.len() as f64,
                median_time: median(&times)?,
                median_gradient: median(&gradients)?,
                median_min_eigenvalue: median(&eigenvalues)?,
            })
        })
        .collect()
}
