//! # Threshold Sweep and Aggregation
//!
//! Applies the consensus detector to every (data-set size, replicate, parameter)
//! group of a [`FitTable`] and folds the resulting flags into one
//! [`AggregateRecord`] per (data-set size, optimizer).
//!
//! Estimates inside a group are ordered by optimizer rank so that every group is
//! judged with the same optimizer ordering. Groups are independent of one another
//! and are evaluated on the rayon pool; results are collected in key order, so
//! the output never depends on scheduling.
//!
//! Per-group anomalies never abort a sweep. A group that cannot be judged is
//! recorded as an [`ExcludedGroup`] and its rows carry no flag.

use crate::consensus::{BadFlag, ConsensusError, DetectorOptions, find_bad};
use crate::data::{FitRecord, FitTable};
use ahash::AHashMap;
use itertools::Itertools;
use ndarray::ArrayView1;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Tuning for [`run_sweep`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepOptions {
    pub detector: DetectorOptions,
    /// Preferred optimizer ordering. Optimizers missing from this list follow in
    /// order of first appearance.
    pub optimizer_order: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("Invalid detector options: {0}")]
    InvalidOptions(#[from] ConsensusError),
    #[error("The fit table is empty; there is nothing to sweep.")]
    EmptyTable,
}

/// Dense ranks assigned to optimizer names.
#[derive(Debug, Clone)]
pub struct OptimizerRanks {
    names: Vec<String>,
    ranks: AHashMap<String, usize>,
}

impl OptimizerRanks {
    /// Preferred names first (those absent from the table are dropped), then the
    /// remaining optimizers of `table` in order of first appearance.
    pub fn resolve(preferred: &[String], table: &FitTable) -> Self {
        let present = table.optimizers();
        let mut names: Vec<String> = preferred
            .iter()
            .filter(|name| present.contains(*name))
            .unique()
            .cloned()
            .collect();
        for name in present {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        let ranks = names
            .iter()
            .enumerate()
            .map(|(rank, name)| (name.clone(), rank))
            .collect();
        Self { names, ranks }
    }

    pub fn rank(&self, name: &str) -> usize {
        self.ranks.get(name).copied().unwrap_or(usize::MAX)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// Why a group was skipped.
#[derive(Debug, Clone, PartialEq)]
pub enum ExclusionReason {
    InsufficientGroupSize { found: usize },
    DuplicateOptimizer(String),
    NonFiniteEstimate { optimizer: String },
    InvalidTolerance { reltol: f64 },
}

impl fmt::Display for ExclusionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientGroupSize { found } => {
                write!(f, "insufficient group size ({found})")
            }
            Self::DuplicateOptimizer(name) => write!(f, "duplicate optimizer '{name}'"),
            Self::NonFiniteEstimate { optimizer } => {
                write!(f, "non-finite estimate from '{optimizer}'")
            }
            Self::InvalidTolerance { reltol } => write!(f, "invalid tolerance ({reltol})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcludedGroup {
    pub log_size: f64,
    pub replicate: u32,
    pub parameter: String,
    pub reason: ExclusionReason,
}

/// Mean flag value for one (data-set size, optimizer) cell.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRecord {
    pub log_size: f64,
    pub optimizer: String,
    /// Mean of the non-missing flag values; `None` when nothing contributed.
    pub mean_bad: Option<f64>,
    /// Rows that contributed to `mean_bad`.
    pub count: usize,
    /// Rows that were judged but produced a missing flag.
    pub missing: usize,
}

/// Everything a sweep produces.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub options: DetectorOptions,
    pub optimizers: OptimizerRanks,
    /// Sorted by data-set size, then optimizer rank.
    pub records: Vec<AggregateRecord>,
    /// Aligned with the table rows; `None` for rows of excluded groups.
    pub row_flags: Vec<Option<BadFlag>>,
    pub exclusions: Vec<ExcludedGroup>,
}

type GroupOutcome = Result<Vec<(usize, BadFlag)>, ExcludedGroup>;

/// Runs the detector over every estimate group and aggregates the flags.
pub fn run_sweep(table: &FitTable, options: &SweepOptions) -> Result<SweepReport, SweepError> {
    options.detector.validate()?;
    if table.is_empty() {
        return Err(SweepError::EmptyTable);
    }

    let records = table.records();
    let optimizers = OptimizerRanks::resolve(&options.optimizer_order, table);

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        compare_group_keys(&records[a], &records[b]).then_with(|| {
            optimizers
                .rank(&records[a].optimizer)
                .cmp(&optimizers.rank(&records[b].optimizer))
        })
    });
    let groups: Vec<Vec<usize>> = order
        .iter()
        .chunk_by(|&&idx| {
            let r = &records[idx];
            (r.log_size.to_bits(), r.replicate, r.parameter.as_str())
        })
        .into_iter()
        .map(|(_, members)| members.copied().collect())
        .collect();

    log::info!(
        "Evaluating {} estimate groups across {} optimizers (reltol = {}, mode = {})",
        groups.len(),
        optimizers.names().len(),
        options.detector.reltol,
        options.detector.mode
    );

    let outcomes: Vec<GroupOutcome> = groups
        .par_iter()
        .map(|members| evaluate_group(records, members, &optimizers, &options.detector))
        .collect();

    let mut row_flags: Vec<Option<BadFlag>> = vec![None; records.len()];
    let mut exclusions = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(flags) => {
                for (row, flag) in flags {
                    row_flags[row] = Some(flag);
                }
            }
            Err(excluded) => {
                log::debug!(
                    "Skipping group (log_size = {}, replicate = {}, parameter = {}): {}",
                    excluded.log_size,
                    excluded.replicate,
                    excluded.parameter,
                    excluded.reason
                );
                exclusions.push(excluded);
            }
        }
    }
    if !exclusions.is_empty() {
        log::warn!(
            "{} of {} estimate groups could not be judged and were excluded",
            exclusions.len(),
            groups.len()
        );
    }

    let aggregates = aggregate(records, &row_flags, &optimizers);

    Ok(SweepReport {
        options: options.detector,
        optimizers,
        records: aggregates,
        row_flags,
        exclusions,
    })
}

fn compare_group_keys(a: &FitRecord, b: &FitRecord) -> Ordering {
    a.log_size
        .total_cmp(&b.log_size)
        .then_with(|| a.replicate.cmp(&b.replicate))
        .then_with(|| a.parameter.cmp(&b.parameter))
}

fn evaluate_group(
    records: &[FitRecord],
    members: &[usize],
    optimizers: &OptimizerRanks,
    detector: &DetectorOptions,
) -> GroupOutcome {
    let head = &records[members[0]];
    let exclude = |reason| ExcludedGroup {
        log_size: head.log_size,
        replicate: head.replicate,
        parameter: head.parameter.clone(),
        reason,
    };

    if members.len() < 2 {
        return Err(exclude(ExclusionReason::InsufficientGroupSize {
            found: members.len(),
        }));
    }
    // Members are sorted by rank, so duplicates are adjacent.
    let rank_of = |idx: usize| optimizers.rank(&records[idx].optimizer);
    if let Some(pair) = members
        .windows(2)
        .find(|pair| rank_of(pair[0]) == rank_of(pair[1]))
    {
        return Err(exclude(ExclusionReason::DuplicateOptimizer(
            records[pair[0]].optimizer.clone(),
        )));
    }

    let values: Vec<f64> = members.iter().map(|&idx| records[idx].value).collect();
    match find_bad(ArrayView1::from(&values[..]), detector) {
        Ok(flags) => Ok(members.iter().copied().zip(flags).collect()),
        Err(ConsensusError::InsufficientGroupSize { found }) => {
            Err(exclude(ExclusionReason::InsufficientGroupSize { found }))
        }
        Err(ConsensusError::NonFiniteEstimate { index, .. }) => {
            Err(exclude(ExclusionReason::NonFiniteEstimate {
                optimizer: records[members[index]].optimizer.clone(),
            }))
        }
        Err(ConsensusError::InvalidTolerance(reltol)) => {
            Err(exclude(ExclusionReason::InvalidTolerance { reltol }))
        }
    }
}

fn aggregate(
    records: &[FitRecord],
    row_flags: &[Option<BadFlag>],
    optimizers: &OptimizerRanks,
) -> Vec<AggregateRecord> {
    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        records[a]
            .log_size
            .total_cmp(&records[b].log_size)
            .then_with(|| {
                optimizers
                    .rank(&records[a].optimizer)
                    .cmp(&optimizers.rank(&records[b].optimizer))
            })
    });

    order
        .iter()
        .chunk_by(|&&idx| (records[idx].log_size.to_bits(), records[idx].optimizer.as_str()))
        .into_iter()
        .map(|(_, members)| {
            let members: Vec<usize> = members.copied().collect();
            let head = &records[members[0]];
            let judged: Vec<BadFlag> = members
                .iter()
                .filter_map(|&idx| row_flags[idx])
                .collect();
            let values: Vec<f64> = judged.iter().filter_map(BadFlag::value).collect();
            let mean_bad = if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<f64>() / values.len() as f64)
            };
            AggregateRecord {
                log_size: head.log_size,
                optimizer: head.optimizer.clone(),
                mean_bad,
                count: values.len(),
                missing: judged.len() - values.len(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::MissingReason;
    use approx::assert_abs_diff_eq;

    fn record(
        optimizer: &str,
        log_size: f64,
        replicate: u32,
        parameter: &str,
        value: f64,
    ) -> FitRecord {
        FitRecord {
            dataset: format!("n{log_size}_r{replicate}"),
            optimizer: optimizer.to_string(),
            log_size,
            replicate,
            parameter: parameter.to_string(),
            value,
            gradient: 1e-5,
            min_eigenvalue: 0.5,
            time: 1.0,
        }
    }

    fn four_optimizer_group(
        log_size: f64,
        replicate: u32,
        parameter: &str,
        values: [f64; 4],
    ) -> Vec<FitRecord> {
        ["bobyqa", "nelder_mead", "nlminb", "lbfgsb"]
            .iter()
            .zip(values)
            .map(|(opt, value)| record(opt, log_size, replicate, parameter, value))
            .collect()
    }

    #[test]
    fn flags_outlier_and_aggregates_by_size_and_optimizer() {
        let mut rows = four_optimizer_group(3.0, 1, "theta", [1.000, 1.001, 0.999, 1.20]);
        rows.extend(four_optimizer_group(3.0, 2, "theta", [2.0, 2.0, 2.0, 2.0]));
        rows.extend(four_optimizer_group(5.0, 1, "theta", [0.5, 0.5, 0.5, 0.5]));
        let table = FitTable::new(rows);

        let report = run_sweep(&table, &SweepOptions::default()).unwrap();
        assert!(report.exclusions.is_empty());
        assert_eq!(report.records.len(), 8);

        let lbfgsb_small = report
            .records
            .iter()
            .find(|r| r.log_size == 3.0 && r.optimizer == "lbfgsb")
            .unwrap();
        assert_eq!(lbfgsb_small.count, 2);
        assert_eq!(lbfgsb_small.missing, 0);
        assert_abs_diff_eq!(lbfgsb_small.mean_bad.unwrap(), 0.5, epsilon = 1e-12);

        let bobyqa_large = report
            .records
            .iter()
            .find(|r| r.log_size == 5.0 && r.optimizer == "bobyqa")
            .unwrap();
        assert_eq!(bobyqa_large.mean_bad, Some(0.0));

        assert_eq!(report.row_flags[3], Some(BadFlag::Flag(true)));
        assert_eq!(report.row_flags[0], Some(BadFlag::Flag(false)));
    }

    #[test]
    fn records_follow_size_then_optimizer_rank() {
        let mut rows = four_optimizer_group(6.0, 1, "theta", [1.0, 1.0, 1.0, 1.0]);
        rows.extend(four_optimizer_group(2.0, 1, "theta", [1.0, 1.0, 1.0, 1.0]));
        let table = FitTable::new(rows);

        let options = SweepOptions {
            optimizer_order: vec!["nlminb".to_string(), "absent".to_string()],
            ..SweepOptions::default()
        };
        let report = run_sweep(&table, &options).unwrap();

        let keys: Vec<(f64, &str)> = report
            .records
            .iter()
            .map(|r| (r.log_size, r.optimizer.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (2.0, "nlminb"),
                (2.0, "bobyqa"),
                (2.0, "nelder_mead"),
                (2.0, "lbfgsb"),
                (6.0, "nlminb"),
                (6.0, "bobyqa"),
                (6.0, "nelder_mead"),
                (6.0, "lbfgsb"),
            ]
        );
        assert_eq!(
            report.optimizers.names(),
            &["nlminb", "bobyqa", "nelder_mead", "lbfgsb"]
        );
    }

    #[test]
    fn undersized_and_duplicated_groups_are_excluded_not_fatal() {
        let mut rows = four_optimizer_group(3.0, 1, "theta", [1.000, 1.001, 0.999, 1.20]);
        rows.push(record("bobyqa", 3.0, 1, "sigma", 0.7));
        rows.push(record("bobyqa", 3.0, 2, "theta", 1.0));
        rows.push(record("bobyqa", 3.0, 2, "theta", 1.1));
        rows.push(record("nlminb", 3.0, 2, "theta", 1.0));
        let table = FitTable::new(rows);

        let report = run_sweep(&table, &SweepOptions::default()).unwrap();
        assert_eq!(report.exclusions.len(), 2);
        assert!(report.exclusions.iter().any(|e| e.parameter == "sigma"
            && e.reason == ExclusionReason::InsufficientGroupSize { found: 1 }));
        assert!(report.exclusions.iter().any(|e| e.replicate == 2
            && e.reason == ExclusionReason::DuplicateOptimizer("bobyqa".to_string())));

        for row in 4..8 {
            assert_eq!(report.row_flags[row], None);
        }
        // The healthy group still contributes.
        let lbfgsb = report
            .records
            .iter()
            .find(|r| r.optimizer == "lbfgsb")
            .unwrap();
        assert_eq!(lbfgsb.mean_bad, Some(1.0));
    }

    #[test]
    fn rejected_tolerance_excludes_the_group() {
        let records = four_optimizer_group(3.0, 4, "theta", [1.0, 1.0, 1.0, 1.0]);
        let table = FitTable::new(records.clone());
        let ranks = OptimizerRanks::resolve(&[], &table);
        let invalid = DetectorOptions::cutoff(-1.0);

        let excluded = evaluate_group(&records, &[0, 1, 2, 3], &ranks, &invalid).unwrap_err();
        assert_eq!(excluded.replicate, 4);
        assert_eq!(
            excluded.reason,
            ExclusionReason::InvalidTolerance { reltol: -1.0 }
        );
        assert_eq!(excluded.reason.to_string(), "invalid tolerance (-1)");

        let options = SweepOptions {
            detector: invalid,
            ..SweepOptions::default()
        };
        assert!(matches!(
            run_sweep(&table, &options),
            Err(SweepError::InvalidOptions(ConsensusError::InvalidTolerance(_)))
        ));
    }

    #[test]
    fn missing_flags_are_excluded_from_means() {
        let mut rows = four_optimizer_group(3.0, 1, "theta", [1.0, -1.0, 0.0, 0.0]);
        rows.extend(four_optimizer_group(3.0, 1, "sigma", [1.0, 1.0, 1.0, 1.0]));
        let table = FitTable::new(rows);

        let report = run_sweep(&table, &SweepOptions::default()).unwrap();
        assert_eq!(
            report.row_flags[0],
            Some(BadFlag::Flag(false)),
            "mean of [-1, 0, 0] is nonzero"
        );
        assert_eq!(report.row_flags[1], Some(BadFlag::Flag(false)));
        assert_eq!(
            report.row_flags[2],
            Some(BadFlag::Missing(MissingReason::DegenerateConsensus))
        );

        let nlminb = report
            .records
            .iter()
            .find(|r| r.optimizer == "nlminb")
            .unwrap();
        assert_eq!(nlminb.count, 1);
        assert_eq!(nlminb.missing, 1);
        assert_eq!(nlminb.mean_bad, Some(0.0));
    }

    #[test]
    fn invalid_options_and_empty_tables_fail_outright() {
        let table = FitTable::new(four_optimizer_group(3.0, 1, "theta", [1.0; 4]));
        let options = SweepOptions {
            detector: DetectorOptions::cutoff(-1.0),
            ..SweepOptions::default()
        };
        assert!(matches!(
            run_sweep(&table, &options),
            Err(SweepError::InvalidOptions(_))
        ));
        assert!(matches!(
            run_sweep(&FitTable::default(), &SweepOptions::default()),
            Err(SweepError::EmptyTable)
        ));
    }
}
