//! # Consensus Deviation Detector
//!
//! Every simulated data set in a convergence study is fitted once per optimizer,
//! so each model parameter ends up with a small group of estimates that should
//! all agree. This module decides, for each member of such a group, whether it
//! disagrees with the consensus formed by the remaining members.
//!
//! For the estimate at position `i`:
//!
//! 1. The consensus `m` is the mean of every other estimate (leave-one-out).
//! 2. The relative spread is the sample standard deviation of `x[j] / m`
//!    over `j != i`. It measures how well the *other* estimates agree.
//! 3. In [`DetectionMode::Cutoff`] the estimate is flagged when the others
//!    agree tightly (`spread < reltol`) but `x[i]` does not match `m` within
//!    `reltol`.
//! 4. In [`DetectionMode::Deviation`] the relative deviation `|1 - x[i] / m|`
//!    is reported, unless the others disagree (`spread > reltol`), in which
//!    case the result is missing.
//!
//! Missing results are explicit [`BadFlag::Missing`] values carrying a
//! [`MissingReason`]; no NaN sentinels leave this module.

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Relative tolerance used when none is configured.
pub const DEFAULT_RELTOL: f64 = 0.01;

/// Selects what the detector reports for each estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMode {
    /// Boolean verdict per estimate.
    #[default]
    Cutoff,
    /// Relative deviation from the leave-one-out consensus.
    Deviation,
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cutoff => f.write_str("cutoff"),
            Self::Deviation => f.write_str("deviation"),
        }
    }
}

/// Tuning for [`find_bad`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorOptions {
    pub reltol: f64,
    pub mode: DetectionMode,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            reltol: DEFAULT_RELTOL,
            mode: DetectionMode::Cutoff,
        }
    }
}

impl DetectorOptions {
    pub fn cutoff(reltol: f64) -> Self {
        Self {
            reltol,
            mode: DetectionMode::Cutoff,
        }
    }

    pub fn deviation(reltol: f64) -> Self {
        Self {
            reltol,
            mode: DetectionMode::Deviation,
        }
    }

    /// Rejects tolerances that cannot express a relative comparison.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if !self.reltol.is_finite() || self.reltol <= 0.0 {
            return Err(ConsensusError::InvalidTolerance(self.reltol));
        }
        Ok(())
    }
}

/// Why an estimate has no verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingReason {
    /// The leave-one-out mean is zero, so ratios against it are undefined.
    DegenerateConsensus,
    /// The other estimates disagree beyond `reltol` (deviation mode only).
    LowAgreement,
    /// Only one other estimate exists; a sample spread needs two.
    SingleComparator,
}

impl MissingReason {
    pub fn describe(self) -> &'static str {
        match self {
            Self::DegenerateConsensus => "degenerate consensus",
            Self::LowAgreement => "low agreement",
            Self::SingleComparator => "single comparator",
        }
    }
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Per-estimate detector output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BadFlag {
    /// Cutoff-mode verdict.
    Flag(bool),
    /// Deviation-mode relative deviation `|1 - x[i] / m|`.
    Deviation(f64),
    Missing(MissingReason),
}

impl BadFlag {
    /// Numeric value used when averaging flags: `true` counts as 1, `false`
    /// as 0, deviations as themselves. Missing flags have no value.
    pub fn value(&self) -> Option<f64> {
        match *self {
            Self::Flag(true) => Some(1.0),
            Self::Flag(false) => Some(0.0),
            Self::Deviation(d) => Some(d),
            Self::Missing(_) => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }

    /// Collapses the flag into a bad/not-bad verdict. Deviations count as bad
    /// when they exceed `reltol`.
    pub fn verdict(&self, reltol: f64) -> Option<bool> {
        match *self {
            Self::Flag(flag) => Some(flag),
            Self::Deviation(d) => Some(d > reltol),
            Self::Missing(_) => None,
        }
    }
}

impl fmt::Display for BadFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::Deviation(d) => write!(f, "{d}"),
            Self::Missing(_) => f.write_str("NA"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConsensusError {
    #[error("A consensus needs at least 2 estimates, but the group has {found}.")]
    InsufficientGroupSize { found: usize },
    #[error("Estimate at position {index} is not finite ({value}).")]
    NonFiniteEstimate { index: usize, value: f64 },
    #[error("The relative tolerance must be finite and positive, got {0}.")]
    InvalidTolerance(f64),
}

/// Mean of `x` without the element at `held_out`. `x` must hold at least two values.
pub fn leave_one_out_mean(x: ArrayView1<f64>, held_out: usize) -> f64 {
    let (sum, count) = x
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != held_out)
        .fold((0.0, 0usize), |(sum, count), (_, &v)| (sum + v, count + 1));
    sum / count as f64
}

/// Sample standard deviation of `x[j] / reference` over `j != held_out`.
///
/// Returns `None` when fewer than two values remain.
pub fn relative_spread(x: ArrayView1<f64>, held_out: usize, reference: f64) -> Option<f64> {
    let ratios: Vec<f64> = x
        .iter()
        .enumerate()
        .filter(|&(j, _)| j != held_out)
        .map(|(_, &v)| v / reference)
        .collect();
    if ratios.len() < 2 {
        return None;
    }
    let n = ratios.len() as f64;
    let mean = ratios.iter().sum::<f64>() / n;
    let sum_sq = ratios.iter().map(|&r| (r - mean) * (r - mean)).sum::<f64>();
    Some((sum_sq / (n - 1.0)).sqrt())
}

/// Mean relative difference test: `|target - current|` scaled by `|target|`.
/// When `|target|` is itself within `tolerance` of zero the plain absolute
/// difference is compared instead.
pub fn approx_equal(target: f64, current: f64, tolerance: f64) -> bool {
    let diff = (target - current).abs();
    let scale = target.abs();
    if scale.is_finite() && scale > tolerance {
        diff / scale <= tolerance
    } else {
        diff <= tolerance
    }
}

/// Runs the leave-one-out consensus check over one estimate group.
pub fn find_bad(
    x: ArrayView1<f64>,
    options: &DetectorOptions,
) -> Result<Vec<BadFlag>, ConsensusError> {
    options.validate()?;
    if x.len() < 2 {
        return Err(ConsensusError::InsufficientGroupSize { found: x.len() });
    }
    if let Some((index, &value)) = x.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(ConsensusError::NonFiniteEstimate { index, value });
    }

    Ok((0..x.len()).map(|i| judge(x, i, options)).collect())
}

/// Slice convenience wrapper around [`find_bad`].
pub fn find_bad_in(
    values: &[f64],
    options: &DetectorOptions,
) -> Result<Vec<BadFlag>, ConsensusError> {
    find_bad(ArrayView1::from(values), options)
}

fn judge(x: ArrayView1<f64>, i: usize, options: &DetectorOptions) -> BadFlag {
    let m = leave_one_out_mean(x, i);
    if m == 0.0 || !m.is_finite() {
        return BadFlag::Missing(MissingReason::DegenerateConsensus);
    }
    let Some(spread) = relative_spread(x, i, m) else {
        return BadFlag::Missing(MissingReason::SingleComparator);
    };
    if !spread.is_finite() {
        return BadFlag::Missing(MissingReason::DegenerateConsensus);
    }

    match options.mode {
        DetectionMode::Cutoff => {
            BadFlag::Flag(spread < options.reltol && !approx_equal(x[i], m, options.reltol))
        }
        DetectionMode::Deviation => {
            if spread > options.reltol {
                BadFlag::Missing(MissingReason::LowAgreement)
            } else {
                BadFlag::Deviation((1.0 - x[i] / m).abs())
            }
        }
    }
}
