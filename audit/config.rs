//! Run configuration, stored as TOML.
//!
//! Every field has a default, so a config file only needs the values it wants to
//! override. Command-line flags take precedence over the file.

use crate::consensus::{ConsensusError, DEFAULT_RELTOL, DetectionMode, DetectorOptions};
use crate::heuristics::{HeuristicError, log_spaced_thresholds};
use crate::sweep::SweepOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// File name written by `concord init-config` when only a directory is given.
pub const DEFAULT_CONFIG_FILE: &str = "concord.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid detector settings: {0}")]
    InvalidDetector(#[from] ConsensusError),
    #[error("Invalid '{name}' grid: {source}")]
    InvalidGrid {
        name: &'static str,
        source: HeuristicError,
    },
}

/// Logarithmic threshold grid for one warning heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdGrid {
    pub lo: f64,
    pub hi: f64,
    pub steps: usize,
}

impl ThresholdGrid {
    pub fn values(&self) -> Result<Vec<f64>, HeuristicError> {
        log_spaced_thresholds(self.lo, self.hi, self.steps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub reltol: f64,
    pub mode: DetectionMode,
    /// Preferred optimizer order; unlisted optimizers follow in input order.
    pub optimizer_order: Vec<String>,
    pub gradient_thresholds: ThresholdGrid,
    pub eigenvalue_thresholds: ThresholdGrid,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            reltol: DEFAULT_RELTOL,
            mode: DetectionMode::Cutoff,
            optimizer_order: Vec::new(),
            gradient_thresholds: ThresholdGrid {
                lo: 1e-6,
                hi: 1e-1,
                steps: 11,
            },
            eigenvalue_thresholds: ThresholdGrid {
                lo: 1e-8,
                hi: 1e-2,
                steps: 11,
            },
        }
    }
}

impl AuditConfig {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.detector_options().validate()?;
        for (name, grid) in [
            ("gradient_thresholds", &self.gradient_thresholds),
            ("eigenvalue_thresholds", &self.eigenvalue_thresholds),
        ] {
            grid.values()
                .map_err(|source| ConfigError::InvalidGrid { name, source })?;
        }
        Ok(())
    }

    pub fn detector_options(&self) -> DetectorOptions {
        DetectorOptions {
            reltol: self.reltol,
            mode: self.mode,
        }
    }

    pub fn sweep_options(&self) -> SweepOptions {
        SweepOptions {
            detector: self.detector_options(),
            optimizer_order: self.optimizer_order.clone(),
        }
    }
}
