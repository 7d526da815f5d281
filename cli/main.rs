#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use concord::config::{AuditConfig, DEFAULT_CONFIG_FILE};
use concord::consensus::{DetectionMode, find_bad_in};
use concord::data::load_fit_table;
use concord::diagnostics::summarize_diagnostics;
use concord::heuristics::{Heuristic, summarize_fits, threshold_sweep};
use concord::report::{
    write_aggregates, write_diagnostics, write_exclusions, write_flagged_rows,
    write_threshold_points, write_to_path,
};
use concord::sweep::run_sweep;

#[derive(Args)]
pub struct SweepArgs {
    /// Path to the convergence-study table (TSV, or CSV with a .csv extension)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// TOML config file; flags given on the command line take precedence
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Relative tolerance for the consensus detector
    #[arg(long)]
    pub reltol: Option<f64>,

    /// Report the relative deviation from consensus instead of a cutoff flag
    #[arg(long)]
    pub deviation: bool,

    /// Directory for the output tables (defaults to the input's directory)
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Args)]
pub struct ThresholdsArgs {
    /// Path to the convergence-study table (TSV, or CSV with a .csv extension)
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// TOML config file holding the threshold grids
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Relative tolerance used to derive the consensus verdicts
    #[arg(long)]
    pub reltol: Option<f64>,

    /// Directory for the output tables (defaults to the input's directory)
    #[arg(long, value_name = "DIR")]
    pub out_dir: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "concord",
    about = "Consensus checks for multi-optimizer mixed-model fits",
    long_about = "Flags optimizer estimates that disagree with the consensus of the other \
                 optimizers, aggregates the flags by data-set size, and calibrates gradient \
                 and eigenvalue convergence warnings against them."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the consensus detector on a single group of estimates
    #[command(about = "Flag estimates that disagree with the others")]
    Detect {
        /// Estimates of one parameter, one per optimizer
        #[arg(value_name = "VALUES", required = true, allow_negative_numbers = true)]
        values: Vec<f64>,

        /// Relative tolerance
        #[arg(long)]
        reltol: Option<f64>,

        /// Report the relative deviation from consensus instead of a cutoff flag
        #[arg(long)]
        deviation: bool,
    },

    /// Apply the detector across a convergence-study table
    #[command(
        about = "Sweep a fit table (outputs: aggregates.tsv, flagged_rows.tsv, exclusions.tsv)"
    )]
    Sweep(SweepArgs),

    /// Compare convergence warnings against the consensus verdicts
    #[command(about = "Calibrate warning thresholds (outputs: thresholds.tsv, diagnostics.tsv)")]
    Thresholds(ThresholdsArgs),

    /// Write a config file holding the default settings
    #[command(about = "Write the default config (outputs: concord.toml)")]
    InitConfig {
        /// Destination file, or a directory to place concord.toml in
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Detect {
            values,
            reltol,
            deviation,
        }) => detect(values, reltol, deviation),
        Some(Commands::Sweep(args)) => sweep(args),
        Some(Commands::Thresholds(args)) => thresholds(args),
        Some(Commands::InitConfig { path }) => init_config(path),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command().print_help().map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Loads the config file if one was given, then applies command-line overrides.
fn resolve_config(
    config: Option<&Path>,
    reltol: Option<f64>,
    deviation: bool,
) -> Result<AuditConfig, Box<dyn std::error::Error>> {
    let mut resolved = match config {
        Some(path) => {
            log::info!("Using config '{}'", path.display());
            AuditConfig::load(path)?
        }
        None => AuditConfig::default(),
    };
    if let Some(reltol) = reltol {
        resolved.reltol = reltol;
    }
    if deviation {
        resolved.mode = DetectionMode::Deviation;
    }
    resolved.validate()?;
    Ok(resolved)
}

fn output_dir(input: &Path, out_dir: Option<PathBuf>) -> Result<PathBuf, std::io::Error> {
    let dir = out_dir.unwrap_or_else(|| match input.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    });
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn detect(
    values: Vec<f64>,
    reltol: Option<f64>,
    deviation: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(None, reltol, deviation)?;
    let flags = find_bad_in(&values, &config.detector_options())?;
    println!("index\tvalue\tbad");
    for (idx, (value, flag)) in values.iter().zip(&flags).enumerate() {
        println!("{}\t{}\t{}", idx + 1, value, flag);
    }
    Ok(())
}

fn sweep(args: SweepArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = resolve_config(args.config.as_deref(), args.reltol, args.deviation)?;
    let table = load_fit_table(&args.input)?;
    let report = run_sweep(&table, &config.sweep_options())?;
    let out_dir = output_dir(&args.input, args.out_dir)?;

    write_to_path(&out_dir.join("aggregates.tsv"), |file| {
        write_aggregates(file, &report.records)
    })?;
    write_to_path(&out_dir.join("flagged_rows.tsv"), |file| {
        write_flagged_rows(file, &table, &report)
    })?;
    write_to_path(&out_dir.join("exclusions.tsv"), |file| {
        write_exclusions(file, &report.exclusions)
    })?;

    println!(
        "Swept {} rows into {} aggregate records ({} groups excluded); results in {}",
        table.len(),
        report.records.len(),
        report.exclusions.len(),
        out_dir.display()
    );
    Ok(())
}

/// Like [`resolve_config`], but fit verdicts are always cutoff-mode flags.
fn verdict_config(
    config: Option<&Path>,
    reltol: Option<f64>,
) -> Result<AuditConfig, Box<dyn std::error::Error>> {
    let mut resolved = resolve_config(config, reltol, false)?;
    if resolved.mode != DetectionMode::Cutoff {
        log::info!(
            "Ignoring mode = {} from the config; fit verdicts use cutoff mode",
            resolved.mode
        );
        resolved.mode = DetectionMode::Cutoff;
    }
    Ok(resolved)
}

fn thresholds(args: ThresholdsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = verdict_config(args.config.as_deref(), args.reltol)?;
    let table = load_fit_table(&args.input)?;
    let report = run_sweep(&table, &config.sweep_options())?;
    let fits = summarize_fits(&table, &report)?;

    let mut points = threshold_sweep(
        &fits,
        Heuristic::Gradient,
        &config.gradient_thresholds.values()?,
    );
    points.extend(threshold_sweep(
        &fits,
        Heuristic::Eigenvalue,
        &config.eigenvalue_thresholds.values()?,
    ));
    let diagnostics = summarize_diagnostics(&fits);

    let out_dir = output_dir(&args.input, args.out_dir)?;
    write_to_path(&out_dir.join("thresholds.tsv"), |file| {
        write_threshold_points(file, &points)
    })?;
    write_to_path(&out_dir.join("diagnostics.tsv"), |file| {
        write_diagnostics(file, &diagnostics)
    })?;

    let judged = fits.iter().filter(|fit| fit.bad.is_some()).count();
    println!(
        "Compared {} threshold points over {} fits ({} with a consensus verdict); results in {}",
        points.len(),
        fits.len(),
        judged,
        out_dir.display()
    );
    Ok(())
}

fn init_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let target = if path.is_dir() {
        path.join(DEFAULT_CONFIG_FILE)
    } else {
        path
    };
    AuditConfig::default().save(&target)?;
    println!("Default config written to {}", target.display());
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;
    const WEEK: u64 = 7 * DAY;
    const YEAR: u64 = 365 * DAY;

    let units = [
        (YEAR, "years"),
        (WEEK, "weeks"),
        (DAY, "days"),
        (HOUR, "hours"),
        (MINUTE, "minutes"),
    ];
    match units.iter().find(|(span, _)| seconds >= *span) {
        Some(&(span, name)) => format!("{:.1} {} ago", seconds as f64 / span as f64, name),
        None => format!("{seconds} seconds ago"),
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("CONCORD_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("concord {version}");
    match option_env!("CONCORD_RELEASE_TAG") {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        match now.checked_sub(build_timestamp) {
            Some(age) if age > 0 => println!("Built: {}", format_duration_ago(age)),
            _ => println!("Built: just now"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_pick_the_largest_unit() {
        assert_eq!(format_duration_ago(42), "42 seconds ago");
        assert_eq!(format_duration_ago(90), "1.5 minutes ago");
        assert_eq!(format_duration_ago(3 * 3600), "3.0 hours ago");
        assert_eq!(format_duration_ago(14 * 86_400), "2.0 weeks ago");
    }

    #[test]
    fn flags_override_config_values() {
        let config = resolve_config(None, Some(0.05), true).unwrap();
        assert_eq!(config.reltol, 0.05);
        assert_eq!(config.mode, DetectionMode::Deviation);
        assert!(resolve_config(None, Some(0.0), false).is_err());
    }

    #[test]
    fn verdicts_ignore_deviation_mode_in_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "reltol = 0.02\nmode = \"deviation\"\n").unwrap();

        let config = verdict_config(Some(&path), None).unwrap();
        assert_eq!(config.mode, DetectionMode::Cutoff);
        assert_eq!(config.reltol, 0.02);
        assert_eq!(
            resolve_config(Some(&path), None, false).unwrap().mode,
            DetectionMode::Deviation
        );
    }

    #[test]
    fn cli_parses_negative_values() {
        let cli = Cli::try_parse_from(["concord", "detect", "-1.0", "-1.01", "--reltol", "0.1"])
            .unwrap();
        match cli.command {
            Some(Commands::Detect { values, reltol, .. }) => {
                assert_eq!(values, vec![-1.0, -1.01]);
                assert_eq!(reltol, Some(0.1));
            }
            _ => panic!("expected the detect subcommand"),
        }
    }
}
