//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "biosense", version, about = "Biosensor reader CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/biosense.toml")]
    pub config: PathBuf,

    /// Optional cartridge calibration CSV (strict header: raw_v,reference_v)
    #[arg(long, value_name = "FILE")]
    pub calibration: Option<PathBuf>,

    /// Print results and errors as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run measurement cycles on the inserted cartridge
    Measure {
        /// Analyte to measure (defaults to the RAFE's current target)
        #[arg(long)]
        analyte: Option<String>,
        /// Number of consecutive cycles; stops at the first non-completed outcome
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Override the solid-contact stabilization hold in ms
        #[arg(long, value_name = "MS")]
        hold_ms: Option<u64>,
    },
    /// Probe the sensor once and report the contact medium
    Classify,
    /// Quick health check (hardware presence / sim ok)
    SelfCheck,
    /// Session health snapshot for operational monitoring
    Health,
}
