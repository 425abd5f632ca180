#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
//! `biosense` command-line entry point.

mod cli;
mod error_fmt;
mod measure;

use std::fs;
use std::path::Path;

use biosense_config::Logging;
use biosense_core::HoldCancel;
use clap::Parser;
use eyre::{Result, WrapErr};
use serde_json::json;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::measure::{build_session, exit_code_for_outcome, outcome_line, run_measure, sim_board};

/// Exit code when `self-check` cannot read the probe.
const SELF_CHECK_FAILED: i32 = 7;

fn main() {
    let code = match run() {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            if JSON_MODE.get().copied().unwrap_or(false) {
                eprintln!("{}", format_error_json(&e));
            } else {
                eprintln!("{}", humanize(&e));
            }
            exit_code_for_error(&e)
        }
    };
    std::process::exit(code);
}

/// Console layer on stderr (JSON or compact) plus an optional JSON-lines file.
fn init_tracing(json: bool, level: &str, logging: &Logging) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_layer = match &logging.file {
        Some(path) => {
            let path = Path::new(path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| eyre::eyre!("logging.file has no file name: {}", path.display()))?;
            let appender = match logging.rotation.as_deref().unwrap_or("never") {
                "daily" => tracing_appender::rolling::daily(dir, name),
                "hourly" => tracing_appender::rolling::hourly(dir, name),
                _ => tracing_appender::rolling::never(dir, name),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = FILE_GUARD.set(guard);
            Some(fmt::layer().json().with_ansi(false).with_writer(writer))
        }
        None => None,
    };
    let json_console = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_console = (!json).then(|| fmt::layer().compact().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(text_console)
        .with(file_layer)
        .try_init()
        .map_err(|e| eyre::eyre!("init tracing: {e}"))
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    let text = fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {}", cli.config.display()))?;
    let cfg = biosense_config::load_toml(&text).wrap_err("parse config TOML")?;
    cfg.validate()?;

    let level = cli
        .log_level
        .clone()
        .or_else(|| cfg.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    init_tracing(cli.json, &level, &cfg.logging)?;

    let calib = cli
        .calibration
        .as_deref()
        .map(biosense_config::load_calibration_csv)
        .transpose()?;

    // Ctrl-C dismisses a running stabilization hold; the cycle then finishes.
    let cancel = HoldCancel::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received; cancelling stabilization hold");
            cancel.cancel();
        })
        .wrap_err("install Ctrl-C handler")?;
    }

    match cli.cmd {
        Commands::Measure {
            analyte,
            count,
            hold_ms,
        } => {
            let orch = build_session(&cfg, calib.as_ref(), sim_board()?, cancel, hold_ms)?;
            let outcomes = run_measure(&orch, analyte.as_deref(), count)?;
            for o in &outcomes {
                if cli.json {
                    println!("{}", serde_json::to_string(o)?);
                } else {
                    println!("{}", outcome_line(o));
                }
            }
            Ok(outcomes.last().map(exit_code_for_outcome).unwrap_or(0))
        }
        Commands::Classify => {
            let orch = build_session(&cfg, calib.as_ref(), sim_board()?, cancel, None)?;
            let c = orch.classify_now()?;
            if cli.json {
                println!("{}", serde_json::to_string(&c)?);
            } else {
                println!("medium: {} ({})", c.medium, c.reason);
            }
            Ok(0)
        }
        Commands::SelfCheck => {
            let orch = build_session(&cfg, calib.as_ref(), sim_board()?, cancel, None)?;
            let c = orch.classify_now()?;
            // Passing requires a readable probe; an unclassifiable medium alone is fine.
            let ok = c.reading.is_some();
            let cartridge = cfg.cartridge.as_ref().map(|c| c.id.as_str());
            if cli.json {
                println!(
                    "{}",
                    json!({
                        "ok": ok,
                        "device_id": orch.device_id(),
                        "medium": c.medium,
                        "reason": c.reason,
                        "cartridge": cartridge,
                    })
                );
            } else {
                if ok {
                    println!("OK");
                } else {
                    println!("FAILED: {}", c.reason);
                }
                println!("device: {}", orch.device_id());
                println!("medium: {}", c.medium);
                println!("cartridge: {}", cartridge.unwrap_or("none"));
            }
            Ok(if ok { 0 } else { SELF_CHECK_FAILED })
        }
        Commands::Health => {
            let orch = build_session(&cfg, calib.as_ref(), sim_board()?, cancel, None)?;
            let summary = orch.session_summary();
            if cli.json {
                println!("{}", serde_json::to_string(&summary)?);
            } else {
                println!(
                    "healthy: device={} analyte={} mode={} suction={} fail_safe_locked={}",
                    summary.device_id,
                    summary.analyte,
                    summary.mode,
                    summary.suction,
                    summary.fail_safe.locked
                );
            }
            Ok(0)
        }
    }
}
