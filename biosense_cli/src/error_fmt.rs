//! Human-readable error descriptions and structured JSON error formatting.

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    use biosense_core::error::{BuildError, CoreError};

    // Typed matches first
    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::MissingProbe | BuildError::MissingFrontEnd | BuildError::MissingPump => format!(
                "What happened: {be}.\nLikely causes: A hardware backend failed to initialize or was not wired into the builder.\nHow to fix: Check the board connection and rerun self-check."
            ),
            BuildError::MissingCartridgeAuthority | BuildError::MissingConsentAuthority => format!(
                "What happened: {be}.\nLikely causes: The session was assembled without its cartridge or consent service.\nHow to fix: This is a wiring bug; report it with --log-level=debug output."
            ),
            BuildError::InvalidConfig(msg) => format!(
                "What happened: Invalid configuration ({msg}).\nLikely causes: Missing or out-of-range values in the TOML.\nHow to fix: Edit the config file, then rerun."
            ),
        };
    }

    if let Some(ce) = err.downcast_ref::<CoreError>() {
        return match ce {
            CoreError::Timeout => "What happened: The analog front-end did not deliver a sample in time.\nLikely causes: Sensor unplugged, ADC not powered, or sampling.sensor_timeout_ms too low.\nHow to fix: Reseat the sensor and cartridge, then raise sampling.sensor_timeout_ms if needed.".to_string(),
            CoreError::UnknownAnalyte(name) => format!(
                "What happened: unknown analyte '{name}'.\nLikely causes: Typo or an analyte this reader has no RAFE mode for.\nHow to fix: Use one of: {}.",
                biosense_core::rafe::known_analytes().collect::<Vec<_>>().join(", ")
            ),
            CoreError::State(msg) => format!(
                "What happened: Operation refused ({msg}).\nLikely causes: The device is locked or the pump is disabled/faulted.\nHow to fix: Check `biosense health` and clear the condition first."
            ),
            other => format!(
                "What happened: {other}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("calibration csv must have headers") {
        return "Invalid headers in calibration CSV. Expected 'raw_v,reference_v'.".to_string();
    }

    if lower.contains("read config") {
        return format!(
            "What happened: {msg}.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Pass --config <FILE> pointing at a readable TOML file."
        );
    }

    if lower.contains("parse config") || lower.contains("must be") {
        return format!(
            "What happened: Configuration is invalid ({}).\nLikely causes: Missing [device] section or out-of-range values.\nHow to fix: Edit the TOML config and try again.",
            err.root_cause()
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable reason name for structured output.
pub fn reason_name(err: &eyre::Report) -> &'static str {
    use biosense_core::error::{BuildError, CoreError};
    if err.downcast_ref::<BuildError>().is_some() {
        return "BuildError";
    }
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::Timeout) => "Timeout",
        Some(CoreError::UnknownAnalyte(_)) => "UnknownAnalyte",
        Some(CoreError::State(_)) => "State",
        Some(CoreError::Hardware(_) | CoreError::HardwareFault(_)) => "Hardware",
        Some(CoreError::Config(_)) => "Config",
        None => "Error",
    }
}

/// Timeouts get their own exit code; everything else is 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    use biosense_core::error::CoreError;
    match err.downcast_ref::<CoreError>() {
        Some(CoreError::Timeout) => 6,
        _ => 1,
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;
    json!({ "reason": reason_name(err), "message": humanize(err) }).to_string()
}
