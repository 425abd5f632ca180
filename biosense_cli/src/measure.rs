//! Session assembly from config and the measure/classify commands.

use biosense_config::{Calibration, Config};
use biosense_core::error::Result as CoreResult;
use biosense_core::mocks::{FixedConsent, StaticCartridge};
use biosense_core::{
    Cartridge, HoldCancel, Measurement, MeasurementOutcome, Orchestrator, StabilizationCfg,
};
use biosense_hardware::{SimulatedFrontEnd, SimulatedProbe, SimulatedPump};

/// Simulated board, tunable through `BIOSENSE_SIM_*` environment variables.
pub struct SimBoard {
    pub probe: SimulatedProbe,
    pub front_end: SimulatedFrontEnd,
    pub pump: SimulatedPump,
}

fn env_f32(key: &str, default: f32) -> eyre::Result<f32> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<f32>()
            .map_err(|e| eyre::eyre!("{key} must be a number, got {v:?}: {e}")),
        Err(_) => Ok(default),
    }
}

pub fn sim_board() -> eyre::Result<SimBoard> {
    let probe = if std::env::var("BIOSENSE_SIM_PROBE").is_ok_and(|v| v == "disconnected") {
        SimulatedProbe::disconnected()
    } else {
        SimulatedProbe::new(
            env_f32("BIOSENSE_SIM_OHMS", 50.0)?,
            env_f32("BIOSENSE_SIM_PHASE_DEG", -45.0)?,
        )
    };
    let front_end = SimulatedFrontEnd::new(
        env_f32("BIOSENSE_SIM_A_V", 0.4)?,
        env_f32("BIOSENSE_SIM_B_V", 0.1)?,
        env_f32("BIOSENSE_SIM_TEMP_C", 25.0)?,
    )
    .with_ripple(env_f32("BIOSENSE_SIM_RIPPLE_V", 0.004)?)
    .with_temperature_step(env_f32("BIOSENSE_SIM_TEMP_STEP_C", 0.0)?);
    Ok(SimBoard {
        probe,
        front_end,
        pump: SimulatedPump::new(),
    })
}

/// Build the orchestrator for one CLI session.
pub fn build_session(
    cfg: &Config,
    calib: Option<&Calibration>,
    board: SimBoard,
    cancel: HoldCancel,
    hold_ms_override: Option<u64>,
) -> CoreResult<Orchestrator> {
    let mut stabilization: StabilizationCfg = (&cfg.stabilization).into();
    if let Some(ms) = hold_ms_override {
        stabilization.hold_ms = ms;
    }

    let cartridges = match &cfg.cartridge {
        Some(c) => {
            let mut cartridge = Cartridge::from(c);
            if let Some(fit) = calib {
                tracing::info!(
                    offset_v = fit.offset_v,
                    gain = fit.gain,
                    inliers = fit.inliers,
                    "cartridge calibration overridden from CSV"
                );
                cartridge.calibration = cartridge.calibration.with_fit(fit);
            }
            StaticCartridge::new(cartridge)
        }
        None => StaticCartridge::empty(),
    };
    let consent = if cfg.consent.research {
        FixedConsent::allow()
    } else {
        FixedConsent::deny()
    };

    Orchestrator::builder()
        .with_device_id(cfg.device.id.clone())
        .with_default_analyte(cfg.device.default_analyte.clone())
        .with_probe(board.probe)
        .with_front_end(board.front_end)
        .with_pump(board.pump)
        .with_classifier((&cfg.classifier).into())
        .with_ehd((&cfg.ehd).into())
        .with_sampling((&cfg.sampling).into())
        .with_filter((&cfg.filter).into())
        .with_anomaly((&cfg.anomaly).into())
        .with_safety((&cfg.safety).into())
        .with_stabilization(stabilization)
        .with_cartridge_authority(cartridges)
        .with_consent_authority(consent)
        .with_hold_cancel(cancel)
        .build()
}

/// Run up to `count` cycles, stopping at the first outcome that is not a
/// completed measurement.
pub fn run_measure(
    orch: &Orchestrator,
    analyte: Option<&str>,
    count: u32,
) -> CoreResult<Vec<MeasurementOutcome>> {
    let mut outcomes = Vec::new();
    for cycle in 0..count.max(1) {
        let outcome = match analyte {
            Some(a) => orch.measure_analyte(a)?,
            None => orch.measure()?,
        };
        tracing::debug!(cycle, outcome = outcome.label(), "cycle finished");
        let done = !matches!(outcome, MeasurementOutcome::Completed { .. });
        outcomes.push(outcome);
        if done {
            break;
        }
    }
    Ok(outcomes)
}

/// Stable exit codes for typed outcomes.
pub fn exit_code_for_outcome(outcome: &MeasurementOutcome) -> i32 {
    match outcome {
        MeasurementOutcome::Completed { .. } => 0,
        MeasurementOutcome::Blocked { .. } => 3,
        MeasurementOutcome::FailSafeTripped { .. } => 4,
        MeasurementOutcome::Busy => 5,
    }
}

fn describe(m: &Measurement) -> String {
    let mut line = format!(
        "measurement completed: {} {:.2} (±{:.1}%) medium={} mode={} T={:.1}°C",
        m.analyte(),
        m.concentration(),
        m.uncertainty_pct(),
        m.medium(),
        m.mode(),
        m.temperature_c()
    );
    if let Some(a) = m.anomaly() {
        line.push_str(&format!(" anomaly: {a}"));
    }
    for adv in m.advisories() {
        let name = serde_json::to_value(adv)
            .ok()
            .and_then(|v| v["kind"].as_str().map(str::to_string))
            .unwrap_or_default();
        line.push_str(&format!(" [{name}]"));
    }
    line
}

/// One human-readable line per outcome.
pub fn outcome_line(outcome: &MeasurementOutcome) -> String {
    match outcome {
        MeasurementOutcome::Completed { measurement } => describe(measurement),
        MeasurementOutcome::Blocked { reason } => format!("measurement blocked: {reason}"),
        MeasurementOutcome::FailSafeTripped { reason } => {
            format!("fail-safe tripped: {reason}; support must clear the lock")
        }
        MeasurementOutcome::Busy => "measurement busy: a cycle is already running".to_string(),
    }
}
