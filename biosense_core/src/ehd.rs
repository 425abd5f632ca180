//! EHD suction policy.
//!
//! Maps contact medium or analyte class to a suction level and applies it to
//! the pump, but only after three gates pass, in order:
//!
//! 1. automatic control is enabled,
//! 2. no manual override was recorded inside the override window,
//! 3. the pump is enabled and reports no fault.
//!
//! A failed gate yields `SuctionDecision::Skipped` and is logged.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use biosense_traits::{Clock, EhdPump};
use serde::Serialize;

use crate::classifier::ContactMedium;
use crate::config::EhdCfg;
use crate::error::{CoreError, Result};
use crate::hw_error::to_report;
use crate::rafe::RafeMode;
use crate::util::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuctionLevel {
    Low,
    Med,
    High,
}

impl SuctionLevel {
    pub fn duty_pct(self, cfg: &EhdCfg) -> u8 {
        match self {
            SuctionLevel::Low => cfg.low_duty_pct,
            SuctionLevel::Med => cfg.med_duty_pct,
            SuctionLevel::High => cfg.high_duty_pct,
        }
    }
}

impl std::fmt::Display for SuctionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SuctionLevel::Low => "low",
            SuctionLevel::Med => "med",
            SuctionLevel::High => "high",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EhdFault {
    #[default]
    None,
    Overcurrent,
    Clogged,
    /// The pump driver rejected a command.
    Driver(String),
}

impl std::fmt::Display for EhdFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EhdFault::None => f.write_str("none"),
            EhdFault::Overcurrent => f.write_str("overcurrent"),
            EhdFault::Clogged => f.write_str("clogged"),
            EhdFault::Driver(msg) => write!(f, "driver: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EhdState {
    pub level: SuctionLevel,
    pub auto_control_enabled: bool,
    pub fault: EhdFault,
    pub enabled: bool,
    pub last_manual_override_at: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    AutoControlDisabled,
    ManualOverrideActive { remaining_ms: u64 },
    PumpDisabled,
    PumpFault { fault: EhdFault },
    /// A manual override happened during the stabilization hold.
    RestoreAbandoned,
    /// The pump rejected the duty command; the level was not changed.
    PumpError { message: String },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AutoControlDisabled => f.write_str("automatic control disabled"),
            SkipReason::ManualOverrideActive { remaining_ms } => {
                write!(f, "manual override active ({remaining_ms} ms remaining)")
            }
            SkipReason::PumpDisabled => f.write_str("pump disabled"),
            SkipReason::PumpFault { fault } => write!(f, "pump fault: {fault}"),
            SkipReason::RestoreAbandoned => {
                f.write_str("manual override after stabilization snapshot; restore abandoned")
            }
            SkipReason::PumpError { message } => write!(f, "pump error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuctionDecision {
    Changed { from: SuctionLevel, to: SuctionLevel },
    Unchanged(SuctionLevel),
    Skipped(SkipReason),
}

/// Level for a classified medium. `Unknown` gives no opinion.
pub fn level_for_medium(medium: ContactMedium) -> Option<SuctionLevel> {
    match medium {
        ContactMedium::OpenAir => Some(SuctionLevel::High),
        ContactMedium::LiquidImmersion => Some(SuctionLevel::Low),
        ContactMedium::SolidHydrogel => Some(SuctionLevel::Med),
        ContactMedium::Unknown => None,
    }
}

/// Level for an analyte class when there is no medium signal.
pub fn level_for_mode(mode: RafeMode) -> Option<SuctionLevel> {
    match mode {
        RafeMode::GasHighImpedance => Some(SuctionLevel::High),
        RafeMode::LiquidEc | RafeMode::Potentiometric => Some(SuctionLevel::Low),
        RafeMode::SolidEis => None,
    }
}

#[derive(Debug)]
struct Inner {
    state: EhdState,
    // Pump has been driven to `state.level` at least once.
    applied: bool,
    snapshot: Option<(SuctionLevel, Instant)>,
}

/// Suction policy for one pump. Methods take the pump explicitly so the
/// orchestrator controls the hardware lock.
pub struct EhdPolicy {
    inner: Mutex<Inner>,
    cfg: EhdCfg,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl std::fmt::Debug for EhdPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EhdPolicy")
            .field("state", &lock(&self.inner).state)
            .field("cfg", &self.cfg)
            .finish()
    }
}

impl EhdPolicy {
    pub fn new(cfg: EhdCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: EhdState {
                    level: SuctionLevel::Low,
                    auto_control_enabled: cfg.auto_control,
                    fault: EhdFault::None,
                    enabled: true,
                    last_manual_override_at: None,
                },
                applied: false,
                snapshot: None,
            }),
            cfg,
            clock,
        }
    }

    pub fn state(&self) -> EhdState {
        lock(&self.inner).state.clone()
    }

    pub fn cfg(&self) -> &EhdCfg {
        &self.cfg
    }

    /// Whether a manual override still suppresses automatic changes.
    pub fn override_active(&self) -> bool {
        let inner = lock(&self.inner);
        self.override_remaining_ms(&inner.state).is_some()
    }

    fn override_remaining_ms(&self, st: &EhdState) -> Option<u64> {
        let at = st.last_manual_override_at?;
        let elapsed = self.clock.ms_since(at);
        (elapsed < self.cfg.manual_override_window_ms)
            .then(|| self.cfg.manual_override_window_ms - elapsed)
    }

    fn gate(&self, st: &EhdState) -> std::result::Result<(), SkipReason> {
        if !st.auto_control_enabled {
            return Err(SkipReason::AutoControlDisabled);
        }
        if let Some(remaining_ms) = self.override_remaining_ms(st) {
            return Err(SkipReason::ManualOverrideActive { remaining_ms });
        }
        if !st.enabled {
            return Err(SkipReason::PumpDisabled);
        }
        if st.fault != EhdFault::None {
            return Err(SkipReason::PumpFault {
                fault: st.fault.clone(),
            });
        }
        Ok(())
    }

    /// Gate, then drive the pump to `target` and commit the level.
    pub fn apply_automatic(&self, target: SuctionLevel, pump: &mut dyn EhdPump) -> SuctionDecision {
        let mut inner = lock(&self.inner);
        self.apply_gated(&mut inner, target, pump)
    }

    fn apply_gated(&self, inner: &mut Inner, target: SuctionLevel, pump: &mut dyn EhdPump) -> SuctionDecision {
        if let Err(reason) = self.gate(&inner.state) {
            tracing::info!(%target, current = %inner.state.level, %reason, "suction change skipped");
            return SuctionDecision::Skipped(reason);
        }
        let from = inner.state.level;
        if from == target && inner.applied {
            return SuctionDecision::Unchanged(from);
        }
        if let Err(e) = pump.set_duty(target.duty_pct(&self.cfg)) {
            let message = e.to_string();
            tracing::warn!(%target, error = %message, "pump rejected duty; marking fault");
            inner.state.fault = EhdFault::Driver(message.clone());
            return SuctionDecision::Skipped(SkipReason::PumpError { message });
        }
        inner.state.level = target;
        inner.applied = true;
        if from == target {
            return SuctionDecision::Unchanged(target);
        }
        tracing::info!(%from, to = %target, "suction level changed");
        SuctionDecision::Changed { from, to: target }
    }

    /// Snapshot the current level and move to `Med` for a solid-contact hold.
    pub fn begin_stabilization(&self, pump: &mut dyn EhdPump) -> SuctionDecision {
        let mut inner = lock(&self.inner);
        let now = self.clock.now();
        inner.snapshot = Some((inner.state.level, now));
        tracing::debug!(snapshot = %inner.state.level, "stabilization snapshot taken");
        self.apply_gated(&mut inner, SuctionLevel::Med, pump)
    }

    /// Restore the pre-hold level under the same gates. Abandoned when a
    /// manual override was recorded at or after the snapshot.
    pub fn end_stabilization(&self, pump: &mut dyn EhdPump) -> SuctionDecision {
        let mut inner = lock(&self.inner);
        let Some((level, taken_at)) = inner.snapshot.take() else {
            return SuctionDecision::Unchanged(inner.state.level);
        };
        if let Err(reason) = self.gate(&inner.state) {
            tracing::info!(restore = %level, %reason, "stabilization restore skipped");
            return SuctionDecision::Skipped(reason);
        }
        if inner
            .state
            .last_manual_override_at
            .is_some_and(|at| at >= taken_at)
        {
            tracing::info!(restore = %level, "stabilization restore abandoned: manual override wins");
            return SuctionDecision::Skipped(SkipReason::RestoreAbandoned);
        }
        self.apply_gated(&mut inner, level, pump)
    }

    /// Human-driven level change. Bypasses the automatic gates but still
    /// requires an enabled, fault-free pump; records the override time.
    pub fn set_manual_level(&self, level: SuctionLevel, pump: &mut dyn EhdPump) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !inner.state.enabled {
            return Err(eyre::Report::new(CoreError::State("EHD pump disabled".into())));
        }
        if inner.state.fault != EhdFault::None {
            return Err(eyre::Report::new(CoreError::State(format!(
                "EHD pump fault: {}",
                inner.state.fault
            ))));
        }
        pump.set_duty(level.duty_pct(&self.cfg)).map_err(to_report)?;
        let from = inner.state.level;
        inner.state.level = level;
        inner.state.last_manual_override_at = Some(self.clock.now());
        inner.applied = true;
        tracing::info!(%from, to = %level, "manual suction override");
        Ok(())
    }

    pub fn set_auto_control(&self, enabled: bool) {
        lock(&self.inner).state.auto_control_enabled = enabled;
        tracing::info!(enabled, "EHD automatic control toggled");
    }

    /// Enable or disable the pump; disabling stops it.
    pub fn set_enabled(&self, enabled: bool, pump: &mut dyn EhdPump) -> Result<()> {
        let mut inner = lock(&self.inner);
        if !enabled {
            pump.stop().map_err(to_report)?;
            inner.applied = false;
        }
        inner.state.enabled = enabled;
        tracing::info!(enabled, "EHD pump enable toggled");
        Ok(())
    }

    pub fn report_fault(&self, fault: EhdFault) {
        tracing::warn!(%fault, "EHD fault reported");
        lock(&self.inner).state.fault = fault;
    }

    pub fn clear_fault(&self) {
        let mut inner = lock(&self.inner);
        if inner.state.fault != EhdFault::None {
            tracing::info!(previous = %inner.state.fault, "EHD fault cleared");
        }
        inner.state.fault = EhdFault::None;
        inner.applied = false;
    }

    /// Emergency stop used by the fail-safe path. Best-effort.
    pub(crate) fn halt(&self, pump: &mut dyn EhdPump) {
        let mut inner = lock(&self.inner);
        inner.applied = false;
        inner.snapshot = None;
        if let Err(e) = pump.stop() {
            tracing::error!(error = %e, "pump stop failed during fail-safe halt");
        }
    }
}
