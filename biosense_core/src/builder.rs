//! Type-state builder for `Orchestrator`.
//!
//! The builder enforces at compile time that the probe, front-end and pump are
//! provided before `build()` is available. `try_build()` is always available
//! for dynamic checks and also validates collaborators and configuration.

use std::marker::PhantomData;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use biosense_traits::{AnalogFrontEnd, Clock, EhdPump, ImpedanceProbe, MonotonicClock};

use crate::calibration::KalmanState;
use crate::collaborators::{CartridgeAuthority, ConsentAuthority, DeepAnalysisSink, RemoteAnalyzer};
use crate::config::{
    AnomalyCfg, ClassifierCfg, EhdCfg, FilterCfg, SafetyCfg, SamplingCfg, StabilizationCfg,
};
use crate::ehd::EhdPolicy;
use crate::error::{BuildError, Result};
use crate::events::{EventSink, NullSink};
use crate::failsafe::FailSafeManager;
use crate::orchestrator::{HoldCancel, Orchestrator, SessionStats};
use crate::rafe::{RafeController, mode_for_analyte};

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

#[derive(Default)]
struct Parts {
    device_id: Option<String>,
    user_id: Option<String>,
    default_analyte: Option<String>,
    classifier: Option<ClassifierCfg>,
    ehd: Option<EhdCfg>,
    sampling: Option<SamplingCfg>,
    filter: Option<FilterCfg>,
    anomaly: Option<AnomalyCfg>,
    safety: Option<SafetyCfg>,
    stabilization: Option<StabilizationCfg>,
    cartridges: Option<Arc<dyn CartridgeAuthority>>,
    consent: Option<Arc<dyn ConsentAuthority>>,
    remote: Option<Arc<dyn RemoteAnalyzer>>,
    archive: Option<Arc<dyn DeepAnalysisSink>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    hold_cancel: Option<HoldCancel>,
}

/// Builder for `Orchestrator`. Type parameters track probe, front-end, pump.
pub struct OrchestratorBuilder<P, F, E> {
    probe: Option<Box<dyn ImpedanceProbe + Send>>,
    front_end: Option<Box<dyn AnalogFrontEnd + Send>>,
    pump: Option<Box<dyn EhdPump + Send>>,
    parts: Parts,
    _p: PhantomData<P>,
    _f: PhantomData<F>,
    _e: PhantomData<E>,
}

impl Default for OrchestratorBuilder<Missing, Missing, Missing> {
    fn default() -> Self {
        Self {
            probe: None,
            front_end: None,
            pump: None,
            parts: Parts::default(),
            _p: PhantomData,
            _f: PhantomData,
            _e: PhantomData,
        }
    }
}

impl Orchestrator {
    /// Start building an Orchestrator.
    pub fn builder() -> OrchestratorBuilder<Missing, Missing, Missing> {
        OrchestratorBuilder::default()
    }
}

fn invalid(msg: &'static str) -> eyre::Report {
    eyre::Report::new(BuildError::InvalidConfig(msg))
}

/// Validate configuration and construct the orchestrator.
fn validate_and_build(
    probe: Box<dyn ImpedanceProbe + Send>,
    front_end: Box<dyn AnalogFrontEnd + Send>,
    pump: Box<dyn EhdPump + Send>,
    parts: Parts,
) -> Result<Orchestrator> {
    let cartridges = parts
        .cartridges
        .ok_or_else(|| eyre::Report::new(BuildError::MissingCartridgeAuthority))?;
    let consent = parts
        .consent
        .ok_or_else(|| eyre::Report::new(BuildError::MissingConsentAuthority))?;

    let device_id = parts.device_id.unwrap_or_else(|| "biosense-dev".to_string());
    if device_id.trim().is_empty() {
        return Err(invalid("device id must not be empty"));
    }
    let default_analyte = parts.default_analyte.unwrap_or_else(|| "glucose".to_string());
    if mode_for_analyte(&default_analyte).is_none() {
        return Err(invalid("unknown default analyte"));
    }

    let sampling = parts.sampling.unwrap_or_default();
    if sampling.burst_len == 0 {
        return Err(invalid("burst_len must be >= 1"));
    }
    if sampling.sample_rate_hz == 0 {
        return Err(invalid("sample_rate_hz must be > 0"));
    }
    if sampling.sensor_timeout_ms == 0 {
        return Err(invalid("sensor_timeout_ms must be >= 1"));
    }

    let filter = parts.filter.unwrap_or_default();
    if !(filter.r.is_finite() && filter.r > 0.0) {
        return Err(invalid("measurement noise r must be > 0"));
    }
    if !(filter.q.is_finite() && filter.q >= 0.0) {
        return Err(invalid("process noise q must be >= 0"));
    }

    let ehd = parts.ehd.unwrap_or_default();
    if ehd.low_duty_pct > 100 || ehd.med_duty_pct > 100 || ehd.high_duty_pct > 100 {
        return Err(invalid("pump duty must be <= 100"));
    }

    let safety = parts.safety.unwrap_or_default();
    if !(safety.max_temperature_c.is_finite() && safety.max_channel_voltage > 0.0) {
        return Err(invalid("safety thresholds must be finite and positive"));
    }

    let stabilization = parts.stabilization.unwrap_or_default();
    if stabilization.poll_ms == 0 {
        return Err(invalid("stabilization poll_ms must be >= 1"));
    }

    let clock: Arc<dyn Clock + Send + Sync> = match parts.clock {
        Some(c) => c,
        None => Arc::new(MonotonicClock::new()),
    };
    let epoch = clock.now();

    let rafe = RafeController::new(&default_analyte, Arc::clone(&clock))?;
    let ehd = EhdPolicy::new(ehd, Arc::clone(&clock));

    tracing::debug!(device_id = %device_id, analyte = %default_analyte, "orchestrator built");

    Ok(Orchestrator {
        device_id,
        user_id: parts.user_id.unwrap_or_else(|| "local".to_string()),
        probe: Mutex::new(probe),
        front_end: Mutex::new(front_end),
        pump: Mutex::new(pump),
        rafe,
        ehd,
        failsafe: Arc::new(FailSafeManager::new(safety)),
        kalman: Mutex::new(KalmanState::default()),
        cartridges,
        consent,
        remote: parts.remote,
        archive: parts.archive,
        events: parts.events.unwrap_or_else(|| Arc::new(NullSink)),
        clock,
        epoch,
        classifier: parts.classifier.unwrap_or_default(),
        sampling,
        filter,
        anomaly: parts.anomaly.unwrap_or_default(),
        stabilization,
        busy: AtomicBool::new(false),
        hold_cancel: parts.hold_cancel.unwrap_or_default(),
        stats: Mutex::new(SessionStats::default()),
    })
}

impl<P, F, E> OrchestratorBuilder<P, F, E> {
    /// Fallible build available in any type-state; returns detailed error for missing pieces.
    pub fn try_build(self) -> Result<Orchestrator> {
        let probe = self
            .probe
            .ok_or_else(|| eyre::Report::new(BuildError::MissingProbe))?;
        let front_end = self
            .front_end
            .ok_or_else(|| eyre::Report::new(BuildError::MissingFrontEnd))?;
        let pump = self
            .pump
            .ok_or_else(|| eyre::Report::new(BuildError::MissingPump))?;
        validate_and_build(probe, front_end, pump, self.parts)
    }
}

impl OrchestratorBuilder<Set, Set, Set> {
    pub fn build(self) -> Result<Orchestrator> {
        self.try_build()
    }
}

/// Chainable setters that do not affect type-state.
impl<P, F, E> OrchestratorBuilder<P, F, E> {
    pub fn with_device_id(mut self, id: impl Into<String>) -> Self {
        self.parts.device_id = Some(id.into());
        self
    }
    /// User whose research consent is consulted each cycle.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.parts.user_id = Some(user.into());
        self
    }
    pub fn with_default_analyte(mut self, analyte: impl Into<String>) -> Self {
        self.parts.default_analyte = Some(analyte.into());
        self
    }
    pub fn with_classifier(mut self, cfg: ClassifierCfg) -> Self {
        self.parts.classifier = Some(cfg);
        self
    }
    pub fn with_ehd(mut self, cfg: EhdCfg) -> Self {
        self.parts.ehd = Some(cfg);
        self
    }
    pub fn with_sampling(mut self, cfg: SamplingCfg) -> Self {
        self.parts.sampling = Some(cfg);
        self
    }
    pub fn with_filter(mut self, cfg: FilterCfg) -> Self {
        self.parts.filter = Some(cfg);
        self
    }
    pub fn with_anomaly(mut self, cfg: AnomalyCfg) -> Self {
        self.parts.anomaly = Some(cfg);
        self
    }
    pub fn with_safety(mut self, cfg: SafetyCfg) -> Self {
        self.parts.safety = Some(cfg);
        self
    }
    pub fn with_stabilization(mut self, cfg: StabilizationCfg) -> Self {
        self.parts.stabilization = Some(cfg);
        self
    }
    pub fn with_cartridge_authority(mut self, a: impl CartridgeAuthority + 'static) -> Self {
        self.parts.cartridges = Some(Arc::new(a));
        self
    }
    pub fn with_consent_authority(mut self, a: impl ConsentAuthority + 'static) -> Self {
        self.parts.consent = Some(Arc::new(a));
        self
    }
    pub fn with_remote_analyzer(mut self, r: impl RemoteAnalyzer + 'static) -> Self {
        self.parts.remote = Some(Arc::new(r));
        self
    }
    pub fn with_deep_analysis_sink(mut self, s: impl DeepAnalysisSink + 'static) -> Self {
        self.parts.archive = Some(Arc::new(s));
        self
    }
    pub fn with_event_sink(mut self, s: impl EventSink + 'static) -> Self {
        self.parts.events = Some(Arc::new(s));
        self
    }
    /// Provide a custom clock implementation; defaults to `MonotonicClock` when not provided.
    pub fn with_clock(mut self, clock: impl Clock + Send + Sync + 'static) -> Self {
        self.parts.clock = Some(Arc::new(clock));
        self
    }
    /// Share a cancel handle created before the orchestrator (e.g. for a signal handler).
    pub fn with_hold_cancel(mut self, cancel: HoldCancel) -> Self {
        self.parts.hold_cancel = Some(cancel);
        self
    }
}

// Setters that advance type-state
impl<F, E> OrchestratorBuilder<Missing, F, E> {
    pub fn with_probe(
        self,
        probe: impl ImpedanceProbe + Send + 'static,
    ) -> OrchestratorBuilder<Set, F, E> {
        OrchestratorBuilder {
            probe: Some(Box::new(probe)),
            front_end: self.front_end,
            pump: self.pump,
            parts: self.parts,
            _p: PhantomData,
            _f: PhantomData,
            _e: PhantomData,
        }
    }
}

impl<P, E> OrchestratorBuilder<P, Missing, E> {
    pub fn with_front_end(
        self,
        front_end: impl AnalogFrontEnd + Send + 'static,
    ) -> OrchestratorBuilder<P, Set, E> {
        OrchestratorBuilder {
            probe: self.probe,
            front_end: Some(Box::new(front_end)),
            pump: self.pump,
            parts: self.parts,
            _p: PhantomData,
            _f: PhantomData,
            _e: PhantomData,
        }
    }
}

impl<P, F> OrchestratorBuilder<P, F, Missing> {
    pub fn with_pump(self, pump: impl EhdPump + Send + 'static) -> OrchestratorBuilder<P, F, Set> {
        OrchestratorBuilder {
            probe: self.probe,
            front_end: self.front_end,
            pump: Some(Box::new(pump)),
            parts: self.parts,
            _p: PhantomData,
            _f: PhantomData,
            _e: PhantomData,
        }
    }
}
