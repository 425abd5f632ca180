//! Measurement orchestrator: one atomic "take a measurement" operation.
//!
//! Cycle order: busy check → fail-safe guard → cartridge → consent →
//! classify → optional stabilization hold → RAFE select/route → EHD target →
//! sample burst → filter on a copy → fail-safe evaluation → commit filter →
//! calibrate → optional remote analysis → record usage → archive → emit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use biosense_traits::{AnalogFrontEnd, Clock, EhdPump, ImpedanceProbe};
use eyre::WrapErr;
use serde::Serialize;
use uuid::Uuid;

use crate::calibration::{
    KalmanState, PrecisionTier, apply_calibration, concentration_from_voltage, detect_anomaly,
    filter_burst, raw_concentration,
};
use crate::classifier::{Classification, ContactMedium, probe_and_classify};
use crate::collaborators::{
    ArtifactRef, Cartridge, CartridgeAuthority, ConsentAuthority, ConsentScope, DeepAnalysisBundle,
    DeepAnalysisSink, Environment, RafeConfiguration, RemoteAnalysis, RemoteAnalysisRequest,
    RemoteAnalyzer, device_signature,
};
use crate::config::{AnomalyCfg, ClassifierCfg, FilterCfg, SamplingCfg, StabilizationCfg};
use crate::ehd::{EhdFault, EhdPolicy, EhdState, SuctionDecision, SuctionLevel, level_for_medium, level_for_mode};
use crate::error::{CoreError, Result};
use crate::events::{ControlEvent, EventSink};
use crate::failsafe::{FailSafeLock, FailSafeManager, SupportAccess, Telemetry};
use crate::hw_error::to_report;
use crate::rafe::{PinAssignment, RafeController, RafeMode, mode_for_analyte};
use crate::status::{
    Advisory, BlockReason, Measurement, MeasurementOutcome, MeasurementParts, MeasurementSource,
    RawSample,
};
use crate::util::{lock, period_ms};

/// RAFE lock reason used for the solid-contact hold.
pub const STABILIZE_REASON: &str = "stabilize";

/// Handle that ends a running stabilization hold early (user dismiss).
///
/// Cleared at the start of every cycle, so a cancel only affects the hold
/// of the cycle in flight.
#[derive(Debug, Clone, Default)]
pub struct HoldCancel(Arc<AtomicBool>);

impl HoldCancel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Releases the busy flag when the cycle ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub cycles: u64,
    pub completed: u64,
    pub blocked: u64,
    pub fail_safe_trips: u64,
    pub fallbacks: u64,
    pub busy_rejections: u64,
}

/// Health snapshot of the session for status displays.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub device_id: String,
    pub fail_safe: FailSafeLock,
    pub analyte: String,
    pub mode: RafeMode,
    pub pins: Vec<PinAssignment>,
    pub mode_lock_reason: Option<String>,
    pub suction: SuctionLevel,
    pub auto_control_enabled: bool,
    pub pump_enabled: bool,
    pub pump_fault: EhdFault,
    pub manual_override_active: bool,
    pub kalman: KalmanState,
    pub stats: SessionStats,
}

/// Sequences classifier, RAFE, EHD, filter and fail-safe for one device
/// session. All methods take `&self`; at most one cycle runs at a time.
pub struct Orchestrator {
    pub(crate) device_id: String,
    pub(crate) user_id: String,
    pub(crate) probe: Mutex<Box<dyn ImpedanceProbe + Send>>,
    pub(crate) front_end: Mutex<Box<dyn AnalogFrontEnd + Send>>,
    pub(crate) pump: Mutex<Box<dyn EhdPump + Send>>,
    pub(crate) rafe: RafeController,
    pub(crate) ehd: EhdPolicy,
    pub(crate) failsafe: Arc<FailSafeManager>,
    pub(crate) kalman: Mutex<KalmanState>,
    pub(crate) cartridges: Arc<dyn CartridgeAuthority>,
    pub(crate) consent: Arc<dyn ConsentAuthority>,
    pub(crate) remote: Option<Arc<dyn RemoteAnalyzer>>,
    pub(crate) archive: Option<Arc<dyn DeepAnalysisSink>>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) epoch: Instant,
    pub(crate) classifier: ClassifierCfg,
    pub(crate) sampling: SamplingCfg,
    pub(crate) filter: FilterCfg,
    pub(crate) anomaly: AnomalyCfg,
    pub(crate) stabilization: StabilizationCfg,
    pub(crate) busy: AtomicBool,
    pub(crate) hold_cancel: HoldCancel,
    pub(crate) stats: Mutex<SessionStats>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("device_id", &self.device_id)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .field("fail_safe", &self.failsafe.snapshot())
            .field("kalman", &*lock(&self.kalman))
            .finish()
    }
}

impl Orchestrator {
    /// Measure the analyte the RAFE currently targets.
    pub fn measure(&self) -> Result<MeasurementOutcome> {
        let analyte = self.rafe.get_state().target_analyte;
        self.measure_analyte(&analyte)
    }

    /// Run one full cycle for `analyte`.
    ///
    /// Typed outcomes cover refusals and trips; `Err` is reserved for
    /// hardware I/O failures and unknown analyte names.
    ///
    /// Unlike `RafeController::select_target_analyte`, an unknown name is
    /// rejected here whether or not the RAFE mode is locked, before any
    /// hardware is touched.
    pub fn measure_analyte(&self, analyte: &str) -> Result<MeasurementOutcome> {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            tracing::warn!("measurement rejected: cycle already in flight");
            lock(&self.stats).busy_rejections += 1;
            return Ok(MeasurementOutcome::Busy);
        };
        lock(&self.stats).cycles += 1;
        self.hold_cancel.reset();

        if let Some(reason) = self.failsafe.guard() {
            return Ok(self.blocked(BlockReason::FailSafeLocked { reason }));
        }
        let cartridge = match self.cartridges.active() {
            None => return Ok(self.blocked(BlockReason::NoCartridge)),
            Some(c) if c.uses_remaining == 0 => {
                return Ok(self.blocked(BlockReason::CartridgeExpended { cartridge_id: c.id }));
            }
            Some(c) => c,
        };
        if mode_for_analyte(analyte).is_none() {
            return Err(eyre::Report::new(CoreError::UnknownAnalyte(analyte.to_string())));
        }

        let mut advisories = Vec::new();
        let research = self.consent.is_granted(&self.user_id, ConsentScope::Research);
        if !research {
            tracing::info!(user = %self.user_id, "research consent not granted; local-only cycle");
            advisories.push(Advisory::ConsentBlocked);
        }
        if cartridge.calibration.tier == PrecisionTier::Low {
            advisories.push(Advisory::LowPrecisionTier);
        }
        if cartridge.calibration.offline_fallback {
            advisories.push(Advisory::OfflineCalibration);
        }

        let classification = self.classify_with(cartridge.calibration.gel_baseline_ohms);
        if classification.is_uncertain() {
            advisories.push(Advisory::ClassificationUncertain {
                reason: classification.reason.clone(),
            });
        }
        if classification.medium == ContactMedium::SolidHydrogel {
            self.stabilize(&mut advisories);
        }

        let rafe_state = self.select_and_route(analyte, &mut advisories)?;

        // Hydrogel keeps the level restored after the hold.
        let target = match classification.medium {
            ContactMedium::SolidHydrogel => None,
            ContactMedium::Unknown => level_for_mode(rafe_state.mode),
            m => level_for_medium(m),
        };
        if let Some(t) = target {
            let decision = {
                let mut pump = lock(&self.pump);
                self.ehd.apply_automatic(t, &mut **pump)
            };
            self.record_suction(t, decision, &mut advisories);
        }

        let burst = self.sample_burst()?;
        let prior = *lock(&self.kalman);
        let diffs: Vec<f32> = burst.iter().map(RawSample::differential_v).collect();
        let posterior = filter_burst(&diffs, prior, self.filter.q, self.filter.r);

        if let Some(reason) = self.failsafe.evaluate(&Telemetry::from_burst(&burst)) {
            {
                let mut pump = lock(&self.pump);
                self.ehd.halt(&mut **pump);
            }
            self.events.emit(ControlEvent::FailSafeTripped {
                reason: reason.clone(),
            });
            lock(&self.stats).fail_safe_trips += 1;
            return Ok(MeasurementOutcome::FailSafeTripped { reason });
        }
        *lock(&self.kalman) = posterior;

        let temperature_c = burst.iter().map(|s| s.temperature_c).sum::<f32>() / burst.len() as f32;
        let calibrated = apply_calibration(posterior.x, &cartridge.calibration, temperature_c);
        let concentration = concentration_from_voltage(calibrated.volts);
        let anomaly = detect_anomaly(
            temperature_c,
            raw_concentration(calibrated.volts),
            posterior.x,
            &self.anomaly,
        );
        if let Some(a) = &anomaly {
            tracing::warn!(anomaly = %a, "local sanity check flagged measurement");
        }
        let raw_pairs: Vec<(f32, f32)> = burst.iter().map(|s| (s.a_v, s.b_v)).collect();

        let (source, remote) =
            self.remote_analysis(research, &cartridge, &raw_pairs, temperature_c, &mut advisories);

        if let Err(e) = self.cartridges.record_usage(&cartridge.id) {
            tracing::warn!(cartridge = %cartridge.id, error = %e, "cartridge usage not recorded");
            advisories.push(Advisory::UsageNotRecorded {
                reason: e.to_string(),
            });
        }

        let id = Uuid::new_v4();
        let artifact = self.archive_bundle(
            DeepAnalysisBundle {
                measurement_id: id,
                concentration,
                recovered_voltage: calibrated.volts,
                raw_pairs,
                environment: Environment {
                    temperature_c,
                    humidity_pct: None,
                },
                calibration: cartridge.calibration.clone(),
                rafe: RafeConfiguration {
                    analyte: rafe_state.target_analyte.clone(),
                    mode: rafe_state.mode.to_string(),
                    pins: rafe_state.pins.clone(),
                },
                interpretation: remote.as_ref().and_then(|r| r.interpretation.clone()),
            },
            &mut advisories,
        );

        let measurement = Measurement::new(MeasurementParts {
            id,
            cartridge_id: cartridge.id,
            analyte: rafe_state.target_analyte,
            mode: rafe_state.mode,
            medium: classification.medium,
            concentration,
            calibrated_voltage: calibrated.volts,
            filtered_voltage: posterior.x,
            raw: burst,
            temperature_c,
            uncertainty_pct: calibrated.uncertainty_pct,
            anomaly,
            remote,
            source,
            advisories,
            artifact,
        });
        tracing::info!(
            id = %measurement.id(),
            concentration = measurement.concentration(),
            uncertainty_pct = measurement.uncertainty_pct(),
            source = ?measurement.source(),
            anomaly = measurement.is_anomalous(),
            "measurement complete"
        );
        self.events.emit(ControlEvent::MeasurementCompleted {
            id,
            concentration,
            source,
            anomaly: measurement.is_anomalous(),
        });
        lock(&self.stats).completed += 1;
        Ok(MeasurementOutcome::Completed {
            measurement: Box::new(measurement),
        })
    }

    fn blocked(&self, reason: BlockReason) -> MeasurementOutcome {
        tracing::warn!(reason = %reason, "measurement blocked");
        self.events.emit(ControlEvent::Blocked {
            reason: reason.to_string(),
        });
        lock(&self.stats).blocked += 1;
        MeasurementOutcome::Blocked { reason }
    }

    fn classify_with(&self, gel_baseline_ohms: Option<f32>) -> Classification {
        let classification = {
            let mut probe = lock(&self.probe);
            probe_and_classify(&mut **probe, &self.classifier, gel_baseline_ohms)
        };
        self.events.emit(ControlEvent::Classified {
            medium: classification.medium,
            reason: classification.reason.clone(),
        });
        classification
    }

    /// Probe and classify outside a cycle. Refused while the fail-safe lock is held.
    pub fn classify_now(&self) -> Result<Classification> {
        if let Some(reason) = self.failsafe.guard() {
            return Err(eyre::Report::new(CoreError::State(format!(
                "fail-safe locked: {reason}"
            ))));
        }
        let baseline = self
            .cartridges
            .active()
            .and_then(|c| c.calibration.gel_baseline_ohms);
        Ok(self.classify_with(baseline))
    }

    fn stabilize(&self, advisories: &mut Vec<Advisory>) {
        let hold_ms = self.stabilization.hold_ms;
        self.rafe.lock_mode(STABILIZE_REASON);
        let before = self.ehd.state().level;
        let decision = {
            let mut pump = lock(&self.pump);
            self.ehd.begin_stabilization(&mut **pump)
        };
        self.record_suction(SuctionLevel::Med, decision, advisories);
        self.events.emit(ControlEvent::StabilizationStarted { hold_ms });
        tracing::info!(hold_ms, "stabilization hold started");

        let start = self.clock.now();
        let poll = self.stabilization.poll_ms.max(1);
        let (held_ms, cancelled) = loop {
            let held = self.clock.ms_since(start);
            if self.hold_cancel.is_cancelled() {
                break (held, true);
            }
            if held >= hold_ms {
                break (held, false);
            }
            self.clock
                .sleep(Duration::from_millis(poll.min(hold_ms - held)));
        };

        let decision = {
            let mut pump = lock(&self.pump);
            self.ehd.end_stabilization(&mut **pump)
        };
        self.record_suction(before, decision, advisories);
        self.rafe.unlock_mode(STABILIZE_REASON);
        tracing::info!(held_ms, cancelled, "stabilization hold ended");
        self.events
            .emit(ControlEvent::StabilizationEnded { held_ms, cancelled });
        if cancelled {
            advisories.push(Advisory::StabilizationCancelled { held_ms });
        }
    }

    fn select_and_route(
        &self,
        analyte: &str,
        advisories: &mut Vec<Advisory>,
    ) -> Result<crate::rafe::RafeState> {
        let before = self.rafe.get_state();
        self.rafe.select_target_analyte(analyte)?;
        let state = self.rafe.get_state();
        let requested = analyte.trim().to_ascii_lowercase();
        if state.target_analyte != requested {
            let lock_reason = state
                .mode_lock
                .as_ref()
                .map(|l| l.reason.clone())
                .unwrap_or_default();
            self.events.emit(ControlEvent::ModeSwitchRejected {
                requested: requested.clone(),
                current: state.mode,
                lock_reason: lock_reason.clone(),
            });
            advisories.push(Advisory::ModeSwitchRejected {
                requested,
                lock_reason,
            });
        } else if state.target_analyte != before.target_analyte {
            self.events.emit(ControlEvent::ModeSwitched {
                analyte: state.target_analyte.clone(),
                mode: state.mode,
            });
        }
        lock(&self.front_end)
            .configure(state.mode.as_str(), &state.pin_numbers())
            .map_err(to_report)
            .wrap_err_with(|| format!("routing front-end for {}", state.mode))?;
        Ok(state)
    }

    fn record_suction(
        &self,
        target: SuctionLevel,
        decision: SuctionDecision,
        advisories: &mut Vec<Advisory>,
    ) {
        match decision {
            SuctionDecision::Changed { from, to } => {
                self.events.emit(ControlEvent::SuctionChanged { from, to });
            }
            SuctionDecision::Unchanged(_) => {}
            SuctionDecision::Skipped(reason) => {
                let reason = reason.to_string();
                self.events.emit(ControlEvent::SuctionSkipped {
                    target,
                    reason: reason.clone(),
                });
                advisories.push(Advisory::SuctionSkipped { reason });
            }
        }
    }

    fn sample_burst(&self) -> Result<Vec<RawSample>> {
        let n = self.sampling.burst_len;
        let timeout = Duration::from_millis(self.sampling.sensor_timeout_ms);
        let period = Duration::from_millis(period_ms(self.sampling.sample_rate_hz));
        let mut fe = lock(&self.front_end);
        let mut burst = Vec::with_capacity(n);
        for i in 0..n {
            if i > 0 {
                self.clock.sleep(period);
            }
            let s = fe
                .sample(timeout)
                .map_err(to_report)
                .wrap_err_with(|| format!("sampling {}/{}", i + 1, n))?;
            burst.push(RawSample {
                a_v: s.a_v,
                b_v: s.b_v,
                temperature_c: s.temperature_c,
                at_ms: self.clock.ms_since(self.epoch),
            });
        }
        tracing::debug!(samples = burst.len(), "raw burst captured");
        Ok(burst)
    }

    fn remote_analysis(
        &self,
        research: bool,
        cartridge: &Cartridge,
        raw_pairs: &[(f32, f32)],
        temperature_c: f32,
        advisories: &mut Vec<Advisory>,
    ) -> (MeasurementSource, Option<RemoteAnalysis>) {
        if !research {
            return (MeasurementSource::Primary, None);
        }
        let Some(remote) = &self.remote else {
            return (MeasurementSource::Primary, None);
        };
        let request = RemoteAnalysisRequest {
            raw_pairs: raw_pairs.to_vec(),
            temperature_c,
            cartridge_id: cartridge.id.clone(),
            device_signature: device_signature(&self.device_id, &cartridge.id, raw_pairs),
        };
        match remote.analyze(&request) {
            Ok(analysis) => (MeasurementSource::Primary, Some(analysis)),
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(marker = "fallback", error = %reason, "remote analysis failed; using local result");
                self.events.emit(ControlEvent::Fallback {
                    reason: reason.clone(),
                });
                lock(&self.stats).fallbacks += 1;
                advisories.push(Advisory::RemoteAnalysisUnavailable { reason });
                (MeasurementSource::Fallback, None)
            }
        }
    }

    fn archive_bundle(
        &self,
        bundle: DeepAnalysisBundle,
        advisories: &mut Vec<Advisory>,
    ) -> Option<ArtifactRef> {
        let sink = self.archive.as_ref()?;
        match sink.submit(bundle) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(error = %e, "deep-analysis bundle not archived");
                advisories.push(Advisory::ArchiveUnavailable {
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    // ── Session accessors and manual controls ───────────────────────────────

    pub fn rafe(&self) -> &RafeController {
        &self.rafe
    }

    pub fn ehd_state(&self) -> EhdState {
        self.ehd.state()
    }

    /// Human-driven suction change; suppresses automatic changes for the
    /// override window.
    pub fn set_suction_manual(&self, level: SuctionLevel) -> Result<()> {
        let mut pump = lock(&self.pump);
        self.ehd.set_manual_level(level, &mut **pump)
    }

    pub fn set_ehd_auto_control(&self, enabled: bool) {
        self.ehd.set_auto_control(enabled);
    }

    pub fn set_ehd_enabled(&self, enabled: bool) -> Result<()> {
        let mut pump = lock(&self.pump);
        self.ehd.set_enabled(enabled, &mut **pump)
    }

    pub fn report_ehd_fault(&self, fault: EhdFault) {
        self.ehd.report_fault(fault);
    }

    pub fn clear_ehd_fault(&self) {
        self.ehd.clear_fault();
    }

    /// Shared handle for readers outside the cycle.
    pub fn fail_safe(&self) -> Arc<FailSafeManager> {
        Arc::clone(&self.failsafe)
    }

    pub fn clear_fail_safe_lock(&self, access: &SupportAccess) -> bool {
        self.failsafe.clear_fail_safe_lock(access)
    }

    pub fn kalman_state(&self) -> KalmanState {
        *lock(&self.kalman)
    }

    pub fn hold_cancel(&self) -> HoldCancel {
        self.hold_cancel.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn session_summary(&self) -> SessionSummary {
        let rafe = self.rafe.get_state();
        let ehd = self.ehd.state();
        SessionSummary {
            device_id: self.device_id.clone(),
            fail_safe: self.failsafe.snapshot(),
            analyte: rafe.target_analyte,
            mode: rafe.mode,
            pins: rafe.pins,
            mode_lock_reason: rafe.mode_lock.map(|l| l.reason),
            suction: ehd.level,
            auto_control_enabled: ehd.auto_control_enabled,
            pump_enabled: ehd.enabled,
            pump_fault: ehd.fault,
            manual_override_active: self.ehd.override_active(),
            kalman: self.kalman_state(),
            stats: lock(&self.stats).clone(),
        }
    }
}
