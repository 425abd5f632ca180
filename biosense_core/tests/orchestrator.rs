use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use biosense_core::mocks::{
    FixedConsent, FixedProbe, MemoryArchive, RecordingPump, ScriptedFrontEnd, StaticCartridge,
    StubRemote,
};
use biosense_core::{
    Advisory, BlockReason, CalibrationParameters, Cartridge, CartridgeAuthority, ChannelSink, ContactMedium,
    ControlEvent, CoreError, HoldCancel, MeasurementOutcome, MeasurementSource, Orchestrator,
    PrecisionTier, RafeMode, RafeState, StabilizationCfg, SuctionLevel,
};
use biosense_core::calibration::Anomaly;
use biosense_traits::{AnalogFrontEnd, BoxError, ChannelSample, Clock, TestClock};
use crossbeam_channel::{Receiver, Sender, bounded};
use rstest::rstest;

const LIQUID: (f32, f32) = (50.0, -45.0);
const HYDROGEL: (f32, f32) = (20_000.0, -30.0);

fn cartridge(uses: u32) -> Cartridge {
    Cartridge {
        id: "CART-7".into(),
        uses_remaining: uses,
        calibration: CalibrationParameters::default(),
    }
}

fn expect_completed(outcome: MeasurementOutcome) -> biosense_core::Measurement {
    match outcome {
        MeasurementOutcome::Completed { measurement } => *measurement,
        other => panic!("expected completed, got {other:?}"),
    }
}

#[rstest]
fn liquid_cycle_produces_calibrated_measurement() {
    let probe = FixedProbe::new(LIQUID.0, LIQUID.1);
    let front_end = ScriptedFrontEnd::constant(0.4, 0.1, 25.0);
    let pump = RecordingPump::default();
    let cart = StaticCartridge::new(cartridge(5));
    let clock = TestClock::new();
    let orch = Orchestrator::builder()
        .with_probe(probe.clone())
        .with_front_end(front_end.clone())
        .with_pump(pump.clone())
        .with_cartridge_authority(cart.clone())
        .with_consent_authority(FixedConsent::deny())
        .with_clock(clock.clone())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert_eq!(m.medium(), ContactMedium::LiquidImmersion);
    assert_eq!(m.analyte(), "glucose");
    assert_eq!(m.mode(), RafeMode::LiquidEc);
    assert_eq!(m.raw().len(), 8);
    assert!((m.filtered_voltage() - 0.3).abs() < 0.01, "x={}", m.filtered_voltage());
    assert!((m.concentration() - 3.0).abs() < 0.1, "c={}", m.concentration());
    assert_eq!(m.uncertainty_pct(), 5.0);
    assert!(m.anomaly().is_none());
    assert_eq!(m.source(), MeasurementSource::Primary);
    assert_eq!(m.cartridge_id(), "CART-7");

    // Liquid contact means low suction.
    assert_eq!(orch.ehd_state().level, SuctionLevel::Low);
    assert_eq!(pump.last_duty(), Some(30));
    // Front-end routed for the selected mode before sampling.
    let routes = front_end.routes();
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].0, "liquid-ec");
    // 7 inter-sample gaps at 100 Hz.
    assert_eq!(clock.elapsed(), Duration::from_millis(70));

    assert_eq!(cart.usage_calls(), 1);
    assert_eq!(cart.active().map(|c| c.uses_remaining), Some(4));
    assert_eq!(probe.calls(), 1);
}

#[rstest]
fn kalman_state_persists_across_cycles() {
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let first = expect_completed(orch.measure().unwrap());
    let after_first = orch.kalman_state();
    assert_eq!(after_first.x, first.filtered_voltage());
    assert!(after_first.p < 1.0);

    let second = expect_completed(orch.measure().unwrap());
    let after_second = orch.kalman_state();
    assert_eq!(after_second.x, second.filtered_voltage());
    assert!((after_second.x - 0.3).abs() <= (after_first.x - 0.3).abs() + 1e-6);
}

#[rstest]
fn consent_denied_never_calls_remote() {
    let consent = FixedConsent::deny();
    let remote = StubRemote::answering(true, Some("ketosis pattern"));
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(consent.clone())
        .with_remote_analyzer(remote.clone())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert_eq!(remote.calls(), 0);
    assert_eq!(consent.calls(), 1);
    assert_eq!(m.source(), MeasurementSource::Primary);
    assert!(m.remote().is_none());
    assert!(m.has_advisory(|a| matches!(a, Advisory::ConsentBlocked)));
}

#[rstest]
fn remote_answer_is_attached_when_consented() {
    let remote = StubRemote::answering(true, Some("ketosis pattern"));
    let archive = MemoryArchive::default();
    let orch = Orchestrator::builder()
        .with_device_id("reader-01")
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::allow())
        .with_remote_analyzer(remote.clone())
        .with_deep_analysis_sink(archive.clone())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert_eq!(m.source(), MeasurementSource::Primary);
    assert!(m.is_anomalous(), "remote flagged the sample");
    assert_eq!(
        m.remote().and_then(|r| r.interpretation.as_deref()),
        Some("ketosis pattern")
    );

    let requests = remote.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].raw_pairs.len(), 8);
    assert_eq!(requests[0].cartridge_id, "CART-7");
    assert_eq!(requests[0].device_signature.len(), 64);

    let bundles = archive.bundles();
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].measurement_id, m.id());
    assert_eq!(bundles[0].interpretation.as_deref(), Some("ketosis pattern"));
    assert_eq!(bundles[0].rafe.mode, "liquid-ec");
    assert_eq!(m.artifact().map(|a| a.0.as_str()), Some("mem://1"));
}

#[rstest]
fn remote_failure_falls_back_to_local_result() {
    let (sink, rx) = ChannelSink::bounded(64);
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::allow())
        .with_remote_analyzer(StubRemote::failing("503 service unavailable"))
        .with_event_sink(sink)
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert_eq!(m.source(), MeasurementSource::Fallback);
    assert!(m.remote().is_none());
    assert!(m.concentration() > 0.0);
    assert!(m.has_advisory(
        |a| matches!(a, Advisory::RemoteAnalysisUnavailable { reason } if reason.contains("503"))
    ));
    let events: Vec<ControlEvent> = rx.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, ControlEvent::Fallback { .. })));
    assert!(matches!(
        events.last(),
        Some(ControlEvent::MeasurementCompleted {
            source: MeasurementSource::Fallback,
            ..
        })
    ));
    assert_eq!(orch.session_summary().stats.fallbacks, 1);
}

#[rstest]
fn missing_or_expended_cartridge_blocks_before_probing() {
    let probe = FixedProbe::new(LIQUID.0, LIQUID.1);
    let cart = StaticCartridge::empty();
    let orch = Orchestrator::builder()
        .with_probe(probe.clone())
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(cart.clone())
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    assert_eq!(
        orch.measure().unwrap(),
        MeasurementOutcome::Blocked {
            reason: BlockReason::NoCartridge
        }
    );

    cart.replace(Some(cartridge(1)));
    expect_completed(orch.measure().unwrap());
    match orch.measure().unwrap() {
        MeasurementOutcome::Blocked {
            reason: BlockReason::CartridgeExpended { cartridge_id },
        } => assert_eq!(cartridge_id, "CART-7"),
        other => panic!("expected expended, got {other:?}"),
    }
    assert_eq!(probe.calls(), 1);
    assert_eq!(orch.session_summary().stats.blocked, 2);
}

#[rstest]
fn unknown_analyte_is_an_error_before_hardware() {
    let probe = FixedProbe::new(LIQUID.0, LIQUID.1);
    let orch = Orchestrator::builder()
        .with_probe(probe.clone())
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .build()
        .unwrap();

    let err = orch.measure_analyte("caffeine").expect_err("unknown analyte");
    assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::UnknownAnalyte(_))));
    assert_eq!(probe.calls(), 0);
    assert!(!orch.is_busy());
}

#[rstest]
fn unknown_analyte_is_refused_even_while_rafe_is_locked() {
    let probe = FixedProbe::new(LIQUID.0, LIQUID.1);
    let front_end = ScriptedFrontEnd::constant(0.4, 0.1, 25.0);
    let cart = StaticCartridge::new(cartridge(5));
    let orch = Orchestrator::builder()
        .with_probe(probe.clone())
        .with_front_end(front_end.clone())
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(cart.clone())
        .with_consent_authority(FixedConsent::deny())
        .build()
        .unwrap();

    orch.rafe().lock_mode("calibrate");
    // The controller alone treats a locked selection as a no-op.
    assert_eq!(orch.rafe().select_target_analyte("caffeine").unwrap(), RafeMode::LiquidEc);

    let err = orch.measure_analyte("caffeine").expect_err("unknown analyte");
    assert!(matches!(
        err.downcast_ref::<CoreError>(),
        Some(CoreError::UnknownAnalyte(name)) if name == "caffeine"
    ));
    assert_eq!(probe.calls(), 0);
    assert_eq!(front_end.samples_taken(), 0);
    assert_eq!(cart.usage_calls(), 0);
    assert_eq!(orch.rafe().get_state().target_analyte, "glucose");
    assert!(orch.rafe().is_locked());
}

#[rstest]
fn sensor_timeout_surfaces_as_typed_error_and_releases_busy() {
    let front_end = ScriptedFrontEnd::constant(0.4, 0.1, 25.0);
    front_end.set_failing(true);
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(front_end.clone())
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let err = orch.measure().expect_err("timeout");
    assert!(matches!(err.downcast_ref::<CoreError>(), Some(CoreError::Timeout)), "{err:?}");
    assert!(!orch.is_busy());
    assert_eq!(orch.kalman_state(), biosense_core::KalmanState::default());

    front_end.set_failing(false);
    expect_completed(orch.measure().unwrap());
}

#[rstest]
fn gas_analyte_without_medium_signal_uses_high_suction() {
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::unplugged())
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure_analyte("Acetone").unwrap());
    assert_eq!(m.medium(), ContactMedium::Unknown);
    assert_eq!(m.mode(), RafeMode::GasHighImpedance);
    assert!(m.has_advisory(|a| matches!(a, Advisory::ClassificationUncertain { .. })));
    assert_eq!(orch.ehd_state().level, SuctionLevel::High);
}

#[rstest]
fn external_mode_lock_rejects_switch_but_completes() {
    let (sink, rx) = ChannelSink::bounded(64);
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_event_sink(sink)
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    orch.rafe().lock_mode("calibrate");
    let m = expect_completed(orch.measure_analyte("acetone").unwrap());
    assert_eq!(m.mode(), RafeMode::LiquidEc);
    assert_eq!(m.analyte(), "glucose");
    assert!(m.has_advisory(|a| matches!(
        a,
        Advisory::ModeSwitchRejected { requested, lock_reason }
            if requested == "acetone" && lock_reason == "calibrate"
    )));
    assert!(rx
        .try_iter()
        .any(|e| matches!(e, ControlEvent::ModeSwitchRejected { current: RafeMode::LiquidEc, .. })));
}

#[rstest]
fn hydrogel_contact_holds_under_mode_lock_then_restores() {
    let clock = TestClock::new();
    let pump = RecordingPump::default();
    let (sink, rx) = ChannelSink::bounded(64);
    let orch = Orchestrator::builder()
        .with_default_analyte("cortisol")
        .with_probe(FixedProbe::new(HYDROGEL.0, HYDROGEL.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(pump.clone())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_event_sink(sink)
        .with_clock(clock.clone())
        .build()
        .unwrap();

    let seen: Arc<Mutex<Vec<RafeState>>> = Arc::default();
    let s = Arc::clone(&seen);
    orch.rafe().subscribe(move |st| s.lock().unwrap().push(st.clone()));

    let m = expect_completed(orch.measure().unwrap());
    assert_eq!(m.medium(), ContactMedium::SolidHydrogel);
    assert_eq!(m.mode(), RafeMode::SolidEis);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].mode_lock.as_ref().map(|l| l.reason.as_str()), Some("stabilize"));
    assert!(!seen[1].is_locked());
    assert!(!orch.rafe().is_locked());

    // Med for the hold, then the pre-hold level comes back.
    assert_eq!(pump.duties(), vec![60, 30]);
    assert_eq!(orch.ehd_state().level, SuctionLevel::Low);
    assert_eq!(clock.elapsed(), Duration::from_millis(3000 + 70));

    let events: Vec<ControlEvent> = rx.try_iter().collect();
    assert!(events.contains(&ControlEvent::StabilizationStarted { hold_ms: 3000 }));
    assert!(events.contains(&ControlEvent::StabilizationEnded {
        held_ms: 3000,
        cancelled: false
    }));
}

/// Clock that fires the hold cancel after a number of sleeps.
struct CancellingClock {
    inner: TestClock,
    cancel: HoldCancel,
    after: usize,
    sleeps: AtomicUsize,
}

impl Clock for CancellingClock {
    fn now(&self) -> Instant {
        self.inner.now()
    }

    fn sleep(&self, d: Duration) {
        self.inner.sleep(d);
        if self.sleeps.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.cancel.cancel();
        }
    }
}

#[rstest]
fn cancelled_hold_ends_early_and_continues() {
    let cancel = HoldCancel::new();
    let clock = CancellingClock {
        inner: TestClock::new(),
        cancel: cancel.clone(),
        after: 3,
        sleeps: AtomicUsize::new(0),
    };
    let orch = Orchestrator::builder()
        .with_default_analyte("cortisol")
        .with_probe(FixedProbe::new(HYDROGEL.0, HYDROGEL.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_stabilization(StabilizationCfg {
            hold_ms: 3000,
            poll_ms: 50,
        })
        .with_hold_cancel(cancel.clone())
        .with_clock(clock)
        .build()
        .unwrap();

    // A stale cancel from before the cycle is cleared at cycle start.
    cancel.cancel();
    let m = expect_completed(orch.measure().unwrap());
    assert!(m.has_advisory(|a| *a == Advisory::StabilizationCancelled { held_ms: 150 }));
    assert!(!orch.rafe().is_locked());
}

#[rstest]
fn manual_override_suppresses_automatic_suction_until_window_ends() {
    let clock = TestClock::new();
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(clock.clone())
        .build()
        .unwrap();

    orch.set_suction_manual(SuctionLevel::High).unwrap();
    let m = expect_completed(orch.measure().unwrap());
    assert!(m.has_advisory(|a| matches!(a, Advisory::SuctionSkipped { .. })));
    assert_eq!(orch.ehd_state().level, SuctionLevel::High);
    assert!(orch.session_summary().manual_override_active);

    clock.advance(Duration::from_secs(61));
    expect_completed(orch.measure().unwrap());
    assert_eq!(orch.ehd_state().level, SuctionLevel::Low);
}

#[rstest]
#[case(PrecisionTier::Low, false, 10.0)]
#[case(PrecisionTier::High, true, 10.0)]
#[case(PrecisionTier::Low, true, 15.0)]
fn cartridge_quality_widens_reported_uncertainty(
    #[case] tier: PrecisionTier,
    #[case] offline: bool,
    #[case] expected: f32,
) {
    let cart = Cartridge {
        calibration: CalibrationParameters {
            tier,
            offline_fallback: offline,
            ..CalibrationParameters::default()
        },
        ..cartridge(5)
    };
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cart))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert!((m.uncertainty_pct() - expected).abs() < 1e-5);
    assert_eq!(m.has_advisory(|a| *a == Advisory::LowPrecisionTier), tier == PrecisionTier::Low);
    assert_eq!(m.has_advisory(|a| *a == Advisory::OfflineCalibration), offline);
}

#[rstest]
fn warm_sample_is_flagged_but_reported() {
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 45.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let m = expect_completed(orch.measure().unwrap());
    assert!(matches!(m.anomaly(), Some(Anomaly::TemperatureOutOfRange { .. })));
    assert!(m.is_anomalous());
    assert!(!orch.fail_safe().is_locked());
}

/// Front-end whose first read blocks until the test releases it.
struct GatedFrontEnd {
    entered: Sender<()>,
    release: Receiver<()>,
    first: bool,
}

impl AnalogFrontEnd for GatedFrontEnd {
    fn configure(&mut self, _mode: &str, _pins: &[u8]) -> Result<(), BoxError> {
        Ok(())
    }

    fn sample(&mut self, _timeout: Duration) -> Result<ChannelSample, BoxError> {
        if self.first {
            self.first = false;
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
        Ok(ChannelSample {
            a_v: 0.4,
            b_v: 0.1,
            temperature_c: 25.0,
        })
    }
}

#[rstest]
fn concurrent_measure_is_rejected_as_busy() {
    let (entered_tx, entered_rx) = bounded(1);
    let (release_tx, release_rx) = bounded(1);
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(GatedFrontEnd {
            entered: entered_tx,
            release: release_rx,
            first: true,
        })
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    std::thread::scope(|s| {
        let first = s.spawn(|| orch.measure().unwrap());
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first cycle reached sampling");
        assert!(orch.is_busy());
        assert_eq!(orch.measure().unwrap(), MeasurementOutcome::Busy);
        release_tx.send(()).unwrap();
        let outcome = first.join().unwrap();
        assert_eq!(outcome.label(), "completed");
    });

    assert!(!orch.is_busy());
    let stats = orch.session_summary().stats;
    assert_eq!(stats.busy_rejections, 1);
    assert_eq!(stats.completed, 1);
}

#[rstest]
fn outcome_serializes_with_tag() {
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(LIQUID.0, LIQUID.1))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::new(cartridge(5)))
        .with_consent_authority(FixedConsent::deny())
        .with_clock(TestClock::new())
        .build()
        .unwrap();

    let v = serde_json::to_value(orch.measure().unwrap()).unwrap();
    assert_eq!(v["outcome"], "completed");
    assert_eq!(v["measurement"]["medium"], "liquid_immersion");
    assert_eq!(v["measurement"]["mode"], "liquid-ec");
    assert_eq!(v["measurement"]["advisories"][0]["kind"], "consent_blocked");
}
