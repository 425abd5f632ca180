use biosense_core::error::BuildError;
use biosense_core::mocks::{FixedConsent, FixedProbe, RecordingPump, ScriptedFrontEnd, StaticCartridge};
use biosense_core::{EhdCfg, FilterCfg, Orchestrator, SamplingCfg, StabilizationCfg};
use rstest::rstest;

fn expect_build_error(err: &eyre::Report) -> &BuildError {
    err.downcast_ref::<BuildError>()
        .unwrap_or_else(|| panic!("expected BuildError, got: {err:?}"))
}

#[rstest]
fn builder_missing_probe_yields_typed_build_error() {
    let err = Orchestrator::builder()
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::empty())
        .with_consent_authority(FixedConsent::deny())
        .try_build()
        .expect_err("should fail with MissingProbe");

    match err.downcast_ref::<BuildError>() {
        Some(BuildError::MissingProbe) => {}
        other => panic!("expected MissingProbe, got: {other:?}"),
    }
}

#[rstest]
fn builder_missing_cartridge_authority_is_reported() {
    let err = Orchestrator::builder()
        .with_probe(FixedProbe::new(50.0, -45.0))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_consent_authority(FixedConsent::deny())
        .build()
        .expect_err("should fail with MissingCartridgeAuthority");
    assert!(matches!(
        expect_build_error(&err),
        BuildError::MissingCartridgeAuthority
    ));
}

#[rstest]
fn builder_missing_consent_authority_is_reported() {
    let err = Orchestrator::builder()
        .with_probe(FixedProbe::new(50.0, -45.0))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::empty())
        .build()
        .expect_err("should fail with MissingConsentAuthority");
    assert!(matches!(
        expect_build_error(&err),
        BuildError::MissingConsentAuthority
    ));
}

#[rstest]
#[case::zero_burst(SamplingCfg { burst_len: 0, ..SamplingCfg::default() }, "burst_len must be >= 1")]
#[case::zero_rate(SamplingCfg { sample_rate_hz: 0, ..SamplingCfg::default() }, "sample_rate_hz must be > 0")]
#[case::zero_timeout(SamplingCfg { sensor_timeout_ms: 0, ..SamplingCfg::default() }, "sensor_timeout_ms must be >= 1")]
fn invalid_sampling_is_rejected(#[case] sampling: SamplingCfg, #[case] msg: &str) {
    let err = Orchestrator::builder()
        .with_probe(FixedProbe::new(50.0, -45.0))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::empty())
        .with_consent_authority(FixedConsent::deny())
        .with_sampling(sampling)
        .build()
        .expect_err("invalid sampling must fail");
    match expect_build_error(&err) {
        BuildError::InvalidConfig(m) => assert_eq!(*m, msg),
        other => panic!("expected InvalidConfig, got: {other:?}"),
    }
}

#[rstest]
fn invalid_filter_pump_and_hold_are_rejected() {
    let base = || {
        Orchestrator::builder()
            .with_probe(FixedProbe::new(50.0, -45.0))
            .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
            .with_pump(RecordingPump::default())
            .with_cartridge_authority(StaticCartridge::empty())
            .with_consent_authority(FixedConsent::deny())
    };

    let err = base()
        .with_filter(FilterCfg { q: 0.001, r: 0.0 })
        .build()
        .expect_err("r = 0");
    assert!(matches!(expect_build_error(&err), BuildError::InvalidConfig(m) if m.contains("noise r")));

    let err = base()
        .with_ehd(EhdCfg {
            high_duty_pct: 120,
            ..EhdCfg::default()
        })
        .build()
        .expect_err("duty > 100");
    assert!(matches!(expect_build_error(&err), BuildError::InvalidConfig("pump duty must be <= 100")));

    let err = base()
        .with_stabilization(StabilizationCfg {
            hold_ms: 3000,
            poll_ms: 0,
        })
        .build()
        .expect_err("poll 0");
    assert!(matches!(expect_build_error(&err), BuildError::InvalidConfig(m) if m.contains("poll_ms")));
}

#[rstest]
fn unknown_default_analyte_is_rejected() {
    let err = Orchestrator::builder()
        .with_probe(FixedProbe::new(50.0, -45.0))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::empty())
        .with_consent_authority(FixedConsent::deny())
        .with_default_analyte("caffeine")
        .build()
        .expect_err("unknown analyte");
    assert!(matches!(expect_build_error(&err), BuildError::InvalidConfig("unknown default analyte")));
}

#[rstest]
fn defaults_build_a_glucose_session() {
    let orch = Orchestrator::builder()
        .with_probe(FixedProbe::new(50.0, -45.0))
        .with_front_end(ScriptedFrontEnd::constant(0.4, 0.1, 25.0))
        .with_pump(RecordingPump::default())
        .with_cartridge_authority(StaticCartridge::empty())
        .with_consent_authority(FixedConsent::deny())
        .build()
        .expect("defaults are valid");
    let summary = orch.session_summary();
    assert_eq!(summary.device_id, "biosense-dev");
    assert_eq!(summary.analyte, "glucose");
    assert!(!summary.fail_safe.locked);
    assert!(!orch.is_busy());
}
