use biosense_core::mocks::FixedProbe;
use biosense_core::{ClassifierCfg, ContactMedium, ImpedanceReading, classify, probe_and_classify};
use rstest::rstest;

fn reading(z: f32, phase: f32) -> ImpedanceReading {
    ImpedanceReading {
        magnitude_ohms: z,
        phase_deg: phase,
        frequency_hz: 1000.0,
    }
}

#[rstest]
#[case(2.0e6, -3.0, ContactMedium::OpenAir)]
#[case(50.0, -45.0, ContactMedium::LiquidImmersion)]
#[case(800.0, -70.0, ContactMedium::LiquidImmersion)]
#[case(20_000.0, -30.0, ContactMedium::SolidHydrogel)]
#[case(5_000.0, -5.0, ContactMedium::SolidHydrogel)]
#[case(2_000.0, -40.0, ContactMedium::Unknown)]
#[case(2.0e6, -60.0, ContactMedium::Unknown)]
#[case(50.0, -89.0, ContactMedium::Unknown)]
fn classifies_by_default_thresholds(
    #[case] z: f32,
    #[case] phase: f32,
    #[case] expected: ContactMedium,
) {
    let c = classify(&reading(z, phase), &ClassifierCfg::default(), None);
    assert_eq!(c.medium, expected, "reason: {}", c.reason);
    assert_eq!(c.reading, Some(reading(z, phase)));
}

#[rstest]
#[case(50.0, -45.0)]
#[case(20_000.0, -30.0)]
#[case(2_000.0, -40.0)]
fn classification_is_idempotent(#[case] z: f32, #[case] phase: f32) {
    let cfg = ClassifierCfg::default();
    let r = reading(z, phase);
    let first = classify(&r, &cfg, Some(15_000.0));
    let second = classify(&r, &cfg, Some(15_000.0));
    assert_eq!(first.medium, second.medium);
    assert_eq!(first.reason, second.reason);
}

#[test]
fn liquid_reason_mentions_capacitive_phase() {
    let c = classify(&reading(50.0, -45.0), &ClassifierCfg::default(), None);
    assert_eq!(c.reason, "|Z| 50Ω <= 1000Ω with capacitive phase -45.0°");
}

#[test]
fn failed_probe_is_unknown_not_error() {
    let mut probe = FixedProbe::unplugged();
    let c = probe_and_classify(&mut probe, &ClassifierCfg::default(), None);
    assert_eq!(c.medium, ContactMedium::Unknown);
    assert!(c.reading.is_none());
    assert!(c.reason.contains("probe not connected"), "{}", c.reason);
    assert_eq!(probe.calls(), 1);
}

#[test]
fn probe_reading_carries_probe_frequency() {
    let mut probe = FixedProbe::new(50.0, -45.0);
    let cfg = ClassifierCfg {
        probe_frequency_hz: 1000.0,
        ..ClassifierCfg::default()
    };
    let c = probe_and_classify(&mut probe, &cfg, None);
    assert_eq!(c.medium, ContactMedium::LiquidImmersion);
    assert_eq!(c.reading.map(|r| r.frequency_hz), Some(1000.0));
}
