//! Contact-medium classification from a single impedance probe.
//!
//! `classify` is pure: the same reading, thresholds and baseline always give
//! the same medium and the same reason string.

use std::time::Duration;

use biosense_traits::ImpedanceProbe;
use serde::Serialize;

use crate::config::ClassifierCfg;

/// One impedance point at the probe frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImpedanceReading {
    pub magnitude_ohms: f32,
    pub phase_deg: f32,
    pub frequency_hz: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactMedium {
    OpenAir,
    LiquidImmersion,
    SolidHydrogel,
    Unknown,
}

impl ContactMedium {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactMedium::OpenAir => "open_air",
            ContactMedium::LiquidImmersion => "liquid_immersion",
            ContactMedium::SolidHydrogel => "solid_hydrogel",
            ContactMedium::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ContactMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified medium with the reading it came from and a human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub medium: ContactMedium,
    /// `None` when the probe could not be read.
    pub reading: Option<ImpedanceReading>,
    pub reason: String,
}

impl Classification {
    pub fn is_uncertain(&self) -> bool {
        self.medium == ContactMedium::Unknown
    }
}

/// Classify a reading. Checks run in order: open air, liquid, hydrogel.
pub fn classify(
    reading: &ImpedanceReading,
    cfg: &ClassifierCfg,
    gel_baseline_ohms: Option<f32>,
) -> Classification {
    let z = reading.magnitude_ohms;
    let phase = reading.phase_deg;
    let verdict = |medium, reason: String| Classification {
        medium,
        reading: Some(*reading),
        reason,
    };

    if !z.is_finite() || !phase.is_finite() || z < 0.0 {
        return verdict(
            ContactMedium::Unknown,
            format!("invalid reading |Z|={z} phase={phase}"),
        );
    }

    if z >= cfg.open_air_min_ohms && phase.abs() <= cfg.open_air_max_phase_deg {
        return verdict(
            ContactMedium::OpenAir,
            format!(
                "|Z| {z:.0}Ω >= {:.0}Ω with near-resistive phase {phase:.1}°",
                cfg.open_air_min_ohms
            ),
        );
    }

    let capacitive = (cfg.capacitive_phase_min_deg..=cfg.capacitive_phase_max_deg).contains(&phase);
    if z <= cfg.liquid_max_ohms && capacitive {
        return verdict(
            ContactMedium::LiquidImmersion,
            format!(
                "|Z| {z:.0}Ω <= {:.0}Ω with capacitive phase {phase:.1}°",
                cfg.liquid_max_ohms
            ),
        );
    }

    if let Some(base) = gel_baseline_ohms.filter(|b| b.is_finite() && *b > 0.0) {
        let lo = base * (1.0 - cfg.gel_baseline_tolerance);
        let hi = base * (1.0 + cfg.gel_baseline_tolerance);
        if (lo..=hi).contains(&z) {
            return verdict(
                ContactMedium::SolidHydrogel,
                format!("|Z| {z:.0}Ω within gel baseline {base:.0}Ω ±{:.0}%", cfg.gel_baseline_tolerance * 100.0),
            );
        }
    }
    if (cfg.hydrogel_min_ohms..=cfg.hydrogel_max_ohms).contains(&z) {
        return verdict(
            ContactMedium::SolidHydrogel,
            format!(
                "|Z| {z:.0}Ω within hydrogel band {:.0}..{:.0}Ω",
                cfg.hydrogel_min_ohms, cfg.hydrogel_max_ohms
            ),
        );
    }

    verdict(
        ContactMedium::Unknown,
        format!("|Z| {z:.0}Ω phase {phase:.1}° matches no medium"),
    )
}

/// Probe once and classify. A failed probe read yields `Unknown` with the
/// probe error as the reason; it never returns an error.
pub fn probe_and_classify<P>(
    probe: &mut P,
    cfg: &ClassifierCfg,
    gel_baseline_ohms: Option<f32>,
) -> Classification
where
    P: ImpedanceProbe + ?Sized,
{
    let timeout = Duration::from_millis(cfg.probe_timeout_ms);
    let classification = match probe.probe(cfg.probe_frequency_hz, timeout) {
        Ok(point) => classify(
            &ImpedanceReading {
                magnitude_ohms: point.magnitude_ohms,
                phase_deg: point.phase_deg,
                frequency_hz: cfg.probe_frequency_hz,
            },
            cfg,
            gel_baseline_ohms,
        ),
        Err(e) => Classification {
            medium: ContactMedium::Unknown,
            reading: None,
            reason: format!("impedance probe failed: {e}"),
        },
    };
    tracing::info!(
        medium = %classification.medium,
        reason = %classification.reason,
        "contact medium classified"
    );
    classification
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(z: f32, phase: f32) -> ImpedanceReading {
        ImpedanceReading {
            magnitude_ohms: z,
            phase_deg: phase,
            frequency_hz: 1000.0,
        }
    }

    #[test]
    fn gel_baseline_widens_the_hydrogel_band() {
        let cfg = ClassifierCfg::default();
        // 70 kΩ is above the generic band but inside 60 kΩ ±25 %.
        let c = classify(&reading(70_000.0, -30.0), &cfg, Some(60_000.0));
        assert_eq!(c.medium, ContactMedium::SolidHydrogel);
        assert!(c.reason.contains("gel baseline"));
        let c = classify(&reading(70_000.0, -30.0), &cfg, None);
        assert_eq!(c.medium, ContactMedium::Unknown);
    }

    #[test]
    fn low_impedance_resistive_phase_is_not_liquid() {
        let c = classify(&reading(50.0, -2.0), &ClassifierCfg::default(), None);
        assert_eq!(c.medium, ContactMedium::Unknown);
    }

    #[test]
    fn nan_reading_is_unknown() {
        let c = classify(&reading(f32::NAN, 0.0), &ClassifierCfg::default(), None);
        assert!(c.is_uncertain());
        assert!(c.reason.starts_with("invalid reading"));
    }
}
