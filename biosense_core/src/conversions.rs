//! `From` implementations bridging `biosense_config` types to `biosense_core` types.

use crate::calibration::{CalibrationParameters, PrecisionTier};
use crate::collaborators::Cartridge;
use crate::config::{
    AnomalyCfg, ClassifierCfg, EhdCfg, FilterCfg, SafetyCfg, SamplingCfg, StabilizationCfg,
};

// ── ClassifierCfg ────────────────────────────────────────────────────────────

impl From<&biosense_config::ClassifierCfg> for ClassifierCfg {
    fn from(c: &biosense_config::ClassifierCfg) -> Self {
        Self {
            probe_frequency_hz: c.probe_frequency_hz,
            probe_timeout_ms: c.probe_timeout_ms,
            open_air_min_ohms: c.open_air_min_ohms,
            open_air_max_phase_deg: c.open_air_max_phase_deg,
            liquid_max_ohms: c.liquid_max_ohms,
            capacitive_phase_min_deg: c.capacitive_phase_min_deg,
            capacitive_phase_max_deg: c.capacitive_phase_max_deg,
            hydrogel_min_ohms: c.hydrogel_min_ohms,
            hydrogel_max_ohms: c.hydrogel_max_ohms,
            gel_baseline_tolerance: c.gel_baseline_tolerance,
        }
    }
}

// ── EhdCfg ───────────────────────────────────────────────────────────────────

impl From<&biosense_config::EhdCfg> for EhdCfg {
    fn from(c: &biosense_config::EhdCfg) -> Self {
        Self {
            manual_override_window_ms: c.manual_override_window_ms,
            low_duty_pct: c.low_duty_pct,
            med_duty_pct: c.med_duty_pct,
            high_duty_pct: c.high_duty_pct,
            auto_control: c.auto_control,
        }
    }
}

// ── SamplingCfg / FilterCfg ──────────────────────────────────────────────────

impl From<&biosense_config::SamplingCfg> for SamplingCfg {
    fn from(c: &biosense_config::SamplingCfg) -> Self {
        Self {
            burst_len: c.burst_len,
            sample_rate_hz: c.sample_rate_hz,
            sensor_timeout_ms: c.sensor_timeout_ms,
        }
    }
}

impl From<&biosense_config::FilterCfg> for FilterCfg {
    fn from(c: &biosense_config::FilterCfg) -> Self {
        Self {
            q: c.process_noise_q,
            r: c.measurement_noise_r,
        }
    }
}

// ── AnomalyCfg / SafetyCfg / StabilizationCfg ────────────────────────────────

impl From<&biosense_config::AnomalyCfg> for AnomalyCfg {
    fn from(c: &biosense_config::AnomalyCfg) -> Self {
        Self {
            min_temperature_c: c.min_temperature_c,
            max_temperature_c: c.max_temperature_c,
            max_concentration: c.max_concentration,
            min_filter_voltage: c.min_filter_voltage,
            max_filter_voltage: c.max_filter_voltage,
        }
    }
}

impl From<&biosense_config::Safety> for SafetyCfg {
    fn from(c: &biosense_config::Safety) -> Self {
        Self {
            max_temperature_c: c.max_temperature_c,
            max_channel_voltage: c.max_channel_voltage,
        }
    }
}

impl From<&biosense_config::StabilizationCfg> for StabilizationCfg {
    fn from(c: &biosense_config::StabilizationCfg) -> Self {
        Self {
            hold_ms: c.hold_ms,
            poll_ms: c.poll_ms,
        }
    }
}

// ── Cartridge ────────────────────────────────────────────────────────────────

impl From<biosense_config::Tier> for PrecisionTier {
    fn from(t: biosense_config::Tier) -> Self {
        match t {
            biosense_config::Tier::High => PrecisionTier::High,
            biosense_config::Tier::Low => PrecisionTier::Low,
        }
    }
}

impl From<&biosense_config::CartridgeCfg> for Cartridge {
    fn from(c: &biosense_config::CartridgeCfg) -> Self {
        Self {
            id: c.id.clone(),
            uses_remaining: c.uses_remaining,
            calibration: CalibrationParameters {
                offset_v: c.offset_v,
                gain: c.gain,
                tier: c.tier.into(),
                uncertainty_pct: c.uncertainty_pct,
                gel_baseline_ohms: c.gel_baseline_ohms,
                offline_fallback: c.offline_fallback,
            },
        }
    }
}

impl CalibrationParameters {
    /// Replace offset/gain with a fitted CSV calibration, keeping tier and
    /// the rest of the cartridge metadata.
    pub fn with_fit(mut self, fit: &biosense_config::Calibration) -> Self {
        self.offset_v = fit.offset_v;
        self.gain = fit.gain;
        self
    }
}
