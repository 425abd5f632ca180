//! Runtime configuration types for the measurement-control core.
//!
//! These are the structs the components and the `Orchestrator` consume.
//! They are separate from the TOML-deserialized config in `biosense_config`.

/// Thresholds for contact-medium classification from a 1 kHz impedance probe.
#[derive(Debug, Clone)]
pub struct ClassifierCfg {
    /// Probe excitation frequency in Hz.
    pub probe_frequency_hz: f32,
    /// Probe read timeout in milliseconds.
    pub probe_timeout_ms: u64,
    /// OpenAir requires |Z| at or above this.
    pub open_air_min_ohms: f32,
    /// OpenAir requires |phase| at or below this.
    pub open_air_max_phase_deg: f32,
    /// LiquidImmersion requires |Z| at or below this.
    pub liquid_max_ohms: f32,
    pub capacitive_phase_min_deg: f32,
    pub capacitive_phase_max_deg: f32,
    /// Generic hydrated-gel band, used with or without a cartridge baseline.
    pub hydrogel_min_ohms: f32,
    pub hydrogel_max_ohms: f32,
    /// Relative tolerance around a cartridge gel baseline.
    pub gel_baseline_tolerance: f32,
}

impl Default for ClassifierCfg {
    fn default() -> Self {
        Self {
            probe_frequency_hz: 1000.0,
            probe_timeout_ms: 100,
            open_air_min_ohms: 1.0e6,
            open_air_max_phase_deg: 15.0,
            liquid_max_ohms: 1_000.0,
            capacitive_phase_min_deg: -85.0,
            capacitive_phase_max_deg: -10.0,
            hydrogel_min_ohms: 5_000.0,
            hydrogel_max_ohms: 50_000.0,
            gel_baseline_tolerance: 0.25,
        }
    }
}

/// EHD pump policy configuration.
#[derive(Debug, Clone)]
pub struct EhdCfg {
    /// Automatic changes are suppressed for this long after a manual override.
    pub manual_override_window_ms: u64,
    pub low_duty_pct: u8,
    pub med_duty_pct: u8,
    pub high_duty_pct: u8,
    /// Initial state of the automatic-control switch.
    pub auto_control: bool,
}

impl Default for EhdCfg {
    fn default() -> Self {
        Self {
            manual_override_window_ms: 60_000,
            low_duty_pct: 30,
            med_duty_pct: 60,
            high_duty_pct: 90,
            auto_control: true,
        }
    }
}

/// Raw burst acquisition.
#[derive(Debug, Clone)]
pub struct SamplingCfg {
    /// Samples per burst.
    pub burst_len: usize,
    /// Drives the inter-sample delay.
    pub sample_rate_hz: u32,
    /// Per-read timeout in milliseconds.
    pub sensor_timeout_ms: u64,
}

impl Default for SamplingCfg {
    fn default() -> Self {
        Self {
            burst_len: 8,
            sample_rate_hz: 100,
            sensor_timeout_ms: 150,
        }
    }
}

/// Scalar Kalman noise parameters.
#[derive(Debug, Clone, Copy)]
pub struct FilterCfg {
    /// Process noise added to the covariance on every predict step.
    pub q: f32,
    /// Measurement noise.
    pub r: f32,
}

impl Default for FilterCfg {
    fn default() -> Self {
        Self {
            q: crate::calibration::DEFAULT_Q,
            r: crate::calibration::DEFAULT_R,
        }
    }
}

/// Local sanity bounds used to flag a measurement as anomalous.
#[derive(Debug, Clone)]
pub struct AnomalyCfg {
    pub min_temperature_c: f32,
    pub max_temperature_c: f32,
    /// Hard ceiling for a plausible concentration.
    pub max_concentration: f32,
    /// Sane band for the Kalman estimate in volts.
    pub min_filter_voltage: f32,
    pub max_filter_voltage: f32,
}

impl Default for AnomalyCfg {
    fn default() -> Self {
        Self {
            min_temperature_c: 15.0,
            max_temperature_c: 40.0,
            max_concentration: 50.0,
            min_filter_voltage: -1.0,
            max_filter_voltage: 4.5,
        }
    }
}

/// Fail-safe trip thresholds.
#[derive(Debug, Clone)]
pub struct SafetyCfg {
    /// Trip when the peak burst temperature exceeds this.
    pub max_temperature_c: f32,
    /// Trip when any channel magnitude exceeds this.
    pub max_channel_voltage: f32,
}

impl Default for SafetyCfg {
    fn default() -> Self {
        Self {
            max_temperature_c: 60.0,
            max_channel_voltage: 5.0,
        }
    }
}

/// Solid-contact stabilization hold.
#[derive(Debug, Clone)]
pub struct StabilizationCfg {
    /// Length of the hold in milliseconds.
    pub hold_ms: u64,
    /// Cancellation poll interval in milliseconds.
    pub poll_ms: u64,
}

impl Default for StabilizationCfg {
    fn default() -> Self {
        Self {
            hold_ms: 3_000,
            poll_ms: 50,
        }
    }
}
