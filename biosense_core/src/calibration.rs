//! Scalar Kalman filter, cartridge calibration and local anomaly checks.
//!
//! Everything here is pure: the orchestrator owns the session `KalmanState`
//! and decides when a posterior is committed.

use serde::Serialize;

use crate::config::AnomalyCfg;

/// Default process noise for slow-changing concentration signals.
pub const DEFAULT_Q: f32 = 0.0008;
/// Default measurement noise for high-frequency electrical noise.
pub const DEFAULT_R: f32 = 0.0009;

/// Temperature at which cartridge gain/offset were characterised.
pub const REFERENCE_TEMP_C: f32 = 25.0;
/// Fractional sensitivity drift per °C away from the reference temperature.
pub const TEMP_COEFF_PER_C: f32 = 0.002;
/// Low-tier cartridges report this multiple of their nominal uncertainty.
pub const LOW_TIER_UNCERTAINTY_FACTOR: f32 = 2.0;
/// Added uncertainty (percentage points) when running on offline calibration.
pub const OFFLINE_FALLBACK_UNCERTAINTY_PCT: f32 = 5.0;
/// Linear sensitivity of the concentration transform (units per volt).
pub const CONCENTRATION_PER_VOLT: f32 = 10.0;

/// Scalar estimate `x` (volts) and its covariance `p`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct KalmanState {
    pub x: f32,
    pub p: f32,
}

impl Default for KalmanState {
    /// Session-start state: no estimate, unit covariance.
    fn default() -> Self {
        Self { x: 0.0, p: 1.0 }
    }
}

/// One predict + update step. Returns the posterior and its estimate.
///
/// Predict adds `q` to the covariance; update blends `x` toward `z` with gain
/// `p / (p + r)` and shrinks `p` by `(1 - k)`. A non-finite measurement leaves
/// the prior untouched.
pub fn kalman_update(z: f32, prior: KalmanState, q: f32, r: f32) -> (KalmanState, f32) {
    if !z.is_finite() {
        return (prior, prior.x);
    }
    let p_pred = prior.p + q.max(0.0);
    let denom = p_pred + r;
    let k = if denom > 0.0 { p_pred / denom } else { 0.0 };
    let x = prior.x + k * (z - prior.x);
    let p = (1.0 - k) * p_pred;
    (KalmanState { x, p }, x)
}

/// Filter a whole burst starting from `prior`; the caller commits the result.
pub fn filter_burst(values: &[f32], prior: KalmanState, q: f32, r: f32) -> KalmanState {
    values
        .iter()
        .fold(prior, |state, &z| kalman_update(z, state, q, r).0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionTier {
    #[default]
    High,
    Low,
}

/// Coefficients supplied by the active cartridge. Replaced wholesale when the
/// cartridge changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationParameters {
    pub offset_v: f32,
    pub gain: f32,
    pub tier: PrecisionTier,
    /// Nominal uncertainty of the calibration in percent.
    pub uncertainty_pct: f32,
    /// Intrinsic impedance of the cartridge hydrogel, if characterised.
    pub gel_baseline_ohms: Option<f32>,
    /// Coefficients are a stored fallback rather than an authenticated set.
    pub offline_fallback: bool,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            offset_v: 0.0,
            gain: 1.0,
            tier: PrecisionTier::High,
            uncertainty_pct: 5.0,
            gel_baseline_ohms: None,
            offline_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalibratedVoltage {
    pub volts: f32,
    /// Reported uncertainty after tier and fallback widening.
    pub uncertainty_pct: f32,
}

/// Apply offset/gain and temperature compensation about `REFERENCE_TEMP_C`.
pub fn apply_calibration(
    raw_v: f32,
    params: &CalibrationParameters,
    temperature_c: f32,
) -> CalibratedVoltage {
    let corrected = (raw_v - params.offset_v) * params.gain;
    let drift = 1.0 + TEMP_COEFF_PER_C * (temperature_c - REFERENCE_TEMP_C);
    let volts = if drift.is_finite() && drift > 0.0 {
        corrected / drift
    } else {
        corrected
    };
    CalibratedVoltage {
        volts,
        uncertainty_pct: reported_uncertainty_pct(params),
    }
}

/// Uncertainty as reported to the user: low tier multiplies, offline adds.
pub fn reported_uncertainty_pct(params: &CalibrationParameters) -> f32 {
    let mut u = params.uncertainty_pct.max(0.0);
    if params.tier == PrecisionTier::Low {
        u *= LOW_TIER_UNCERTAINTY_FACTOR;
    }
    if params.offline_fallback {
        u += OFFLINE_FALLBACK_UNCERTAINTY_PCT;
    }
    u
}

/// Unclamped linear transform; negative output means "below zero" and is an
/// anomaly signal.
#[inline]
pub fn raw_concentration(volts: f32) -> f32 {
    volts * CONCENTRATION_PER_VOLT
}

/// Monotonic voltage → concentration transform, clamped to be non-negative.
#[inline]
pub fn concentration_from_voltage(volts: f32) -> f32 {
    raw_concentration(volts).max(0.0)
}

/// Why a measurement was flagged by the local sanity check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    TemperatureOutOfRange { temperature_c: f32 },
    ConcentrationOutOfRange { concentration: f32 },
    FilterOutOfBand { x: f32 },
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Anomaly::TemperatureOutOfRange { temperature_c } => {
                write!(f, "temperature {temperature_c:.1}°C outside operating range")
            }
            Anomaly::ConcentrationOutOfRange { concentration } => {
                write!(f, "concentration {concentration:.2} outside plausible range")
            }
            Anomaly::FilterOutOfBand { x } => {
                write!(f, "filter estimate {x:.3}V outside sane band")
            }
        }
    }
}

/// First failing sanity check, if any. Temperature is checked first, then the
/// unclamped concentration, then the filter estimate.
pub fn detect_anomaly(
    temperature_c: f32,
    raw_concentration: f32,
    filter_x: f32,
    cfg: &AnomalyCfg,
) -> Option<Anomaly> {
    if !(cfg.min_temperature_c..=cfg.max_temperature_c).contains(&temperature_c) {
        return Some(Anomaly::TemperatureOutOfRange { temperature_c });
    }
    if !(0.0..=cfg.max_concentration).contains(&raw_concentration) {
        return Some(Anomaly::ConcentrationOutOfRange {
            concentration: raw_concentration,
        });
    }
    if !(cfg.min_filter_voltage..=cfg.max_filter_voltage).contains(&filter_x) {
        return Some(Anomaly::FilterOutOfBand { x: filter_x });
    }
    None
}
