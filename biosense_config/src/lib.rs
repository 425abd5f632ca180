#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and cartridge calibration parsing for the biosensor reader.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Calibration CSV loader enforces headers and performs a robust refit
//!   to reduce outlier influence before gain/offset estimation.
use serde::Deserialize;

/// Cartridge calibration CSV schema.
///
/// Expected headers:
/// raw_v,reference_v
///
/// Each row pairs a raw differential voltage read by the device with the
/// voltage a reference instrument reported for the same standard solution.
///
/// Example:
/// raw_v,reference_v
/// 0.120,0.100
/// 0.620,0.600
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CalibrationRow {
    pub raw_v: f64,
    pub reference_v: f64,
}

#[derive(Debug, Deserialize)]
pub struct Device {
    /// Stable device identifier used in remote-analysis signatures.
    pub id: String,
    /// Analyte selected on the RAFE at session start.
    #[serde(default = "default_analyte")]
    pub default_analyte: String,
}

fn default_analyte() -> String {
    "glucose".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClassifierCfg {
    pub probe_frequency_hz: f32,
    pub probe_timeout_ms: u64,
    pub open_air_min_ohms: f32,
    pub open_air_max_phase_deg: f32,
    pub liquid_max_ohms: f32,
    /// Capacitive phase window for liquid contact (degrees, negative = capacitive).
    pub capacitive_phase_min_deg: f32,
    pub capacitive_phase_max_deg: f32,
    pub hydrogel_min_ohms: f32,
    pub hydrogel_max_ohms: f32,
    /// Relative tolerance around a cartridge's gel baseline (0.25 = ±25 %).
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

#[derive(Debug, Deserialize)]
#[serde(default)]
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SamplingCfg {
    /// Samples per raw burst.
    pub burst_len: usize,
    pub sample_rate_hz: u32,
    /// Per-read timeout (ms). Also accepts alias "sample_ms".
    #[serde(alias = "sample_ms")]
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FilterCfg {
    pub process_noise_q: f32,
    pub measurement_noise_r: f32,
}

impl Default for FilterCfg {
    fn default() -> Self {
        Self {
            process_noise_q: 0.0008,
            measurement_noise_r: 0.0009,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AnomalyCfg {
    pub min_temperature_c: f32,
    pub max_temperature_c: f32,
    /// Hard ceiling for a plausible concentration (mmol/L).
    pub max_concentration: f32,
    /// Sane band for the filter estimate (volts).
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Safety {
    /// Trip the fail-safe lock above this board temperature.
    pub max_temperature_c: f32,
    /// Trip the fail-safe lock above this absolute channel voltage.
    pub max_channel_voltage: f32,
}

impl Default for Safety {
    fn default() -> Self {
        Self {
            max_temperature_c: 60.0,
            max_channel_voltage: 5.0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StabilizationCfg {
    /// Solid-contact settle window.
    pub hold_ms: u64,
    /// Cancellation poll interval while holding.
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

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    High,
    Low,
}

/// Cartridge description used by the CLI's in-memory cartridge authority.
#[derive(Debug, Deserialize, Clone)]
pub struct CartridgeCfg {
    pub id: String,
    pub uses_remaining: u32,
    #[serde(default)]
    pub offset_v: f32,
    #[serde(default = "default_gain")]
    pub gain: f32,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_uncertainty_pct")]
    pub uncertainty_pct: f32,
    #[serde(default)]
    pub gel_baseline_ohms: Option<f32>,
    #[serde(default)]
    pub offline_fallback: bool,
}

fn default_gain() -> f32 {
    1.0
}

fn default_uncertainty_pct() -> f32 {
    5.0
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ConsentCfg {
    /// Whether the session user granted the "Research" scope.
    pub research: bool,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub device: Device,
    #[serde(default)]
    pub classifier: ClassifierCfg,
    #[serde(default)]
    pub ehd: EhdCfg,
    #[serde(default)]
    pub sampling: SamplingCfg,
    #[serde(default)]
    pub filter: FilterCfg,
    #[serde(default)]
    pub anomaly: AnomalyCfg,
    #[serde(default)]
    pub safety: Safety,
    #[serde(default)]
    pub stabilization: StabilizationCfg,
    #[serde(default)]
    pub logging: Logging,
    /// Optional inserted cartridge; absent means every measurement is blocked.
    #[serde(default)]
    pub cartridge: Option<CartridgeCfg>,
    #[serde(default)]
    pub consent: ConsentCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Gain/offset fitted from reference rows: `reference_v = gain * (raw_v - offset_v)`.
#[derive(Debug, Clone, Copy)]
pub struct Calibration {
    pub offset_v: f32,
    pub gain: f32,
    /// RMS residual of the initial fit (volts).
    pub rms_residual_v: f32,
    /// Rows kept after outlier rejection.
    pub inliers: usize,
}

impl Calibration {
    /// Build Calibration from reference rows using ordinary least squares on all points.
    /// Fits reference = a*raw + b, then converts to core form reference = a*(raw - offset),
    /// where offset = -b/a is the raw voltage that reads as zero.
    pub fn from_rows(rows: Vec<CalibrationRow>) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("calibration requires at least two rows, got {}", rows.len());
        }
        if let Some(i) = rows
            .iter()
            .position(|r| !r.raw_v.is_finite() || !r.reference_v.is_finite())
        {
            eyre::bail!("calibration row {} contains a non-finite value", i);
        }

        // Ensure strictly monotonic raw values (increasing or decreasing), no duplicates
        let mut dir: i8 = 0; // 1 for increasing, -1 for decreasing
        for i in 1..rows.len() {
            let d = rows[i].raw_v - rows[i - 1].raw_v;
            if d == 0.0 {
                eyre::bail!(
                    "calibration rows have duplicate raw values at index {} and {}",
                    i - 1,
                    i
                );
            }
            let step_dir = if d > 0.0 { 1 } else { -1 };
            if dir == 0 {
                dir = step_dir;
            } else if dir != step_dir {
                eyre::bail!(
                    "calibration raw values must be monotonic (strictly increasing or strictly decreasing)"
                );
            }
        }

        let pts: Vec<(f64, f64)> = rows.iter().map(|r| (r.raw_v, r.reference_v)).collect();
        let (a0, b0) = ols_fit(&pts)?;
        let sumsq: f64 = pts
            .iter()
            .map(|(x, y)| {
                let r = y - (a0 * x + b0);
                r * r
            })
            .sum();
        let rms = (sumsq / pts.len() as f64).sqrt();

        // Reject outliers with |residual| > 2σ and refit if at least 2 remain.
        // An exact fit leaves only rounding noise in the residuals; skip the refit.
        let (a, b, inliers) = if rms > EXACT_FIT_RMS_V {
            robust_refit(&pts, a0, b0, rms, 2.0).unwrap_or((a0, b0, pts.len()))
        } else {
            (a0, b0, pts.len())
        };

        let offset_v = (-b / a) as f32;
        let gain = a as f32;
        if !offset_v.is_finite() {
            eyre::bail!("calibration produced invalid zero offset");
        }
        if !gain.is_finite() || gain == 0.0 {
            eyre::bail!("calibration gain out of range");
        }

        Ok(Calibration {
            offset_v,
            gain,
            rms_residual_v: rms as f32,
            inliers,
        })
    }
}

/// Residual RMS below which a fit is treated as exact (volts).
const EXACT_FIT_RMS_V: f64 = 1e-9;

/// Ordinary least squares in f64: returns (slope, intercept).
fn ols_fit(pts: &[(f64, f64)]) -> eyre::Result<(f64, f64)> {
    let n = pts.len() as f64;
    let mean_x = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pts.iter().map(|p| p.1).sum::<f64>() / n;
    let mut sxx = 0.0f64;
    let mut sxy = 0.0f64;
    for (x, y) in pts {
        let dx = x - mean_x;
        sxx += dx * dx;
        sxy += dx * (y - mean_y);
    }
    if !sxx.is_finite() || sxx == 0.0 {
        eyre::bail!("calibration cannot determine gain (degenerate raw variance)");
    }
    let a = sxy / sxx;
    if !a.is_finite() {
        eyre::bail!("calibration produced non-finite gain");
    }
    if a == 0.0 {
        eyre::bail!("calibration produced zero slope (invalid gain)");
    }
    Ok((a, mean_y - a * mean_x))
}

/// Single-step robust refit: drop points with |residual| > k * rms around the
/// initial line, then refit inliers with an online (Welford/Chan) covariance
/// update. Returns None when the refit does not apply (no outliers, < 2
/// inliers, degenerate variance); the caller then keeps the initial fit.
fn robust_refit(pts: &[(f64, f64)], a0: f64, b0: f64, rms: f64, k: f64) -> Option<(f64, f64, usize)> {
    if !(rms.is_finite() && rms > 0.0 && k.is_finite() && k > 0.0) {
        return None;
    }
    let thr = k * rms;
    let mut n_in: usize = 0;
    let mut mean_x = 0.0f64;
    let mut mean_y = 0.0f64;
    let mut cxx = 0.0f64;
    let mut cxy = 0.0f64;

    for &(x, y) in pts {
        if (y - (a0 * x + b0)).abs() > thr {
            continue;
        }
        n_in += 1;
        let n_new = n_in as f64;
        let dx = x - mean_x;
        let dy = y - mean_y;
        let mean_x_new = mean_x + dx / n_new;
        let mean_y_new = mean_y + dy / n_new;
        cxx += dx * (x - mean_x_new);
        cxy += dx * (y - mean_y_new);
        mean_x = mean_x_new;
        mean_y = mean_y_new;
    }

    if n_in < 2 || n_in == pts.len() || !cxx.is_finite() || cxx == 0.0 {
        return None;
    }
    let a = cxy / cxx;
    if !a.is_finite() || a == 0.0 {
        return None;
    }
    Some((a, mean_y - a * mean_x, n_in))
}

impl TryFrom<Vec<CalibrationRow>> for Calibration {
    type Error = eyre::Report;
    fn try_from(rows: Vec<CalibrationRow>) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

pub fn load_calibration_csv(path: &std::path::Path) -> eyre::Result<Calibration> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open calibration CSV {:?}: {}", path, e))?;

    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["raw_v", "reference_v"];
    let actual: Vec<String> = headers.iter().map(|s| s.trim().to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "calibration CSV must have headers 'raw_v,reference_v', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<CalibrationRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    Calibration::try_from(rows)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Device
        if self.device.id.trim().is_empty() {
            eyre::bail!("device.id must not be empty");
        }
        if self.device.default_analyte.trim().is_empty() {
            eyre::bail!("device.default_analyte must not be empty");
        }

        // Classifier
        let c = &self.classifier;
        if !(c.probe_frequency_hz > 0.0) {
            eyre::bail!("classifier.probe_frequency_hz must be > 0");
        }
        if c.probe_timeout_ms == 0 {
            eyre::bail!("classifier.probe_timeout_ms must be >= 1");
        }
        if !(c.liquid_max_ohms > 0.0) {
            eyre::bail!("classifier.liquid_max_ohms must be > 0");
        }
        if !(c.hydrogel_min_ohms > c.liquid_max_ohms) {
            eyre::bail!("classifier.hydrogel_min_ohms must be > classifier.liquid_max_ohms");
        }
        if !(c.hydrogel_max_ohms > c.hydrogel_min_ohms) {
            eyre::bail!("classifier.hydrogel_max_ohms must be > classifier.hydrogel_min_ohms");
        }
        if !(c.open_air_min_ohms > c.hydrogel_max_ohms) {
            eyre::bail!("classifier.open_air_min_ohms must be > classifier.hydrogel_max_ohms");
        }
        if !(c.open_air_max_phase_deg >= 0.0) {
            eyre::bail!("classifier.open_air_max_phase_deg must be >= 0");
        }
        if !(c.capacitive_phase_min_deg < c.capacitive_phase_max_deg
            && c.capacitive_phase_max_deg <= 0.0)
        {
            eyre::bail!(
                "classifier capacitive phase window must satisfy min < max <= 0 degrees"
            );
        }
        if !(c.gel_baseline_tolerance > 0.0 && c.gel_baseline_tolerance < 1.0) {
            eyre::bail!("classifier.gel_baseline_tolerance must be in (0.0, 1.0)");
        }

        // EHD
        let e = &self.ehd;
        if e.high_duty_pct > 100 {
            eyre::bail!("ehd.high_duty_pct must be <= 100");
        }
        if !(e.low_duty_pct <= e.med_duty_pct && e.med_duty_pct <= e.high_duty_pct) {
            eyre::bail!("ehd duties must satisfy low <= med <= high");
        }
        if e.manual_override_window_ms > 60 * 60 * 1000 {
            eyre::bail!("ehd.manual_override_window_ms is unreasonably large (>1h)");
        }

        // Sampling
        if self.sampling.burst_len == 0 {
            eyre::bail!("sampling.burst_len must be >= 1");
        }
        if self.sampling.burst_len > 4096 {
            eyre::bail!("sampling.burst_len is unreasonably large (>4096)");
        }
        if self.sampling.sample_rate_hz == 0 {
            eyre::bail!("sampling.sample_rate_hz must be > 0");
        }
        if self.sampling.sensor_timeout_ms == 0 {
            eyre::bail!("sampling.sensor_timeout_ms must be >= 1");
        }

        // Filter
        if !(self.filter.process_noise_q >= 0.0 && self.filter.process_noise_q.is_finite()) {
            eyre::bail!("filter.process_noise_q must be >= 0");
        }
        if !(self.filter.measurement_noise_r > 0.0 && self.filter.measurement_noise_r.is_finite())
        {
            eyre::bail!("filter.measurement_noise_r must be > 0");
        }

        // Anomaly
        let a = &self.anomaly;
        if !(a.min_temperature_c < a.max_temperature_c) {
            eyre::bail!("anomaly.min_temperature_c must be < anomaly.max_temperature_c");
        }
        if !(a.max_concentration > 0.0) {
            eyre::bail!("anomaly.max_concentration must be > 0");
        }
        if !(a.min_filter_voltage < a.max_filter_voltage) {
            eyre::bail!("anomaly.min_filter_voltage must be < anomaly.max_filter_voltage");
        }

        // Safety
        if !(self.safety.max_temperature_c > a.max_temperature_c) {
            eyre::bail!("safety.max_temperature_c must be above anomaly.max_temperature_c");
        }
        if !(self.safety.max_channel_voltage > 0.0) {
            eyre::bail!("safety.max_channel_voltage must be > 0");
        }

        // Stabilization
        if self.stabilization.poll_ms == 0 {
            eyre::bail!("stabilization.poll_ms must be >= 1");
        }
        if self.stabilization.hold_ms > 60_000 {
            eyre::bail!("stabilization.hold_ms is unreasonably large (>60s)");
        }

        // Cartridge
        if let Some(cart) = &self.cartridge {
            if cart.id.trim().is_empty() {
                eyre::bail!("cartridge.id must not be empty");
            }
            if !(cart.gain.is_finite() && cart.gain != 0.0) {
                eyre::bail!("cartridge.gain must be finite and non-zero");
            }
            if !(0.0..=100.0).contains(&cart.uncertainty_pct) {
                eyre::bail!("cartridge.uncertainty_pct must be in [0, 100]");
            }
            if let Some(b) = cart.gel_baseline_ohms
                && !(b > 0.0)
            {
                eyre::bail!("cartridge.gel_baseline_ohms must be > 0");
            }
        }

        Ok(())
    }
}
