//! Measurement records and the tagged outcome of one cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::calibration::Anomaly;
use crate::classifier::ContactMedium;
use crate::collaborators::{ArtifactRef, RemoteAnalysis};
use crate::rafe::RafeMode;

/// One dual-channel sample. `at_ms` is relative to the session epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RawSample {
    pub a_v: f32,
    pub b_v: f32,
    pub temperature_c: f32,
    pub at_ms: u64,
}

impl RawSample {
    /// Differential voltage fed to the filter.
    #[inline]
    pub fn differential_v(&self) -> f32 {
        self.a_v - self.b_v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementSource {
    /// Local pipeline, plus the remote judgment when it was requested and answered.
    Primary,
    /// Remote analysis was requested but failed; local result only.
    Fallback,
}

/// Non-error conditions attached to a measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    ConsentBlocked,
    RemoteAnalysisUnavailable { reason: String },
    ClassificationUncertain { reason: String },
    StabilizationCancelled { held_ms: u64 },
    ModeSwitchRejected { requested: String, lock_reason: String },
    SuctionSkipped { reason: String },
    LowPrecisionTier,
    OfflineCalibration,
    UsageNotRecorded { reason: String },
    ArchiveUnavailable { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
    NoCartridge,
    CartridgeExpended { cartridge_id: String },
    FailSafeLocked { reason: String },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::NoCartridge => f.write_str("no valid cartridge"),
            BlockReason::CartridgeExpended { cartridge_id } => {
                write!(f, "cartridge {cartridge_id} has no uses remaining")
            }
            BlockReason::FailSafeLocked { reason } => write!(f, "fail-safe locked: {reason}"),
        }
    }
}

/// Immutable record of one completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    id: Uuid,
    timestamp: DateTime<Utc>,
    cartridge_id: String,
    analyte: String,
    mode: RafeMode,
    medium: ContactMedium,
    concentration: f32,
    calibrated_voltage: f32,
    filtered_voltage: f32,
    raw: Vec<RawSample>,
    temperature_c: f32,
    uncertainty_pct: f32,
    anomaly: Option<Anomaly>,
    remote: Option<RemoteAnalysis>,
    source: MeasurementSource,
    advisories: Vec<Advisory>,
    artifact: Option<ArtifactRef>,
}

/// Field bundle for `Measurement::new`; only the orchestrator builds these.
#[derive(Debug)]
pub(crate) struct MeasurementParts {
    pub id: Uuid,
    pub cartridge_id: String,
    pub analyte: String,
    pub mode: RafeMode,
    pub medium: ContactMedium,
    pub concentration: f32,
    pub calibrated_voltage: f32,
    pub filtered_voltage: f32,
    pub raw: Vec<RawSample>,
    pub temperature_c: f32,
    pub uncertainty_pct: f32,
    pub anomaly: Option<Anomaly>,
    pub remote: Option<RemoteAnalysis>,
    pub source: MeasurementSource,
    pub advisories: Vec<Advisory>,
    pub artifact: Option<ArtifactRef>,
}

impl Measurement {
    pub(crate) fn new(p: MeasurementParts) -> Self {
        Self {
            id: p.id,
            timestamp: Utc::now(),
            cartridge_id: p.cartridge_id,
            analyte: p.analyte,
            mode: p.mode,
            medium: p.medium,
            concentration: p.concentration,
            calibrated_voltage: p.calibrated_voltage,
            filtered_voltage: p.filtered_voltage,
            raw: p.raw,
            temperature_c: p.temperature_c,
            uncertainty_pct: p.uncertainty_pct,
            anomaly: p.anomaly,
            remote: p.remote,
            source: p.source,
            advisories: p.advisories,
            artifact: p.artifact,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
    pub fn cartridge_id(&self) -> &str {
        &self.cartridge_id
    }
    pub fn analyte(&self) -> &str {
        &self.analyte
    }
    pub fn mode(&self) -> RafeMode {
        self.mode
    }
    pub fn medium(&self) -> ContactMedium {
        self.medium
    }
    pub fn concentration(&self) -> f32 {
        self.concentration
    }
    pub fn calibrated_voltage(&self) -> f32 {
        self.calibrated_voltage
    }
    /// Kalman estimate after this burst (volts, pre-calibration).
    pub fn filtered_voltage(&self) -> f32 {
        self.filtered_voltage
    }
    pub fn raw(&self) -> &[RawSample] {
        &self.raw
    }
    /// Mean burst temperature.
    pub fn temperature_c(&self) -> f32 {
        self.temperature_c
    }
    pub fn uncertainty_pct(&self) -> f32 {
        self.uncertainty_pct
    }
    pub fn anomaly(&self) -> Option<&Anomaly> {
        self.anomaly.as_ref()
    }
    pub fn remote(&self) -> Option<&RemoteAnalysis> {
        self.remote.as_ref()
    }
    pub fn source(&self) -> MeasurementSource {
        self.source
    }
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }
    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    /// Local sanity check failed or the remote service flagged the sample.
    pub fn is_anomalous(&self) -> bool {
        self.anomaly.is_some() || self.remote.as_ref().is_some_and(|r| r.anomaly)
    }

    pub fn has_advisory(&self, pred: impl Fn(&Advisory) -> bool) -> bool {
        self.advisories.iter().any(pred)
    }
}

/// Tagged result of `Orchestrator::measure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MeasurementOutcome {
    Completed { measurement: Box<Measurement> },
    Blocked { reason: BlockReason },
    FailSafeTripped { reason: String },
    /// Another cycle is in flight; this request was rejected, not queued.
    Busy,
}

impl MeasurementOutcome {
    pub fn measurement(&self) -> Option<&Measurement> {
        match self {
            MeasurementOutcome::Completed { measurement } => Some(measurement),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MeasurementOutcome::Completed { .. } => "completed",
            MeasurementOutcome::Blocked { .. } => "blocked",
            MeasurementOutcome::FailSafeTripped { .. } => "fail_safe_tripped",
            MeasurementOutcome::Busy => "busy",
        }
    }
}
