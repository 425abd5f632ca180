//! Interfaces the core consumes but does not implement.

use biosense_traits::BoxError;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::calibration::CalibrationParameters;
use crate::rafe::PinAssignment;

/// Identity, remaining uses and calibration of the inserted cartridge.
#[derive(Debug, Clone, PartialEq)]
pub struct Cartridge {
    pub id: String,
    pub uses_remaining: u32,
    pub calibration: CalibrationParameters,
}

pub trait CartridgeAuthority: Send + Sync {
    /// The currently authenticated cartridge, if any.
    fn active(&self) -> Option<Cartridge>;
    /// Called once per produced measurement.
    fn record_usage(&self, cartridge_id: &str) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsentScope {
    Research,
}

impl std::fmt::Display for ConsentScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsentScope::Research => f.write_str("Research"),
        }
    }
}

pub trait ConsentAuthority: Send + Sync {
    fn is_granted(&self, user: &str, scope: ConsentScope) -> bool;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteAnalysisRequest {
    /// (channel A, channel B) volts per sample.
    pub raw_pairs: Vec<(f32, f32)>,
    pub temperature_c: f32,
    pub cartridge_id: String,
    pub device_signature: String,
}

/// Enriched judgment returned by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteAnalysis {
    pub anomaly: bool,
    pub interpretation: Option<String>,
}

pub trait RemoteAnalyzer: Send + Sync {
    fn analyze(&self, request: &RemoteAnalysisRequest) -> Result<RemoteAnalysis, BoxError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Environment {
    pub temperature_c: f32,
    pub humidity_pct: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RafeConfiguration {
    pub analyte: String,
    pub mode: String,
    pub pins: Vec<PinAssignment>,
}

/// Archival bundle handed to the deep-analysis sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeepAnalysisBundle {
    pub measurement_id: uuid::Uuid,
    pub concentration: f32,
    pub recovered_voltage: f32,
    pub raw_pairs: Vec<(f32, f32)>,
    pub environment: Environment,
    pub calibration: CalibrationParameters,
    pub rafe: RafeConfiguration,
    pub interpretation: Option<String>,
}

pub trait DeepAnalysisSink: Send + Sync {
    fn submit(&self, bundle: DeepAnalysisBundle) -> Result<ArtifactRef, BoxError>;
}

/// Hex SHA-256 over device id, cartridge id and the raw pairs.
pub fn device_signature(device_id: &str, cartridge_id: &str, raw_pairs: &[(f32, f32)]) -> String {
    let mut h = Sha256::new();
    h.update(device_id.as_bytes());
    h.update([0u8]);
    h.update(cartridge_id.as_bytes());
    h.update([0u8]);
    for (a, b) in raw_pairs {
        h.update(a.to_le_bytes());
        h.update(b.to_le_bytes());
    }
    h.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_and_input_sensitive() {
        let pairs = [(0.4, 0.1), (0.41, 0.1)];
        let a = device_signature("dev-1", "CART-1", &pairs);
        assert_eq!(a.len(), 64);
        assert_eq!(a, device_signature("dev-1", "CART-1", &pairs));
        assert_ne!(a, device_signature("dev-1", "CART-2", &pairs));
        assert_ne!(a, device_signature("dev-1", "CART-1", &pairs[..1]));
    }
}
