#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Measurement-control core for a portable electrochemical/impedance
//! biosensor reader (hardware-agnostic).
//!
//! All hardware interactions go through the `biosense_traits` capability
//! traits: `ImpedanceProbe`, `AnalogFrontEnd` and `EhdPump`.
//!
//! ## Architecture
//!
//! - **Calibration & Kalman**: scalar filter, offset/gain, anomaly checks (`calibration`)
//! - **Classifier**: contact medium from one impedance probe (`classifier`)
//! - **RAFE**: analyte → mode → pins, mode lock, subscribers (`rafe`)
//! - **EHD**: suction level policy with manual-override guard (`ehd`)
//! - **Fail-safe**: global telemetry lock, support-only clear (`failsafe`)
//! - **Orchestrator**: one atomic measurement cycle (`orchestrator`, `builder`)
//!
//! External collaborators (cartridge, consent, remote analysis, archive) are
//! traits in `collaborators`; observers receive `events::ControlEvent`s.

pub mod builder;
pub mod calibration;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod conversions;
pub mod ehd;
pub mod error;
pub mod events;
pub mod failsafe;
pub mod hw_error;
pub mod mocks;
pub mod orchestrator;
pub mod rafe;
pub mod status;
pub mod util;

pub use builder::{Missing, OrchestratorBuilder, Set};
pub use calibration::{
    CalibratedVoltage, CalibrationParameters, KalmanState, PrecisionTier, apply_calibration,
    concentration_from_voltage, kalman_update,
};
pub use classifier::{Classification, ContactMedium, ImpedanceReading, classify, probe_and_classify};
pub use collaborators::{
    ArtifactRef, Cartridge, CartridgeAuthority, ConsentAuthority, ConsentScope, DeepAnalysisBundle,
    DeepAnalysisSink, RemoteAnalysis, RemoteAnalysisRequest, RemoteAnalyzer,
};
pub use config::{
    AnomalyCfg, ClassifierCfg, EhdCfg, FilterCfg, SafetyCfg, SamplingCfg, StabilizationCfg,
};
pub use ehd::{EhdFault, EhdPolicy, EhdState, SkipReason, SuctionDecision, SuctionLevel};
pub use error::{BuildError, CoreError, Result};
pub use events::{ChannelSink, ControlEvent, EventSink, NullSink};
pub use failsafe::{FailSafeLock, FailSafeManager, SupportAccess, Telemetry};
pub use hw_error::map_hw_error;
pub use orchestrator::{HoldCancel, Orchestrator, SessionStats, SessionSummary};
pub use rafe::{PinAssignment, PinRole, RafeController, RafeMode, RafeState, SubscriptionId};
pub use status::{Advisory, BlockReason, Measurement, MeasurementOutcome, MeasurementSource, RawSample};
