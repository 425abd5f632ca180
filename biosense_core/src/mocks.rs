//! Test and helper doubles for biosense_core.
//!
//! Handles are cheap to clone and share their counters, so a test can keep a
//! clone after moving the original into the orchestrator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use biosense_traits::{AnalogFrontEnd, BoxError, ChannelSample, EhdPump, ImpedancePoint, ImpedanceProbe};

use crate::collaborators::{
    ArtifactRef, Cartridge, CartridgeAuthority, ConsentAuthority, ConsentScope, DeepAnalysisBundle,
    DeepAnalysisSink, RemoteAnalysis, RemoteAnalysisRequest, RemoteAnalyzer,
};
use crate::util::lock;

/// Probe returning a fixed point (or failing) and counting reads.
#[derive(Debug, Clone)]
pub struct FixedProbe {
    point: Option<ImpedancePoint>,
    calls: Arc<AtomicUsize>,
}

impl FixedProbe {
    pub fn new(magnitude_ohms: f32, phase_deg: f32) -> Self {
        Self {
            point: Some(ImpedancePoint {
                magnitude_ohms,
                phase_deg,
            }),
            calls: Arc::default(),
        }
    }

    pub fn unplugged() -> Self {
        Self {
            point: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ImpedanceProbe for FixedProbe {
    fn probe(&mut self, _frequency_hz: f32, _timeout: Duration) -> Result<ImpedancePoint, BoxError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.point
            .ok_or_else(|| Box::new(std::io::Error::other("probe not connected")) as BoxError)
    }
}

/// Front-end cycling through a fixed list of samples. Records routing.
#[derive(Debug, Clone)]
pub struct ScriptedFrontEnd {
    samples: Arc<Vec<ChannelSample>>,
    taken: Arc<AtomicUsize>,
    routes: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    fail_reads: Arc<AtomicBool>,
}

impl ScriptedFrontEnd {
    pub fn new(samples: Vec<ChannelSample>) -> Self {
        Self {
            samples: Arc::new(samples),
            taken: Arc::default(),
            routes: Arc::default(),
            fail_reads: Arc::default(),
        }
    }

    /// Every read returns the same sample.
    pub fn constant(a_v: f32, b_v: f32, temperature_c: f32) -> Self {
        Self::new(vec![ChannelSample {
            a_v,
            b_v,
            temperature_c,
        }])
    }

    /// Make subsequent reads fail with a timeout.
    pub fn set_failing(&self, failing: bool) {
        self.fail_reads.store(failing, Ordering::Relaxed);
    }

    pub fn samples_taken(&self) -> usize {
        self.taken.load(Ordering::Relaxed)
    }

    pub fn routes(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.routes).clone()
    }
}

impl AnalogFrontEnd for ScriptedFrontEnd {
    fn configure(&mut self, mode: &str, pins: &[u8]) -> Result<(), BoxError> {
        lock(&self.routes).push((mode.to_string(), pins.to_vec()));
        Ok(())
    }

    fn sample(&mut self, _timeout: Duration) -> Result<ChannelSample, BoxError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(Box::new(std::io::Error::other("ADC read timeout")));
        }
        let i = self.taken.fetch_add(1, Ordering::Relaxed);
        if self.samples.is_empty() {
            return Err(Box::new(std::io::Error::other("no scripted samples")));
        }
        Ok(self.samples[i % self.samples.len()])
    }
}

/// Pump recording every commanded duty; `failing()` rejects every command.
#[derive(Debug, Clone, Default)]
pub struct RecordingPump {
    duties: Arc<Mutex<Vec<u8>>>,
    stops: Arc<AtomicUsize>,
    fail: bool,
}

impl RecordingPump {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn duties(&self) -> Vec<u8> {
        lock(&self.duties).clone()
    }

    pub fn last_duty(&self) -> Option<u8> {
        lock(&self.duties).last().copied()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::Relaxed)
    }
}

impl EhdPump for RecordingPump {
    fn set_duty(&mut self, duty_pct: u8) -> Result<(), BoxError> {
        if self.fail {
            return Err(Box::new(std::io::Error::other("pump driver fault")));
        }
        lock(&self.duties).push(duty_pct);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BoxError> {
        self.stops.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// In-memory cartridge authority that decrements uses on `record_usage`.
#[derive(Debug, Clone, Default)]
pub struct StaticCartridge {
    cartridge: Arc<Mutex<Option<Cartridge>>>,
    usage_calls: Arc<AtomicUsize>,
}

impl StaticCartridge {
    pub fn new(cartridge: Cartridge) -> Self {
        Self {
            cartridge: Arc::new(Mutex::new(Some(cartridge))),
            usage_calls: Arc::default(),
        }
    }

    /// No cartridge inserted.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn replace(&self, cartridge: Option<Cartridge>) {
        *lock(&self.cartridge) = cartridge;
    }

    pub fn usage_calls(&self) -> usize {
        self.usage_calls.load(Ordering::Relaxed)
    }
}

impl CartridgeAuthority for StaticCartridge {
    fn active(&self) -> Option<Cartridge> {
        lock(&self.cartridge).clone()
    }

    fn record_usage(&self, cartridge_id: &str) -> Result<(), BoxError> {
        self.usage_calls.fetch_add(1, Ordering::Relaxed);
        let mut slot = lock(&self.cartridge);
        match slot.as_mut() {
            Some(c) if c.id == cartridge_id => {
                c.uses_remaining = c.uses_remaining.saturating_sub(1);
                Ok(())
            }
            _ => Err(Box::new(std::io::Error::other(format!(
                "cartridge {cartridge_id} not active"
            )))),
        }
    }
}

/// Consent authority with a fixed answer; counts consultations.
#[derive(Debug, Clone, Default)]
pub struct FixedConsent {
    granted: bool,
    calls: Arc<AtomicUsize>,
}

impl FixedConsent {
    pub fn allow() -> Self {
        Self {
            granted: true,
            calls: Arc::default(),
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ConsentAuthority for FixedConsent {
    fn is_granted(&self, _user: &str, _scope: ConsentScope) -> bool {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.granted
    }
}

/// Remote analyzer that answers with a fixed judgment or a fixed failure.
#[derive(Debug, Clone)]
pub struct StubRemote {
    answer: Result<RemoteAnalysis, String>,
    requests: Arc<Mutex<Vec<RemoteAnalysisRequest>>>,
}

impl StubRemote {
    pub fn answering(anomaly: bool, interpretation: Option<&str>) -> Self {
        Self {
            answer: Ok(RemoteAnalysis {
                anomaly,
                interpretation: interpretation.map(str::to_string),
            }),
            requests: Arc::default(),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            answer: Err(message.to_string()),
            requests: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requests(&self) -> Vec<RemoteAnalysisRequest> {
        lock(&self.requests).clone()
    }
}

impl RemoteAnalyzer for StubRemote {
    fn analyze(&self, request: &RemoteAnalysisRequest) -> Result<RemoteAnalysis, BoxError> {
        lock(&self.requests).push(request.clone());
        self.answer
            .clone()
            .map_err(|m| Box::new(std::io::Error::other(m)) as BoxError)
    }
}

/// Deep-analysis sink keeping bundles in memory; refs are `mem://<n>`.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    bundles: Arc<Mutex<Vec<DeepAnalysisBundle>>>,
}

impl MemoryArchive {
    pub fn bundles(&self) -> Vec<DeepAnalysisBundle> {
        lock(&self.bundles).clone()
    }
}

impl DeepAnalysisSink for MemoryArchive {
    fn submit(&self, bundle: DeepAnalysisBundle) -> Result<ArtifactRef, BoxError> {
        let mut b = lock(&self.bundles);
        b.push(bundle);
        Ok(ArtifactRef(format!("mem://{}", b.len())))
    }
}
