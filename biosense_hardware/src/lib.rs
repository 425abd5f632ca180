//! Simulated hardware backends for the biosensor reader.
//!
//! These stand in for the impedance probe, the RAFE switch matrix/ADC and the
//! EHD pump when no board is attached (CLI demos, integration tests).
pub mod error;

use biosense_traits::{
    AnalogFrontEnd, BoxError, ChannelSample, EhdPump, ImpedancePoint, ImpedanceProbe,
};
use error::HwError;

/// Simulated impedance probe returning a fixed point, or failing when unplugged.
#[derive(Debug, Clone)]
pub struct SimulatedProbe {
    point: ImpedancePoint,
    connected: bool,
}

impl SimulatedProbe {
    pub fn new(magnitude_ohms: f32, phase_deg: f32) -> Self {
        Self {
            point: ImpedancePoint {
                magnitude_ohms,
                phase_deg,
            },
            connected: true,
        }
    }

    /// A probe whose sensor is not plugged in; every read fails.
    pub fn disconnected() -> Self {
        Self {
            point: ImpedancePoint {
                magnitude_ohms: f32::NAN,
                phase_deg: f32::NAN,
            },
            connected: false,
        }
    }
}

impl ImpedanceProbe for SimulatedProbe {
    fn probe(
        &mut self,
        frequency_hz: f32,
        _timeout: std::time::Duration,
    ) -> Result<ImpedancePoint, BoxError> {
        if !self.connected {
            return Err(Box::new(HwError::NotConnected));
        }
        tracing::debug!(
            frequency_hz,
            magnitude_ohms = self.point.magnitude_ohms,
            phase_deg = self.point.phase_deg,
            "impedance probe (simulated)"
        );
        Ok(self.point)
    }
}

/// Simulated front-end producing a deterministic triangle ripple around a
/// base voltage on channel A, a flat reference on channel B, and a board
/// temperature that can drift per sample.
#[derive(Debug, Clone)]
pub struct SimulatedFrontEnd {
    base_a_v: f32,
    base_b_v: f32,
    ripple_v: f32,
    temperature_c: f32,
    temperature_step_c: f32,
    samples_taken: u32,
    mode: Option<String>,
    pins: Vec<u8>,
}

impl SimulatedFrontEnd {
    pub fn new(base_a_v: f32, base_b_v: f32, temperature_c: f32) -> Self {
        Self {
            base_a_v,
            base_b_v,
            ripple_v: 0.004,
            temperature_c,
            temperature_step_c: 0.0,
            samples_taken: 0,
            mode: None,
            pins: Vec::new(),
        }
    }

    pub fn with_ripple(mut self, ripple_v: f32) -> Self {
        self.ripple_v = ripple_v;
        self
    }

    /// Temperature added after each sample (simulates a heating board).
    pub fn with_temperature_step(mut self, step_c: f32) -> Self {
        self.temperature_step_c = step_c;
        self
    }

    pub fn samples_taken(&self) -> u32 {
        self.samples_taken
    }

    pub fn routed_mode(&self) -> Option<&str> {
        self.mode.as_deref()
    }

    pub fn routed_pins(&self) -> &[u8] {
        &self.pins
    }

    fn ripple(&self) -> f32 {
        // Period-4 triangle: 0, +1, 0, -1
        let phase = match self.samples_taken % 4 {
            1 => 1.0,
            3 => -1.0,
            _ => 0.0,
        };
        self.ripple_v * phase
    }
}

impl AnalogFrontEnd for SimulatedFrontEnd {
    fn configure(&mut self, mode: &str, pins: &[u8]) -> Result<(), BoxError> {
        tracing::debug!(mode, ?pins, "front-end routed (simulated)");
        self.mode = Some(mode.to_string());
        self.pins = pins.to_vec();
        Ok(())
    }

    fn sample(&mut self, _timeout: std::time::Duration) -> Result<ChannelSample, BoxError> {
        if self.mode.is_none() {
            return Err(Box::new(HwError::NotConfigured));
        }
        let s = ChannelSample {
            a_v: self.base_a_v + self.ripple(),
            b_v: self.base_b_v,
            temperature_c: self.temperature_c,
        };
        self.samples_taken = self.samples_taken.saturating_add(1);
        self.temperature_c += self.temperature_step_c;
        tracing::trace!(a_v = s.a_v, b_v = s.b_v, temperature_c = s.temperature_c, "sample (simulated)");
        Ok(s)
    }
}

/// Simulated EHD pump that records the commanded duty.
#[derive(Debug, Default, Clone)]
pub struct SimulatedPump {
    duty_pct: u8,
    running: bool,
}

impl SimulatedPump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty_pct(&self) -> u8 {
        self.duty_pct
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

impl EhdPump for SimulatedPump {
    fn set_duty(&mut self, duty_pct: u8) -> Result<(), BoxError> {
        if duty_pct > 100 {
            return Err(Box::new(HwError::PumpFault(format!(
                "duty {duty_pct}% out of range"
            ))));
        }
        self.duty_pct = duty_pct;
        self.running = duty_pct > 0;
        tracing::debug!(duty_pct, "pump duty set (simulated)");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BoxError> {
        self.duty_pct = 0;
        self.running = false;
        tracing::debug!("pump stopped (simulated)");
        Ok(())
    }
}
