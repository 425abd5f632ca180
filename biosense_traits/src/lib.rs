//! Capability traits for the biosensor reader hardware.
//!
//! The control core never touches pins directly; every physical read or write
//! goes through one of these traits. Errors cross the boundary as
//! `Box<dyn Error + Send + Sync>` and are mapped to typed errors by the core.

pub mod clock;

pub use clock::{Clock, MonotonicClock, TestClock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One complex-impedance point returned by the probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedancePoint {
    pub magnitude_ohms: f32,
    /// Phase angle in degrees; negative values are capacitive.
    pub phase_deg: f32,
}

/// One dual-channel voltage sample with the board temperature at capture time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    pub a_v: f32,
    pub b_v: f32,
    pub temperature_c: f32,
}

/// Quick impedance probe used to decide what the sensor is touching.
pub trait ImpedanceProbe {
    fn probe(
        &mut self,
        frequency_hz: f32,
        timeout: std::time::Duration,
    ) -> Result<ImpedancePoint, BoxError>;
}

/// Reconfigurable analog front-end: switch-matrix routing plus the sampling ADC.
pub trait AnalogFrontEnd {
    /// Route the given physical pins for the named operating mode.
    fn configure(&mut self, mode: &str, pins: &[u8]) -> Result<(), BoxError>;
    fn sample(&mut self, timeout: std::time::Duration) -> Result<ChannelSample, BoxError>;
}

/// Electrohydrodynamic sample-collection pump.
pub trait EhdPump {
    fn set_duty(&mut self, duty_pct: u8) -> Result<(), BoxError>;
    fn stop(&mut self) -> Result<(), BoxError>;
}
