use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("timeout waiting for sensor")]
    Timeout,
    #[error("invalid state: {0}")]
    State(String),
    #[error("unknown analyte: {0}")]
    UnknownAnalyte(String),
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing impedance probe")]
    MissingProbe,
    #[error("missing analog front-end")]
    MissingFrontEnd,
    #[error("missing EHD pump")]
    MissingPump,
    #[error("missing cartridge authority")]
    MissingCartridgeAuthority,
    #[error("missing consent authority")]
    MissingConsentAuthority,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
