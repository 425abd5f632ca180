use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("bus error: {0}")]
    Bus(String),
    #[error("sensor timeout")]
    Timeout,
    #[error("impedance probe not connected")]
    NotConnected,
    #[error("front-end not configured for any mode")]
    NotConfigured,
    #[error("pump fault: {0}")]
    PumpFault(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
