use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MotionError {
    #[error("hardware error: {0}")]
    Hardware(String),
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    #[error("timeout waiting for hardware")]
    Timeout,
    #[error("invalid motor id {0}")]
    InvalidMotor(u8),
    #[error("event queue closed")]
    QueueClosed,
    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing pwm output")]
    MissingOutput,
    #[error("missing pulse counter")]
    MissingPulseCounter,
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
