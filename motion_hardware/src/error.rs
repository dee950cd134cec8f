use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("pwm channel {0} out of range")]
    ChannelOutOfRange(usize),
    #[error("pulse counter unit {0} out of range")]
    UnitOutOfRange(usize),
    #[error("pulse counter unit {0} not enabled")]
    UnitDisabled(usize),
    #[error("injected fault: {0}")]
    Injected(String),
    #[error("timeout")]
    Timeout,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
