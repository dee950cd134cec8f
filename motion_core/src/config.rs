//! Runtime configuration for the motion core.
//!
//! These are the structs the core runs on. The TOML schema lives in
//! `motion_config`; see `conversions` for the mapping.

pub use motion_config::TickMode;

/// Encoder timing and counter settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncoderCfg {
    /// Edges closer than this to the previous accepted edge are dropped (µs).
    pub debounce_us: i64,
    /// Speed reads 0 when the last edge is older than this (µs).
    pub max_period_us: i64,
    /// Intervals shorter than this are implausible and read as 0 speed (µs).
    pub min_period_us: i64,
    /// `speed()` divides ticks/s by this factor.
    pub ticks_per_rev: f32,
    /// Counter value at which the hardware wraps up to zero.
    pub counter_high_limit: i32,
    /// Counter value at which the hardware wraps down to zero.
    pub counter_low_limit: i32,
}

impl Default for EncoderCfg {
    fn default() -> Self {
        Self {
            debounce_us: 20,
            max_period_us: 100_000,
            min_period_us: 1_000,
            ticks_per_rev: 1.0,
            counter_high_limit: i32::from(i16::MAX),
            counter_low_limit: i32::from(i16::MIN),
        }
    }
}

/// PID defaults applied to every motor regulator, plus the shared tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegulatorCfg {
    pub tick_ms: u64,
    pub mode: TickMode,
    pub p: f32,
    pub s: f32,
    pub d: f32,
    pub max_output: f32,
    pub zero_threshold: f32,
    pub integral_bleed_coef: f32,
}

impl Default for RegulatorCfg {
    fn default() -> Self {
        Self {
            tick_ms: 10,
            mode: TickMode::Thread,
            p: 4.0,
            s: 0.2,
            d: 0.05,
            max_output: 100.0,
            zero_threshold: 2.0,
            integral_bleed_coef: 1.0,
        }
    }
}

/// Motion profile defaults for every motor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelCfg {
    pub acceleration: f32,
    pub pos_threshold: f32,
}

impl Default for WheelCfg {
    fn default() -> Self {
        Self {
            acceleration: 2000.0,
            pos_threshold: 2.0,
        }
    }
}

/// Output channel pair of one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorChannels {
    pub forward: usize,
    pub reverse: usize,
    /// Swap the meaning of positive and negative power.
    pub inverted: bool,
}

impl MotorChannels {
    pub const fn new(forward: usize, reverse: usize) -> Self {
        Self {
            forward,
            reverse,
            inverted: false,
        }
    }
}

/// Number of motors on the default board layout.
pub const DEFAULT_MOTORS: usize = 8;

/// Dispatcher, queue and fail-safe settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerCfg {
    pub queue_capacity: usize,
    /// Fail-safe grace period (ms).
    pub failsafe_ms: u64,
    pub failsafe_enabled: bool,
    /// Pause between enqueue attempts on a full queue (ms).
    pub queue_retry_ms: u64,
    /// Attempts before backpressure is reported.
    pub queue_retry_warn: u32,
    /// Duty value for 100 %.
    pub pwm_resolution: u16,
    /// One entry per motor, indexed by `MotorId`.
    pub motors: Vec<MotorChannels>,
}

impl Default for ManagerCfg {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            failsafe_ms: 300,
            failsafe_enabled: true,
            queue_retry_ms: 1,
            queue_retry_warn: 100,
            pwm_resolution: 100,
            motors: default_channel_map(DEFAULT_MOTORS),
        }
    }
}

/// Motor `i` on channels `(2i, 2i + 1)`.
pub fn default_channel_map(motors: usize) -> Vec<MotorChannels> {
    (0..motors)
        .map(|i| MotorChannels::new(2 * i, 2 * i + 1))
        .collect()
}
