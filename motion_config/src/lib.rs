#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema for the motion core.
//!
//! Every section is optional; missing fields fall back to the defaults the
//! board ships with. `Config::validate()` rejects values the runtime cannot
//! honor.
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ManagerCfg {
    /// Depth of the event queue between interrupt/task producers and the dispatcher.
    pub queue_capacity: usize,
    /// Grace period without a motor update before all motors are stopped (ms).
    pub failsafe_ms: u64,
    /// Install the fail-safe watchdog at all.
    pub failsafe: bool,
    /// Sleep between enqueue attempts while the queue is full (ms).
    pub queue_retry_ms: u64,
    /// Retries before a backpressure warning is logged.
    pub queue_retry_warn: u32,
    /// Duty value corresponding to 100 % on a channel.
    pub pwm_resolution: u16,
}

impl Default for ManagerCfg {
    fn default() -> Self {
        Self {
            queue_capacity: 32,
            failsafe_ms: 300,
            failsafe: true,
            queue_retry_ms: 1,
            queue_retry_warn: 100,
            pwm_resolution: 100,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EncoderCfg {
    /// Edges closer than this to the previous one are treated as noise (µs).
    pub debounce_us: i64,
    /// No edge for this long means the wheel stands still (µs).
    pub max_period_us: i64,
    /// Edge intervals shorter than this are implausible and read as 0 speed (µs).
    pub min_period_us: i64,
    /// Speed normalization factor.
    pub ticks_per_rev: f32,
    pub counter_high_limit: i16,
    pub counter_low_limit: i16,
}

impl Default for EncoderCfg {
    fn default() -> Self {
        Self {
            debounce_us: 20,
            max_period_us: 100_000,
            min_period_us: 1_000,
            ticks_per_rev: 1.0,
            counter_high_limit: i16::MAX,
            counter_low_limit: i16::MIN,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// A background thread runs the regulators at `tick_ms`.
    #[default]
    Thread,
    /// The application calls `RegulatorDriver::tick()` itself.
    Manual,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RegulatorCfg {
    pub tick_ms: u64,
    pub mode: TickMode,
    pub p: f32,
    pub s: f32,
    pub d: f32,
    /// Output clamp, in motor power units (0, 100].
    pub max_output: f32,
    /// Errors at or below this magnitude count as zero (ticks).
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

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WheelCfg {
    /// ticks/s²
    pub acceleration: f32,
    /// Distance to target at which the on-target callback fires (ticks).
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
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct MotorChannels {
    pub forward: usize,
    pub reverse: usize,
    #[serde(default)]
    pub inverted: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    /// Filter directive, e.g. "info" or "motion_core=debug".
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerCfg,
    pub encoder: EncoderCfg,
    pub regulator: RegulatorCfg,
    pub wheel: WheelCfg,
    /// Channel map, one entry per motor. Empty means 8 motors on channels
    /// (0,1), (2,3), ... (14,15).
    pub motors: Vec<MotorChannels>,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and validate a config file.
pub fn load_file(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("read config {:?}: {}", path, e))?;
    let cfg = load_toml(&text).map_err(|e| eyre::eyre!("parse config {:?}: {}", path, e))?;
    cfg.validate()?;
    Ok(cfg)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Manager
        if self.manager.queue_capacity == 0 {
            eyre::bail!("manager.queue_capacity must be >= 1");
        }
        if self.manager.failsafe_ms == 0 {
            eyre::bail!("manager.failsafe_ms must be >= 1");
        }
        if self.manager.failsafe_ms > 60 * 1000 {
            eyre::bail!("manager.failsafe_ms is unreasonably large (>60s)");
        }
        if self.manager.pwm_resolution == 0 {
            eyre::bail!("manager.pwm_resolution must be >= 1");
        }

        // Encoder
        if self.encoder.debounce_us < 0 {
            eyre::bail!("encoder.debounce_us must be >= 0");
        }
        if self.encoder.min_period_us < 0 || self.encoder.min_period_us >= self.encoder.max_period_us
        {
            eyre::bail!("encoder.min_period_us must be in [0, max_period_us)");
        }
        if !(self.encoder.ticks_per_rev.is_finite() && self.encoder.ticks_per_rev > 0.0) {
            eyre::bail!("encoder.ticks_per_rev must be > 0");
        }
        if self.encoder.counter_high_limit <= 0 {
            eyre::bail!("encoder.counter_high_limit must be > 0");
        }
        if self.encoder.counter_low_limit >= 0 {
            eyre::bail!("encoder.counter_low_limit must be < 0");
        }

        // Regulator
        if self.regulator.tick_ms == 0 {
            eyre::bail!("regulator.tick_ms must be >= 1");
        }
        for (name, gain) in [
            ("p", self.regulator.p),
            ("s", self.regulator.s),
            ("d", self.regulator.d),
        ] {
            if !gain.is_finite() || gain < 0.0 {
                eyre::bail!("regulator.{name} must be finite and >= 0");
            }
        }
        if !(self.regulator.max_output > 0.0 && self.regulator.max_output <= 100.0) {
            eyre::bail!("regulator.max_output must be in (0.0, 100.0]");
        }
        if !self.regulator.zero_threshold.is_finite() || self.regulator.zero_threshold < 0.0 {
            eyre::bail!("regulator.zero_threshold must be >= 0");
        }
        if !self.regulator.integral_bleed_coef.is_finite()
            || self.regulator.integral_bleed_coef < 0.0
        {
            eyre::bail!("regulator.integral_bleed_coef must be >= 0");
        }

        // Wheel
        if !(self.wheel.acceleration.is_finite() && self.wheel.acceleration > 0.0) {
            eyre::bail!("wheel.acceleration must be > 0");
        }
        if !self.wheel.pos_threshold.is_finite() || self.wheel.pos_threshold < 0.0 {
            eyre::bail!("wheel.pos_threshold must be >= 0");
        }

        // Motors
        if self.motors.len() > usize::from(u8::MAX) {
            eyre::bail!("motors: at most 255 motors are supported");
        }
        let mut used = HashSet::new();
        for (i, m) in self.motors.iter().enumerate() {
            if m.forward == m.reverse {
                eyre::bail!("motors[{i}]: forward and reverse channel must differ");
            }
            for ch in [m.forward, m.reverse] {
                if !used.insert(ch) {
                    eyre::bail!("motors[{i}]: channel {ch} is already used by another motor");
                }
            }
        }

        Ok(())
    }
}
