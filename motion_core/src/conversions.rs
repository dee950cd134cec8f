//! `From` implementations bridging `motion_config` types to `motion_core` types.

use crate::config::{
    EncoderCfg, ManagerCfg, MotorChannels, RegulatorCfg, WheelCfg, default_channel_map,
    DEFAULT_MOTORS,
};

// ── EncoderCfg ───────────────────────────────────────────────────────────────

impl From<&motion_config::EncoderCfg> for EncoderCfg {
    fn from(c: &motion_config::EncoderCfg) -> Self {
        Self {
            debounce_us: c.debounce_us,
            max_period_us: c.max_period_us,
            min_period_us: c.min_period_us,
            ticks_per_rev: c.ticks_per_rev,
            counter_high_limit: i32::from(c.counter_high_limit),
            counter_low_limit: i32::from(c.counter_low_limit),
        }
    }
}

// ── RegulatorCfg ─────────────────────────────────────────────────────────────

impl From<&motion_config::RegulatorCfg> for RegulatorCfg {
    fn from(c: &motion_config::RegulatorCfg) -> Self {
        Self {
            tick_ms: c.tick_ms,
            mode: c.mode,
            p: c.p,
            s: c.s,
            d: c.d,
            max_output: c.max_output,
            zero_threshold: c.zero_threshold,
            integral_bleed_coef: c.integral_bleed_coef,
        }
    }
}

// ── WheelCfg ─────────────────────────────────────────────────────────────────

impl From<&motion_config::WheelCfg> for WheelCfg {
    fn from(c: &motion_config::WheelCfg) -> Self {
        Self {
            acceleration: c.acceleration,
            pos_threshold: c.pos_threshold,
        }
    }
}

// ── ManagerCfg ───────────────────────────────────────────────────────────────

impl From<&motion_config::MotorChannels> for MotorChannels {
    fn from(c: &motion_config::MotorChannels) -> Self {
        Self {
            forward: c.forward,
            reverse: c.reverse,
            inverted: c.inverted,
        }
    }
}

impl From<&motion_config::Config> for ManagerCfg {
    fn from(c: &motion_config::Config) -> Self {
        let motors = if c.motors.is_empty() {
            default_channel_map(DEFAULT_MOTORS)
        } else {
            c.motors.iter().map(MotorChannels::from).collect()
        };
        Self {
            queue_capacity: c.manager.queue_capacity,
            failsafe_ms: c.manager.failsafe_ms,
            failsafe_enabled: c.manager.failsafe,
            queue_retry_ms: c.manager.queue_retry_ms,
            queue_retry_warn: c.manager.queue_retry_warn,
            pwm_resolution: c.manager.pwm_resolution,
            motors,
        }
    }
}
