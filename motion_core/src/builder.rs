//! Type-state builder for [`Manager`].
//!
//! `build()` only exists once both a PWM output and a pulse counter were
//! given; `try_build()` is always available and reports what is missing.
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;

use motion_traits::{Clock, MonotonicClock, PulseCounter, PwmOutput};

use crate::config::{EncoderCfg, ManagerCfg, RegulatorCfg, WheelCfg};
use crate::error::{BuildError, Result};
use crate::manager::Manager;

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

pub struct ManagerBuilder<O, C> {
    output: Option<Box<dyn PwmOutput + Send>>,
    counter: Option<Arc<dyn PulseCounter + Send + Sync>>,
    manager: Option<ManagerCfg>,
    encoder: Option<EncoderCfg>,
    regulator: Option<RegulatorCfg>,
    wheel: Option<WheelCfg>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
    failsafe_disabled: bool,
    _o: PhantomData<O>,
    _c: PhantomData<C>,
}

impl Default for ManagerBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            output: None,
            counter: None,
            manager: None,
            encoder: None,
            regulator: None,
            wheel: None,
            clock: None,
            failsafe_disabled: false,
            _o: PhantomData,
            _c: PhantomData,
        }
    }
}

fn invalid(what: &'static str) -> eyre::Report {
    eyre::Report::new(BuildError::InvalidConfig(what))
}

fn validate(
    cfg: &ManagerCfg,
    encoder: &EncoderCfg,
    regulator: &RegulatorCfg,
    wheel: &WheelCfg,
    channels: usize,
) -> Result<()> {
    if cfg.motors.is_empty() || cfg.motors.len() > usize::from(u8::MAX) {
        return Err(invalid("motor count must be within 1..=255"));
    }
    let mut used = HashSet::new();
    for m in &cfg.motors {
        if m.forward >= channels || m.reverse >= channels {
            return Err(invalid("motor channel beyond pwm output channels"));
        }
        if m.forward == m.reverse {
            return Err(invalid("motor forward and reverse channel must differ"));
        }
        if !used.insert(m.forward) || !used.insert(m.reverse) {
            return Err(invalid("pwm channel assigned to more than one motor"));
        }
    }
    if cfg.queue_capacity == 0 {
        return Err(invalid("queue capacity must be > 0"));
    }
    if cfg.failsafe_enabled && cfg.failsafe_ms == 0 {
        return Err(invalid("fail-safe period must be > 0"));
    }
    if cfg.pwm_resolution == 0 {
        return Err(invalid("pwm resolution must be > 0"));
    }

    if encoder.debounce_us < 0 || encoder.min_period_us < 0 {
        return Err(invalid("encoder periods must be >= 0"));
    }
    if encoder.min_period_us > encoder.max_period_us {
        return Err(invalid("encoder min period exceeds max period"));
    }
    if !encoder.ticks_per_rev.is_finite() || encoder.ticks_per_rev <= 0.0 {
        return Err(invalid("ticks per revolution must be > 0"));
    }
    if encoder.counter_high_limit <= 0 || encoder.counter_low_limit >= 0 {
        return Err(invalid("counter limits must straddle zero"));
    }

    if regulator.tick_ms == 0 {
        return Err(invalid("regulator tick must be >= 1 ms"));
    }
    let gains = [
        regulator.p,
        regulator.s,
        regulator.d,
        regulator.max_output,
        regulator.zero_threshold,
        regulator.integral_bleed_coef,
    ];
    if gains.iter().any(|g| !g.is_finite()) {
        return Err(invalid("regulator parameters must be finite"));
    }

    if !wheel.acceleration.is_finite() || wheel.acceleration <= 0.0 {
        return Err(invalid("wheel acceleration must be > 0"));
    }
    if !wheel.pos_threshold.is_finite() {
        return Err(invalid("wheel position threshold must be finite"));
    }
    Ok(())
}

impl<O, C> ManagerBuilder<O, C> {
    /// Fallible build available in any type-state.
    pub fn try_build(self) -> Result<Manager> {
        let output = self
            .output
            .ok_or_else(|| eyre::Report::new(BuildError::MissingOutput))?;
        let counter = self
            .counter
            .ok_or_else(|| eyre::Report::new(BuildError::MissingPulseCounter))?;
        let mut cfg = self.manager.unwrap_or_default();
        if self.failsafe_disabled {
            cfg.failsafe_enabled = false;
        }
        let encoder = self.encoder.unwrap_or_default();
        let regulator = self.regulator.unwrap_or_default();
        let wheel = self.wheel.unwrap_or_default();
        validate(&cfg, &encoder, &regulator, &wheel, output.channels())?;

        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(b) => Arc::from(b),
            None => Arc::new(MonotonicClock::new()),
        };
        Manager::start(&cfg, encoder, regulator, wheel, output, counter, clock)
    }

    pub fn with_manager_cfg(mut self, cfg: ManagerCfg) -> Self {
        self.manager = Some(cfg);
        self
    }

    pub fn with_encoder_cfg(mut self, cfg: EncoderCfg) -> Self {
        self.encoder = Some(cfg);
        self
    }

    pub fn with_regulator_cfg(mut self, cfg: RegulatorCfg) -> Self {
        self.regulator = Some(cfg);
        self
    }

    pub fn with_wheel_cfg(mut self, cfg: WheelCfg) -> Self {
        self.wheel = Some(cfg);
        self
    }

    /// All sections from a loaded config file.
    pub fn with_config(self, cfg: &motion_config::Config) -> Self {
        self.with_manager_cfg(ManagerCfg::from(cfg))
            .with_encoder_cfg(EncoderCfg::from(&cfg.encoder))
            .with_regulator_cfg(RegulatorCfg::from(&cfg.regulator))
            .with_wheel_cfg(WheelCfg::from(&cfg.wheel))
    }

    /// Provide a custom clock; defaults to `MonotonicClock`.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Do not stop the motors when updates cease.
    pub fn disable_failsafe(mut self) -> Self {
        self.failsafe_disabled = true;
        self
    }
}

// Setters that advance type-state
impl<C> ManagerBuilder<Missing, C> {
    pub fn with_output(self, output: impl PwmOutput + Send + 'static) -> ManagerBuilder<Set, C> {
        ManagerBuilder {
            output: Some(Box::new(output)),
            counter: self.counter,
            manager: self.manager,
            encoder: self.encoder,
            regulator: self.regulator,
            wheel: self.wheel,
            clock: self.clock,
            failsafe_disabled: self.failsafe_disabled,
            _o: PhantomData,
            _c: PhantomData,
        }
    }
}

impl<O> ManagerBuilder<O, Missing> {
    pub fn with_pulse_counter(
        self,
        counter: impl PulseCounter + Send + Sync + 'static,
    ) -> ManagerBuilder<O, Set> {
        ManagerBuilder {
            output: self.output,
            counter: Some(Arc::new(counter)),
            manager: self.manager,
            encoder: self.encoder,
            regulator: self.regulator,
            wheel: self.wheel,
            clock: self.clock,
            failsafe_disabled: self.failsafe_disabled,
            _o: PhantomData,
            _c: PhantomData,
        }
    }
}

impl ManagerBuilder<Set, Set> {
    /// Build once every required part is present.
    pub fn build(self) -> Result<Manager> {
        self.try_build()
    }
}
