//! Per-motor facade.
//!
//! Encoder, regulator and wheel are created on first use, so a motor that is
//! only ever driven with raw power costs nothing extra. Calling `drive` wires
//! them together: each regulator tick advances the wheel, uses its position
//! as the setpoint, reads the encoder and appends the output to the shared
//! per-tick batch.
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crate::batch::{MotorChangeBuilder, TickBatch};
use crate::encoder::Encoder;
use crate::error::Result;
use crate::event::MotorId;
use crate::manager::Shared;
use crate::regulator::{Reader, Regulator, RegulatorDriver, Writer};
use crate::util::lock;
use crate::wheel::{OnTarget, Wheel};

/// Motion profile of one motor, shared with its regulator.
pub type SharedWheel = Arc<Mutex<Wheel>>;

#[allow(clippy::cast_precision_loss)]
fn ticks(v: i32) -> f32 {
    v as f32
}

#[derive(Default)]
struct Parts {
    encoder: Option<Arc<Encoder>>,
    regulator: Option<Arc<Regulator>>,
    wheel: Option<SharedWheel>,
}

pub struct Motor {
    id: MotorId,
    shared: Arc<Shared>,
    driver: RegulatorDriver,
    batch: Arc<TickBatch>,
    parts: Mutex<Parts>,
}

impl std::fmt::Debug for Motor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Motor")
            .field("id", &self.id)
            .field("power", &self.current_power())
            .field("regulated", &self.is_regulated())
            .finish_non_exhaustive()
    }
}

impl Motor {
    pub(crate) fn new(
        id: MotorId,
        shared: Arc<Shared>,
        driver: RegulatorDriver,
        batch: Arc<TickBatch>,
    ) -> Self {
        Self {
            id,
            shared,
            driver,
            batch,
            parts: Mutex::new(Parts::default()),
        }
    }

    pub fn id(&self) -> MotorId {
        self.id
    }

    fn builder(&self) -> MotorChangeBuilder {
        MotorChangeBuilder::new(self.shared.queue.clone())
    }

    /// Hand off from regulated to direct control. Output of a tick still in
    /// progress is withdrawn so it cannot land after the direct command.
    fn release_regulator(&self) {
        let reg = lock(&self.parts).regulator.clone();
        if let Some(reg) = reg.filter(|r| r.is_enabled()) {
            tracing::debug!(motor = %self.id, "regulator disabled by direct command");
            reg.disable();
            self.batch.withdraw(self.id);
        }
    }

    /// Drive with signed power in -100..=100.
    pub fn power(&self, value: i8) -> Result<()> {
        self.release_regulator();
        self.builder().power(self.id, value).set()
    }

    /// Brake.
    pub fn stop(&self) -> Result<()> {
        self.release_regulator();
        self.builder().stop(self.id).set()
    }

    /// Limit the duty cycle, and the regulator output with it.
    pub fn pwm_max_percent(&self, percent: u8) -> Result<()> {
        if let Some(reg) = lock(&self.parts).regulator.as_ref() {
            reg.set_max_output(f32::from(percent.min(100)));
        }
        self.builder().pwm_max_percent(self.id, percent).set()
    }

    pub fn current_power(&self) -> i8 {
        self.shared
            .status
            .get(self.id.index())
            .map_or(0, |s| s.power.load(Ordering::Acquire))
    }

    pub fn current_pwm_max_percent(&self) -> u8 {
        self.shared
            .status
            .get(self.id.index())
            .map_or(100, |s| s.pwm_max_percent.load(Ordering::Acquire))
    }

    fn ensure_encoder(&self, parts: &mut Parts) -> Arc<Encoder> {
        if let Some(enc) = &parts.encoder {
            return enc.clone();
        }
        let unit = self.id.index();
        let mut fresh = false;
        let enc = match self.shared.encoders.get(unit) {
            Some(slot) => slot
                .get_or_init(|| {
                    fresh = true;
                    Arc::new(self.new_encoder())
                })
                .clone(),
            None => Arc::new(self.new_encoder()),
        };
        if fresh {
            // only counts once the dispatcher can see the encoder
            match self.shared.counter.enable(unit) {
                Ok(()) => tracing::debug!(motor = %self.id, unit, "encoder installed"),
                Err(e) => tracing::error!(motor = %self.id, unit, error = %e, "failed to enable pulse counter"),
            }
        }
        parts.encoder = Some(enc.clone());
        enc
    }

    fn new_encoder(&self) -> Encoder {
        Encoder::new(
            self.id,
            self.shared.encoder_cfg,
            self.shared.counter.clone(),
            self.shared.clock.clone(),
            self.shared.epoch,
            self.shared.queue.clone(),
        )
    }

    fn ensure_wheel(&self, parts: &mut Parts) -> SharedWheel {
        if let Some(w) = &parts.wheel {
            return w.clone();
        }
        let enc = self.ensure_encoder(parts);
        let mut wheel = Wheel::new(&self.shared.wheel_cfg);
        wheel.sync(enc.value().map_or(0.0, ticks));
        let wheel = Arc::new(Mutex::new(wheel));
        parts.wheel = Some(wheel.clone());
        wheel
    }

    fn ensure_regulator(&self, parts: &mut Parts) -> Arc<Regulator> {
        if let Some(r) = &parts.regulator {
            return r.clone();
        }
        let enc = self.ensure_encoder(parts);
        let wheel = self.ensure_wheel(parts);
        let reg = self.driver.create(format!("motor {}", self.id));

        let weak = Arc::downgrade(&reg);
        let batch = self.batch.clone();
        let reader_enc = enc.clone();
        let reader: Reader = Box::new(move || {
            let reg = weak.upgrade()?;
            let (hold, arrived) = {
                let mut w = lock(&wheel);
                if w.target().is_some() {
                    let hold = w.process(batch.dt());
                    (Some(hold), w.take_arrival())
                } else {
                    (None, None)
                }
            };
            if let Some(hold) = hold {
                // a direct command may have disabled the loop meanwhile
                reg.update_setpoint(hold);
            }
            if let Some(cb) = arrived {
                cb();
            }
            reader_enc.value().ok().map(ticks)
        });

        let id = self.id;
        let batch = self.batch.clone();
        let writer: Writer = Box::new(move |x| batch.append_power(id, x));
        reg.install(reader, writer);
        reg.set_max_output(
            reg.max_output()
                .min(f32::from(self.current_pwm_max_percent())),
        );

        let weak = Arc::downgrade(&reg);
        let batch = self.batch.clone();
        enc.set_preempt_hook(Box::new(move || {
            if let Some(r) = weak.upgrade() {
                r.disable();
                batch.withdraw(id);
            }
        }));
        parts.regulator = Some(reg.clone());
        reg
    }

    /// The encoder; installing it enables the counter unit.
    pub fn encoder(&self) -> Arc<Encoder> {
        let mut parts = lock(&self.parts);
        self.ensure_encoder(&mut parts)
    }

    /// The motion profile, anchored at the current encoder value.
    pub fn wheel(&self) -> SharedWheel {
        let mut parts = lock(&self.parts);
        self.ensure_wheel(&mut parts)
    }

    /// The position regulator, installed but disabled until a drive.
    pub fn regulator(&self) -> Arc<Regulator> {
        let mut parts = lock(&self.parts);
        self.ensure_regulator(&mut parts)
    }

    /// Regulated move to `target` ticks at `speed` ticks/s.
    pub fn drive_to_value(&self, target: i32, speed: f32, callback: Option<OnTarget>) {
        self.program(move |w| w.drive_to_value(ticks(target), speed, callback));
    }

    /// Regulated move by `distance` ticks from the current target.
    pub fn drive(&self, distance: i32, speed: f32, callback: Option<OnTarget>) {
        self.program(move |w| w.drive(ticks(distance), speed, callback));
    }

    fn program(&self, apply: impl FnOnce(&mut Wheel)) {
        let (enc, wheel, reg) = {
            let mut parts = lock(&self.parts);
            let reg = self.ensure_regulator(&mut parts);
            (
                self.ensure_encoder(&mut parts),
                self.ensure_wheel(&mut parts),
                reg,
            )
        };
        if enc.is_driving() {
            tracing::debug!(motor = %self.id, "direct drive replaced by regulated drive");
            enc.cancel_drive();
        }

        let enabled = reg.is_enabled();
        let hold = {
            let mut w = lock(&wheel);
            if !enabled {
                // the motor may have moved under direct control
                if let Ok(v) = enc.value() {
                    w.sync(ticks(v));
                }
            }
            apply(&mut w);
            w.current_position()
        };
        if !enabled {
            reg.set(hold);
        }
    }

    /// Re-anchor the wheel at the encoder reading.
    pub fn sync_wheel(&self) -> Result<()> {
        let (enc, wheel, reg) = {
            let mut parts = lock(&self.parts);
            (
                self.ensure_encoder(&mut parts),
                self.ensure_wheel(&mut parts),
                parts.regulator.clone(),
            )
        };
        let pos = ticks(enc.value()?);
        lock(&wheel).sync(pos);
        if let Some(reg) = reg.filter(|r| r.is_enabled()) {
            reg.set(pos);
        }
        Ok(())
    }

    /// Whether the regulator currently drives this motor.
    pub fn is_regulated(&self) -> bool {
        lock(&self.parts)
            .regulator
            .as_ref()
            .is_some_and(|r| r.is_enabled())
    }
}
