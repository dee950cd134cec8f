//! Batched motor updates.
//!
//! A [`MotorChangeBuilder`] collects operations for any number of motors and
//! submits them as one event, which the dispatcher applies before a single
//! flush. [`TickBatch`] keeps one builder open per regulator tick so every
//! regulated motor lands in the same frame.
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Result;
use crate::event::{Event, EventQueue, MotorChange, MotorId, MotorOp};
use crate::pwm::POWER_MAX;
use crate::regulator::{Tick, TickHooks};
use crate::util::{clamp_logged, lock};

#[must_use = "changes are only applied by set()"]
#[derive(Debug)]
pub struct MotorChangeBuilder {
    queue: EventQueue,
    changes: Vec<MotorChange>,
}

impl MotorChangeBuilder {
    pub(crate) fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            changes: Vec::new(),
        }
    }

    fn push(&mut self, id: MotorId, op: MotorOp) -> &mut Self {
        if id.index() >= self.queue.motor_count() {
            tracing::warn!(motor = %id, "change for unknown motor skipped");
            return self;
        }
        self.changes.push(MotorChange { id, op });
        self
    }

    /// Signed power, clamped to -100..=100.
    pub fn power(&mut self, id: MotorId, value: i8) -> &mut Self {
        let value = clamp_logged(value, -POWER_MAX, POWER_MAX, "power");
        self.push(id, MotorOp::Power(value))
    }

    /// Duty ceiling in percent, clamped to 0..=100.
    pub fn pwm_max_percent(&mut self, id: MotorId, percent: u8) -> &mut Self {
        let percent = clamp_logged(percent, 0, 100, "pwm_max_percent");
        self.push(id, MotorOp::PwmMaxPercent(percent))
    }

    /// Brake.
    pub fn stop(&mut self, id: MotorId) -> &mut Self {
        self.push(id, MotorOp::Stop)
    }

    /// Drop everything collected for `id`.
    pub(crate) fn discard(&mut self, id: MotorId) {
        self.changes.retain(|c| c.id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Submit everything collected so far as one event. An empty submit still
    /// counts as a motor update for the fail-safe.
    pub fn set(&mut self) -> Result<()> {
        let changes = std::mem::take(&mut self.changes);
        self.queue.push(Event::Motors(changes))
    }
}

/// Regulator outputs to motor power, rounded and clamped.
pub(crate) fn output_to_power(x: f32) -> i8 {
    let max = f32::from(POWER_MAX);
    #[allow(clippy::cast_possible_truncation)]
    let power = x.round().clamp(-max, max) as i8;
    power
}

/// Per-tick builder shared by all motor regulators.
#[derive(Debug)]
pub(crate) struct TickBatch {
    queue: EventQueue,
    dt_bits: AtomicU32,
    open: Mutex<Option<MotorChangeBuilder>>,
}

impl TickBatch {
    pub(crate) fn new(queue: EventQueue) -> Self {
        Self {
            queue,
            dt_bits: AtomicU32::new(0f32.to_bits()),
            open: Mutex::new(None),
        }
    }

    /// `dt` of the tick in progress (or the last one).
    pub(crate) fn dt(&self) -> f32 {
        f32::from_bits(self.dt_bits.load(Ordering::Acquire))
    }

    pub(crate) fn append_power(&self, id: MotorId, output: f32) {
        let power = output_to_power(output);
        match lock(&self.open).as_mut() {
            Some(builder) => {
                builder.power(id, power);
            }
            None => tracing::warn!(motor = %id, "regulator output outside a tick dropped"),
        }
    }

    /// Take back regulated output for `id` that the open tick has not
    /// submitted yet.
    pub(crate) fn withdraw(&self, id: MotorId) {
        if let Some(builder) = lock(&self.open).as_mut() {
            builder.discard(id);
        }
    }
}

impl TickHooks for TickBatch {
    fn begin_tick(&self, tick: &Tick) {
        self.dt_bits.store(tick.dt.to_bits(), Ordering::Release);
        let mut open = lock(&self.open);
        if open.is_some() {
            tracing::warn!(seq = tick.seq, "previous tick batch was never submitted");
        }
        *open = Some(MotorChangeBuilder::new(self.queue.clone()));
    }

    fn end_tick(&self, tick: &Tick) {
        let Some(mut builder) = lock(&self.open).take() else {
            tracing::error!(seq = tick.seq, "tick ended without an open batch");
            return;
        };
        if builder.is_empty() {
            return;
        }
        if let Err(e) = builder.set() {
            tracing::error!(seq = tick.seq, error = %e, "tick batch not submitted");
        }
    }
}
