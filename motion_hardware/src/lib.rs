//! Host simulations of the peripherals the motion core drives.
//!
//! - [`SimulatedPwm`] latches staged duties on `flush()` and keeps a frame
//!   history that tests inspect through a [`PwmProbe`].
//! - [`SimulatedPulseCounter`] behaves like a hardware counter bank: it only
//!   counts on enabled units and wraps to zero at its limits, raising a limit
//!   interrupt.
//! - [`SimulatedEncoder`] turns a pulse into a count plus an edge interrupt.
pub mod error;
pub mod util;

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use motion_traits::{CounterLimit, InterruptSink, PulseCounter, PwmOutput};

use crate::error::HwError;

const FRAME_HISTORY: usize = 1024;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PwmState {
    staged: Vec<u16>,
    latched: Vec<u16>,
    flushes: u64,
    frames: Vec<Vec<u16>>,
    fail_next: bool,
}

/// Simulated PWM actuator.
pub struct SimulatedPwm {
    state: Arc<Mutex<PwmState>>,
}

impl SimulatedPwm {
    pub fn new(channels: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PwmState {
                staged: vec![0; channels],
                latched: vec![0; channels],
                ..PwmState::default()
            })),
        }
    }

    /// Handle for observing what the actuator was told.
    pub fn probe(&self) -> PwmProbe {
        PwmProbe {
            state: self.state.clone(),
        }
    }
}

impl PwmOutput for SimulatedPwm {
    fn channels(&self) -> usize {
        lock(&self.state).staged.len()
    }

    fn set_duty(&mut self, channel: usize, value: u16) {
        let mut st = lock(&self.state);
        match st.staged.get_mut(channel) {
            Some(cell) => *cell = value,
            None => tracing::warn!(channel, "duty write to unknown channel ignored"),
        }
    }

    fn flush(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut st = lock(&self.state);
        if st.fail_next {
            st.fail_next = false;
            return Err(Box::new(HwError::Injected("pwm flush".into())));
        }
        st.latched = st.staged.clone();
        st.flushes += 1;
        if st.frames.len() >= FRAME_HISTORY {
            st.frames.remove(0);
        }
        let frame = st.latched.clone();
        st.frames.push(frame);
        Ok(())
    }
}

/// Read side of a [`SimulatedPwm`].
#[derive(Clone)]
pub struct PwmProbe {
    state: Arc<Mutex<PwmState>>,
}

impl PwmProbe {
    /// Duty latched by the last successful flush.
    pub fn duty(&self, channel: usize) -> Option<u16> {
        lock(&self.state).latched.get(channel).copied()
    }

    /// Duty written but not necessarily flushed.
    pub fn staged(&self, channel: usize) -> Option<u16> {
        lock(&self.state).staged.get(channel).copied()
    }

    pub fn flushes(&self) -> u64 {
        lock(&self.state).flushes
    }

    /// Latched frames, oldest first.
    pub fn frames(&self) -> Vec<Vec<u16>> {
        lock(&self.state).frames.clone()
    }

    /// Make the next flush fail once.
    pub fn fail_next_flush(&self) {
        lock(&self.state).fail_next = true;
    }
}

struct Unit {
    count: AtomicI32,
    enabled: AtomicBool,
}

struct CounterInner {
    units: Vec<Unit>,
    high: i32,
    low: i32,
    sink: Mutex<Option<Arc<dyn InterruptSink + Send + Sync>>>,
    fail_reads: AtomicBool,
}

/// Simulated pulse counter bank. Clones share the same counters.
#[derive(Clone)]
pub struct SimulatedPulseCounter {
    inner: Arc<CounterInner>,
}

impl SimulatedPulseCounter {
    /// Counter bank using the full `i16` range as limits.
    pub fn new(units: usize) -> Self {
        Self::with_limits(units, i16::MAX, i16::MIN)
    }

    /// Counter bank wrapping at `high` / `low`.
    pub fn with_limits(units: usize, high: i16, low: i16) -> Self {
        let units = (0..units)
            .map(|_| Unit {
                count: AtomicI32::new(0),
                enabled: AtomicBool::new(false),
            })
            .collect();
        Self {
            inner: Arc::new(CounterInner {
                units,
                high: i32::from(high),
                low: i32::from(low),
                sink: Mutex::new(None),
                fail_reads: AtomicBool::new(false),
            }),
        }
    }

    /// Route limit interrupts to `sink`.
    pub fn connect(&self, sink: impl InterruptSink + Send + Sync + 'static) {
        *lock(&self.inner.sink) = Some(Arc::new(sink));
    }

    /// Count one pulse on `unit`. Returns false when the unit is not
    /// counting (unknown or not enabled).
    pub fn step(&self, unit: usize, forward: bool) -> bool {
        let Some(u) = self.inner.units.get(unit) else {
            return false;
        };
        if !u.enabled.load(Ordering::Acquire) {
            return false;
        }
        let delta = if forward { 1 } else { -1 };
        let next = u.count.load(Ordering::Acquire) + delta;
        let limit = if next >= self.inner.high {
            Some(CounterLimit::High)
        } else if next <= self.inner.low {
            Some(CounterLimit::Low)
        } else {
            None
        };
        match limit {
            Some(limit) => {
                u.count.store(0, Ordering::Release);
                let sink = lock(&self.inner.sink).clone();
                if let Some(sink) = sink {
                    sink.counter_limit(unit, limit);
                }
            }
            None => u.count.store(next, Ordering::Release),
        }
        true
    }

    /// Make every `count()` fail until cleared.
    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn is_enabled(&self, unit: usize) -> bool {
        self.inner
            .units
            .get(unit)
            .is_some_and(|u| u.enabled.load(Ordering::Acquire))
    }
}

impl PulseCounter for SimulatedPulseCounter {
    fn enable(&self, unit: usize) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let u = self
            .inner
            .units
            .get(unit)
            .ok_or(HwError::UnitOutOfRange(unit))?;
        u.enabled.store(true, Ordering::Release);
        tracing::debug!(unit, "pulse counter unit enabled");
        Ok(())
    }

    fn count(&self, unit: usize) -> Result<i16, Box<dyn std::error::Error + Send + Sync>> {
        if self.inner.fail_reads.load(Ordering::Relaxed) {
            return Err(Box::new(HwError::Injected("pulse counter read".into())));
        }
        let u = self
            .inner
            .units
            .get(unit)
            .ok_or(HwError::UnitOutOfRange(unit))?;
        let raw = u.count.load(Ordering::Acquire);
        Ok(i16::try_from(raw).unwrap_or(if raw > 0 { i16::MAX } else { i16::MIN }))
    }
}

/// One quadrature encoder wired to a counter unit and an edge interrupt.
pub struct SimulatedEncoder {
    counter: SimulatedPulseCounter,
    unit: usize,
    sink: Arc<dyn InterruptSink + Send + Sync>,
}

impl SimulatedEncoder {
    pub fn new(
        counter: SimulatedPulseCounter,
        unit: usize,
        sink: impl InterruptSink + Send + Sync + 'static,
    ) -> Self {
        Self {
            counter,
            unit,
            sink: Arc::new(sink),
        }
    }

    /// Emit one pulse at `timestamp_us`. The phase pin reads high when
    /// turning backwards. Returns false when the counter unit is disabled.
    pub fn pulse(&self, forward: bool, timestamp_us: i64) -> bool {
        if !self.counter.step(self.unit, forward) {
            return false;
        }
        self.sink.encoder_edge(self.unit, timestamp_us, !forward);
        true
    }

    pub fn unit(&self) -> usize {
        self.unit
    }
}
