//! Generic PID regulator and the shared driver that ticks every instance.
//!
//! A [`Regulator`] is bound to a measurement reader and an output writer by
//! [`Regulator::install`]. The first install starts the driver thread; every
//! tick it calls [`TickHooks::begin_tick`] on all hooks, `process()` on every
//! live regulator in registration order, then [`TickHooks::end_tick`]. The
//! thread exits once no regulator is left.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use motion_traits::Clock;

use crate::config::{RegulatorCfg, TickMode};
use crate::util::{lock, period_from_ms};

/// Returns the measurement, or `None` when there is nothing to regulate on.
pub type Reader = Box<dyn FnMut() -> Option<f32> + Send>;
/// Receives the clamped controller output. Runs under the regulator's state
/// lock and must not call back into the same regulator.
pub type Writer = Box<dyn FnMut(f32) + Send>;

/// One pass of the regulator driver.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub now: Instant,
    /// Seconds since the previous tick (the nominal period on the first one).
    pub dt: f32,
    pub seq: u64,
}

/// Called around every driver pass.
pub trait TickHooks: Send + Sync {
    fn begin_tick(&self, tick: &Tick);
    fn end_tick(&self, tick: &Tick);
}

#[derive(Debug, Clone)]
struct PidState {
    setpoint: Option<f32>,
    p: f32,
    s: f32,
    d: f32,
    max_output: f32,
    zero_threshold: f32,
    bleed_coef: f32,
    sum: f32,
    last_error: f32,
    last_tick: Option<Instant>,
    last_output: f32,
}

impl PidState {
    fn new(cfg: &RegulatorCfg) -> Self {
        Self {
            setpoint: None,
            p: cfg.p.abs(),
            s: cfg.s.abs(),
            d: cfg.d.abs(),
            max_output: cfg.max_output.abs(),
            zero_threshold: cfg.zero_threshold.abs(),
            bleed_coef: cfg.integral_bleed_coef.abs(),
            sum: 0.0,
            last_error: 0.0,
            last_tick: None,
            last_output: 0.0,
        }
    }

    /// Move the integral sum toward zero without crossing it.
    fn bleed(&mut self, dt: f32) {
        let denom = self.bleed_coef * self.s;
        if denom <= 0.0 {
            self.sum = 0.0;
            return;
        }
        let step = self.max_output * dt / denom;
        self.sum = if self.sum.abs() <= step {
            0.0
        } else {
            self.sum - step.copysign(self.sum)
        };
    }

    fn step(&mut self, w: f32, y: f32, now: Instant) -> f32 {
        let dt = self
            .last_tick
            .map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f32());
        self.last_tick = Some(now);

        let mut e = w - y;
        if e.abs() <= self.zero_threshold {
            e = 0.0;
            self.bleed(dt);
        }

        let raw = self.p * e + self.s * (self.sum + e) + self.d * (e - self.last_error) * dt;
        let x = raw.clamp(-self.max_output, self.max_output);
        let saturated = raw.abs() > self.max_output;
        let unwinds = (raw > self.max_output && e < 0.0) || (raw < -self.max_output && e > 0.0);
        if !saturated || unwinds {
            self.sum += e;
        }
        self.last_error = e;
        self.last_output = x;
        x
    }
}

/// PID instance. Create through [`RegulatorDriver::create`].
pub struct Regulator {
    label: String,
    driver: Weak<DriverShared>,
    clock: Arc<dyn Clock + Send + Sync>,
    state: Mutex<PidState>,
    io: Mutex<Option<(Reader, Writer)>>,
}

impl std::fmt::Debug for Regulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regulator")
            .field("label", &self.label)
            .field("state", &*lock(&self.state))
            .finish_non_exhaustive()
    }
}

impl Regulator {
    /// Bind the reader and writer and register with the driver. A second
    /// call is ignored.
    pub fn install(self: &Arc<Self>, reader: Reader, writer: Writer) {
        {
            let mut io = lock(&self.io);
            if io.is_some() {
                tracing::warn!(label = %self.label, "regulator already installed");
                return;
            }
            *io = Some((reader, writer));
        }
        match self.driver.upgrade() {
            Some(driver) => driver.register(Arc::downgrade(self)),
            None => tracing::error!(label = %self.label, "regulator driver is gone"),
        }
    }

    pub fn is_installed(&self) -> bool {
        lock(&self.io).is_some()
    }

    /// Enable the loop with setpoint `w`. A non-finite value disables it.
    pub fn set(&self, w: f32) {
        if !w.is_finite() {
            self.disable();
            return;
        }
        let mut st = lock(&self.state);
        if st.setpoint.is_none() {
            st.sum = 0.0;
            st.last_error = 0.0;
            st.last_tick = Some(self.clock.now());
        }
        st.setpoint = Some(w);
    }

    /// Move the setpoint of a running loop. Unlike [`set`](Self::set) this
    /// never enables it; returns whether the setpoint was taken.
    pub fn update_setpoint(&self, w: f32) -> bool {
        let mut st = lock(&self.state);
        if st.setpoint.is_none() || !w.is_finite() {
            return false;
        }
        st.setpoint = Some(w);
        true
    }

    /// Stop the loop. Waits for a step in progress, so no output of this
    /// instance is written once it returns.
    pub fn disable(&self) {
        lock(&self.state).setpoint = None;
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).setpoint.is_some()
    }

    pub fn setpoint(&self) -> Option<f32> {
        lock(&self.state).setpoint
    }

    pub fn set_params(&self, p: f32, s: f32, d: f32) {
        let mut st = lock(&self.state);
        st.p = p.abs();
        st.s = s.abs();
        st.d = d.abs();
    }

    /// `(p, s, d)`
    pub fn params(&self) -> (f32, f32, f32) {
        let st = lock(&self.state);
        (st.p, st.s, st.d)
    }

    pub fn set_max_output(&self, max: f32) {
        lock(&self.state).max_output = max.abs();
    }

    pub fn max_output(&self) -> f32 {
        lock(&self.state).max_output
    }

    pub fn set_zero_threshold(&self, threshold: f32) {
        lock(&self.state).zero_threshold = threshold.abs();
    }

    pub fn set_integral_bleed_coef(&self, coef: f32) {
        lock(&self.state).bleed_coef = coef.abs();
    }

    pub fn integral_sum(&self) -> f32 {
        lock(&self.state).sum
    }

    pub fn last_error(&self) -> f32 {
        lock(&self.state).last_error
    }

    /// Output written on the last processed tick.
    pub fn last_output(&self) -> f32 {
        lock(&self.state).last_output
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run one control step now. Normally called by the driver.
    pub fn process(&self) {
        self.process_at(self.clock.now());
    }

    pub(crate) fn process_at(&self, now: Instant) {
        let mut io = lock(&self.io);
        let Some((reader, writer)) = io.as_mut() else {
            return;
        };
        if !self.is_enabled() {
            return;
        }
        // the reader may call back into the state setters, so no state lock yet
        let Some(y) = reader() else {
            return;
        };
        // the writer runs under the state lock, which orders it against disable()
        let mut st = lock(&self.state);
        let Some(w) = st.setpoint else {
            return;
        };
        if !y.is_finite() {
            tracing::warn!(label = %self.label, y, "non-finite measurement skipped");
            return;
        }
        let x = st.step(w, y, now);
        writer(x);
    }
}

#[derive(Default)]
struct Registry {
    regulators: Vec<Weak<Regulator>>,
    hooks: Vec<Arc<dyn TickHooks>>,
    last_tick: Option<Instant>,
    seq: u64,
}

struct DriverShared {
    clock: Arc<dyn Clock + Send + Sync>,
    cfg: RegulatorCfg,
    period: Duration,
    registry: Mutex<Registry>,
    running: AtomicBool,
    shutdown: AtomicBool,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DriverShared {
    fn register(self: &Arc<Self>, regulator: Weak<Regulator>) {
        let mut reg = lock(&self.registry);
        reg.regulators.push(regulator);
        tracing::debug!(count = reg.regulators.len(), "regulator registered");

        if self.cfg.mode == TickMode::Manual
            || self.shutdown.load(Ordering::Acquire)
            || self.running.load(Ordering::Acquire)
        {
            return;
        }
        // a previous thread that ran out of regulators has already left its loop
        if let Some(old) = lock(&self.join_handle).take() {
            if let Err(e) = old.join() {
                tracing::warn!(?e, "regulator driver thread panicked");
            }
        }
        let worker = self.clone();
        match std::thread::Builder::new()
            .name("motion-regulators".into())
            .spawn(move || worker.run())
        {
            Ok(handle) => {
                self.running.store(true, Ordering::Release);
                *lock(&self.join_handle) = Some(handle);
                tracing::debug!(period_ms = self.cfg.tick_ms, "regulator driver started");
            }
            Err(e) => tracing::error!(error = %e, "failed to spawn regulator driver"),
        }
    }

    fn run(&self) {
        loop {
            self.clock.sleep(self.period);
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            if !self.tick(true) {
                break;
            }
        }
        tracing::trace!("regulator driver exiting cleanly");
    }

    /// One pass. Returns false when the registry is empty; from the thread
    /// that also marks the driver as stopped.
    fn tick(&self, from_thread: bool) -> bool {
        let (regulators, hooks, tick) = {
            let mut reg = lock(&self.registry);
            reg.regulators.retain(|r| r.strong_count() > 0);
            if reg.regulators.is_empty() {
                if from_thread {
                    self.running.store(false, Ordering::Release);
                    tracing::debug!("no regulators left, driver stopping");
                }
                return false;
            }
            let now = self.clock.now();
            let dt = reg.last_tick.map_or(self.period.as_secs_f32(), |t| {
                now.saturating_duration_since(t).as_secs_f32()
            });
            reg.last_tick = Some(now);
            reg.seq = reg.seq.wrapping_add(1);
            let live: Vec<Arc<Regulator>> =
                reg.regulators.iter().filter_map(Weak::upgrade).collect();
            (
                live,
                reg.hooks.clone(),
                Tick {
                    now,
                    dt,
                    seq: reg.seq,
                },
            )
        };

        for h in &hooks {
            h.begin_tick(&tick);
        }
        for r in &regulators {
            r.process_at(tick.now);
        }
        for h in &hooks {
            h.end_tick(&tick);
        }
        true
    }
}

/// Handle to the shared regulator driver. Clones refer to the same driver.
#[derive(Clone)]
pub struct RegulatorDriver {
    shared: Arc<DriverShared>,
}

impl RegulatorDriver {
    pub fn new(cfg: RegulatorCfg, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                clock,
                period: period_from_ms(cfg.tick_ms),
                cfg,
                registry: Mutex::new(Registry::default()),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                join_handle: Mutex::new(None),
            }),
        }
    }

    /// New regulator with the driver's default gains. It takes part in ticks
    /// once installed.
    pub fn create(&self, label: impl Into<String>) -> Arc<Regulator> {
        Arc::new(Regulator {
            label: label.into(),
            driver: Arc::downgrade(&self.shared),
            clock: self.shared.clock.clone(),
            state: Mutex::new(PidState::new(&self.shared.cfg)),
            io: Mutex::new(None),
        })
    }

    pub fn add_hooks(&self, hooks: Arc<dyn TickHooks>) {
        lock(&self.shared.registry).hooks.push(hooks);
    }

    /// Run one pass on the calling thread. Returns false if nothing is
    /// registered. This is how `TickMode::Manual` is driven.
    pub fn tick(&self) -> bool {
        self.shared.tick(false)
    }

    /// Live installed regulators.
    pub fn len(&self) -> usize {
        lock(&self.shared.registry)
            .regulators
            .iter()
            .filter(|r| r.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    /// Stop the thread for good and join it.
    pub fn shutdown(&self) {
        {
            let _reg = lock(&self.shared.registry);
            self.shared.shutdown.store(true, Ordering::Release);
        }
        let handle = lock(&self.shared.join_handle).take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(()) => tracing::trace!("regulator driver joined successfully"),
                Err(e) => tracing::warn!(?e, "regulator driver panicked during shutdown"),
            }
        }
        self.shared.running.store(false, Ordering::Release);
    }
}
