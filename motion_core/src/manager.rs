//! The motor manager: event dispatcher, fail-safe and the public entry point.
//!
//! One dispatcher thread owns the output stages and the PWM actuator. It
//! drains the event queue, applies motor changes and encoder bookkeeping and
//! flushes the actuator once per drained batch. Drive completion callbacks
//! run on a separate thread, so a callback that queues new commands never
//! waits on the dispatcher it would have to be drained by.
use std::sync::atomic::{AtomicI8, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel as xch;
use motion_traits::{Clock, PulseCounter, PwmOutput};

use crate::batch::{MotorChangeBuilder, TickBatch};
use crate::config::{EncoderCfg, ManagerCfg, RegulatorCfg, WheelCfg};
use crate::encoder::{DriveDone, Encoder};
use crate::error::Result;
use crate::event::{Event, EventQueue, Interrupts, MotorId, MotorOp};
use crate::hw_error::map_hw_error;
use crate::motor::Motor;
use crate::pwm::{DutyBuffer, DutyView, MotorOutput};
use crate::regulator::RegulatorDriver;
use crate::timers::{TimerId, Timers};
use crate::util::period_from_ms;

/// Last commanded values of one motor, readable from any thread.
#[derive(Debug)]
pub(crate) struct MotorStatus {
    pub(crate) power: AtomicI8,
    pub(crate) pwm_max_percent: AtomicU8,
}

impl Default for MotorStatus {
    fn default() -> Self {
        Self {
            power: AtomicI8::new(0),
            pwm_max_percent: AtomicU8::new(100),
        }
    }
}

/// State shared by the manager, its motors and the dispatcher.
pub(crate) struct Shared {
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) epoch: Instant,
    pub(crate) queue: EventQueue,
    /// ms since `epoch` of the last motor update (at least 1), 0 when none
    /// is pending for the fail-safe.
    pub(crate) motors_last_set: AtomicU64,
    pub(crate) failsafe_ms: u64,
    pub(crate) status: Vec<MotorStatus>,
    pub(crate) encoders: Vec<OnceLock<Arc<Encoder>>>,
    pub(crate) counter: Arc<dyn PulseCounter + Send + Sync>,
    pub(crate) encoder_cfg: EncoderCfg,
    pub(crate) regulator_cfg: RegulatorCfg,
    pub(crate) wheel_cfg: WheelCfg,
}

impl Shared {
    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.ms_since(self.epoch)
    }

    fn mark_motors_set(&self) {
        self.motors_last_set
            .store(self.now_ms().max(1), Ordering::Release);
    }

    pub(crate) fn encoder(&self, unit: usize) -> Option<&Arc<Encoder>> {
        self.encoders.get(unit).and_then(OnceLock::get)
    }
}

/// Stop everything if no motor update arrived within the grace period.
/// Fires once per silence; returns true when it did.
pub(crate) fn failsafe_check(shared: &Shared, now_ms: u64) -> bool {
    let last = shared.motors_last_set.load(Ordering::Acquire);
    if last == 0 || now_ms.saturating_sub(last) <= shared.failsafe_ms {
        return false;
    }
    if shared
        .motors_last_set
        .compare_exchange(last, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // a fresh update raced in
        return false;
    }
    tracing::error!(
        silent_ms = now_ms.saturating_sub(last),
        grace_ms = shared.failsafe_ms,
        "fail-safe: no motor update, stopping all motors"
    );
    if let Err(e) = shared.queue.push(Event::StopAll) {
        tracing::error!(error = %e, "fail-safe stop could not be queued");
    }
    true
}

/// A finished direct drive waiting for its callback.
type Completion = (Arc<Encoder>, DriveDone);

fn run_completions(rx: &xch::Receiver<Completion>) {
    for (encoder, done) in rx {
        done.finish(&encoder);
    }
    tracing::trace!("completion thread exiting cleanly");
}

struct Dispatcher {
    shared: Arc<Shared>,
    outputs: Vec<MotorOutput>,
    duty: DutyBuffer,
    pwm: Box<dyn PwmOutput + Send>,
    completions: xch::Sender<Completion>,
}

impl Dispatcher {
    fn run(mut self, rx: &xch::Receiver<Event>, shutdown: &xch::Receiver<()>) {
        loop {
            xch::select! {
                recv(rx) -> ev => match ev {
                    Ok(ev) => self.handle_batch(ev, rx),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        tracing::trace!("dispatcher thread exiting cleanly");
    }

    /// Apply `first` plus whatever is already queued behind it, then flush once.
    fn handle_batch(&mut self, first: Event, rx: &xch::Receiver<Event>) {
        let mut finished = Vec::new();
        let mut dirty = self.apply(first, &mut finished);
        let pending = rx.len();
        for ev in rx.try_iter().take(pending) {
            dirty |= self.apply(ev, &mut finished);
        }
        if dirty {
            self.flush();
        }
        for completion in finished {
            if self.completions.send(completion).is_err() {
                tracing::warn!("completion thread gone, drive callback dropped");
            }
        }
    }

    fn apply(&mut self, ev: Event, finished: &mut Vec<Completion>) -> bool {
        match ev {
            Event::Motors(changes) => {
                let mut dirty = false;
                for change in changes {
                    dirty |= self.apply_op(change.id, change.op);
                }
                self.shared.mark_motors_set();
                dirty
            }
            Event::StopAll => {
                let mut dirty = false;
                for i in 0..self.outputs.len() {
                    dirty |= self.set_power(i, 0);
                }
                dirty
            }
            Event::EncoderEdge {
                unit,
                timestamp_us,
                phase_high,
            } => {
                let Some(encoder) = self.shared.encoder(unit).cloned() else {
                    tracing::trace!(unit, "edge for uninstalled encoder");
                    return false;
                };
                match encoder.handle_edge(timestamp_us, phase_high) {
                    Some(done) => {
                        let dirty = self.set_power(unit, 0);
                        finished.push((encoder, done));
                        dirty
                    }
                    None => false,
                }
            }
            Event::EncoderLimit { unit, limit } => {
                match self.shared.encoder(unit) {
                    Some(encoder) => encoder.handle_limit(limit),
                    None => tracing::warn!(unit, ?limit, "counter limit for uninstalled encoder"),
                }
                false
            }
        }
    }

    fn apply_op(&mut self, id: MotorId, op: MotorOp) -> bool {
        let i = id.index();
        let Some(out) = self.outputs.get_mut(i) else {
            tracing::warn!(motor = %id, "change for unknown motor ignored");
            return false;
        };
        let dirty = match op {
            MotorOp::Power(p) => out.direct_power(&mut self.duty, p),
            MotorOp::PwmMaxPercent(pct) => out.direct_pwm_max_percent(&mut self.duty, pct),
            MotorOp::Stop => out.direct_stop(&mut self.duty),
        };
        self.publish_status(i);
        dirty
    }

    fn set_power(&mut self, i: usize, power: i8) -> bool {
        let Some(out) = self.outputs.get_mut(i) else {
            return false;
        };
        let dirty = out.direct_power(&mut self.duty, power);
        self.publish_status(i);
        dirty
    }

    fn publish_status(&self, i: usize) {
        if let (Some(out), Some(st)) = (self.outputs.get(i), self.shared.status.get(i)) {
            st.power.store(out.power(), Ordering::Release);
            st.pwm_max_percent
                .store(out.pwm_max_percent(), Ordering::Release);
        }
    }

    fn flush(&mut self) {
        for (ch, value) in self.duty.staged().iter().enumerate() {
            self.pwm.set_duty(ch, *value);
        }
        self.duty.publish();
        if let Err(e) = self.pwm.flush() {
            let err = map_hw_error(e.as_ref());
            tracing::error!(error = %err, "pwm flush failed");
        }
    }
}

/// Owns the dispatcher, timers, regulator driver and all motors. Dropping it
/// stops and joins every background thread.
pub struct Manager {
    shared: Arc<Shared>,
    motors: Vec<Motor>,
    regulators: RegulatorDriver,
    timers: Timers,
    duty_view: DutyView,
    failsafe_timer: Option<TimerId>,
    shutdown_tx: Option<xch::Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
    completions: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("motors", &self.motors.len())
            .field("queued", &self.shared.queue.len())
            .field("failsafe_timer", &self.failsafe_timer)
            .finish_non_exhaustive()
    }
}

impl Manager {
    /// Start building a manager.
    pub fn builder() -> crate::builder::ManagerBuilder<crate::builder::Missing, crate::builder::Missing>
    {
        crate::builder::ManagerBuilder::default()
    }

    /// Spawn the background threads. `cfg` is already validated.
    pub(crate) fn start(
        cfg: &ManagerCfg,
        encoder_cfg: EncoderCfg,
        regulator_cfg: RegulatorCfg,
        wheel_cfg: WheelCfg,
        pwm: Box<dyn PwmOutput + Send>,
        counter: Arc<dyn PulseCounter + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
    ) -> Result<Self> {
        let motor_count = cfg.motors.len();
        let (queue, rx) = EventQueue::bounded(
            cfg.queue_capacity,
            period_from_ms(cfg.queue_retry_ms),
            cfg.queue_retry_warn,
            motor_count,
        );
        let epoch = clock.now();
        let shared = Arc::new(Shared {
            clock: clock.clone(),
            epoch,
            queue: queue.clone(),
            motors_last_set: AtomicU64::new(0),
            failsafe_ms: cfg.failsafe_ms,
            status: (0..motor_count).map(|_| MotorStatus::default()).collect(),
            encoders: (0..motor_count).map(|_| OnceLock::new()).collect(),
            counter,
            encoder_cfg,
            regulator_cfg,
            wheel_cfg,
        });

        let duty = DutyBuffer::new(pwm.channels());
        let duty_view = duty.view();
        let outputs = cfg
            .motors
            .iter()
            .zip(0u8..)
            .map(|(ch, i)| MotorOutput::new(MotorId(i), *ch, cfg.pwm_resolution))
            .collect();
        let (done_tx, done_rx) = xch::unbounded::<Completion>();
        let completions = std::thread::Builder::new()
            .name("motion-completions".into())
            .spawn(move || run_completions(&done_rx))?;
        let dispatcher = Dispatcher {
            shared: shared.clone(),
            outputs,
            duty,
            pwm,
            completions: done_tx,
        };
        let (shutdown_tx, shutdown_rx) = xch::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("motion-dispatcher".into())
            .spawn(move || dispatcher.run(&rx, &shutdown_rx))?;

        let regulators = RegulatorDriver::new(regulator_cfg, clock.clone());
        let batch = Arc::new(TickBatch::new(queue));
        regulators.add_hooks(batch.clone());

        let motors = (0u8..)
            .take(motor_count)
            .map(|i| Motor::new(MotorId(i), shared.clone(), regulators.clone(), batch.clone()))
            .collect();

        let timers = Timers::spawn(clock);
        let failsafe_timer = if cfg.failsafe_enabled {
            let fs = shared.clone();
            Some(timers.schedule(cfg.failsafe_ms, move || {
                failsafe_check(&fs, fs.now_ms());
                true
            }))
        } else {
            tracing::warn!("motor fail-safe disabled");
            None
        };

        tracing::info!(
            motors = motor_count,
            queue = cfg.queue_capacity,
            failsafe_ms = cfg.failsafe_ms,
            tick_ms = regulator_cfg.tick_ms,
            "motor manager started"
        );

        Ok(Self {
            shared,
            motors,
            regulators,
            timers,
            duty_view,
            failsafe_timer,
            shutdown_tx: Some(shutdown_tx),
            dispatcher: Some(handle),
            completions: Some(completions),
        })
    }

    /// Motor `id`, or `None` (with a warning) if there is no such motor.
    pub fn motor(&self, id: MotorId) -> Option<&Motor> {
        let m = self.motors.get(id.index());
        if m.is_none() {
            tracing::warn!(motor = %id, count = self.motors.len(), "invalid motor index");
        }
        m
    }

    pub fn motors(&self) -> &[Motor] {
        &self.motors
    }

    pub fn motor_count(&self) -> usize {
        self.motors.len()
    }

    /// Builder whose `set()` updates all listed motors in one flush.
    pub fn set_motors(&self) -> MotorChangeBuilder {
        MotorChangeBuilder::new(self.shared.queue.clone())
    }

    /// Run `callback` every `period_ms`; returning false stops it.
    pub fn schedule<F>(&self, period_ms: u64, callback: F) -> TimerId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.timers.schedule(period_ms, callback)
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    /// Id of the fail-safe timer, if it is enabled.
    pub fn failsafe_timer(&self) -> Option<TimerId> {
        self.failsafe_timer
    }

    pub fn regulators(&self) -> &RegulatorDriver {
        &self.regulators
    }

    /// Sink for edge and counter-limit interrupt sources.
    pub fn interrupts(&self) -> Interrupts {
        Interrupts::new(self.shared.queue.clone())
    }

    /// Duties as last flushed to the actuator.
    pub fn duty(&self) -> DutyView {
        self.duty_view.clone()
    }

    /// Interrupt events lost to a full queue.
    pub fn isr_dropped(&self) -> u64 {
        self.shared.queue.isr_dropped()
    }

    /// Microseconds since the manager started, the time base of edge timestamps.
    pub fn timestamp_us(&self) -> i64 {
        self.shared.clock.us_since(self.shared.epoch)
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.regulators.shutdown();
        if let Some(id) = self.failsafe_timer.take() {
            self.timers.cancel(id);
        }
        drop(self.shutdown_tx.take());
        if let Some(handle) = self.dispatcher.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("dispatcher thread joined successfully"),
                Err(e) => tracing::warn!(?e, "dispatcher thread panicked during shutdown"),
            }
        }
        // the dispatcher held the only sender
        if let Some(handle) = self.completions.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("completion thread joined successfully"),
                Err(e) => tracing::warn!(?e, "completion thread panicked during shutdown"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_channel_map;
    use motion_hardware::SimulatedPulseCounter;
    use motion_traits::ManualClock;
    use std::time::Duration;

    fn shared(clock: &ManualClock) -> (Shared, xch::Receiver<Event>) {
        let (queue, rx) = EventQueue::bounded(8, Duration::from_millis(1), 10, 2);
        let shared = Shared {
            clock: Arc::new(clock.clone()),
            epoch: clock.origin(),
            queue,
            motors_last_set: AtomicU64::new(0),
            failsafe_ms: 300,
            status: vec![MotorStatus::default(), MotorStatus::default()],
            encoders: vec![OnceLock::new(), OnceLock::new()],
            counter: Arc::new(SimulatedPulseCounter::new(2)),
            encoder_cfg: EncoderCfg::default(),
            regulator_cfg: RegulatorCfg::default(),
            wheel_cfg: WheelCfg::default(),
        };
        (shared, rx)
    }

    #[test]
    fn failsafe_ignores_until_first_update() {
        let clock = ManualClock::new();
        let (s, rx) = shared(&clock);
        assert!(!failsafe_check(&s, 10_000));
        assert!(rx.is_empty());
    }

    #[test]
    fn failsafe_fires_once_per_silence() {
        let clock = ManualClock::new();
        let (s, rx) = shared(&clock);
        clock.set_offset(Duration::from_millis(100));
        s.mark_motors_set();

        assert!(!failsafe_check(&s, 400), "exactly at the grace period");
        assert!(failsafe_check(&s, 401));
        assert!(!failsafe_check(&s, 800));
        assert_eq!(rx.try_recv().unwrap(), Event::StopAll);
        assert!(rx.is_empty());

        clock.set_offset(Duration::from_millis(900));
        s.mark_motors_set();
        assert!(failsafe_check(&s, 1300));
        assert_eq!(rx.len(), 1);
    }

    #[test]
    fn update_at_time_zero_still_arms() {
        let clock = ManualClock::new();
        let (s, _rx) = shared(&clock);
        s.mark_motors_set();
        assert_eq!(s.motors_last_set.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dispatcher_drains_queue_into_one_flush() {
        let clock = ManualClock::new();
        let (s, rx) = shared(&clock);
        let pwm = motion_hardware::SimulatedPwm::new(4);
        let probe = pwm.probe();
        let mut d = Dispatcher {
            shared: Arc::new(s),
            outputs: default_channel_map(2)
                .into_iter()
                .zip(0u8..)
                .map(|(ch, i)| MotorOutput::new(MotorId(i), ch, 100))
                .collect(),
            duty: DutyBuffer::new(4),
            pwm: Box::new(pwm),
            completions: xch::unbounded().0,
        };
        let q = d.shared.queue.clone();
        q.push(Event::Motors(vec![crate::event::MotorChange {
            id: MotorId(1),
            op: MotorOp::Power(-20),
        }]))
        .unwrap();
        q.push(Event::StopAll).unwrap();

        d.handle_batch(
            Event::Motors(vec![crate::event::MotorChange {
                id: MotorId(0),
                op: MotorOp::Power(60),
            }]),
            &rx,
        );
        assert_eq!(probe.flushes(), 1);
        assert_eq!(probe.frames(), vec![vec![0, 0, 0, 0]]);
        assert_eq!(d.shared.status[1].power.load(Ordering::Relaxed), 0);
        assert!(rx.is_empty());
    }
}
