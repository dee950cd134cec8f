//! Quadrature encoder: tick position and speed estimate.
//!
//! The hardware pulse counter only spans `counter_low_limit..counter_high_limit`
//! and wraps to zero at either end. Each wrap arrives as an
//! [`Event::EncoderLimit`](crate::event::Event) which the dispatcher folds into
//! a software accumulator, so `value()` is the total since installation.
//!
//! Edge events carry a timestamp and the phase level; the interval between
//! accepted edges gives the speed, its sign the direction.
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use motion_traits::{Clock, CounterLimit, PulseCounter};

use crate::config::EncoderCfg;
use crate::error::Result;
use crate::event::{Event, EventQueue, MotorChange, MotorId, MotorOp};
use crate::hw_error::map_hw_error;
use crate::util::{MICROS_PER_SEC, lock};

/// Completion callback of a direct drive.
pub type DriveCallback = Box<dyn FnOnce(&Encoder) + Send>;

type PreemptHook = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct EdgeTiming {
    last_edge_us: Option<i64>,
    /// Signed; negative when turning backwards. 0 until two edges were seen.
    interval_us: i64,
}

struct DriveTarget {
    target: i32,
    dir: i32,
    callback: Option<DriveCallback>,
}

/// A direct drive that just reached its target. The dispatcher cuts the
/// power; [`DriveDone::finish`] then runs on the completion thread.
pub(crate) struct DriveDone(Option<DriveCallback>);

impl DriveDone {
    pub(crate) fn finish(self, encoder: &Encoder) {
        if let Some(cb) = self.0 {
            cb(encoder);
        }
    }
}

pub struct Encoder {
    id: MotorId,
    cfg: EncoderCfg,
    counter: Arc<dyn PulseCounter + Send + Sync>,
    clock: Arc<dyn Clock + Send + Sync>,
    epoch: Instant,
    queue: EventQueue,
    accumulator: AtomicI32,
    timing: Mutex<EdgeTiming>,
    drive: Mutex<Option<DriveTarget>>,
    preempt: Mutex<Option<PreemptHook>>,
}

impl fmt::Debug for Encoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encoder")
            .field("id", &self.id)
            .field("accumulator", &self.accumulator.load(Ordering::Relaxed))
            .field("timing", &*lock(&self.timing))
            .finish_non_exhaustive()
    }
}

impl Encoder {
    pub(crate) fn new(
        id: MotorId,
        cfg: EncoderCfg,
        counter: Arc<dyn PulseCounter + Send + Sync>,
        clock: Arc<dyn Clock + Send + Sync>,
        epoch: Instant,
        queue: EventQueue,
    ) -> Self {
        Self {
            id,
            cfg,
            counter,
            clock,
            epoch,
            queue,
            accumulator: AtomicI32::new(0),
            timing: Mutex::new(EdgeTiming::default()),
            drive: Mutex::new(None),
            preempt: Mutex::new(None),
        }
    }

    pub fn id(&self) -> MotorId {
        self.id
    }

    /// Counter unit this encoder reads.
    pub fn unit(&self) -> usize {
        self.id.index()
    }

    /// Total signed ticks since installation.
    pub fn value(&self) -> Result<i32> {
        let raw = self.counter.count(self.unit()).map_err(|e| {
            let err = map_hw_error(e.as_ref());
            tracing::warn!(motor = %self.id, error = %err, "encoder read failed");
            eyre::Report::new(err)
        })?;
        Ok(self
            .accumulator
            .load(Ordering::Acquire)
            .wrapping_add(i32::from(raw)))
    }

    /// Signed speed in ticks/s divided by `ticks_per_rev`. Reads 0 when the
    /// last edge is too old or the measured interval is implausibly short.
    pub fn speed(&self) -> f32 {
        let now = self.clock.us_since(self.epoch);
        let timing = *lock(&self.timing);
        let Some(last) = timing.last_edge_us else {
            return 0.0;
        };
        if now.saturating_sub(last) > self.cfg.max_period_us {
            return 0.0;
        }
        if timing.interval_us.abs() < self.cfg.min_period_us || timing.interval_us == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let ticks_per_sec = MICROS_PER_SEC as f32 / timing.interval_us as f32;
        ticks_per_sec / self.cfg.ticks_per_rev
    }

    pub fn ticks_per_rev(&self) -> f32 {
        self.cfg.ticks_per_rev
    }

    /// Microseconds on the manager clock, the time base edge timestamps use.
    pub fn timestamp_us(&self) -> i64 {
        self.clock.us_since(self.epoch)
    }

    /// Edge bookkeeping, run on the dispatcher.
    /// Only edges that pass the debounce are checked against a drive target.
    pub(crate) fn handle_edge(&self, timestamp_us: i64, phase_high: bool) -> Option<DriveDone> {
        {
            let mut t = lock(&self.timing);
            match t.last_edge_us {
                None => t.last_edge_us = Some(timestamp_us),
                Some(last) if timestamp_us > last.saturating_add(self.cfg.debounce_us) => {
                    let interval = timestamp_us - last;
                    t.interval_us = if phase_high { -interval } else { interval };
                    t.last_edge_us = Some(timestamp_us);
                }
                Some(_) => {
                    tracing::trace!(motor = %self.id, timestamp_us, "edge debounced");
                    return None;
                }
            }
        }
        self.check_drive()
    }

    /// Fold a counter wrap into the accumulator, run on the dispatcher.
    pub(crate) fn handle_limit(&self, limit: CounterLimit) {
        let step = match limit {
            CounterLimit::High => self.cfg.counter_high_limit,
            CounterLimit::Low => self.cfg.counter_low_limit,
        };
        self.accumulator.fetch_add(step, Ordering::AcqRel);
    }

    fn check_drive(&self) -> Option<DriveDone> {
        let mut drive = lock(&self.drive);
        let d = drive.as_ref()?;
        let value = self.value().ok()?;
        if (i64::from(value) - i64::from(d.target)) * i64::from(d.dir) < 0 {
            return None;
        }
        let done = drive.take().map(|d| DriveDone(d.callback));
        tracing::debug!(motor = %self.id, value, "direct drive reached target");
        done
    }

    /// Run at fixed `power` until `target` is reached or passed, then stop
    /// and call `callback`. Replaces any running direct drive.
    pub fn drive_to_value(
        &self,
        target: i32,
        power: i8,
        callback: Option<DriveCallback>,
    ) -> Result<()> {
        if power == 0 {
            tracing::warn!(motor = %self.id, "direct drive with zero power ignored");
            return Ok(());
        }
        let value = self.value()?;
        if value == target {
            // a drive still running is superseded and its power cut
            let stop = self.cancel_drive();
            if let Some(cb) = callback {
                cb(self);
            }
            if stop {
                return self.queue.push(Event::Motors(vec![MotorChange {
                    id: self.id,
                    op: MotorOp::Power(0),
                }]));
            }
            return Ok(());
        }
        if let Some(hook) = lock(&self.preempt).as_ref() {
            hook();
        }
        let dir: i32 = if target > value { 1 } else { -1 };
        let previous = lock(&self.drive).replace(DriveTarget {
            target,
            dir,
            callback,
        });
        if let Some(DriveTarget {
            callback: Some(cb), ..
        }) = previous
        {
            cb(self);
        }

        let magnitude = power.saturating_abs();
        let power = if dir > 0 { magnitude } else { -magnitude };
        self.queue.push(Event::Motors(vec![MotorChange {
            id: self.id,
            op: MotorOp::Power(power),
        }]))
    }

    /// Like [`drive_to_value`](Self::drive_to_value), relative to the
    /// current value.
    pub fn drive(&self, ticks: i32, power: i8, callback: Option<DriveCallback>) -> Result<()> {
        let value = self.value()?;
        self.drive_to_value(value.wrapping_add(ticks), power, callback)
    }

    /// Abandon a direct drive, calling its callback. Power is left as is.
    pub fn cancel_drive(&self) -> bool {
        let previous = lock(&self.drive).take();
        match previous {
            Some(d) => {
                if let Some(cb) = d.callback {
                    cb(self);
                }
                true
            }
            None => false,
        }
    }

    pub fn is_driving(&self) -> bool {
        lock(&self.drive).is_some()
    }

    /// Called when a direct drive starts, so a regulated mode can stand down.
    pub(crate) fn set_preempt_hook(&self, hook: PreemptHook) {
        *lock(&self.preempt) = Some(hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Interrupts;
    use crossbeam_channel::Receiver;
    use motion_hardware::SimulatedPulseCounter;
    use motion_traits::ManualClock;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Rig {
        encoder: Encoder,
        counter: SimulatedPulseCounter,
        clock: ManualClock,
        rx: Receiver<Event>,
    }

    fn rig(cfg: EncoderCfg, high: i16, low: i16) -> Rig {
        let counter = SimulatedPulseCounter::with_limits(1, high, low);
        counter.enable(0).unwrap();
        let clock = ManualClock::new();
        let (queue, rx) = EventQueue::bounded(16, Duration::from_millis(1), 10, 1);
        counter.connect(Interrupts::new(queue.clone()));
        let encoder = Encoder::new(
            MotorId(0),
            cfg,
            Arc::new(counter.clone()),
            Arc::new(clock.clone()),
            clock.origin(),
            queue,
        );
        Rig {
            encoder,
            counter,
            clock,
            rx,
        }
    }

    impl Rig {
        /// Pulse as hardware would and dispatch the resulting edge.
        fn edge(&self, forward: bool, at_us: u64) -> Option<DriveDone> {
            self.clock.set_offset(Duration::from_micros(at_us));
            self.counter.step(0, forward);
            self.encoder
                .handle_edge(i64::try_from(at_us).unwrap(), !forward)
        }
    }

    #[test]
    fn bounced_edge_is_ignored_for_timing() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.edge(true, 0);
        // the counter's glitch filter swallows the bounce, the edge irq does not
        r.clock.set_offset(Duration::from_micros(10));
        assert!(r.encoder.handle_edge(10, false).is_none());
        assert_eq!(r.encoder.value().unwrap(), 1);
        assert_eq!(r.encoder.speed(), 0.0);
    }

    #[test]
    fn single_edge_counts_but_has_no_speed() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.edge(true, 0);
        assert_eq!(r.encoder.value().unwrap(), 1);
        assert_eq!(r.encoder.speed(), 0.0);
    }

    #[test]
    fn five_ms_interval_reads_200_ticks_per_second() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.edge(true, 0);
        r.edge(true, 5000);
        assert_eq!(r.encoder.value().unwrap(), 2);
        assert!((r.encoder.speed() - 200.0).abs() < 1e-3);
    }

    #[test]
    fn backward_edges_give_negative_speed_and_scale() {
        let cfg = EncoderCfg {
            ticks_per_rev: 4.0,
            ..EncoderCfg::default()
        };
        let r = rig(cfg, i16::MAX, i16::MIN);
        r.edge(false, 0);
        r.edge(false, 5000);
        assert_eq!(r.encoder.value().unwrap(), -2);
        assert_eq!(r.encoder.ticks_per_rev(), 4.0);
        assert!((r.encoder.speed() + 50.0).abs() < 1e-3);
    }

    #[test]
    fn speed_goes_stale() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.edge(true, 0);
        r.edge(true, 5000);
        r.clock.advance(Duration::from_millis(101));
        assert_eq!(r.encoder.speed(), 0.0);
    }

    #[test]
    fn read_failure_surfaces_as_error() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.counter.fail_reads(true);
        assert!(r.encoder.value().is_err());
        r.counter.fail_reads(false);
        assert_eq!(r.encoder.value().unwrap(), 0);
    }

    #[test]
    fn direct_drive_stops_once_at_target() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        r.encoder
            .drive(
                3,
                40,
                Some(Box::new(move |_| {
                    h.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();
        assert!(r.encoder.is_driving());
        assert_eq!(
            r.rx.try_recv().unwrap(),
            Event::Motors(vec![MotorChange {
                id: MotorId(0),
                op: MotorOp::Power(40)
            }])
        );

        assert!(r.edge(true, 0).is_none());
        assert!(r.edge(true, 5000).is_none());
        let done = r.edge(true, 10_000).expect("target reached");
        done.finish(&r.encoder);
        assert!(r.edge(true, 15_000).is_none());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!r.encoder.is_driving());
    }

    #[test]
    fn backward_drive_uses_negative_power() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.encoder.drive_to_value(-5, -30, None).unwrap();
        assert_eq!(
            r.rx.try_recv().unwrap(),
            Event::Motors(vec![MotorChange {
                id: MotorId(0),
                op: MotorOp::Power(-30)
            }])
        );
    }

    #[test]
    fn new_drive_completes_the_superseded_one() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        let hits = Arc::new(AtomicU32::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        r.encoder
            .drive_to_value(
                100,
                20,
                Some(Box::new(move |_| {
                    a.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();
        r.encoder
            .drive_to_value(
                200,
                20,
                Some(Box::new(move |_| {
                    b.fetch_add(10, Ordering::Relaxed);
                })),
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(r.encoder.cancel_drive());
        assert_eq!(hits.load(Ordering::Relaxed), 11);
    }

    #[test]
    fn drive_to_current_value_completes_immediately() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        r.encoder
            .drive_to_value(
                0,
                50,
                Some(Box::new(move |_| {
                    h.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(r.rx.is_empty());
    }

    #[test]
    fn bounced_edge_does_not_finish_a_drive() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        r.encoder.drive(2, 40, None).unwrap();
        assert!(r.edge(true, 0).is_none());

        // counted by the hardware, but inside the debounce window
        r.clock.set_offset(Duration::from_micros(10));
        r.counter.step(0, true);
        assert!(r.encoder.handle_edge(10, false).is_none());
        assert_eq!(r.encoder.value().unwrap(), 2);
        assert!(r.encoder.is_driving());

        r.clock.set_offset(Duration::from_micros(5000));
        assert!(r.encoder.handle_edge(5000, false).is_some());
        assert!(!r.encoder.is_driving());
    }

    #[test]
    fn drive_to_current_value_supersedes_running_drive() {
        let r = rig(EncoderCfg::default(), i16::MAX, i16::MIN);
        let hits = Arc::new(AtomicU32::new(0));
        let (a, b) = (hits.clone(), hits.clone());
        r.encoder
            .drive_to_value(
                5,
                30,
                Some(Box::new(move |_| {
                    a.fetch_add(1, Ordering::Relaxed);
                })),
            )
            .unwrap();
        assert!(r.rx.try_recv().is_ok());

        r.encoder
            .drive_to_value(
                0,
                30,
                Some(Box::new(move |_| {
                    b.fetch_add(10, Ordering::Relaxed);
                })),
            )
            .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 11);
        assert!(!r.encoder.is_driving());
        assert_eq!(
            r.rx.try_recv().unwrap(),
            Event::Motors(vec![MotorChange {
                id: MotorId(0),
                op: MotorOp::Power(0)
            }])
        );
        assert!(r.rx.is_empty());
    }

    proptest! {
        #[test]
        fn value_tracks_net_pulses_across_wraps(steps in prop::collection::vec(any::<bool>(), 0..400)) {
            let cfg = EncoderCfg {
                counter_high_limit: 7,
                counter_low_limit: -5,
                ..EncoderCfg::default()
            };
            let r = rig(cfg, 7, -5);
            let mut expected = 0i32;
            for forward in steps {
                r.counter.step(0, forward);
                expected += if forward { 1 } else { -1 };
                while let Ok(ev) = r.rx.try_recv() {
                    if let Event::EncoderLimit { limit, .. } = ev {
                        r.encoder.handle_limit(limit);
                    }
                }
                prop_assert_eq!(r.encoder.value().unwrap(), expected);
            }
        }
    }
}
