//! Trapezoidal motion profile.
//!
//! A `Wheel` produces a position setpoint that moves toward a target with
//! bounded acceleration, cruises at the requested speed and brakes from the
//! deceleration point so it arrives at the reachable final speed without
//! passing the target. In velocity mode it just ramps to the requested speed
//! and keeps going.
//!
//! Units are encoder ticks, ticks/s and ticks/s². The type is not
//! synchronized; the motor facade keeps it behind a mutex.
use std::fmt;
use std::sync::Arc;

use crate::config::WheelCfg;
use crate::util::approach;

/// Called once when the profile gets within the position threshold.
pub type OnTarget = Arc<dyn Fn() + Send + Sync>;

const MIN_ACCELERATION: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionTarget {
    Position(f32),
    /// Unbounded travel; the sign of the speed picks the direction.
    Velocity(f32),
}

pub struct Wheel {
    position: f32,
    /// Current speed magnitude.
    speed: f32,
    /// Sign of the current motion in velocity mode.
    heading: f32,
    target: Option<MotionTarget>,
    cruise_speed: f32,
    /// What `speed` ramps toward this tick: cruise, or the exit speed once braking.
    target_speed: f32,
    final_speed: f32,
    /// `final_speed` limited to what the remaining distance allows.
    exit_speed: f32,
    acceleration: f32,
    decel_point: f32,
    travel_dir: f32,
    braking: bool,
    pos_threshold: f32,
    on_target: bool,
    callback: Option<OnTarget>,
    arrived: Option<OnTarget>,
}

impl fmt::Debug for Wheel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wheel")
            .field("position", &self.position)
            .field("speed", &self.speed)
            .field("target", &self.target)
            .field("target_speed", &self.target_speed)
            .field("exit_speed", &self.exit_speed)
            .field("decel_point", &self.decel_point)
            .field("on_target", &self.on_target)
            .finish_non_exhaustive()
    }
}

impl Default for Wheel {
    fn default() -> Self {
        Self::new(&WheelCfg::default())
    }
}

/// Distance covered while changing speed from `from` to `to` at `accel`.
fn braking_distance(from: f32, to: f32, accel: f32) -> f32 {
    let t = (to - from).abs() / accel;
    0.5 * accel * t * t + from.min(to) * t
}

impl Wheel {
    pub fn new(cfg: &WheelCfg) -> Self {
        Self {
            position: 0.0,
            speed: 0.0,
            heading: 1.0,
            target: None,
            cruise_speed: 0.0,
            target_speed: 0.0,
            final_speed: 0.0,
            exit_speed: 0.0,
            acceleration: cfg.acceleration.max(MIN_ACCELERATION),
            decel_point: 0.0,
            travel_dir: 1.0,
            braking: false,
            pos_threshold: cfg.pos_threshold.abs(),
            on_target: false,
            callback: None,
            arrived: None,
        }
    }

    pub fn acceleration(&mut self, accel: f32) {
        if !accel.is_finite() || accel < MIN_ACCELERATION {
            tracing::warn!(accel, min = MIN_ACCELERATION, "acceleration clamped");
        }
        self.acceleration = if accel.is_finite() {
            accel.max(MIN_ACCELERATION)
        } else {
            MIN_ACCELERATION
        };
        self.recalc();
    }

    /// Cruise speed. In velocity mode the sign selects the direction.
    pub fn speed(&mut self, speed: f32) {
        if !speed.is_finite() {
            tracing::warn!(speed, "non-finite speed ignored");
            return;
        }
        self.cruise_speed = speed.abs();
        if let Some(MotionTarget::Velocity(_)) = self.target {
            self.target = Some(MotionTarget::Velocity(speed));
        }
        self.recalc();
    }

    /// Speed to arrive at the target with.
    pub fn final_speed(&mut self, speed: f32) {
        if !speed.is_finite() {
            tracing::warn!(speed, "non-finite final speed ignored");
            return;
        }
        self.final_speed = speed.abs();
        self.recalc();
    }

    /// New absolute target. Re-arms the on-target callback.
    pub fn position(&mut self, target: f32) {
        if !target.is_finite() {
            tracing::warn!(target, "non-finite target ignored, use speed_mode()");
            return;
        }
        self.target = Some(MotionTarget::Position(target));
        self.on_target = false;
        self.recalc();
    }

    /// Drop the position target and travel at the cruise speed indefinitely.
    pub fn speed_mode(&mut self) {
        let dir = match self.target {
            Some(MotionTarget::Velocity(v)) => v,
            _ => self.cruise_speed,
        };
        self.target = Some(MotionTarget::Velocity(self.cruise_speed.copysign(dir)));
        self.on_target = false;
        self.recalc();
    }

    pub fn is_speed_mode(&self) -> bool {
        matches!(self.target, Some(MotionTarget::Velocity(_)))
    }

    /// Clear the target; `process` then holds the current position.
    pub fn stop(&mut self) {
        self.target = None;
        self.speed = 0.0;
        self.braking = false;
    }

    /// Re-anchor the profile at `position` and go idle.
    pub fn sync(&mut self, position: f32) {
        self.position = position;
        self.stop();
        self.on_target = false;
    }

    pub fn set_pos_threshold(&mut self, threshold: f32) {
        self.pos_threshold = threshold.abs();
    }

    pub fn register_callback(&mut self, callback: Option<OnTarget>) {
        self.callback = callback;
    }

    /// Go to `target` at `speed`, calling `callback` on arrival.
    pub fn drive_to_value(&mut self, target: f32, speed: f32, callback: Option<OnTarget>) {
        self.register_callback(callback);
        self.speed(speed);
        self.position(target);
    }

    /// Move `distance` relative to the current target (or position when idle).
    pub fn drive(&mut self, distance: f32, speed: f32, callback: Option<OnTarget>) {
        let base = match self.target {
            Some(MotionTarget::Position(t)) => t,
            _ => self.position,
        };
        self.drive_to_value(base + distance, speed, callback);
    }

    pub fn is_on_position(&self) -> bool {
        self.on_target
    }

    pub fn current_position(&self) -> f32 {
        self.position
    }

    /// Signed speed of the setpoint.
    pub fn current_speed(&self) -> f32 {
        match self.target {
            Some(MotionTarget::Velocity(_)) => self.speed * self.heading,
            Some(MotionTarget::Position(t)) => self.speed.copysign(t - self.position),
            None => 0.0,
        }
    }

    pub fn target(&self) -> Option<MotionTarget> {
        self.target
    }

    /// The final speed the profile will actually arrive with.
    pub fn reachable_final_speed(&self) -> f32 {
        self.exit_speed
    }

    pub fn deceleration_point(&self) -> Option<f32> {
        match self.target {
            Some(MotionTarget::Position(_)) => Some(self.decel_point),
            _ => None,
        }
    }

    /// Callback armed by the last arrival, if not yet taken.
    pub fn take_arrival(&mut self) -> Option<OnTarget> {
        self.arrived.take()
    }

    /// Advance by `dt` seconds and return the new setpoint.
    pub fn process(&mut self, dt: f32) -> f32 {
        let dt = if dt.is_finite() { dt.max(0.0) } else { 0.0 };
        match self.target {
            None => {}
            Some(MotionTarget::Velocity(v)) => {
                // ramp the signed velocity so a reversal passes through zero
                let current = self.speed * self.heading;
                let next = approach(current, v, self.acceleration * dt);
                self.speed = next.abs();
                if next.abs() > 0.0 {
                    self.heading = next.signum();
                }
                self.position += next * dt;
            }
            Some(MotionTarget::Position(target)) => {
                let ramped = approach(self.speed, self.target_speed, self.acceleration * dt);
                let remaining = (target - self.position).abs();
                self.speed = if self.braking && remaining > 0.0 {
                    // never brake harder than needed to still reach the target
                    let curve =
                        (self.exit_speed.powi(2) + 2.0 * self.acceleration * remaining).sqrt();
                    ramped.max(curve.min(self.speed))
                } else {
                    ramped
                };

                let before = self.past_decel_point();
                self.heading = self.travel_dir;
                self.position = approach(self.position, target, self.speed * dt);
                if !self.braking && !before && self.past_decel_point() {
                    self.braking = true;
                    self.target_speed = self.exit_speed;
                }

                if !self.on_target && (target - self.position).abs() <= self.pos_threshold {
                    self.on_target = true;
                    self.arrived.clone_from(&self.callback);
                }
            }
        }
        self.position
    }

    fn past_decel_point(&self) -> bool {
        (self.position - self.decel_point) * self.travel_dir >= 0.0
    }

    fn recalc(&mut self) {
        self.target_speed = self.cruise_speed;
        self.exit_speed = self.final_speed;
        self.braking = false;
        let Some(MotionTarget::Position(target)) = self.target else {
            return;
        };

        let delta = target - self.position;
        self.travel_dir = if delta < 0.0 { -1.0 } else { 1.0 };
        let remaining = delta.abs();
        let accel = self.acceleration;

        let mut s = braking_distance(self.target_speed, self.exit_speed, accel);
        if s > remaining {
            let reach = (2.0 * accel * remaining).copysign(self.exit_speed - self.target_speed);
            self.exit_speed = (self.target_speed.powi(2) + reach).max(0.0).sqrt();
            s = braking_distance(self.target_speed, self.exit_speed, accel).min(remaining);
        }
        self.decel_point = target - s * self.travel_dir;

        if self.past_decel_point() {
            self.braking = true;
            self.target_speed = self.exit_speed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DT: f32 = 0.01;

    fn wheel(accel: f32) -> Wheel {
        Wheel::new(&WheelCfg {
            acceleration: accel,
            pos_threshold: 1.0,
        })
    }

    #[test]
    fn idle_profile_holds_position() {
        let mut w = wheel(100.0);
        w.sync(42.0);
        assert_eq!(w.process(DT), 42.0);
        assert_eq!(w.current_speed(), 0.0);
    }

    #[test]
    fn decel_point_for_plain_stop() {
        let mut w = wheel(100.0);
        w.speed(100.0);
        w.position(1000.0);
        // 100²/(2*100) = 50 ticks of braking
        let p = w.deceleration_point().unwrap();
        assert!((p - 950.0).abs() < 1e-3, "decel point {p}");
        assert!((w.reachable_final_speed()).abs() < f32::EPSILON);
    }

    #[test]
    fn short_move_limits_final_speed() {
        let mut w = wheel(100.0);
        w.speed(10.0);
        w.final_speed(100.0);
        w.position(2.0);
        // cannot reach 100 within 2 ticks: sqrt(10² + 2*100*2)
        let expected = (100.0f32 + 400.0).sqrt();
        assert!((w.reachable_final_speed() - expected).abs() < 1e-3);
    }

    #[test]
    fn backward_move_mirrors_decel_point() {
        let mut w = wheel(100.0);
        w.sync(0.0);
        w.speed(100.0);
        w.position(-1000.0);
        let p = w.deceleration_point().unwrap();
        assert!((p + 950.0).abs() < 1e-3);
        for _ in 0..10 {
            w.process(DT);
        }
        assert!(w.current_position() < 0.0);
        assert!(w.current_speed() < 0.0);
    }

    #[test]
    fn arrives_and_fires_callback_once() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        let mut w = wheel(500.0);
        w.drive_to_value(
            200.0,
            300.0,
            Some(Arc::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            })),
        );

        let mut fired = 0;
        for _ in 0..1000 {
            let pos = w.process(DT);
            assert!(pos <= 200.0);
            if let Some(cb) = w.take_arrival() {
                cb();
                fired += 1;
            }
        }
        assert_eq!(w.current_position(), 200.0);
        assert!(w.is_on_position());
        assert_eq!(fired, 1);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(w.current_speed(), 0.0);
    }

    #[test]
    fn new_target_rearms_callback() {
        let mut w = wheel(500.0);
        w.register_callback(Some(Arc::new(|| {})));
        w.speed(100.0);
        w.position(5.0);
        for _ in 0..200 {
            w.process(DT);
        }
        assert!(w.take_arrival().is_some());
        w.drive(5.0, 100.0, Some(Arc::new(|| {})));
        assert!(!w.is_on_position());
        assert_eq!(w.target(), Some(MotionTarget::Position(10.0)));
    }

    #[test]
    fn velocity_mode_ramps_and_keeps_going() {
        let mut w = wheel(100.0);
        w.speed(-50.0);
        w.speed_mode();
        assert!(w.is_speed_mode());
        w.speed(-50.0);
        for _ in 0..100 {
            w.process(DT);
        }
        assert!((w.current_speed() + 50.0).abs() < 1e-3);
        assert!(w.current_position() < -10.0);
        assert_eq!(w.deceleration_point(), None);
    }

    #[test]
    fn invalid_inputs_are_ignored_or_clamped() {
        let mut w = wheel(100.0);
        w.position(f32::NAN);
        assert_eq!(w.target(), None);
        w.acceleration(0.0);
        w.speed(10.0);
        w.position(1.0);
        assert!(w.process(DT).is_finite());
    }
}
