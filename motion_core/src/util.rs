//! Small helpers shared across the motion core.
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Number of microseconds in one second.
pub const MICROS_PER_SEC: i64 = 1_000_000;

/// Lock a mutex, recovering the data if a previous holder panicked.
#[inline]
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Period for a millisecond setting, never shorter than 1 ms.
#[inline]
pub fn period_from_ms(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

/// Clamp `value` into `[lo, hi]`, logging a warning when it had to be changed.
pub fn clamp_logged<T>(value: T, lo: T, hi: T, what: &'static str) -> T
where
    T: PartialOrd + Copy + Debug,
{
    if value < lo {
        tracing::warn!(?value, min = ?lo, what, "value clamped");
        lo
    } else if value > hi {
        tracing::warn!(?value, max = ?hi, what, "value clamped");
        hi
    } else {
        value
    }
}

/// Move `current` toward `target` by at most `max_step`, snapping onto the
/// target once it is within one step.
#[inline]
pub fn approach(current: f32, target: f32, max_step: f32) -> f32 {
    let diff = target - current;
    if diff.abs() <= max_step {
        target
    } else {
        current + max_step.copysign(diff)
    }
}
