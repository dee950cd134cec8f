//! Hardware seams for the motion core.
//!
//! The core never touches registers directly. It drives a [`PwmOutput`]
//! actuator, reads a [`PulseCounter`] bank and is fed by interrupt sources
//! through an [`InterruptSink`].
pub mod clock;

pub use clock::{Clock, ManualClock, MonotonicClock};

/// Per-channel duty-cycle actuator ("set per-channel duty, then flush").
pub trait PwmOutput {
    /// Number of output channels.
    fn channels(&self) -> usize;

    /// Stage a duty value for one channel. Takes effect on the next `flush`.
    fn set_duty(&mut self, channel: usize, value: u16);

    /// Push all staged duties to the hardware at once.
    fn flush(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Bank of hardware pulse counters, one unit per encoder.
///
/// Each unit counts up or down and wraps to zero when it reaches its high or
/// low limit, raising [`InterruptSink::counter_limit`].
pub trait PulseCounter {
    /// Start counting on `unit` and enable its interrupts.
    fn enable(&self, unit: usize) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Current raw count of `unit`.
    fn count(&self, unit: usize) -> Result<i16, Box<dyn std::error::Error + Send + Sync>>;
}

/// Which limit a pulse counter unit hit before wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterLimit {
    High,
    Low,
}

/// Entry points for interrupt-context producers.
///
/// Implementations must not block, allocate or take locks. Both methods
/// return `true` when the consumer has to be woken to handle the event.
pub trait InterruptSink {
    /// A qualifying encoder edge at `timestamp_us` (monotonic). `phase_high`
    /// is the level of the quadrature phase pin sampled at the edge.
    fn encoder_edge(&self, unit: usize, timestamp_us: i64, phase_high: bool) -> bool;

    /// Pulse counter `unit` reached `limit` and wrapped to zero.
    fn counter_limit(&self, unit: usize, limit: CounterLimit) -> bool;
}
