//! Events flowing into the dispatcher and the queue that carries them.
//!
//! Interrupt sources enqueue with [`EventQueue::push_from_isr`], which never
//! blocks and never allocates. Everything else uses [`EventQueue::push`],
//! which waits for room instead of dropping the event.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel as xch;
use motion_traits::{CounterLimit, InterruptSink};

use crate::error::{MotionError, Result};

/// Index of a physical motor, starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MotorId(pub u8);

impl MotorId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for MotorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", u16::from(self.0) + 1)
    }
}

/// One operation on one motor's output stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorOp {
    /// Signed power in -100..=100.
    Power(i8),
    /// Ceiling on the duty cycle in percent (0..=100).
    PwmMaxPercent(u8),
    /// Brake: both channels driven at full duty.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotorChange {
    pub id: MotorId,
    pub op: MotorOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Apply all changes, then flush the outputs once.
    Motors(Vec<MotorChange>),
    /// Zero every motor's power, then flush once.
    StopAll,
    EncoderEdge {
        unit: usize,
        timestamp_us: i64,
        phase_high: bool,
    },
    EncoderLimit {
        unit: usize,
        limit: CounterLimit,
    },
}

/// Producer side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    tx: xch::Sender<Event>,
    retry: Duration,
    retry_warn: u32,
    motor_count: usize,
    isr_dropped: Arc<AtomicU64>,
}

impl EventQueue {
    pub(crate) fn bounded(
        capacity: usize,
        retry: Duration,
        retry_warn: u32,
        motor_count: usize,
    ) -> (Self, xch::Receiver<Event>) {
        let (tx, rx) = xch::bounded(capacity.max(1));
        (
            Self {
                tx,
                retry,
                retry_warn,
                motor_count,
                isr_dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue from task context. Waits while the queue is full; only fails
    /// once the dispatcher is gone.
    pub fn push(&self, event: Event) -> Result<()> {
        let mut event = event;
        let mut attempts: u32 = 0;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return Ok(()),
                Err(xch::TrySendError::Full(back)) => {
                    event = back;
                    attempts = attempts.saturating_add(1);
                    if attempts == self.retry_warn {
                        tracing::warn!(attempts, "event queue full, still retrying");
                    }
                    std::thread::sleep(self.retry);
                }
                Err(xch::TrySendError::Disconnected(_)) => {
                    tracing::error!("event queue closed, event discarded");
                    return Err(eyre::Report::new(MotionError::QueueClosed));
                }
            }
        }
    }

    /// Enqueue from interrupt context. Never blocks. Returns true when the
    /// event was accepted into an empty queue, i.e. the consumer may be
    /// parked and needs waking. A full queue drops the event and counts it.
    pub fn push_from_isr(&self, event: Event) -> bool {
        let was_empty = self.tx.is_empty();
        match self.tx.try_send(event) {
            Ok(()) => was_empty,
            Err(_) => {
                self.isr_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Events currently waiting for the dispatcher.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Interrupt events lost to a full queue.
    pub fn isr_dropped(&self) -> u64 {
        self.isr_dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn motor_count(&self) -> usize {
        self.motor_count
    }
}

/// [`InterruptSink`] handed to edge and counter interrupt sources.
#[derive(Debug, Clone)]
pub struct Interrupts {
    queue: EventQueue,
}

impl Interrupts {
    pub(crate) fn new(queue: EventQueue) -> Self {
        Self { queue }
    }
}

impl InterruptSink for Interrupts {
    fn encoder_edge(&self, unit: usize, timestamp_us: i64, phase_high: bool) -> bool {
        self.queue.push_from_isr(Event::EncoderEdge {
            unit,
            timestamp_us,
            phase_high,
        })
    }

    fn counter_limit(&self, unit: usize, limit: CounterLimit) -> bool {
        self.queue
            .push_from_isr(Event::EncoderLimit { unit, limit })
    }
}
