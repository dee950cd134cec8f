//! Periodic and one-shot callbacks on a dedicated thread.
//!
//! A callback returning `false` is removed after that run. While callbacks
//! run the table lock is released, so they (and any other thread) may call
//! `schedule`, `reset` and `cancel`. Ids are never handed out twice while
//! the timer holding them is still in the table.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use motion_traits::Clock;

use crate::util::{lock, period_from_ms};

pub type TimerId = u16;

/// Never returned by `schedule`.
pub const INVALID_ID: TimerId = 0;

pub type TimerCallback = Box<dyn FnMut() -> bool + Send>;

struct Slot {
    id: TimerId,
    period: Duration,
    next_due: Instant,
    /// `None` while the callback is running.
    callback: Option<TimerCallback>,
    /// `reset` was called while the callback was running.
    rearmed: bool,
}

/// The timer table without any threading.
pub(crate) struct TimerTable {
    slots: Vec<Slot>,
    id_counter: TimerId,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            id_counter: 1,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn free_id(&mut self) -> TimerId {
        let mut id = self.id_counter;
        loop {
            if id == INVALID_ID || self.slots.iter().any(|s| s.id == id) {
                id = id.wrapping_add(1);
                continue;
            }
            self.id_counter = id.wrapping_add(1);
            return id;
        }
    }

    pub(crate) fn schedule(
        &mut self,
        now: Instant,
        period: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let id = self.free_id();
        self.slots.push(Slot {
            id,
            period,
            next_due: now + period,
            callback: Some(callback),
            rearmed: false,
        });
        id
    }

    pub(crate) fn reset(&mut self, id: TimerId, now: Instant, period: Duration) -> bool {
        match self.slots.iter_mut().find(|s| s.id == id) {
            Some(slot) => {
                slot.period = period;
                slot.next_due = now + period;
                slot.rearmed = slot.callback.is_none();
                true
            }
            None => false,
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        match self.slots.iter().position(|s| s.id == id) {
            Some(idx) => {
                self.slots.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Take the callbacks of every timer due at `now`.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(TimerId, TimerCallback)> {
        self.slots
            .iter_mut()
            .filter(|s| s.next_due <= now)
            .filter_map(|s| s.callback.take().map(|cb| (s.id, cb)))
            .collect()
    }

    /// Put a callback back after it ran at `fired_at`.
    pub(crate) fn restore(
        &mut self,
        id: TimerId,
        callback: TimerCallback,
        keep: bool,
        fired_at: Instant,
    ) {
        let Some(idx) = self.slots.iter().position(|s| s.id == id) else {
            // cancelled while running
            return;
        };
        if !keep {
            self.slots.swap_remove(idx);
            return;
        }
        let slot = &mut self.slots[idx];
        slot.callback = Some(callback);
        if slot.rearmed {
            slot.rearmed = false;
        } else {
            slot.next_due = fired_at + slot.period;
        }
    }

    /// Earliest due time among timers that are not currently running.
    pub(crate) fn next_due(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|s| s.callback.is_some())
            .map(|s| s.next_due)
            .min()
    }
}

struct TimersInner {
    table: Mutex<TimerTable>,
    wake: Condvar,
    shutdown: AtomicBool,
    clock: Arc<dyn Clock + Send + Sync>,
}

/// Timer scheduler. Dropping it stops and joins the thread.
pub struct Timers {
    inner: Arc<TimersInner>,
    join_handle: Option<JoinHandle<()>>,
}

impl Timers {
    pub fn spawn(clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let inner = Arc::new(TimersInner {
            table: Mutex::new(TimerTable::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            clock,
        });
        let worker = inner.clone();
        let join_handle = std::thread::Builder::new()
            .name("motion-timers".into())
            .spawn(move || run(&worker))
            .map_err(|e| tracing::error!(error = %e, "failed to spawn timer thread"))
            .ok();
        Self { inner, join_handle }
    }

    /// Run `callback` every `period_ms` until it returns false.
    pub fn schedule<F>(&self, period_ms: u64, callback: F) -> TimerId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let now = self.inner.clock.now();
        let id = lock(&self.inner.table).schedule(
            now,
            period_from_ms(period_ms),
            Box::new(callback),
        );
        self.inner.wake.notify_one();
        tracing::debug!(id, period_ms, "timer scheduled");
        id
    }

    /// Change the period of `id` and restart its countdown from now.
    pub fn reset(&self, id: TimerId, period_ms: u64) -> bool {
        let now = self.inner.clock.now();
        let found = lock(&self.inner.table).reset(id, now, period_from_ms(period_ms));
        if found {
            self.inner.wake.notify_one();
        }
        found
    }

    /// Remove `id`. A run already in progress completes.
    pub fn cancel(&self, id: TimerId) -> bool {
        let found = lock(&self.inner.table).cancel(id);
        if found {
            tracing::debug!(id, "timer cancelled");
        }
        found
    }

    /// Live timers, including ones currently running.
    pub fn len(&self) -> usize {
        lock(&self.inner.table).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-evaluate due times now (e.g. after moving a manual clock).
    pub fn notify(&self) {
        self.inner.wake.notify_one();
    }
}

fn run(inner: &TimersInner) {
    loop {
        let now = inner.clock.now();
        let due = {
            let mut table = lock(&inner.table);
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            table.take_due(now)
        };

        for (id, mut callback) in due {
            let keep = callback();
            lock(&inner.table).restore(id, callback, keep, now);
        }

        let table = lock(&inner.table);
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        match table.next_due() {
            None => {
                let _unused = inner.wake.wait(table);
            }
            Some(due) => {
                let wait = due.saturating_duration_since(inner.clock.now());
                if !wait.is_zero() {
                    let _unused = inner.wake.wait_timeout(table, wait);
                }
            }
        }
    }
    tracing::trace!("timer thread exiting cleanly");
}

impl Drop for Timers {
    fn drop(&mut self) {
        {
            let _table = lock(&self.inner.table);
            self.inner.shutdown.store(true, Ordering::Release);
        }
        self.inner.wake.notify_all();
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("timer thread joined successfully"),
                Err(e) => tracing::warn!(?e, "timer thread panicked during shutdown"),
            }
        }
    }
}
