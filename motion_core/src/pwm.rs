//! Duty-cycle cells and the per-motor output stage.
//!
//! The dispatcher owns a [`DutyBuffer`]. It stages new duties, then
//! `publish()` copies them into the inactive bank and swaps the active index
//! in one atomic store. Readers holding a [`DutyView`] always see a complete
//! frame without taking a lock.
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};

use crate::config::MotorChannels;
use crate::event::MotorId;
use crate::util::clamp_logged;

/// Largest power magnitude a motor accepts.
pub const POWER_MAX: i8 = 100;

struct DutyBanks {
    cells: [Box<[AtomicU16]>; 2],
    active: AtomicUsize,
    flips: AtomicU64,
}

impl DutyBanks {
    fn new(channels: usize) -> Self {
        let bank = || (0..channels).map(|_| AtomicU16::new(0)).collect::<Box<[_]>>();
        Self {
            cells: [bank(), bank()],
            active: AtomicUsize::new(0),
            flips: AtomicU64::new(0),
        }
    }
}

/// Double-buffered duty cells, written by the dispatcher only.
pub struct DutyBuffer {
    staged: Vec<u16>,
    banks: Arc<DutyBanks>,
}

impl DutyBuffer {
    pub fn new(channels: usize) -> Self {
        Self {
            staged: vec![0; channels],
            banks: Arc::new(DutyBanks::new(channels)),
        }
    }

    pub fn channels(&self) -> usize {
        self.staged.len()
    }

    /// Staged value of `channel`.
    pub fn get(&self, channel: usize) -> u16 {
        self.staged.get(channel).copied().unwrap_or(0)
    }

    /// Stage `value` on `channel`. Returns true if the cell changed.
    pub fn set(&mut self, channel: usize, value: u16) -> bool {
        match self.staged.get_mut(channel) {
            Some(cell) if *cell != value => {
                *cell = value;
                true
            }
            Some(_) => false,
            None => {
                tracing::warn!(channel, "duty write to unknown channel ignored");
                false
            }
        }
    }

    /// Copy the staged frame into the inactive bank and make it active.
    pub fn publish(&mut self) {
        let active = self.banks.active.load(Ordering::Acquire);
        let next = active ^ 1;
        for (cell, v) in self.banks.cells[next].iter().zip(&self.staged) {
            cell.store(*v, Ordering::Relaxed);
        }
        self.banks.active.store(next, Ordering::Release);
        self.banks.flips.fetch_add(1, Ordering::Relaxed);
    }

    /// Staged frame in channel order.
    pub fn staged(&self) -> &[u16] {
        &self.staged
    }

    pub fn view(&self) -> DutyView {
        DutyView {
            banks: self.banks.clone(),
        }
    }
}

/// Lock-free reader of the active duty bank.
#[derive(Clone)]
pub struct DutyView {
    banks: Arc<DutyBanks>,
}

impl DutyView {
    pub fn duty(&self, channel: usize) -> Option<u16> {
        let active = self.banks.active.load(Ordering::Acquire);
        self.banks.cells[active]
            .get(channel)
            .map(|c| c.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<u16> {
        let active = self.banks.active.load(Ordering::Acquire);
        self.banks.cells[active]
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect()
    }

    /// Number of published frames.
    pub fn flips(&self) -> u64 {
        self.banks.flips.load(Ordering::Relaxed)
    }
}

/// Output stage of one motor: power, ceiling and its two duty cells.
pub(crate) struct MotorOutput {
    id: MotorId,
    channels: MotorChannels,
    resolution: u16,
    power: i8,
    pwm_max_percent: u8,
    pwm_scale: f32,
}

impl MotorOutput {
    pub(crate) fn new(id: MotorId, channels: MotorChannels, resolution: u16) -> Self {
        Self {
            id,
            channels,
            resolution,
            power: 0,
            pwm_max_percent: 100,
            pwm_scale: Self::scale(resolution, 100),
        }
    }

    fn scale(resolution: u16, percent: u8) -> f32 {
        f32::from(resolution) * f32::from(percent) / 100.0 / f32::from(POWER_MAX)
    }

    pub(crate) fn power(&self) -> i8 {
        self.power
    }

    pub(crate) fn pwm_max_percent(&self) -> u8 {
        self.pwm_max_percent
    }

    /// Drive with signed `power`. Returns true if a duty cell changed.
    pub(crate) fn direct_power(&mut self, duty: &mut DutyBuffer, power: i8) -> bool {
        let power = clamp_logged(power, -POWER_MAX, POWER_MAX, "motor power");
        self.power = power;
        let signed = if self.channels.inverted {
            -i16::from(power)
        } else {
            i16::from(power)
        };
        let max = i32::from(self.resolution);
        #[allow(clippy::cast_possible_truncation)]
        let pwm = (f32::from(signed) * self.pwm_scale).round() as i32;
        let pwm = clamp_logged(pwm, -max, max, "motor pwm");
        let (fwd, rev) = if pwm >= 0 { (pwm, 0) } else { (0, -pwm) };
        tracing::trace!(motor = %self.id, power, fwd, rev, "motor power");
        let a = duty.set(self.channels.forward, to_duty(fwd));
        let b = duty.set(self.channels.reverse, to_duty(rev));
        a || b
    }

    /// Change the duty ceiling and re-apply the current power under it.
    pub(crate) fn direct_pwm_max_percent(&mut self, duty: &mut DutyBuffer, percent: u8) -> bool {
        let percent = clamp_logged(percent, 0, 100, "pwm max percent");
        self.pwm_max_percent = percent;
        self.pwm_scale = Self::scale(self.resolution, percent);
        self.direct_power(duty, self.power)
    }

    /// Brake: both channels at full duty.
    pub(crate) fn direct_stop(&mut self, duty: &mut DutyBuffer) -> bool {
        self.power = 0;
        let a = duty.set(self.channels.forward, self.resolution);
        let b = duty.set(self.channels.reverse, self.resolution);
        a || b
    }
}

fn to_duty(v: i32) -> u16 {
    u16::try_from(v.max(0)).unwrap_or(u16::MAX)
}
