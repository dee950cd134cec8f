//! Stand-ins for running the core without hardware.

/// PWM output that accepts and discards everything.
#[derive(Debug, Clone, Copy)]
pub struct NoopOutput {
    channels: usize,
}

impl NoopOutput {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl motion_traits::PwmOutput for NoopOutput {
    fn channels(&self) -> usize {
        self.channels
    }

    fn set_duty(&mut self, _channel: usize, _value: u16) {}

    fn flush(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Pulse counter that never moves; useful for motors without encoders.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPulseCounter;

impl motion_traits::PulseCounter for NoopPulseCounter {
    fn enable(&self, _unit: usize) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }

    fn count(&self, _unit: usize) -> Result<i16, Box<dyn std::error::Error + Send + Sync>> {
        Ok(0)
    }
}
