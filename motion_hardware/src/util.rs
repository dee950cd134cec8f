use std::time::{Duration, Instant};

use crate::error::{HwError, Result};

/// Poll `done` until it returns true or `timeout` expires.
/// Sleeps `poll_interval` between checks to avoid spinning.
pub fn wait_until(
    mut done: impl FnMut() -> bool,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return Err(HwError::Timeout);
        }
        std::thread::sleep(poll_interval);
    }
    Ok(())
}
