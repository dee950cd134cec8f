//! Maps `Box<dyn Error>` from trait boundaries to typed `MotionError`.
//!
//! The traits in `motion_traits` use `Box<dyn Error + Send + Sync>`; this
//! module converts those to our error enum, with an optional feature-gated
//! path for `motion_hardware::HwError` downcasting.

use crate::error::MotionError;

/// Map a trait-boundary error to a typed `MotionError`.
///
/// Attempts to downcast known hardware error types first, then falls back
/// to string-based heuristics.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> MotionError {
    #[cfg(feature = "hardware-errors")]
    {
        use motion_hardware::error::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            return match hw {
                HwError::Timeout => MotionError::Timeout,
                HwError::Injected(_) | HwError::Io(_) => MotionError::Hardware(hw.to_string()),
                other => MotionError::HardwareFault(other.to_string()),
            };
        }
    }

    let s = e.to_string();
    if s.to_lowercase().contains("timeout") {
        MotionError::Timeout
    } else {
        MotionError::Hardware(s)
    }
}
