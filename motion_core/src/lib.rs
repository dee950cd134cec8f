#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Closed-loop motor control core (hardware-agnostic).
//!
//! All hardware goes through `motion_traits`: a [`PwmOutput`](motion_traits::PwmOutput)
//! actuator, a [`PulseCounter`](motion_traits::PulseCounter) bank and interrupt
//! sources feeding an [`InterruptSink`](motion_traits::InterruptSink).
//!
//! ## Architecture
//!
//! - **Events**: interrupts and application calls post to one bounded queue
//!   (`event` module); a single dispatcher thread consumes it (`manager`).
//! - **Outputs**: per-motor power and duty ceiling, double-buffered duties,
//!   one actuator flush per drained batch (`pwm`).
//! - **Encoder**: tick position with overflow accumulation and edge-interval
//!   speed (`encoder`).
//! - **Regulator**: PID with conditional anti-windup and integral bleed, all
//!   instances ticked by one shared driver (`regulator`).
//! - **Wheel**: trapezoidal motion profile (`wheel`).
//! - **Batching**: all regulated motors of one tick land in one flush (`batch`).
//! - **Safety**: fail-safe stop when motor updates cease; timers (`timers`).
//!
//! ```no_run
//! use motion_core::{Manager, MotorId};
//! use motion_core::mocks::{NoopOutput, NoopPulseCounter};
//!
//! # fn main() -> eyre::Result<()> {
//! let manager = Manager::builder()
//!     .with_output(NoopOutput::new(16))
//!     .with_pulse_counter(NoopPulseCounter)
//!     .build()?;
//! manager
//!     .set_motors()
//!     .power(MotorId(0), 40)
//!     .power(MotorId(1), -40)
//!     .set()?;
//! if let Some(m) = manager.motor(MotorId(2)) {
//!     m.drive(500, 200.0, None);
//! }
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod builder;
pub mod config;
pub mod conversions;
pub mod encoder;
pub mod error;
pub mod event;
pub mod hw_error;
pub mod manager;
pub mod mocks;
pub mod motor;
pub mod pwm;
pub mod regulator;
pub mod timers;
pub mod util;
pub mod wheel;

pub use batch::MotorChangeBuilder;
pub use builder::{ManagerBuilder, Missing, Set};
pub use config::{EncoderCfg, ManagerCfg, MotorChannels, RegulatorCfg, TickMode, WheelCfg};
pub use encoder::{DriveCallback, Encoder};
pub use error::{BuildError, MotionError, Result};
pub use event::{Event, EventQueue, Interrupts, MotorChange, MotorId, MotorOp};
pub use manager::Manager;
pub use motor::{Motor, SharedWheel};
pub use pwm::{DutyView, POWER_MAX};
pub use regulator::{Reader, Regulator, RegulatorDriver, Tick, TickHooks, Writer};
pub use timers::{INVALID_ID, TimerId, Timers};
pub use wheel::{MotionTarget, OnTarget, Wheel};
