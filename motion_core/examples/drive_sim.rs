//! Drive two simulated motors to a target and report where they ended up.
//!
//! Usage: `cargo run -p motion_core --example drive_sim [config.toml]`
//! Logging follows `[logging]` in the config; `RUST_LOG` overrides the level.
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use motion_core::{Manager, MotorId};
use motion_hardware::{SimulatedEncoder, SimulatedPulseCounter, SimulatedPwm};
use tracing_subscriber::EnvFilter;

/// Plant speed per unit of power (ticks/s).
const GAIN: f32 = 15.0;

fn init_tracing(logging: &motion_config::Logging) {
    let level = logging.level.as_deref().unwrap_or("info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> eyre::Result<()> {
    let cfg = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => motion_config::load_file(&path)?,
        None => motion_config::Config::default(),
    };
    init_tracing(&cfg.logging);

    let counter = SimulatedPulseCounter::new(8);
    let manager = Manager::builder()
        .with_output(SimulatedPwm::new(16))
        .with_pulse_counter(counter.clone())
        .with_config(&cfg)
        .build()?;
    counter.connect(manager.interrupts());

    let ids = [MotorId(0), MotorId(1)];
    let targets = [1_500, -800];
    let arrived = Arc::new(AtomicU32::new(0));
    for (id, target) in ids.iter().zip(targets) {
        let a = arrived.clone();
        let motor = manager.motor(*id).ok_or_else(|| eyre::eyre!("no motor {id}"))?;
        motor.drive_to_value(
            target,
            600.0,
            Some(Arc::new(move || {
                a.fetch_add(1, Ordering::Relaxed);
            })),
        );
    }

    let encoders: Vec<SimulatedEncoder> = ids
        .iter()
        .map(|id| SimulatedEncoder::new(counter.clone(), id.index(), manager.interrupts()))
        .collect();
    let mut position = [0.0f32; 2];
    let mut emitted = [0i32; 2];
    let period = Duration::from_millis(5);
    let started = Instant::now();
    let mut last = started;

    while started.elapsed() < Duration::from_secs(6) {
        std::thread::sleep(period);
        let dt = last.elapsed().as_secs_f32();
        last = Instant::now();
        for (i, id) in ids.iter().enumerate() {
            let Some(motor) = manager.motor(*id) else {
                continue;
            };
            position[i] += f32::from(motor.current_power()) * GAIN * dt;
            #[allow(clippy::cast_possible_truncation)]
            let whole = position[i].trunc() as i32;
            while emitted[i] != whole {
                let forward = whole > emitted[i];
                encoders[i].pulse(forward, manager.timestamp_us());
                emitted[i] += if forward { 1 } else { -1 };
            }
        }
    }

    for id in ids {
        if let Some(motor) = manager.motor(id) {
            tracing::info!(
                motor = %id,
                value = motor.encoder().value()?,
                power = motor.current_power(),
                "final state"
            );
        }
    }
    tracing::info!(arrived = arrived.load(Ordering::Relaxed), "done");
    Ok(())
}
