//! Closed loop against a simulated motor: power in, encoder pulses out.
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use motion_core::{Manager, ManagerCfg, MotorChannels, MotorId, RegulatorCfg, TickMode};
use motion_hardware::util::wait_until;
use motion_hardware::{SimulatedEncoder, SimulatedPulseCounter, SimulatedPwm};
use motion_traits::ManualClock;

const TICK: Duration = Duration::from_millis(10);
/// Plant speed per unit of power (ticks/s).
const GAIN: f32 = 20.0;

struct Plant {
    manager: Manager,
    clock: ManualClock,
    encoder: SimulatedEncoder,
    /// Physical position; pulses are emitted as it crosses whole ticks.
    position: f32,
    emitted: i32,
}

impl Plant {
    fn new() -> Self {
        let clock = ManualClock::new();
        let counter = SimulatedPulseCounter::new(2);
        let manager = Manager::builder()
            .with_output(SimulatedPwm::new(4))
            .with_pulse_counter(counter.clone())
            .with_manager_cfg(ManagerCfg {
                motors: vec![MotorChannels::new(0, 1), MotorChannels::new(2, 3)],
                ..ManagerCfg::default()
            })
            .with_regulator_cfg(RegulatorCfg {
                mode: TickMode::Manual,
                p: 1.0,
                s: 0.0,
                d: 0.0,
                ..RegulatorCfg::default()
            })
            .with_clock(Box::new(clock.clone()))
            .disable_failsafe()
            .build()
            .expect("build manager");
        counter.connect(manager.interrupts());
        let encoder = SimulatedEncoder::new(counter, 0, manager.interrupts());
        Self {
            manager,
            clock,
            encoder,
            position: 0.0,
            emitted: 0,
        }
    }

    fn motor(&self) -> &motion_core::Motor {
        self.manager.motor(MotorId(0)).expect("motor 1")
    }

    /// One control period: tick the regulators, let the dispatcher catch up,
    /// then move the shaft under the current power.
    fn step(&mut self) {
        self.clock.advance(TICK);
        self.manager.regulators().tick();
        std::thread::sleep(Duration::from_micros(300));

        let power = f32::from(self.motor().current_power());
        self.position += power * GAIN * TICK.as_secs_f32();
        #[allow(clippy::cast_possible_truncation)]
        let whole = self.position.trunc() as i32;
        while self.emitted != whole {
            let forward = whole > self.emitted;
            self.encoder.pulse(forward, self.manager.timestamp_us());
            self.emitted += if forward { 1 } else { -1 };
        }
    }

    fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_steps {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }
}

#[test]
fn regulated_drive_reaches_target_and_holds() {
    let mut plant = Plant::new();
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    plant.motor().drive_to_value(
        600,
        300.0,
        Some(Arc::new(move || {
            h.fetch_add(1, Ordering::Relaxed);
        })),
    );
    assert!(plant.motor().is_regulated());

    let arrived = plant.run_until(1000, |_| hits.load(Ordering::Relaxed) > 0);
    assert!(arrived, "profile never reached the target");

    // let the shaft catch up with the setpoint
    plant.run_until(300, |_| false);
    let value = plant.motor().encoder().value().expect("encoder");
    assert!((value - 600).abs() <= 5, "settled at {value}");
    assert_eq!(hits.load(Ordering::Relaxed), 1);
    assert!(plant.motor().is_regulated(), "regulator keeps holding");

    // a relative move continues from the previous target
    plant.motor().drive(-200, 300.0, None);
    plant.run_until(400, |_| false);
    let value = plant.motor().encoder().value().expect("encoder");
    assert!((value - 400).abs() <= 5, "settled at {value}");
}

#[test]
fn direct_power_takes_over_from_regulator() {
    let mut plant = Plant::new();
    plant.motor().drive_to_value(10_000, 500.0, None);
    plant.run_until(20, |_| false);
    assert!(plant.motor().current_power() > 0);

    plant.motor().power(-40).expect("queue");
    assert!(!plant.motor().is_regulated());
    plant.run_until(20, |_| false);
    assert_eq!(plant.motor().current_power(), -40);
}

#[test]
fn direct_power_during_a_tick_is_not_overridden() {
    let plant = Plant::new();
    let motor = plant.motor();
    motor.drive(1000, 200.0, None);
    assert!(motor.is_regulated());
    plant.clock.advance(TICK);

    let wheel = motor.wheel();
    let guard = wheel.lock().unwrap();
    // the tick blocks in the reader until the profile is released
    let driver = plant.manager.regulators().clone();
    let tick = std::thread::spawn(move || driver.tick());
    std::thread::sleep(Duration::from_millis(20));

    motor.power(-40).expect("queue");
    assert!(!motor.is_regulated());
    drop(guard);
    tick.join().expect("tick thread");

    assert!(!motor.is_regulated(), "tick re-enabled the regulator");
    wait_until(
        || motor.current_power() == -40,
        Duration::from_secs(2),
        Duration::from_millis(1),
    )
    .expect("direct power applied");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(motor.current_power(), -40);
}

#[test]
fn direct_drive_stops_at_target_and_preempts_regulator() {
    let mut plant = Plant::new();
    plant.motor().drive_to_value(0, 100.0, None);
    assert!(plant.motor().is_regulated());

    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    let encoder = plant.motor().encoder();
    encoder
        .drive(
            150,
            50,
            Some(Box::new(move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            })),
        )
        .expect("direct drive");
    assert!(!plant.motor().is_regulated());

    let stopped = plant.run_until(200, |p| {
        hits.load(Ordering::Relaxed) > 0 && p.motor().current_power() == 0
    });
    assert!(stopped, "direct drive never completed");
    let value = encoder.value().expect("encoder");
    assert!((150..=170).contains(&value), "stopped at {value}");
    assert!(!encoder.is_driving());

    plant.run_until(10, |_| false);
    assert_eq!(hits.load(Ordering::Relaxed), 1);
}

#[test]
fn sync_wheel_reanchors_profile() {
    let mut plant = Plant::new();
    // counting starts once the encoder is installed
    plant.motor().encoder();
    plant.motor().power(50).expect("queue");
    plant.run_until(30, |_| false);
    plant.motor().stop().expect("queue");
    plant.run_until(2, |_| false);

    plant.motor().sync_wheel().expect("sync");
    let encoder_value = plant.motor().encoder().value().expect("encoder");
    let wheel = plant.motor().wheel();
    #[allow(clippy::cast_precision_loss)]
    let expected = encoder_value as f32;
    assert_eq!(wheel.lock().unwrap().current_position(), expected);
    assert!(encoder_value > 0);
}
