//! Motor updates reach the actuator as whole frames.
use std::time::Duration;

use motion_core::{Manager, ManagerCfg, MotorChannels, MotorId, RegulatorCfg, TickMode, WheelCfg};
use motion_hardware::util::wait_until;
use motion_hardware::{PwmProbe, SimulatedPulseCounter, SimulatedPwm};

fn rig(cfg: ManagerCfg) -> (Manager, PwmProbe) {
    let pwm = SimulatedPwm::new(16);
    let probe = pwm.probe();
    let m = Manager::builder()
        .with_output(pwm)
        .with_pulse_counter(SimulatedPulseCounter::new(8))
        .with_manager_cfg(cfg)
        .disable_failsafe()
        .build()
        .expect("build manager");
    (m, probe)
}

fn settle(cond: impl FnMut() -> bool) {
    wait_until(cond, Duration::from_secs(2), Duration::from_millis(1)).expect("condition not met");
}

#[test]
fn two_motors_change_in_one_flush() {
    let (m, probe) = rig(ManagerCfg::default());
    m.set_motors()
        .power(MotorId(0), 50)
        .power(MotorId(1), -30)
        .set()
        .expect("queue");

    settle(|| probe.flushes() >= 1);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.flushes(), 1);
    let frame = &probe.frames()[0];
    assert_eq!(frame[0], 50);
    assert_eq!(frame[1], 0);
    assert_eq!(frame[2], 0);
    assert_eq!(frame[3], 30);
}

#[test]
fn direct_commands_update_status_and_duty_view() {
    let (m, probe) = rig(ManagerCfg::default());
    let motor = m.motor(MotorId(2)).expect("motor 3");
    motor.power(-70).expect("queue");
    settle(|| motor.current_power() == -70);
    assert_eq!(probe.duty(5), Some(70));
    assert_eq!(m.duty().duty(5), Some(70));

    motor.pwm_max_percent(50).expect("queue");
    settle(|| motor.current_pwm_max_percent() == 50);
    assert_eq!(probe.duty(5), Some(35));

    motor.stop().expect("queue");
    settle(|| probe.duty(4) == Some(100));
    assert_eq!(probe.duty(5), Some(100));
    assert_eq!(motor.current_power(), 0);
}

#[test]
fn inverted_motor_and_resolution() {
    let cfg = ManagerCfg {
        pwm_resolution: 1000,
        motors: vec![
            MotorChannels::new(0, 1),
            MotorChannels {
                forward: 2,
                reverse: 3,
                inverted: true,
            },
        ],
        ..ManagerCfg::default()
    };
    let (m, probe) = rig(cfg);
    m.set_motors()
        .power(MotorId(0), 25)
        .power(MotorId(1), 25)
        .set()
        .expect("queue");
    settle(|| probe.flushes() >= 1);
    assert_eq!(probe.duty(0), Some(250));
    assert_eq!(probe.duty(2), Some(0));
    assert_eq!(probe.duty(3), Some(250));
}

#[test]
fn unknown_motor_is_skipped_not_fatal() {
    let (m, probe) = rig(ManagerCfg::default());
    assert!(m.motor(MotorId(8)).is_none());
    m.set_motors()
        .power(MotorId(9), 10)
        .power(MotorId(0), 10)
        .set()
        .expect("queue");
    settle(|| probe.duty(0) == Some(10));
}

#[test]
fn failed_flush_is_logged_and_next_frame_goes_out() {
    let (m, probe) = rig(ManagerCfg::default());
    probe.fail_next_flush();
    let motor = m.motor(MotorId(0)).expect("motor 1");
    motor.power(20).expect("queue");
    settle(|| motor.current_power() == 20);
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(probe.flushes(), 0);

    motor.power(30).expect("queue");
    settle(|| probe.duty(0) == Some(30));
}

#[test]
fn empty_set_does_not_touch_outputs() {
    let (m, probe) = rig(ManagerCfg::default());
    m.set_motors().set().expect("queue");
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.flushes(), 0);
}

#[test]
fn regulated_motors_share_one_flush_per_tick() {
    let pwm = SimulatedPwm::new(16);
    let probe = pwm.probe();
    let m = Manager::builder()
        .with_output(pwm)
        .with_pulse_counter(SimulatedPulseCounter::new(8))
        .with_regulator_cfg(RegulatorCfg {
            mode: TickMode::Manual,
            p: 10.0,
            s: 0.0,
            d: 0.0,
            zero_threshold: 0.0,
            ..RegulatorCfg::default()
        })
        .with_wheel_cfg(WheelCfg {
            acceleration: 100_000.0,
            ..WheelCfg::default()
        })
        .disable_failsafe()
        .build()
        .expect("build manager");

    m.motor(MotorId(0)).expect("motor 1").drive(500, 300.0, None);
    m.motor(MotorId(1)).expect("motor 2").drive(-500, 300.0, None);
    std::thread::sleep(Duration::from_millis(20));
    let before = probe.flushes();

    assert!(m.regulators().tick());
    settle(|| probe.flushes() > before);
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.flushes(), before + 1);

    let frames = probe.frames();
    let frame = frames.last().expect("one frame");
    assert!(frame[0] > 0, "motor 1 forward: {frame:?}");
    assert_eq!(frame[1], 0);
    assert_eq!(frame[2], 0);
    assert!(frame[3] > 0, "motor 2 reverse: {frame:?}");
}
