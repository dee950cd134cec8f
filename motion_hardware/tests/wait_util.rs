use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use std::time::Duration;

use motion_hardware::error::HwError;
use motion_hardware::util::wait_until;

#[test]
fn wait_until_success_path() {
    let done = Arc::new(AtomicBool::new(false));
    let done_bg = done.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(3));
        done_bg.store(true, Ordering::Relaxed);
    });

    let res = wait_until(
        || done.load(Ordering::Relaxed),
        Duration::from_millis(200),
        Duration::from_micros(200),
    );
    assert!(res.is_ok(), "expected success, got {res:?}");
}

#[test]
fn wait_until_timeout_path() {
    let err = wait_until(
        || false,
        Duration::from_millis(5),
        Duration::from_micros(200),
    )
    .expect_err("expected timeout error");

    match err {
        HwError::Timeout => {}
        other => panic!("unexpected error: {other:?}"),
    }
}
