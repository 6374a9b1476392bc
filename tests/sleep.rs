//! Fiber-aware sleeping: ordering, accuracy and the zero-delay yield.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use corio::hook;
use corio::io::IoManager;

#[test]
fn shorter_sleep_finishes_first() {
    let iom = IoManager::new(2, false, "sleep_order").unwrap();
    let (tx, rx) = mpsc::channel();
    let start = Instant::now();

    for (label, ms) in [("long", 200u64), ("short", 100u64)] {
        let tx = tx.clone();
        iom.spawn(move || {
            hook::sleep(Duration::from_millis(ms));
            tx.send((label, start.elapsed())).unwrap();
        })
        .unwrap();
    }

    let (first, first_elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second, second_elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, "short");
    assert_eq!(second, "long");

    // Each sleeper resumes close to its own target.
    assert!(first_elapsed >= Duration::from_millis(80), "{:?}", first_elapsed);
    assert!(first_elapsed < Duration::from_millis(400), "{:?}", first_elapsed);
    assert!(second_elapsed >= Duration::from_millis(180), "{:?}", second_elapsed);
    assert!(second_elapsed < Duration::from_millis(500), "{:?}", second_elapsed);

    iom.stop();
}

#[test]
fn zero_sleep_yields_to_other_fibers() {
    // Single worker: if sleep(0) did not yield, the first fiber would
    // finish before the second ever started.
    let iom = IoManager::new(1, false, "sleep_zero").unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    let o = order.clone();
    iom.spawn(move || {
        o.lock().unwrap().push("first:before");
        hook::sleep(Duration::ZERO);
        o.lock().unwrap().push("first:after");
    })
    .unwrap();

    let o = order.clone();
    iom.spawn(move || {
        o.lock().unwrap().push("second");
        done_tx.send(()).unwrap();
    })
    .unwrap();

    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Give the zero-sleeper time to be rescheduled.
    std::thread::sleep(Duration::from_millis(100));
    iom.stop();

    let order = order.lock().unwrap().clone();
    assert_eq!(order, vec!["first:before", "second", "first:after"]);
}

#[test]
fn usleep_and_nanosleep_delegate() {
    let iom = IoManager::new(1, false, "sleep_misc").unwrap();
    let (tx, rx) = mpsc::channel();

    iom.spawn(move || {
        let start = Instant::now();
        hook::usleep(20_000);
        hook::nanosleep(Duration::from_millis(20));
        tx.send(start.elapsed()).unwrap();
    })
    .unwrap();

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(30), "{:?}", elapsed);
    iom.stop();
}
