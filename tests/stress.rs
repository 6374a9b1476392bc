//! Shutdown draining, affinity pinning and wakeup flooding.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use corio::fiber::State;
use corio::hook;
use corio::io::IoManager;
use corio::scheduler::ScheduleTask;

fn gettid() -> u64 {
    unsafe { libc::syscall(libc::SYS_gettid) as u64 }
}

#[test]
fn stop_waits_for_sleeping_fibers() {
    let iom = IoManager::new(4, false, "drain").unwrap();
    let done = Arc::new(AtomicUsize::new(0));

    let mut fibers = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let done = done.clone();
        let fiber = iom
            .scheduler()
            .spawn_with_stack(
                move || {
                    hook::sleep(Duration::from_millis(50));
                    done.fetch_add(1, Ordering::SeqCst);
                },
                64 * 1024,
            )
            .unwrap();
        fibers.push(fiber);
    }

    std::thread::sleep(Duration::from_millis(10));
    iom.stop();

    // stop() may only return once every fiber has run to completion.
    assert_eq!(done.load(Ordering::SeqCst), 1000);
    for fiber in &fibers {
        assert_eq!(fiber.state(), State::Term);
    }
    assert_eq!(iom.pending_events(), 0);
}

#[test]
fn affinity_pins_to_one_worker() {
    let iom = IoManager::new(3, false, "aff").unwrap();
    let tids = iom.scheduler().thread_ids();
    assert_eq!(tids.len(), 3);
    let target = tids[2];

    let (tx, rx) = mpsc::channel();
    for _ in 0..50 {
        let tx = tx.clone();
        iom.schedule(
            ScheduleTask::callback(move || {
                tx.send(gettid()).unwrap();
            })
            .with_thread(target),
        );
    }
    drop(tx);

    for _ in 0..50 {
        let ran_on = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ran_on, target, "pinned task ran on a foreign worker");
    }
    iom.stop();
}

#[test]
fn tickle_flood_stays_drainable() {
    // Hammer the wake pipe by scheduling many tasks onto an
    // otherwise-idle pool; the self-pipe must never clog.
    let iom = IoManager::new(2, false, "flood").unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    const TOTAL: usize = 1_000_000;
    const WAVE: usize = 1000;
    let deadline = Instant::now() + Duration::from_secs(300);
    let mut submitted = 0;
    while submitted < TOTAL {
        for _ in 0..WAVE {
            let ran = ran.clone();
            iom.schedule(ScheduleTask::callback(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }));
        }
        submitted += WAVE;
        while ran.load(Ordering::SeqCst) < submitted {
            assert!(Instant::now() < deadline, "runtime clogged after {} tasks", submitted);
            std::thread::yield_now();
        }
    }
    assert_eq!(ran.load(Ordering::SeqCst), TOTAL);

    // Still alive: one more round trip.
    let (tx, rx) = mpsc::channel();
    iom.schedule(ScheduleTask::callback(move || tx.send(()).unwrap()));
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    iom.stop();
}

#[test]
fn batch_schedule_runs_everything_once() {
    let iom = IoManager::new(2, false, "batch").unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..500)
        .map(|_| {
            let ran = ran.clone();
            ScheduleTask::callback(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();
    iom.scheduler().schedule_batch(tasks);

    let deadline = Instant::now() + Duration::from_secs(10);
    while ran.load(Ordering::SeqCst) < 500 {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(1));
    }
    iom.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 500);
}
