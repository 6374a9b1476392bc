//! I/O timeouts surfacing as `ETIMEDOUT` through the hook layer.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use corio::hook;
use corio::io::IoManager;

#[test]
fn recv_times_out_when_peer_is_silent() {
    let iom = IoManager::new(2, false, "recv_to").unwrap();
    let (tx, rx) = mpsc::channel();

    iom.spawn(move || {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let _ = corio::fd::table().get(fds[0], true);
        let _ = corio::fd::table().get(fds[1], true);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 100_000,
        };
        hook::setsockopt(fds[0], libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv).unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 8];
        let res = hook::recv(fds[0], &mut buf, 0);
        let elapsed = start.elapsed();

        hook::close(fds[0]).unwrap();
        hook::close(fds[1]).unwrap();
        tx.send((res.map_err(|e| e.raw_os_error()), elapsed)).unwrap();
    })
    .unwrap();

    let (res, elapsed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(res, Err(Some(libc::ETIMEDOUT)));
    assert!(elapsed >= Duration::from_millis(80), "woke after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1000), "woke after {:?}", elapsed);

    iom.stop();
    assert_eq!(iom.pending_events(), 0);
}

#[test]
fn connect_times_out_on_blackhole_address() {
    let iom = IoManager::new(1, false, "conn_to").unwrap();
    let (tx, rx) = mpsc::channel();

    iom.spawn(move || {
        // TEST-NET-2: guaranteed non-routable, SYNs disappear.
        let addr: SocketAddr = "198.51.100.1:1".parse().unwrap();
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        let start = Instant::now();
        let res = hook::connect_with_timeout(fd, &addr, Some(Duration::from_millis(200)));
        let elapsed = start.elapsed();
        hook::close(fd).unwrap();
        tx.send((res.map_err(|e| e.raw_os_error()), elapsed)).unwrap();
    })
    .unwrap();

    let (res, elapsed) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    match res {
        Err(Some(code)) if code == libc::ETIMEDOUT => {
            assert!(
                elapsed >= Duration::from_millis(200),
                "timed out after only {:?}",
                elapsed
            );
            assert!(
                elapsed < Duration::from_millis(2000),
                "timed out after {:?}",
                elapsed
            );
        }
        Err(_) => {
            // Sandboxes without a default route refuse synchronously;
            // nothing to measure then.
            eprintln!("blackhole connect refused synchronously, skipping timing check");
        }
        Ok(()) => panic!("connect to TEST-NET-2 unexpectedly succeeded"),
    }

    iom.stop();
    assert_eq!(iom.pending_events(), 0);
}

#[test]
fn send_timeout_applies_to_writes() {
    // Fill a socketpair's buffers; a timed send must give up with
    // ETIMEDOUT instead of hanging.
    let iom = IoManager::new(2, false, "send_to").unwrap();
    let (tx, rx) = mpsc::channel();

    iom.spawn(move || {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let _ = corio::fd::table().get(fds[0], true);
        let _ = corio::fd::table().get(fds[1], true);

        let tv = libc::timeval {
            tv_sec: 0,
            tv_usec: 100_000,
        };
        hook::setsockopt(fds[0], libc::SOL_SOCKET, libc::SO_SNDTIMEO, &tv).unwrap();

        let chunk = [0u8; 64 * 1024];
        let res = loop {
            match hook::send(fds[0], &chunk, 0) {
                Ok(_) => continue,
                Err(e) => break e.raw_os_error(),
            }
        };
        hook::close(fds[0]).unwrap();
        hook::close(fds[1]).unwrap();
        tx.send(res).unwrap();
    })
    .unwrap();

    let res = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(res, Some(libc::ETIMEDOUT));

    iom.stop();
    assert_eq!(iom.pending_events(), 0);
}
