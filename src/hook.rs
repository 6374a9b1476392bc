//! Cooperative syscall layer.
//!
//! Each function here mirrors a blocking POSIX call. With the per-thread
//! hook bit off (the default outside worker threads) they are plain
//! passthroughs to libc. With it on (worker threads force it on before
//! entering the run loop), a call on a socket that would block instead:
//!
//! 1. issues the raw syscall in nonblocking mode (the fd table forces
//!    `O_NONBLOCK` on every registered socket),
//! 2. on `EAGAIN` arms a condition timer for the fd's send/recv timeout
//!    and registers READ or WRITE interest bound to the current fiber,
//! 3. yields; on resume either retries or reports `ETIMEDOUT`.
//!
//! Results use `io::Result`, with the raw OS errno preserved inside the
//! error (`Error::raw_os_error`). Application code sees ordinary I/O
//! failures; suspension is invisible.

use std::cell::Cell;
use std::io;
use std::mem::{self, MaybeUninit};
use std::net::SocketAddr;
use std::os::raw::{c_int, c_ulong, c_void};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::clock::{duration_to_ms, INFINITE_MS};
use crate::error::Error;
use crate::fd::{self, TimeoutKind};
use crate::fiber::{self, Fiber};
use crate::io::{self as io_mgr, Event, IoManager};
use crate::scheduler::ScheduleTask;
use crate::util::{cvt, cvt_size, from_sockaddr, to_sockaddr};

thread_local! {
    static HOOK_ENABLED: Cell<bool> = Cell::new(false);
}

/// Process-wide default `connect` timeout in ms; `INFINITE_MS` disables
/// it.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(5000);

/// Whether syscalls on this thread are routed through the runtime.
#[inline]
pub fn is_enabled() -> bool {
    HOOK_ENABLED.with(|e| e.get())
}

/// Flips the per-thread hook bit. Worker threads set it on entry to the
/// run loop; other threads default to off.
#[inline]
pub fn set_enabled(on: bool) {
    HOOK_ENABLED.with(|e| e.set(on));
}

/// Sets the process-wide default `connect` timeout; `None` disables it.
pub fn set_connect_timeout(timeout: Option<Duration>) {
    CONNECT_TIMEOUT_MS.store(
        timeout.map_or(INFINITE_MS, duration_to_ms),
        Ordering::SeqCst,
    );
}

/// The process-wide default `connect` timeout.
pub fn connect_timeout() -> Option<Duration> {
    match CONNECT_TIMEOUT_MS.load(Ordering::SeqCst) {
        INFINITE_MS => None,
        ms => Some(Duration::from_millis(ms)),
    }
}

/// Shared flag between a suspended I/O wait and its condition timer. The
/// timer stores the errno it cancelled the wait with.
#[derive(Default)]
struct IoWait {
    cancelled: AtomicI32,
}

/// Arms the condition timer guarding one suspended wait: on expiry it
/// marks the wait cancelled and fires the armed event so the fiber wakes
/// with `ETIMEDOUT`.
fn arm_timeout(
    iom: &Arc<IoManager>,
    wait: &Arc<IoWait>,
    fd: RawFd,
    ev: Event,
    timeout_ms: u64,
) -> crate::timer::Timer {
    let state = Arc::downgrade(wait);
    let wiom = Arc::downgrade(iom);
    iom.add_condition_timer(
        Duration::from_millis(timeout_ms),
        move || {
            let state = match state.upgrade() {
                Some(s) => s,
                None => return,
            };
            if state.cancelled.load(Ordering::SeqCst) != 0 {
                return;
            }
            state.cancelled.store(libc::ETIMEDOUT, Ordering::SeqCst);
            if let Some(iom) = wiom.upgrade() {
                iom.cancel_event(fd, ev);
            }
        },
        Arc::downgrade(wait),
    )
}

/// Converts a runtime registration failure back into the errno channel.
fn registration_errno(e: Error) -> io::Error {
    match e {
        Error::Registration { source, .. } => source,
        Error::Io(source) => source,
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

/// Common blocking-to-suspending transform for the read/write families.
fn do_io(
    fd: RawFd,
    name: &str,
    ev: Event,
    timeout_kind: TimeoutKind,
    mut raw: impl FnMut() -> isize,
) -> io::Result<usize> {
    if !is_enabled() {
        return cvt_size(raw());
    }
    let info = match fd::table().get(fd, false) {
        Some(info) => info,
        None => return cvt_size(raw()),
    };
    if info.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !info.is_socket() || info.user_nonblock() {
        return cvt_size(raw());
    }

    let timeout_ms = info.timeout(timeout_kind);
    let wait = Arc::new(IoWait::default());
    loop {
        let n = raw();
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {}
            _ => return Err(err),
        }

        let iom = match io_mgr::current() {
            Some(iom) => iom,
            None => return Err(err),
        };
        let timer = timeout_ms.map(|ms| arm_timeout(&iom, &wait, fd, ev, ms));
        if let Err(e) = iom.add_event(fd, ev) {
            log::error!("{}: add_event(fd {}, {:?}) failed: {}", name, fd, ev, e);
            if let Some(timer) = &timer {
                timer.cancel();
            }
            return Err(registration_errno(e));
        }

        fiber::yield_now();

        if let Some(timer) = &timer {
            timer.cancel();
        }
        let cancelled = wait.cancelled.load(Ordering::SeqCst);
        if cancelled != 0 {
            return Err(io::Error::from_raw_os_error(cancelled));
        }
        // Woken by readiness: retry the syscall.
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sleeping
////////////////////////////////////////////////////////////////////////////////

/// Fiber-aware sleep. A zero duration still yields through the scheduler
/// at least once.
pub fn sleep(dur: Duration) {
    let iom = match io_mgr::current() {
        Some(iom) if is_enabled() => iom,
        _ => return thread::sleep(dur),
    };
    let cur = Fiber::current();
    let sched = iom.scheduler().clone();
    iom.add_timer(
        dur,
        move || sched.schedule(ScheduleTask::fiber(cur.clone())),
        false,
    );
    fiber::yield_now();
}

/// `usleep(3)` equivalent.
pub fn usleep(micros: u64) {
    sleep(Duration::from_micros(micros));
}

/// `nanosleep(2)` equivalent. Always runs the full duration; never
/// reports an interrupted remainder.
pub fn nanosleep(dur: Duration) {
    sleep(dur);
}

////////////////////////////////////////////////////////////////////////////////
// Socket lifecycle
////////////////////////////////////////////////////////////////////////////////

/// `socket(2)`; registers the fd with the runtime's fd table (forcing
/// nonblocking mode) when hooks are on.
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> io::Result<RawFd> {
    let fd = cvt(unsafe { libc::socket(domain, ty, protocol) })?;
    if is_enabled() {
        let _ = fd::table().get(fd, true);
    }
    Ok(fd)
}

/// `connect(2)` with the process-wide default timeout.
pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    connect_with_timeout(fd, addr, connect_timeout())
}

/// `connect(2)` with an explicit timeout. A nonblocking connect reports
/// "in progress"; the fiber suspends on WRITE interest and `SO_ERROR`
/// decides the outcome after the wakeup.
pub fn connect_with_timeout(
    fd: RawFd,
    addr: &SocketAddr,
    timeout: Option<Duration>,
) -> io::Result<()> {
    let (storage, len) = to_sockaddr(addr);
    let raw = || {
        cvt(unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        })
        .map(drop)
    };
    if !is_enabled() {
        return raw();
    }
    let info = match fd::table().get(fd, false) {
        Some(info) => info,
        None => return raw(),
    };
    if info.is_closed() {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    if !info.is_socket() || info.user_nonblock() {
        return raw();
    }

    match raw() {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }
    let iom = match io_mgr::current() {
        Some(iom) => iom,
        None => return Err(io::Error::from_raw_os_error(libc::EINPROGRESS)),
    };

    let wait = Arc::new(IoWait::default());
    let timer = timeout.map(|t| arm_timeout(&iom, &wait, fd, Event::WRITE, duration_to_ms(t)));
    match iom.add_event(fd, Event::WRITE) {
        Ok(()) => {
            fiber::yield_now();
            if let Some(timer) = &timer {
                timer.cancel();
            }
            let cancelled = wait.cancelled.load(Ordering::SeqCst);
            if cancelled != 0 {
                return Err(io::Error::from_raw_os_error(cancelled));
            }
        }
        Err(e) => {
            if let Some(timer) = &timer {
                timer.cancel();
            }
            log::error!("connect: add_event(fd {}, WRITE) failed: {}", fd, e);
            return Err(registration_errno(e));
        }
    }

    let mut so_error: c_int = 0;
    let mut so_len = mem::size_of::<c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut _ as *mut c_void,
            &mut so_len,
        )
    })?;
    if so_error == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(so_error))
    }
}

/// `accept(2)`; the accepted fd is registered (and forced nonblocking)
/// like one made by [`socket`].
pub fn accept(fd: RawFd) -> io::Result<RawFd> {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || {
        (unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) }) as isize
    })?;
    let newfd = n as RawFd;
    if is_enabled() {
        let _ = fd::table().get(newfd, true);
    }
    Ok(newfd)
}

/// `close(2)`. Cancels every armed event on the fd, drops its table
/// entry, then always performs the real close.
pub fn close(fd: RawFd) -> io::Result<()> {
    if fd::table().get(fd, false).is_some() {
        if let Some(iom) = io_mgr::current() {
            iom.cancel_all(fd);
        }
        fd::table().del(fd);
    }
    cvt(unsafe { libc::close(fd) }).map(drop)
}

////////////////////////////////////////////////////////////////////////////////
// Reading
////////////////////////////////////////////////////////////////////////////////

/// `read(2)`.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

/// `readv(2)`.
pub fn readv(fd: RawFd, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize> {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, bufs.as_mut_ptr() as *mut libc::iovec, bufs.len() as c_int)
    })
}

/// `recv(2)`.
pub fn recv(fd: RawFd, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// `recvfrom(2)`; also reports the peer address when the kernel provides
/// one.
pub fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: c_int,
) -> io::Result<(usize, Option<SocketAddr>)> {
    let mut storage = unsafe { MaybeUninit::<libc::sockaddr_storage>::zeroed().assume_init() };
    let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addrlen,
        )
    })?;
    Ok((n, from_sockaddr(&storage, addrlen)))
}

/// `recvmsg(2)`.
///
/// # Safety
///
/// `msg` must point to a valid `msghdr` whose buffers stay alive for the
/// whole call, exactly as for the raw syscall.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Writing
////////////////////////////////////////////////////////////////////////////////

/// `write(2)`.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

/// `writev(2)`.
pub fn writev(fd: RawFd, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, bufs.as_ptr() as *const libc::iovec, bufs.len() as c_int)
    })
}

/// `send(2)`.
pub fn send(fd: RawFd, buf: &[u8], flags: c_int) -> io::Result<usize> {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// `sendto(2)`.
pub fn sendto(fd: RawFd, buf: &[u8], flags: c_int, addr: &SocketAddr) -> io::Result<usize> {
    let (storage, len) = to_sockaddr(addr);
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    })
}

/// `sendmsg(2)`.
///
/// # Safety
///
/// Same contract as [`recvmsg`].
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: c_int) -> io::Result<usize> {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

////////////////////////////////////////////////////////////////////////////////
// Fd control
////////////////////////////////////////////////////////////////////////////////

/// `fcntl(2)` for integer-argument commands.
///
/// `F_SETFL` shadows the user's `O_NONBLOCK` bit in the fd table; the
/// kernel keeps `sys | user` so the runtime's nonblocking loop keeps
/// working whatever the application sets. `F_GETFL` reports the user's
/// view, not the kernel's.
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> io::Result<c_int> {
    match cmd {
        libc::F_SETFL => {
            let mut arg = arg;
            if let Some(info) = fd::table().get(fd, false) {
                if info.is_socket() && !info.is_closed() {
                    info.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
                    if info.sys_nonblock() {
                        arg |= libc::O_NONBLOCK;
                    } else {
                        arg &= !libc::O_NONBLOCK;
                    }
                }
            }
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, arg) })
        }
        libc::F_GETFL => {
            let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL, 0) })?;
            match fd::table().get(fd, false) {
                Some(info) if info.is_socket() && !info.is_closed() => {
                    if info.user_nonblock() {
                        Ok(flags | libc::O_NONBLOCK)
                    } else {
                        Ok(flags & !libc::O_NONBLOCK)
                    }
                }
                _ => Ok(flags),
            }
        }
        _ => cvt(unsafe { libc::fcntl(fd, cmd, arg) }),
    }
}

/// `ioctl(2)`. `FIONBIO` updates the user nonblock bit and passes
/// through.
///
/// # Safety
///
/// `arg` must be valid for the given request, as for the raw syscall.
pub unsafe fn ioctl(fd: RawFd, request: c_ulong, arg: *mut c_void) -> io::Result<c_int> {
    if request == libc::FIONBIO as c_ulong && !arg.is_null() {
        let on = unsafe { *(arg as *mut c_int) } != 0;
        if let Some(info) = fd::table().get(fd, false) {
            if info.is_socket() && !info.is_closed() {
                info.set_user_nonblock(on);
            }
        }
    }
    cvt(unsafe { libc::ioctl(fd, request, arg) })
}

/// `getsockopt(2)` passthrough.
pub fn getsockopt<T>(fd: RawFd, level: c_int, optname: c_int, value: &mut T) -> io::Result<()> {
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(fd, level, optname, value as *mut T as *mut c_void, &mut len)
    })
    .map(drop)
}

/// `setsockopt(2)`. `SO_RCVTIMEO`/`SO_SNDTIMEO` are additionally recorded
/// in the fd table (in milliseconds), which is where the suspend-side
/// timeout machinery reads them from.
pub fn setsockopt<T>(fd: RawFd, level: c_int, optname: c_int, value: &T) -> io::Result<()> {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && mem::size_of::<T>() == mem::size_of::<libc::timeval>()
    {
        if let Some(info) = fd::table().get(fd, false) {
            let tv = unsafe { &*(value as *const T as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            info.set_timeout_ms(kind, if ms == 0 { INFINITE_MS } else { ms });
        }
    }
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            value as *const T as *const c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    })
    .map(drop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_bit_is_per_thread() {
        assert!(!is_enabled());
        set_enabled(true);
        assert!(is_enabled());
        let other = thread::spawn(is_enabled).join().unwrap();
        assert!(!other);
        set_enabled(false);
    }

    #[test]
    fn connect_timeout_default_is_five_seconds() {
        assert_eq!(connect_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn fcntl_shadows_user_nonblock() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        set_enabled(false);

        // The runtime forced O_NONBLOCK, but the user never asked for it.
        let flags = fcntl(fd, libc::F_GETFL, 0).unwrap();
        assert_eq!(flags & libc::O_NONBLOCK, 0);

        // The user turns it on: both views agree now.
        fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK).unwrap();
        let flags = fcntl(fd, libc::F_GETFL, 0).unwrap();
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        // The user turns it off: the kernel keeps the runtime's bit.
        fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK).unwrap();
        assert_eq!(
            fcntl(fd, libc::F_GETFL, 0).unwrap() & libc::O_NONBLOCK,
            0
        );
        let raw = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert_ne!(raw & libc::O_NONBLOCK, 0);

        close(fd).unwrap();
    }

    #[test]
    fn setsockopt_records_timeout_ms() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0).unwrap();
        set_enabled(false);
        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv).unwrap();
        let info = fd::table().get(fd, false).unwrap();
        assert_eq!(info.timeout(TimeoutKind::Recv), Some(1500));
        close(fd).unwrap();
    }
}
