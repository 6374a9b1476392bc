//! Process-wide file descriptor table.
//!
//! The [hook layer](crate::hook) consults this table to decide whether a
//! syscall should be routed through the runtime at all: only sockets the
//! user has not explicitly marked nonblocking get the suspend-on-EAGAIN
//! treatment. Socket fds are forced into kernel-level nonblocking mode the
//! moment they are registered, so the raw syscalls issued by the hooks
//! never actually block.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::clock::INFINITE_MS;

/// Which of the two per-fd timeouts an operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

/// Per-fd bookkeeping: socketness, the two nonblocking views and the
/// send/recv timeouts.
///
/// `sys_nonblock` is the runtime's view (forced on for sockets);
/// `user_nonblock` is what the application asked for through
/// `fcntl`/`ioctl`. The kernel flag is the OR of both, while `fcntl`
/// reads report only the user's bit.
pub struct FdInfo {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdInfo {
    fn new(fd: RawFd) -> FdInfo {
        let mut is_socket = false;
        unsafe {
            let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed().assume_init();
            if libc::fstat(fd, &mut st) == 0 {
                is_socket = st.st_mode & libc::S_IFMT == libc::S_IFSOCK;
            }
        }
        let sys_nonblock = if is_socket {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            true
        } else {
            false
        };
        FdInfo {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(INFINITE_MS),
            send_timeout_ms: AtomicU64::new(INFINITE_MS),
        }
    }

    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::SeqCst);
    }

    /// Timeout for the given direction in milliseconds; `None` when
    /// unset.
    pub fn timeout(&self, kind: TimeoutKind) -> Option<u64> {
        let ms = match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::SeqCst),
        };
        if ms == INFINITE_MS {
            None
        } else {
            Some(ms)
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::SeqCst),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::SeqCst),
        }
    }
}

/// The process-wide fd table. One entry per fd number, grown on demand.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

static TABLE: Lazy<FdTable> = Lazy::new(|| FdTable {
    slots: RwLock::new(Vec::new()),
});

/// The process-wide table instance.
pub fn table() -> &'static FdTable {
    &TABLE
}

impl FdTable {
    /// Returns the entry for `fd`, synthesizing one (stat + forced
    /// nonblock for sockets) when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(info)) = slots.get(fd as usize) {
                return Some(info.clone());
            }
        }
        if !auto_create {
            return None;
        }
        let mut slots = self.slots.write().unwrap();
        // Someone else may have created it while we re-locked.
        if let Some(Some(info)) = slots.get(fd as usize) {
            return Some(info.clone());
        }
        if slots.len() <= fd as usize {
            let target = (fd as usize + 1).max(slots.len() * 3 / 2);
            slots.resize_with(target, || None);
        }
        let info = Arc::new(FdInfo::new(fd));
        slots[fd as usize] = Some(info.clone());
        Some(info)
    }

    /// Drops the entry for `fd`; called by the `close` hook.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(info) = slot.take() {
                info.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}
