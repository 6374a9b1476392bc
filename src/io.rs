//! Readiness-driven I/O runtime.
//!
//! [`IoManager`] composes a [`Scheduler`], a [`TimerManager`] and an
//! edge-triggered epoll instance. Suspended fibers register interest in an
//! fd direction; when the kernel reports readiness (or a condition timer
//! cancels the wait) the fiber is handed back to the scheduler.
//!
//! Workers with no runnable task park inside [`idle`](Driver::idle),
//! blocking in `epoll_wait` with a timeout bounded by the earliest pending
//! timer. Other threads wake them by writing one byte to an internal pipe
//! whose read end is permanently registered with the poller ("tickling").

use std::io;
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::fiber::{self, Fiber, State};
use crate::scheduler::{self, Driver, ScheduleTask, Scheduler};
use crate::timer::{Timer, TimerManager};
use crate::util::cvt;

bitflags! {
    /// Fd readiness directions. Values match the epoll flags they are
    /// registered as.
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

thread_local! {
    static CURRENT_IO: std::cell::RefCell<Weak<IoManager>> =
        std::cell::RefCell::new(Weak::new());
}

/// The `IoManager` driving the current thread, if any. Set on every
/// worker thread and on the thread that constructed the manager.
pub fn current() -> Option<Arc<IoManager>> {
    CURRENT_IO.with(|c| c.borrow().upgrade())
}

fn set_current(iom: &Weak<IoManager>) {
    CURRENT_IO.with(|c| *c.borrow_mut() = iom.clone());
}

/// Who to wake when one direction of an fd fires: a suspended fiber or a
/// callback, plus the scheduler to hand it to.
#[derive(Default)]
struct EventCtx {
    sched: Option<Arc<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl EventCtx {
    #[inline]
    fn is_empty(&self) -> bool {
        self.fiber.is_none() && self.cb.is_none()
    }

    #[inline]
    fn clear(&mut self) {
        self.sched = None;
        self.fiber = None;
        self.cb = None;
    }
}

struct FdSlot {
    events: Event,
    read: EventCtx,
    write: EventCtx,
}

impl FdSlot {
    fn ctx_mut(&mut self, ev: Event) -> &mut EventCtx {
        if ev == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }

    /// Clears the interest bit and schedules whatever was bound to it.
    /// Caller adjusts the pending-event counter.
    fn trigger(&mut self, fd: RawFd, ev: Event) {
        self.events.remove(ev);
        let ctx = self.ctx_mut(ev);
        let sched = ctx.sched.take();
        let sched = match sched {
            Some(s) => s,
            None => {
                log::error!("fd {} event {:?} fired without a scheduler bound", fd, ev);
                ctx.clear();
                return;
            }
        };
        if let Some(cb) = ctx.cb.take() {
            sched.schedule(ScheduleTask::callback_boxed(cb));
        } else if let Some(fiber) = ctx.fiber.take() {
            sched.schedule(ScheduleTask::fiber(fiber));
        } else {
            log::error!("fd {} event {:?} fired with an empty context", fd, ev);
        }
    }
}

struct FdContext {
    fd: RawFd,
    slot: Mutex<FdSlot>,
}

/// Scheduler + timers + epoll: the runtime that suspends fibers on fd
/// readiness and deadlines.
pub struct IoManager {
    me: Weak<IoManager>,
    sched: Arc<Scheduler>,
    timers: TimerManager,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Creates the epoll instance and the wake pipe, then starts the
    /// underlying scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) }).map_err(Error::Io)?;

        let mut pipe_fds = [0 as RawFd; 2];
        if let Err(e) = cvt(unsafe {
            libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC)
        }) {
            unsafe { libc::close(epfd) };
            return Err(e.into());
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        if let Err(e) = cvt(unsafe {
            libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev)
        }) {
            unsafe {
                libc::close(epfd);
                libc::close(pipe_fds[0]);
                libc::close(pipe_fds[1]);
            }
            return Err(Error::Registration {
                fd: pipe_fds[0],
                op: "add",
                source: e,
            });
        }

        let iom = Arc::new_cyclic(|me: &Weak<IoManager>| {
            let driver: Weak<dyn Driver> = me.clone();
            let waker = me.clone();
            IoManager {
                me: me.clone(),
                sched: Scheduler::with_driver(threads, use_caller, name, driver),
                timers: TimerManager::with_waker(Box::new(move || {
                    // A new earliest deadline: unblock the poller so it
                    // recomputes its wait.
                    if let Some(iom) = waker.upgrade() {
                        iom.tickle_impl();
                    }
                })),
                epfd,
                tickle_fds: pipe_fds,
                pending: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
            }
        });
        iom.grow_contexts(32);
        set_current(&iom.me);
        iom.sched.start();
        Ok(iom)
    }

    #[inline(always)]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    /// Number of armed fd-direction interests. Equals the total interest
    /// bits set across all fds.
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Forwards to [`Scheduler::schedule`].
    #[inline]
    pub fn schedule(&self, task: ScheduleTask) {
        self.sched.schedule(task);
    }

    /// Forwards to [`Scheduler::spawn`].
    #[inline]
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> Result<Arc<Fiber>> {
        self.sched.spawn(f)
    }

    /// Stops the underlying scheduler, draining all queued work, armed
    /// events and pending timers first.
    pub fn stop(&self) {
        self.sched.stop();
    }

    /// Arms a timer on the runtime's timer manager.
    pub fn add_timer(
        &self,
        delay: Duration,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.timers.add_timer(delay, cb, recurring)
    }

    /// Arms a condition timer: the callback only runs while `cond` is
    /// still upgradable.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        delay: Duration,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
    ) -> Timer {
        self.timers.add_condition_timer(delay, cb, cond, false)
    }

    /// Registers interest in `ev` on `fd`, bound to the current fiber:
    /// when the direction becomes ready the fiber is rescheduled. The
    /// caller is expected to yield right after.
    ///
    /// # Panics
    ///
    /// Panics when `ev` is not exactly one direction, or when that
    /// direction is already armed for `fd` (programmer error).
    pub fn add_event(&self, fd: RawFd, ev: Event) -> Result<()> {
        self.add_event_inner(fd, ev, None)
    }

    /// Like [`add_event`](IoManager::add_event) but binds a callback
    /// instead of the current fiber.
    pub fn add_event_with(
        &self,
        fd: RawFd,
        ev: Event,
        cb: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.add_event_inner(fd, ev, Some(Box::new(cb)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        ev: Event,
        cb: Option<Box<dyn FnOnce() + Send + 'static>>,
    ) -> Result<()> {
        assert!(fd >= 0, "add_event on negative fd");
        assert!(
            ev == Event::READ || ev == Event::WRITE,
            "exactly one direction must be armed, got {:?}",
            ev
        );
        let ctx = self.fd_context(fd);
        let mut slot = ctx.slot.lock().unwrap();
        assert!(
            !slot.events.contains(ev),
            "event {:?} already armed for fd {}",
            ev,
            fd
        );

        let op = if slot.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let new_events = slot.events | ev;
        if let Err(e) = self.epoll_update(fd, op, new_events) {
            log::error!("add_event(fd {}, {:?}): {}", fd, ev, e);
            return Err(e);
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        slot.events = new_events;
        let ectx = slot.ctx_mut(ev);
        debug_assert!(ectx.is_empty());
        ectx.sched = Some(scheduler::current().unwrap_or_else(|| self.sched.clone()));
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(cur.state(), State::Running);
                ectx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Disarms `ev` on `fd` without running what was bound to it.
    /// Returns `false` when the event was not armed.
    pub fn del_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut slot = ctx.slot.lock().unwrap();
        if !slot.events.contains(ev) {
            return false;
        }
        let left = slot.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.epoll_update(fd, op, left) {
            log::error!("del_event(fd {}, {:?}): {}", fd, ev, e);
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        slot.events = left;
        slot.ctx_mut(ev).clear();
        true
    }

    /// Disarms `ev` on `fd` and fires what was bound to it, as if the fd
    /// had become ready. This is how condition timers unblock a timed-out
    /// I/O wait.
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut slot = ctx.slot.lock().unwrap();
        if !slot.events.contains(ev) {
            return false;
        }
        let left = slot.events - ev;
        let op = if left.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        if let Err(e) = self.epoll_update(fd, op, left) {
            log::error!("cancel_event(fd {}, {:?}): {}", fd, ev, e);
            return false;
        }
        slot.trigger(fd, ev);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Fires and disarms everything on `fd` and forgets it in the poller.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup_context(fd) {
            Some(c) => c,
            None => return false,
        };
        let mut slot = ctx.slot.lock().unwrap();
        if slot.events.is_empty() {
            return false;
        }
        if let Err(e) = self.epoll_update(fd, libc::EPOLL_CTL_DEL, Event::empty()) {
            log::error!("cancel_all(fd {}): {}", fd, e);
            return false;
        }
        if slot.events.contains(Event::READ) {
            slot.trigger(fd, Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if slot.events.contains(Event::WRITE) {
            slot.trigger(fd, Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(slot.events.is_empty());
        true
    }

    fn epoll_update(&self, fd: RawFd, op: c_int, events: Event) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        match cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) }) {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::Registration {
                fd,
                op: match op {
                    libc::EPOLL_CTL_ADD => "add",
                    libc::EPOLL_CTL_MOD => "mod",
                    _ => "del",
                },
                source: e,
            }),
        }
    }

    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let slots = self.fd_contexts.read().unwrap();
            if let Some(ctx) = slots.get(fd as usize) {
                return ctx.clone();
            }
        }
        self.grow_contexts((fd as usize + 1).max(fd as usize * 3 / 2));
        self.fd_contexts.read().unwrap()[fd as usize].clone()
    }

    fn lookup_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.fd_contexts.read().unwrap().get(fd as usize).cloned()
    }

    fn grow_contexts(&self, size: usize) {
        let mut slots = self.fd_contexts.write().unwrap();
        while slots.len() < size {
            let next_fd = slots.len() as RawFd;
            slots.push(Arc::new(FdContext {
                fd: next_fd,
                slot: Mutex::new(FdSlot {
                    events: Event::empty(),
                    read: EventCtx::default(),
                    write: EventCtx::default(),
                }),
            }));
        }
    }

    /// Wakes one parked worker with a byte through the self-pipe. Skipped
    /// when nobody is parked: a busy worker rescans the queue anyway. A
    /// full pipe is fine, the poller is overdue for a wakeup already.
    fn tickle_impl(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let n = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const c_void, 1) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                log::error!("tickle write failed: {}", err);
            }
        }
    }

    fn idle_loop(&self, sched: &Scheduler) {
        const MAX_EVENTS: usize = 256;
        const MAX_TIMEOUT_MS: u64 = 5000;
        log::debug!("iomanager {} idle", sched.name());

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        loop {
            if Driver::stopping(self, sched) {
                log::debug!("iomanager {} idle exits", sched.name());
                break;
            }

            let timeout_ms = self
                .timers
                .next_timeout_ms()
                .map_or(MAX_TIMEOUT_MS, |next| next.min(MAX_TIMEOUT_MS));
            let n = loop {
                let rt = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as c_int,
                        timeout_ms as c_int,
                    )
                };
                if rt >= 0 {
                    break rt as usize;
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("epoll_wait: {}", err);
                break 0;
            };

            let expired = self.timers.take_expired();
            if !expired.is_empty() {
                sched.schedule_batch(
                    expired
                        .into_iter()
                        .map(|cb| ScheduleTask::callback(move || cb())),
                );
            }

            for raw in &events[..n] {
                let fd = raw.u64 as RawFd;
                if fd == self.tickle_fds[0] {
                    // Drain every queued tickle byte; edge-triggered, so
                    // leftovers would go unnoticed.
                    let mut buf = [0u8; 256];
                    while unsafe {
                        libc::read(self.tickle_fds[0], buf.as_mut_ptr() as *mut c_void, buf.len())
                    } > 0
                    {}
                    continue;
                }

                let ctx = match self.lookup_context(fd) {
                    Some(c) => c,
                    None => continue,
                };
                let mut slot = ctx.slot.lock().unwrap();

                let mut revents = raw.events;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    // An error wakes both directions so nobody waits on a
                    // dead fd.
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & slot.events.bits();
                }
                let mut fired = Event::empty();
                if revents & libc::EPOLLIN as u32 != 0 {
                    fired |= Event::READ;
                }
                if revents & libc::EPOLLOUT as u32 != 0 {
                    fired |= Event::WRITE;
                }
                fired &= slot.events;
                if fired.is_empty() {
                    continue;
                }

                let left = slot.events - fired;
                let op = if left.is_empty() {
                    libc::EPOLL_CTL_DEL
                } else {
                    libc::EPOLL_CTL_MOD
                };
                if let Err(e) = self.epoll_update(fd, op, left) {
                    log::error!("idle: rewriting interest for fd {} failed: {}", fd, e);
                    continue;
                }

                if fired.contains(Event::READ) {
                    slot.trigger(fd, Event::READ);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if fired.contains(Event::WRITE) {
                    slot.trigger(fd, Event::WRITE);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Hand freshly scheduled tasks to the run loop before the
            // next wait.
            fiber::yield_now();
        }
    }
}

impl Driver for IoManager {
    fn on_thread_start(&self) {
        set_current(&self.me);
    }

    fn tickle(&self, _sched: &Scheduler) {
        self.tickle_impl();
    }

    fn idle(&self, sched: &Scheduler) {
        self.idle_loop(sched);
    }

    fn stopping(&self, sched: &Scheduler) -> bool {
        self.pending.load(Ordering::SeqCst) == 0
            && !self.timers.has_timers()
            && sched.base_stopping()
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        self.sched.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for IoManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoManager")
            .field("epfd", &self.epfd)
            .field("pending_events", &self.pending_events())
            .finish_non_exhaustive()
    }
}
