//! Cooperative multitasking primitive.
//!
//! A [`Fiber`] is a stackful coroutine: a private heap stack plus a saved
//! machine context, switched with the `ucontext` family. Application code
//! inside a fiber is plain straight-line code; when it blocks (through the
//! [hook layer](crate::hook)) the fiber is suspended and the worker thread
//! moves on to other work.
//!
//! A fiber has three states: **Ready**, **Running** or **Term**. It starts
//! Ready, becomes Running when [resumed](Fiber::resume), goes back to Ready
//! when it [yields](yield_now), and reaches Term when its entry function
//! returns. Term is final; a Term fiber can only be recycled with
//! [`Fiber::reset`].
//!
//! Every thread has an implicit "root" fiber representing the thread's own
//! execution; it owns no stack and is materialized lazily by
//! [`Fiber::current`].

use std::cell::{RefCell, UnsafeCell};
use std::io;
use std::mem::MaybeUninit;
use std::os::raw::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::scheduler;

/// Stack size used when a fiber is created with `stack_size == 0`.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

type Entry = Box<dyn FnOnce() + Send + 'static>;

/// Execution state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable: created, reset, or suspended after a yield.
    Ready = 0,
    /// Currently executing on some thread.
    Running = 1,
    /// The entry function has returned. Final.
    Term = 2,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Term,
        }
    }
}

/// A stackful coroutine.
///
/// Handles are reference counted; the scheduler, armed I/O events and
/// pending timers each hold one while they can still resume the fiber.
pub struct Fiber {
    me: Weak<Fiber>,
    id: u64,
    stack_size: usize,
    stack: Option<Box<[u8]>>,
    ctx: UnsafeCell<libc::ucontext_t>,
    entry: UnsafeCell<Option<Entry>>,
    state: AtomicU8,
    in_scheduler: bool,
}

// The scheduler serializes access: a fiber is resumed by at most one
// thread at a time (the run loop skips fibers in the Running state), and
// `ctx`/`entry` are only touched by the thread currently resuming it.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

#[inline]
fn empty_ctx() -> libc::ucontext_t {
    unsafe { MaybeUninit::<libc::ucontext_t>::zeroed().assume_init() }
}

unsafe fn switch(save: *mut libc::ucontext_t, load: *const libc::ucontext_t) {
    if libc::swapcontext(save, load) != 0 {
        log::error!("swapcontext failed: {}", io::Error::last_os_error());
    }
}

impl Fiber {
    /// Creates a new Ready fiber that will run `f` when first resumed.
    ///
    /// - `stack_size`: private stack size in bytes; `0` means
    ///   [`DEFAULT_STACK_SIZE`].
    /// - `in_scheduler`: selects where the fiber switches back to on
    ///   yield: `true` targets the scheduling fiber of the worker thread
    ///   running it, `false` targets the thread's root fiber. Fibers
    ///   handed to a [`Scheduler`](crate::scheduler::Scheduler) must be
    ///   created with `true`; fibers resumed by hand from ordinary thread
    ///   flow (generator style) with `false`.
    pub fn new(
        f: impl FnOnce() + Send + 'static,
        stack_size: usize,
        in_scheduler: bool,
    ) -> Result<Arc<Fiber>> {
        let stack_size = if stack_size == 0 {
            DEFAULT_STACK_SIZE
        } else {
            stack_size
        };
        let mut stack = vec![0u8; stack_size].into_boxed_slice();

        let mut ctx = empty_ctx();
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            return Err(Error::Context {
                op: "getcontext",
                source: io::Error::last_os_error(),
            });
        }
        ctx.uc_link = ptr::null_mut();
        ctx.uc_stack.ss_sp = stack.as_mut_ptr() as *mut c_void;
        ctx.uc_stack.ss_size = stack_size;
        unsafe { libc::makecontext(&mut ctx, fiber_main, 0) };

        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new_cyclic(|me| Fiber {
            me: me.clone(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack_size,
            stack: Some(stack),
            ctx: UnsafeCell::new(ctx),
            entry: UnsafeCell::new(Some(Box::new(f))),
            state: AtomicU8::new(State::Ready as u8),
            in_scheduler,
        }))
    }

    /// The root fiber of a thread: no private stack, Running from birth.
    fn root() -> Arc<Fiber> {
        let mut ctx = empty_ctx();
        if unsafe { libc::getcontext(&mut ctx) } != 0 {
            log::error!("getcontext failed: {}", io::Error::last_os_error());
        }
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new_cyclic(|me| Fiber {
            me: me.clone(),
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            stack_size: 0,
            stack: None,
            ctx: UnsafeCell::new(ctx),
            entry: UnsafeCell::new(None),
            state: AtomicU8::new(State::Running as u8),
            in_scheduler: false,
        })
    }

    /// The fiber currently running on this thread.
    ///
    /// The first call on a thread materializes the thread's root fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let root = Fiber::root();
        THREAD_FIBER.with(|t| *t.borrow_mut() = Some(root.clone()));
        CURRENT.with(|c| *c.borrow_mut() = Some(root.clone()));
        root
    }

    /// The thread's root fiber (materializing it if needed).
    pub(crate) fn thread_fiber() -> Arc<Fiber> {
        if let Some(f) = THREAD_FIBER.with(|t| t.borrow().clone()) {
            return f;
        }
        // Materializes both thread-locals.
        let cur = Fiber::current();
        THREAD_FIBER.with(|t| t.borrow().clone()).unwrap_or(cur)
    }

    #[inline]
    fn set_current(f: Arc<Fiber>) {
        CURRENT.with(|c| *c.borrow_mut() = Some(f));
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline(always)]
    fn set_state(&self, s: State) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// Switches execution from the current thread flow into this fiber.
    ///
    /// Returns when the fiber yields or terminates.
    ///
    /// # Panics
    ///
    /// Panics unless the fiber is Ready: resuming a Running or Term fiber
    /// is a programmer error.
    pub fn resume(&self) {
        assert_eq!(
            self.state(),
            State::Ready,
            "resume of fiber {} in state {:?}",
            self.id,
            self.state()
        );
        let this = self.me.upgrade().expect("resume of a fiber without live handles");
        let from = if self.in_scheduler {
            scheduler::sched_fiber().expect("scheduler fiber resumed outside a worker thread")
        } else {
            Fiber::thread_fiber()
        };
        from.set_state(State::Ready);
        self.set_state(State::Running);
        let from_ctx = from.ctx.get();
        drop(from);
        Fiber::set_current(this);
        unsafe { switch(from_ctx, self.ctx.get()) };
        // Back here once the fiber yields (or, for the final time, never).
    }

    /// Gives the CPU back to the return target: the scheduling fiber when
    /// the fiber runs under a scheduler, the thread's root fiber
    /// otherwise. Infallible.
    pub(crate) fn switch_out(&self) {
        if self.state() != State::Term {
            self.set_state(State::Ready);
        }
        let back = if self.in_scheduler {
            scheduler::sched_fiber().expect("scheduler fiber yielded outside a worker thread")
        } else {
            Fiber::thread_fiber()
        };
        back.set_state(State::Running);
        let back_ctx = back.ctx.get();
        // Move the handle into the thread-local so nothing is left on this
        // frame when a Term fiber abandons it below.
        Fiber::set_current(back);
        unsafe { switch(self.ctx.get(), back_ctx) };
    }

    /// Recycles a Term fiber for a new entry, reusing its stack.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is not Term or is a root fiber.
    pub fn reset(&self, f: impl FnOnce() + Send + 'static) {
        assert_eq!(
            self.state(),
            State::Term,
            "reset of fiber {} in state {:?}",
            self.id,
            self.state()
        );
        let stack = self
            .stack
            .as_ref()
            .expect("reset of a root fiber");
        unsafe {
            *self.entry.get() = Some(Box::new(f));
            let ctx = self.ctx.get();
            if libc::getcontext(ctx) != 0 {
                log::error!("getcontext failed: {}", io::Error::last_os_error());
            }
            (*ctx).uc_link = ptr::null_mut();
            (*ctx).uc_stack.ss_sp = stack.as_ptr() as *mut c_void;
            (*ctx).uc_stack.ss_size = self.stack_size;
            libc::makecontext(ctx, fiber_main, 0);
        }
        self.set_state(State::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// Suspends the current fiber, handing the CPU back to its return target.
///
/// Calling this from outside any fiber (on a thread's root fiber) is a
/// no-op.
pub fn yield_now() {
    let cur = Fiber::current();
    if cur.stack.is_none() {
        return;
    }
    cur.switch_out();
}

/// Id of the fiber currently running on this thread, `0` when the thread
/// has not touched the fiber machinery yet.
pub fn fiber_id() -> u64 {
    CURRENT.with(|c| c.borrow().as_ref().map(|f| f.id()).unwrap_or(0))
}

/// Number of live fiber objects in the process (root fibers included).
pub fn fiber_count() -> u64 {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Entry trampoline: runs the stored entry, marks the fiber Term and
/// performs the final switch out.
extern "C" fn fiber_main() {
    let cur = Fiber::current();
    let entry = unsafe { (*cur.entry.get()).take() };
    if let Some(entry) = entry {
        // A panicking fiber must not take the worker thread down with it.
        if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
            log::error!("fiber {} terminated by panic", cur.id());
        }
    }
    cur.set_state(State::Term);
    // The final switch happens through a raw pointer: this frame is
    // abandoned, so no handle may still be owned here. The fiber stays
    // alive because whoever resumed it still holds one.
    let raw: *const Fiber = Arc::as_ptr(&cur);
    drop(cur);
    unsafe { (*raw).switch_out() };
    unreachable!("terminated fiber resumed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_resume_yield_term() {
        let steps = Arc::new(AtomicU64::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_reuses_stack() {
        let fiber = Fiber::new(|| {}, 64 * 1024, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        let ran = Arc::new(AtomicU64::new(0));
        let r = ran.clone();
        fiber.reset(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn current_materializes_root() {
        let root = Fiber::current();
        assert_eq!(root.state(), State::Running);
        assert!(root.stack.is_none());
        // Same handle on a second call.
        assert!(Arc::ptr_eq(&root, &Fiber::current()));
    }

    #[test]
    fn yield_outside_fiber_is_noop() {
        yield_now();
        yield_now();
    }

    #[test]
    fn panicking_fiber_reaches_term() {
        let fiber = Fiber::new(|| panic!("inside fiber"), 64 * 1024, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn generator_style_interleaving() {
        let out = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o = out.clone();
        let fiber = Fiber::new(
            move || {
                o.lock().unwrap().push("a");
                yield_now();
                o.lock().unwrap().push("c");
            },
            64 * 1024,
            false,
        )
        .unwrap();
        fiber.resume();
        out.lock().unwrap().push("b");
        fiber.resume();
        assert_eq!(*out.lock().unwrap(), vec!["a", "b", "c"]);
    }
}
