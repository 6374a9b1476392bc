//! M:N cooperative scheduler.
//!
//! A [`Scheduler`] multiplexes fibers over a fixed pool of worker OS
//! threads. Work arrives as a [`ScheduleTask`] (an existing fiber handle
//! or a bare callback) through a mutex-protected FIFO queue. Each
//! worker runs the same loop: take the first eligible task, resume it on a
//! fiber, and when the queue has nothing for this thread, resume the idle
//! fiber instead.
//!
//! What "idle" means is pluggable through the crate-internal [`Driver`]
//! trait. The base driver just yields in a loop (busy-polling); the
//! [`IoManager`](crate::io::IoManager) replaces it with a blocking wait on
//! the event demultiplexer, which is what turns this from a toy pool into
//! an I/O runtime.
//!
//! With `use_caller` the constructing thread is counted as one of the
//! workers: a dedicated scheduling fiber is created on it and its share of
//! the run loop is driven by [`stop`](Scheduler::stop).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;

use once_cell::sync::Lazy;

use crate::error::Result;
use crate::fiber::{self, Fiber, State};
use crate::hook;
use crate::util::thread_id;

thread_local! {
    static CURRENT_SCHED: RefCell<Weak<Scheduler>> = RefCell::new(Weak::new());
    static SCHED_FIBER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

/// The scheduler driving the current thread, if any.
pub fn current() -> Option<Arc<Scheduler>> {
    CURRENT_SCHED.with(|c| c.borrow().upgrade())
}

/// The scheduling fiber of the current thread: the context that fibers
/// created with `in_scheduler = true` switch back to when they yield.
pub(crate) fn sched_fiber() -> Option<Arc<Fiber>> {
    SCHED_FIBER.with(|f| f.borrow().clone())
}

fn set_current(sched: &Arc<Scheduler>) {
    CURRENT_SCHED.with(|c| *c.borrow_mut() = Arc::downgrade(sched));
}

fn set_sched_fiber(f: Arc<Fiber>) {
    SCHED_FIBER.with(|s| *s.borrow_mut() = Some(f));
}

/// Hook points a derived runtime uses to override how workers wake, park
/// and decide they are done. The base implementation busy-polls.
pub(crate) trait Driver: Send + Sync {
    /// Runs once per worker thread before it enters the run loop.
    fn on_thread_start(&self) {}

    /// Wakes one parked worker because new work arrived.
    fn tickle(&self, sched: &Scheduler) {
        let _ = sched;
        log::trace!("tickle");
    }

    /// Body of the idle fiber; called when a worker has nothing to run.
    /// Must yield regularly and return once `stopping` holds.
    fn idle(&self, sched: &Scheduler) {
        while !self.stopping(sched) {
            fiber::yield_now();
        }
    }

    /// Whether workers may exit.
    fn stopping(&self, sched: &Scheduler) -> bool {
        sched.base_stopping()
    }
}

struct DefaultDriver;

impl Driver for DefaultDriver {}

static DEFAULT_DRIVER: Lazy<Arc<dyn Driver>> = Lazy::new(|| Arc::new(DefaultDriver));

enum TaskKind {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send + 'static>),
}

/// A queued unit of work: a fiber handle or a bare callback, with an
/// optional thread affinity.
pub struct ScheduleTask {
    kind: TaskKind,
    thread: Option<u64>,
}

impl ScheduleTask {
    /// Wraps an existing fiber. The fiber must have been created with
    /// `in_scheduler = true`.
    pub fn fiber(f: Arc<Fiber>) -> Self {
        ScheduleTask {
            kind: TaskKind::Fiber(f),
            thread: None,
        }
    }

    /// Wraps a bare callback; the executing worker hosts it on a cached
    /// callback fiber.
    pub fn callback(f: impl FnOnce() + Send + 'static) -> Self {
        Self::callback_boxed(Box::new(f))
    }

    pub(crate) fn callback_boxed(f: Box<dyn FnOnce() + Send + 'static>) -> Self {
        ScheduleTask {
            kind: TaskKind::Call(f),
            thread: None,
        }
    }

    /// Pins the task to the worker with the given OS thread id (see
    /// [`Scheduler::thread_ids`]). Other workers will skip it.
    pub fn with_thread(mut self, tid: u64) -> Self {
        self.thread = Some(tid);
        self
    }
}

/// Thread pool multiplexing fibers onto worker OS threads.
pub struct Scheduler {
    me: Weak<Scheduler>,
    name: String,
    /// Threads this scheduler spawns (excludes the caller thread).
    worker_count: usize,
    /// Worker total including the caller thread when `use_caller`.
    total_threads: usize,
    use_caller: bool,
    root_thread: Option<u64>,
    driver: Weak<dyn Driver>,
    tasks: Mutex<VecDeque<ScheduleTask>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_ids: Mutex<Vec<u64>>,
    root_fiber: Mutex<Option<Arc<Fiber>>>,
    active: AtomicUsize,
    idle: AtomicUsize,
    started: AtomicBool,
    stop_flag: AtomicBool,
    joined: AtomicBool,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers. With `use_caller` the
    /// constructing thread is one of them and `threads - 1` are spawned.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Self::with_driver(threads, use_caller, name, Weak::<DefaultDriver>::new())
    }

    pub(crate) fn with_driver(
        threads: usize,
        use_caller: bool,
        name: &str,
        driver: Weak<dyn Driver>,
    ) -> Arc<Scheduler> {
        assert!(threads >= 1, "scheduler needs at least one thread");
        let (worker_count, root_thread) = if use_caller {
            (threads - 1, Some(thread_id()))
        } else {
            (threads, None)
        };
        let sched = Arc::new_cyclic(|me| Scheduler {
            me: me.clone(),
            name: name.to_owned(),
            worker_count,
            total_threads: threads,
            use_caller,
            root_thread,
            driver,
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(Vec::new()),
            root_fiber: Mutex::new(None),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stop_flag: AtomicBool::new(false),
            joined: AtomicBool::new(false),
        });
        if let Some(tid) = root_thread {
            set_current(&sched);
            sched.thread_ids.lock().unwrap().push(tid);
        }
        sched
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of all workers, usable with
    /// [`ScheduleTask::with_thread`]. Complete once [`start`] returned.
    ///
    /// [`start`]: Scheduler::start
    pub fn thread_ids(&self) -> Vec<u64> {
        self.thread_ids.lock().unwrap().clone()
    }

    #[inline]
    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// Spawns the worker threads. Idempotent while running; a no-op
    /// (logged) after `stop`.
    pub fn start(&self) {
        if self.stop_flag.load(Ordering::SeqCst) {
            log::error!("scheduler {} is stopped, start ignored", self.name);
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("scheduler {} start", self.name);
        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return,
        };

        if self.use_caller {
            // The caller thread's run loop lives on its own fiber and is
            // driven by `stop`.
            let me = this.clone();
            match Fiber::new(move || me.run(), 0, false) {
                Ok(f) => {
                    set_sched_fiber(f.clone());
                    *self.root_fiber.lock().unwrap() = Some(f);
                }
                Err(e) => log::error!("scheduler {}: cannot create root fiber: {}", self.name, e),
            }
        }

        let (tx, rx) = mpsc::channel();
        let mut spawned = 0;
        {
            let mut threads = self.threads.lock().unwrap();
            for i in 0..self.worker_count {
                let me = this.clone();
                let tx = tx.clone();
                let res = thread::Builder::new()
                    .name(format!("{}_{}", self.name, i))
                    .spawn(move || {
                        let _ = tx.send(thread_id());
                        me.run();
                    });
                match res {
                    Ok(handle) => {
                        threads.push(handle);
                        spawned += 1;
                    }
                    Err(e) => log::error!("scheduler {}: worker spawn failed: {}", self.name, e),
                }
            }
        }
        drop(tx);
        let mut ids = self.thread_ids.lock().unwrap();
        for _ in 0..spawned {
            if let Ok(tid) = rx.recv() {
                ids.push(tid);
            }
        }
    }

    /// Enqueues a task. Wakes a worker when the queue was empty.
    pub fn schedule(&self, task: ScheduleTask) {
        if self.joined.load(Ordering::SeqCst) {
            log::warn!("scheduler {} already stopped, task dropped", self.name);
            return;
        }
        let need_tickle = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if need_tickle {
            self.driver().tickle(self);
        }
    }

    /// Enqueues a batch, waking at most one worker.
    pub fn schedule_batch(&self, tasks: impl IntoIterator<Item = ScheduleTask>) {
        if self.joined.load(Ordering::SeqCst) {
            log::warn!("scheduler {} already stopped, batch dropped", self.name);
            return;
        }
        let need_tickle = {
            let mut q = self.tasks.lock().unwrap();
            let was_empty = q.is_empty();
            let mut any = false;
            for task in tasks {
                q.push_back(task);
                any = true;
            }
            was_empty && any
        };
        if need_tickle {
            self.driver().tickle(self);
        }
    }

    /// Creates a fiber running `f` (default stack) and schedules it.
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) -> Result<Arc<Fiber>> {
        self.spawn_with_stack(f, 0)
    }

    /// Creates a fiber with an explicit stack size and schedules it.
    pub fn spawn_with_stack(
        &self,
        f: impl FnOnce() + Send + 'static,
        stack_size: usize,
    ) -> Result<Arc<Fiber>> {
        let fiber = Fiber::new(f, stack_size, true)?;
        self.schedule(ScheduleTask::fiber(fiber.clone()));
        Ok(fiber)
    }

    /// Signals shutdown, drains the queue and joins all workers. With
    /// `use_caller` this must run on the constructing thread, whose share
    /// of the work is drained here.
    pub fn stop(&self) {
        if self.stop_flag.swap(true, Ordering::SeqCst) && self.joined.load(Ordering::SeqCst) {
            return;
        }
        log::debug!("scheduler {} stop", self.name);
        let driver = self.driver();
        for _ in 0..self.total_threads {
            driver.tickle(self);
        }

        let root = self.root_fiber.lock().unwrap().take();
        if let Some(root) = root {
            driver.tickle(self);
            root.resume();
        }

        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("scheduler {}: worker thread panicked", self.name);
            }
        }
        self.joined.store(true, Ordering::SeqCst);
    }

    /// Base shutdown predicate: stop requested, queue drained, nobody
    /// mid-task. Derived runtimes strengthen this.
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    pub fn stopping(&self) -> bool {
        self.driver().stopping(self)
    }

    fn driver(&self) -> Arc<dyn Driver> {
        match self.driver.upgrade() {
            Some(d) => d,
            None => DEFAULT_DRIVER.clone(),
        }
    }

    /// Worker run loop; also hosted on the caller thread's root fiber
    /// when `use_caller`.
    fn run(&self) {
        let this = match self.me.upgrade() {
            Some(this) => this,
            None => return,
        };
        hook::set_enabled(true);
        set_current(&this);
        let driver = self.driver();
        driver.on_thread_start();

        let tid = thread_id();
        if self.root_thread != Some(tid) {
            // On plain workers the scheduling fiber is the thread itself.
            set_sched_fiber(Fiber::current());
        }
        log::debug!("scheduler {} run loop on thread {}", self.name, tid);

        let idle_driver = driver.clone();
        let idle_sched = this.clone();
        let idle_fiber = match Fiber::new(move || idle_driver.idle(&idle_sched), 0, true) {
            Ok(f) => f,
            Err(e) => {
                log::error!("scheduler {}: cannot create idle fiber: {}", self.name, e);
                return;
            }
        };
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut task: Option<ScheduleTask> = None;
            let mut tickle_me = false;
            {
                let mut q = self.tasks.lock().unwrap();
                let mut i = 0;
                while i < q.len() {
                    let skip = {
                        let t = &q[i];
                        if t.thread.map_or(false, |aff| aff != tid) {
                            // Pinned elsewhere; make sure its owner looks.
                            tickle_me = true;
                            true
                        } else {
                            // A fiber still winding down on another worker
                            // stays queued until its yield completes.
                            matches!(&t.kind, TaskKind::Fiber(f) if f.state() == State::Running)
                        }
                    };
                    if skip {
                        i += 1;
                        continue;
                    }
                    task = q.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || (task.is_some() && !q.is_empty());
                if task.is_none() {
                    // Going idle is published under the queue lock, so a
                    // schedule racing with this transition always sees an
                    // idle worker and tickles it.
                    self.idle.fetch_add(1, Ordering::SeqCst);
                }
            }
            if tickle_me {
                driver.tickle(self);
            }

            match task.map(|t| t.kind) {
                Some(TaskKind::Fiber(f)) => {
                    f.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(TaskKind::Call(cb)) => {
                    let fiber = match cb_fiber.take() {
                        Some(f) => {
                            f.reset(cb);
                            f
                        }
                        None => match Fiber::new(cb, 0, true) {
                            Ok(f) => f,
                            Err(e) => {
                                log::error!(
                                    "scheduler {}: cannot create callback fiber: {}",
                                    self.name,
                                    e
                                );
                                self.active.fetch_sub(1, Ordering::SeqCst);
                                continue;
                            }
                        },
                    };
                    fiber.resume();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    if fiber.state() == State::Term {
                        // Reusable for the next callback.
                        cb_fiber = Some(fiber);
                    }
                    // Otherwise the callback suspended mid-flight and the
                    // fiber now belongs to whoever rearms it.
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        self.idle.fetch_sub(1, Ordering::SeqCst);
                        log::debug!("scheduler {}: idle fiber terminated", self.name);
                        break;
                    }
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
        log::debug!("scheduler {} worker {} exits", self.name, tid);
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("threads", &self.total_threads)
            .field("use_caller", &self.use_caller)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    #[test]
    fn callbacks_run_on_workers() {
        let sched = Scheduler::new(2, false, "cb");
        sched.start();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let n = n.clone();
            sched.schedule(ScheduleTask::callback(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert!(wait_until(Duration::from_secs(5), || n
            .load(Ordering::SeqCst)
            == 100));
        sched.stop();
    }

    #[test]
    fn scheduled_fibers_reach_term() {
        let sched = Scheduler::new(2, false, "fib");
        sched.start();
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        let fiber = sched
            .spawn_with_stack(
                move || {
                    n2.fetch_add(1, Ordering::SeqCst);
                },
                64 * 1024,
            )
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || fiber.state()
            == State::Term));
        assert_eq!(n.load(Ordering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn batch_runs_everything() {
        let sched = Scheduler::new(2, false, "batch");
        sched.start();
        let n = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let n = n.clone();
                ScheduleTask::callback(move || {
                    n.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        sched.schedule_batch(tasks);
        assert!(wait_until(Duration::from_secs(5), || n
            .load(Ordering::SeqCst)
            == 50));
        sched.stop();
    }

    #[test]
    fn use_caller_drains_on_stop() {
        let sched = Scheduler::new(1, true, "caller");
        sched.start();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let n = n.clone();
            sched.schedule(ScheduleTask::callback(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // The single worker is the caller thread; everything runs inside
        // stop().
        sched.stop();
        assert_eq!(n.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn schedule_after_stop_is_ignored() {
        let sched = Scheduler::new(1, false, "late");
        sched.start();
        sched.stop();
        // Must not panic or hang.
        sched.schedule(ScheduleTask::callback(|| unreachable!()));
    }

    #[test]
    fn stop_joins_workers_and_drains_queue() {
        let sched = Scheduler::new(3, false, "drain");
        sched.start();
        let n = Arc::new(AtomicUsize::new(0));
        for _ in 0..200 {
            let n = n.clone();
            sched.schedule(ScheduleTask::callback(move || {
                n.fetch_add(1, Ordering::SeqCst);
            }));
        }
        sched.stop();
        assert_eq!(n.load(Ordering::SeqCst), 200);
        assert!(sched.tasks.lock().unwrap().is_empty());
        assert!(sched.threads.lock().unwrap().is_empty());
    }
}
