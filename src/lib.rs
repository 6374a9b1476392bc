//! Synchronous-looking network programming on stackful fibers.
//!
//! This library contains the building blocks of a cooperative M:N runtime:
//!
//! - [Fibers: stackful coroutines with explicit resume/yield](fiber)
//! - [Scheduler: a worker-thread pool multiplexing fibers](scheduler)
//! - [Timers: deadline callbacks with weak-condition cancellation](timer)
//! - [IoManager: epoll-driven wakeups glued to the scheduler](io)
//! - [Fd table: per-fd socket/nonblock/timeout bookkeeping](fd)
//! - [Hook layer: blocking syscalls turned into fiber suspensions](hook)
//! - [Logging](log) (see <https://docs.rs/log/>)
//! - [Error handling](error)
//!
//! Application code running inside a fiber writes ordinary blocking-style
//! I/O through the [`hook`] functions. When a call would block, the
//! runtime parks the fiber, registers interest with epoll (plus an
//! optional timeout on the timer wheel) and hands the worker thread to
//! other fibers; the call returns once the fd is ready or the timeout
//! fires with `ETIMEDOUT`.
//!
//! ```no_run
//! use corio::io::IoManager;
//!
//! let iom = IoManager::new(2, false, "demo").unwrap();
//! iom.spawn(|| {
//!     let fd = corio::hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
//!     let addr = "93.184.216.34:80".parse().unwrap();
//!     corio::hook::connect(fd, &addr).unwrap();
//!     corio::hook::write(fd, b"GET / HTTP/1.0\r\n\r\n").unwrap();
//!     let mut buf = [0u8; 4096];
//!     let n = corio::hook::read(fd, &mut buf).unwrap();
//!     println!("{}", String::from_utf8_lossy(&buf[..n]));
//!     corio::hook::close(fd).unwrap();
//! })
//! .unwrap();
//! iom.stop();
//! ```
//!
//! Only Linux is supported: the poller is epoll and context switches use
//! the `ucontext` family.

pub mod clock;
pub mod error;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod log;
pub mod scheduler;
pub mod timer;
mod util;

pub use error::{Error, Result};
pub use fiber::{yield_now, Fiber};
pub use io::{Event, IoManager};
pub use scheduler::{ScheduleTask, Scheduler};
pub use timer::Timer;
