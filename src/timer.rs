//! Deadline-triggered callbacks.
//!
//! A [`TimerManager`] keeps an ordered set of absolute monotonic
//! deadlines. The I/O idle loop asks it for the nearest deadline to bound
//! its demultiplexer wait, then drains whatever expired with
//! [`take_expired`](TimerManager::take_expired) and schedules the
//! callbacks.
//!
//! Cancellation clears the stored callback, so a timer that races with its
//! own firing degrades to a no-op instead of running a stale callback.
//! Condition timers additionally gate the callback on a [`Weak`] staying
//! upgradable, which is how I/O timeouts die together with the operation
//! they guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::clock;

pub(crate) type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Ordering key: firing time, then insertion sequence. The sequence keeps
/// same-deadline timers distinct and firing in insertion order.
type TimerKey = (u64, u64);

struct TimerEntry {
    seq: u64,
    recurring: bool,
    period_ms: AtomicU64,
    at_ms: AtomicU64,
    cb: Mutex<Option<TimerCallback>>,
}

impl TimerEntry {
    #[inline]
    fn key(&self) -> TimerKey {
        (self.at_ms.load(Ordering::Relaxed), self.seq)
    }
}

struct Inner {
    // Lock order: `timers` first, then an entry's `cb`. `take_expired`
    // and the handle operations both follow it.
    timers: RwLock<BTreeMap<TimerKey, Arc<TimerEntry>>>,
    seq: AtomicU64,
    prev_wall_ms: AtomicU64,
    waker: Option<Box<dyn Fn() + Send + Sync>>,
}

impl Inner {
    /// Inserts an entry, waking the poller when it became the new front
    /// (its deadline bounds the demultiplexer wait).
    fn insert(&self, entry: Arc<TimerEntry>) {
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            let key = entry.key();
            let at_front = timers.keys().next().map_or(true, |front| key < *front);
            timers.insert(key, entry);
            at_front
        };
        if at_front {
            if let Some(waker) = &self.waker {
                waker();
            }
        }
    }

    /// A wall clock jump backwards by more than an hour expires
    /// everything; better to fire early once than to sit on timers whose
    /// deadlines no longer mean anything.
    fn detect_rollover(&self, now_wall: u64) -> bool {
        let prev = self.prev_wall_ms.swap(now_wall, Ordering::Relaxed);
        prev != 0 && now_wall < prev && prev - now_wall > 60 * 60 * 1000
    }
}

/// Handle to a pending timer. Dropping the handle does not cancel the
/// timer.
pub struct Timer {
    entry: Arc<TimerEntry>,
    mgr: Weak<Inner>,
}

impl Timer {
    /// Removes the timer and clears its callback. Returns `false` when
    /// the timer already fired (one-shot) or was already cancelled.
    pub fn cancel(&self) -> bool {
        let inner = match self.mgr.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let mut timers = inner.timers.write().unwrap();
        let mut cb = self.entry.cb.lock().unwrap();
        if cb.is_none() {
            return false;
        }
        *cb = None;
        timers.remove(&self.entry.key());
        true
    }

    /// Pushes the firing time out to `now + period`. Only meaningful for
    /// recurring timers; returns `false` otherwise, or when the timer is
    /// gone.
    pub fn refresh(&self) -> bool {
        if !self.entry.recurring {
            return false;
        }
        self.reschedule(|now, entry| now + entry.period_ms.load(Ordering::Relaxed))
    }

    /// Re-arms the timer with a new delay. With `from_now` the delay is
    /// anchored at the current instant, otherwise at the original start.
    pub fn reset(&self, delay: Duration, from_now: bool) -> bool {
        let delay_ms = clock::duration_to_ms(delay);
        if delay_ms == self.entry.period_ms.load(Ordering::Relaxed) && !from_now {
            return true;
        }
        self.reschedule(|now, entry| {
            let start = if from_now {
                now
            } else {
                entry
                    .at_ms
                    .load(Ordering::Relaxed)
                    .saturating_sub(entry.period_ms.load(Ordering::Relaxed))
            };
            entry.period_ms.store(delay_ms, Ordering::Relaxed);
            start + delay_ms
        })
    }

    fn reschedule(&self, new_at: impl FnOnce(u64, &TimerEntry) -> u64) -> bool {
        let inner = match self.mgr.upgrade() {
            Some(inner) => inner,
            None => return false,
        };
        let at_front = {
            let mut timers = inner.timers.write().unwrap();
            let cb = self.entry.cb.lock().unwrap();
            if cb.is_none() {
                return false;
            }
            timers.remove(&self.entry.key());
            let at = new_at(clock::monotonic_ms(), &self.entry);
            self.entry.at_ms.store(at, Ordering::Relaxed);
            let key = self.entry.key();
            let at_front = timers.keys().next().map_or(true, |front| key < *front);
            timers.insert(key, self.entry.clone());
            at_front
        };
        if at_front {
            if let Some(waker) = &inner.waker {
                waker();
            }
        }
        true
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("at_ms", &self.entry.at_ms.load(Ordering::Relaxed))
            .field("recurring", &self.entry.recurring)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of pending timers.
pub struct TimerManager {
    inner: Arc<Inner>,
}

impl TimerManager {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// `waker` runs (outside all locks) whenever an insert produces a new
    /// earliest deadline, so a blocked poller can re-arm its wait.
    pub(crate) fn with_waker(waker: Box<dyn Fn() + Send + Sync>) -> Self {
        Self::build(Some(waker))
    }

    fn build(waker: Option<Box<dyn Fn() + Send + Sync>>) -> Self {
        TimerManager {
            inner: Arc::new(Inner {
                timers: RwLock::new(BTreeMap::new()),
                seq: AtomicU64::new(0),
                prev_wall_ms: AtomicU64::new(0),
                waker,
            }),
        }
    }

    /// Arms a timer firing `delay` from now. A recurring timer re-arms
    /// itself with the same period after each firing.
    pub fn add_timer(
        &self,
        delay: Duration,
        cb: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.add_timer_impl(delay, Arc::new(cb), recurring)
    }

    /// Arms a timer whose callback only runs if `cond` is still
    /// upgradable at fire time. Dropping the last strong reference to the
    /// condition is a race-free way to disarm the timer.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        delay: Duration,
        cb: impl Fn() + Send + Sync + 'static,
        cond: Weak<T>,
        recurring: bool,
    ) -> Timer {
        self.add_timer_impl(
            delay,
            Arc::new(move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            }),
            recurring,
        )
    }

    fn add_timer_impl(&self, delay: Duration, cb: TimerCallback, recurring: bool) -> Timer {
        let delay_ms = clock::duration_to_ms(delay);
        let entry = Arc::new(TimerEntry {
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            recurring,
            period_ms: AtomicU64::new(delay_ms),
            at_ms: AtomicU64::new(clock::monotonic_ms().saturating_add(delay_ms)),
            cb: Mutex::new(Some(cb)),
        });
        self.inner.insert(entry.clone());
        Timer {
            entry,
            mgr: Arc::downgrade(&self.inner),
        }
    }

    /// Milliseconds until the earliest pending timer; `None` when the set
    /// is empty.
    pub fn next_timeout_ms(&self) -> Option<u64> {
        let timers = self.inner.timers.read().unwrap();
        timers
            .keys()
            .next()
            .map(|(at, _)| at.saturating_sub(clock::monotonic_ms()))
    }

    pub fn has_timers(&self) -> bool {
        !self.inner.timers.read().unwrap().is_empty()
    }

    /// Removes every timer with a deadline at or before now and returns
    /// their callbacks in firing order. Recurring timers are re-armed at
    /// `fire + period`; cancelled ones are silently discarded.
    pub(crate) fn take_expired(&self) -> Vec<TimerCallback> {
        let rollover = self.inner.detect_rollover(clock::wall_ms());
        let now = clock::monotonic_ms();
        let mut out = Vec::new();
        let mut reinsert = Vec::new();

        let mut timers = self.inner.timers.write().unwrap();
        loop {
            let key = match timers.keys().next() {
                Some(key) => *key,
                None => break,
            };
            if !rollover && key.0 > now {
                break;
            }
            let entry = timers.remove(&key).unwrap();
            let cb = if entry.recurring {
                entry.cb.lock().unwrap().clone()
            } else {
                // A fired one-shot gives up its callback so a later
                // `cancel` correctly reports "too late".
                entry.cb.lock().unwrap().take()
            };
            if let Some(cb) = cb {
                out.push(cb);
                if entry.recurring {
                    let next = key.0.saturating_add(entry.period_ms.load(Ordering::Relaxed));
                    entry.at_ms.store(next, Ordering::Relaxed);
                    reinsert.push((entry.key(), entry));
                }
            }
        }
        for (key, entry) in reinsert {
            timers.insert(key, entry);
        }
        out
    }
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        (n, move || {
            n2.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn fires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, delay) in [("late", 20u64), ("early", 1)] {
            let o = order.clone();
            mgr.add_timer(
                Duration::from_millis(delay),
                move || o.lock().unwrap().push(label),
                false,
            );
        }
        thread::sleep(Duration::from_millis(40));
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
        assert!(!mgr.has_timers());
    }

    #[test]
    fn tie_broken_by_insertion_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["first", "second", "third"] {
            let o = order.clone();
            mgr.add_timer(
                Duration::from_millis(1),
                move || o.lock().unwrap().push(label),
                false,
            );
        }
        thread::sleep(Duration::from_millis(10));
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let (n, cb) = counter();
        let timer = mgr.add_timer(Duration::from_millis(1), cb, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        thread::sleep(Duration::from_millis(10));
        assert!(mgr.take_expired().is_empty());
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_reports_too_late() {
        let mgr = TimerManager::new();
        let (_, cb) = counter();
        let timer = mgr.add_timer(Duration::from_millis(1), cb, false);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(mgr.take_expired().len(), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn recurring_timer_rearms() {
        let mgr = TimerManager::new();
        let (n, cb) = counter();
        mgr.add_timer(Duration::from_millis(5), cb, true);
        thread::sleep(Duration::from_millis(12));
        for cb in mgr.take_expired() {
            cb();
        }
        assert!(mgr.has_timers(), "recurring timer must re-arm");
        thread::sleep(Duration::from_millis(12));
        for cb in mgr.take_expired() {
            cb();
        }
        assert!(n.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn condition_timer_with_dead_owner_is_noop() {
        let mgr = TimerManager::new();
        let (n, cb) = counter();
        let owner = Arc::new(());
        mgr.add_condition_timer(Duration::from_millis(1), cb, Arc::downgrade(&owner), false);
        drop(owner);
        thread::sleep(Duration::from_millis(10));
        for cb in mgr.take_expired() {
            cb();
        }
        assert_eq!(n.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn next_timeout_tracks_front() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timeout_ms(), None);
        mgr.add_timer(Duration::from_millis(500), || {}, false);
        let next = mgr.next_timeout_ms().unwrap();
        assert!(next <= 500);
        mgr.add_timer(Duration::from_millis(10), || {}, false);
        assert!(mgr.next_timeout_ms().unwrap() <= 10);
    }

    #[test]
    fn refresh_only_for_recurring() {
        let mgr = TimerManager::new();
        let one_shot = mgr.add_timer(Duration::from_millis(50), || {}, false);
        assert!(!one_shot.refresh());
        let recurring = mgr.add_timer(Duration::from_millis(50), || {}, true);
        assert!(recurring.refresh());
    }

    #[test]
    fn reset_moves_deadline() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(Duration::from_millis(500), || {}, false);
        assert!(timer.reset(Duration::from_millis(5), true));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(mgr.take_expired().len(), 1);
    }
}
