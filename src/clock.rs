//! Millisecond clocks backing the timer wheel.
//!
//! All deadlines inside the runtime are absolute milliseconds on the
//! monotonic clock; the wall clock is only consulted to detect the system
//! time being yanked backwards underneath us.

use std::mem::MaybeUninit;
use std::time::Duration;

/// Sentinel for "no timeout". Large enough that arithmetic on it never
/// overflows a `u64` of milliseconds in practice.
pub const INFINITE_MS: u64 = u64::MAX;

#[inline]
fn gettime_ms(clock: libc::clockid_t) -> u64 {
    unsafe {
        let mut ts = MaybeUninit::<libc::timespec>::zeroed().assume_init();
        if libc::clock_gettime(clock, &mut ts) != 0 {
            let err = std::io::Error::last_os_error();
            panic!("failed to get time: {}", err);
        }
        ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
    }
}

/// Monotonic time in milliseconds since an arbitrary epoch.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Not affected by
/// daylight saving time or by changes done by an administrator; the right
/// clock for deadlines and elapsed-time measurement.
#[inline(always)]
pub fn monotonic_ms() -> u64 {
    gettime_ms(libc::CLOCK_MONOTONIC)
}

/// Wall clock time in milliseconds since the Unix epoch.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. May jump in either
/// direction; used only for rollback detection.
#[inline(always)]
pub fn wall_ms() -> u64 {
    gettime_ms(libc::CLOCK_REALTIME)
}

/// Converts a `Duration` to whole milliseconds, saturating at
/// [`INFINITE_MS`].
#[inline]
pub fn duration_to_ms(d: Duration) -> u64 {
    let ms = d.as_millis();
    if ms >= INFINITE_MS as u128 {
        INFINITE_MS
    } else {
        ms as u64
    }
}
