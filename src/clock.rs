//! Clock abstraction for the time-based trackers.
//!
//! A `Clock` is a pair of plain function pointers so cache structs stay
//! `Copy`-friendly and tests can substitute a fake time source without
//! generics. Ticks are an opaque monotonic unit; `freq` ticks equal one
//! second.

use core::time::Duration;

#[derive(Clone, Copy)]
pub struct Clock {
    /// Current time in ticks. Monotonic, starts at an arbitrary point.
    pub now: fn() -> i64,
    /// Ticks per second.
    pub freq: fn() -> i64,
}

impl Clock {
    /// The platform monotonic clock (nanosecond ticks).
    pub fn system() -> Self {
        Clock {
            now: crate::platform::clock_now,
            freq: crate::platform::clock_freq,
        }
    }

    /// Convert a duration to ticks on this clock.
    pub fn ticks_for(&self, d: Duration) -> i64 {
        let freq = (self.freq)() as i128;
        ((d.as_nanos() as i128 * freq) / 1_000_000_000) as i64
    }
}

/// Per-thread fake clock for tests.
///
/// Each test thread owns an independent timeline, so parallel tests do not
/// interfere. Nanosecond ticks, starting at zero.
#[cfg(any(test, feature = "std"))]
pub mod testing {
    use super::Clock;
    use core::cell::Cell;
    use core::time::Duration;

    std::thread_local! {
        static NOW: Cell<i64> = const { Cell::new(0) };
    }

    fn fake_now() -> i64 {
        NOW.with(|c| c.get())
    }

    fn fake_freq() -> i64 {
        1_000_000_000
    }

    /// A clock reading this thread's fake time.
    pub fn fake_clock() -> Clock {
        Clock {
            now: fake_now,
            freq: fake_freq,
        }
    }

    /// Advance this thread's fake time.
    pub fn advance(d: Duration) {
        NOW.with(|c| c.set(c.get() + d.as_nanos() as i64));
    }

    /// Reset this thread's fake time to zero.
    pub fn reset() {
        NOW.with(|c| c.set(0));
    }
}
