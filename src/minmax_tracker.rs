//! Sliding-window extrema tracking for huge-page counts.
//!
//! `MinMaxTracker` divides a window into `EPOCHS` fixed-length epochs and
//! records the min and max reported value per epoch in a ring. Queries fold
//! the extrema of the epochs covering the requested lookback; empty epochs
//! are neutral. Epoch boundaries are derived by flooring the clock, so a
//! report and a query in the same epoch always agree on its index.

use crate::clock::Clock;
use crate::huge_pages::HugeLength;
use crate::stats::{PbtxtRegion, Printer};
use core::time::Duration;

/// Ceiling division for signed integers (`i64::div_ceil` is unstable).
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

/// Per-epoch extrema. An empty epoch is `{min: MAX, max: ZERO}`, the neutral
/// element for both folds.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Extrema {
    min: HugeLength,
    max: HugeLength,
}

impl Extrema {
    const NIL: Extrema = Extrema {
        min: HugeLength::MAX,
        max: HugeLength::ZERO,
    };

    fn report(&mut self, n: HugeLength) {
        self.min = self.min.min(n);
        self.max = self.max.max(n);
    }

    fn empty(&self) -> bool {
        *self == Self::NIL
    }
}

/// Tracks the extremes of a `HugeLength` value over a recent window.
pub struct MinMaxTracker<const EPOCHS: usize> {
    clock: Clock,
    epoch_ticks: i64,
    /// Epoch index (`now / epoch_ticks`) of the most recent advance.
    last_epoch: i64,
    ring: [Extrema; EPOCHS],
}

impl<const EPOCHS: usize> MinMaxTracker<EPOCHS> {
    pub fn new(clock: Clock, window: Duration) -> Self {
        let epoch_ticks = (clock.ticks_for(window) / EPOCHS as i64).max(1);
        Self {
            clock,
            epoch_ticks,
            last_epoch: (clock.now)() / epoch_ticks,
            ring: [Extrema::NIL; EPOCHS],
        }
    }

    /// Length of one epoch in clock ticks.
    pub fn epoch_ticks(&self) -> i64 {
        self.epoch_ticks
    }

    /// Record the current value of the tracked quantity.
    pub fn report(&mut self, n: HugeLength) {
        self.advance();
        let idx = (self.last_epoch.rem_euclid(EPOCHS as i64)) as usize;
        self.ring[idx].report(n);
    }

    /// Maximum reported value over the last `t`. Granularity is one epoch,
    /// rounded up; `t` shorter than an epoch reads just the current epoch.
    pub fn max_over(&mut self, t: i64) -> HugeLength {
        self.fold(t).max
    }

    /// Minimum reported value over the last `t`. Returns
    /// [`HugeLength::MAX`] when every covered epoch is empty.
    pub fn min_over(&mut self, t: i64) -> HugeLength {
        self.fold(t).min
    }

    fn fold(&mut self, t: i64) -> Extrema {
        self.advance();
        let epochs = div_ceil_i64(t, self.epoch_ticks)
            .clamp(1, EPOCHS as i64) as usize;
        let mut acc = Extrema::NIL;
        for i in 0..epochs {
            let idx = (self.last_epoch - i as i64).rem_euclid(EPOCHS as i64) as usize;
            let e = self.ring[idx];
            acc.min = acc.min.min(e.min);
            acc.max = acc.max.max(e.max);
        }
        acc
    }

    /// Roll the ring forward to the current epoch, clearing skipped epochs.
    fn advance(&mut self) {
        let cur = (self.clock.now)() / self.epoch_ticks;
        if cur <= self.last_epoch {
            return;
        }
        let skipped = (cur - self.last_epoch).min(EPOCHS as i64);
        for i in 1..=skipped {
            let idx = (self.last_epoch + i).rem_euclid(EPOCHS as i64) as usize;
            self.ring[idx] = Extrema::NIL;
        }
        self.last_epoch = cur;
    }

    /// One-line summary: extrema over the full window.
    pub fn print(&mut self, out: &mut Printer<'_>) {
        let window = self.epoch_ticks * EPOCHS as i64;
        let all = self.fold(window);
        let min = if all.min == HugeLength::MAX {
            HugeLength::ZERO
        } else {
            all.min
        };
        out.print(format_args!(
            "min {} / max {} hugepages over {} epochs of {} ticks\n",
            min, all.max, EPOCHS, self.epoch_ticks
        ));
    }

    /// Per-epoch dump of the last window, oldest first. Empty epochs are
    /// omitted; `epochs_ago` locates each entry.
    pub fn print_in_pbtxt(&mut self, region: &mut PbtxtRegion<'_>) {
        self.advance();
        region.print_i64("epoch_ticks", self.epoch_ticks);
        for ago in (0..EPOCHS as i64).rev() {
            let idx = (self.last_epoch - ago).rem_euclid(EPOCHS as i64) as usize;
            let e = self.ring[idx];
            if e.empty() {
                continue;
            }
            let mut sub = region.create_sub_region("epoch");
            sub.print_i64("epochs_ago", ago);
            sub.print_i64("min_hugepages", e.min.raw() as i64);
            sub.print_i64("max_hugepages", e.max.raw() as i64);
        }
    }
}
