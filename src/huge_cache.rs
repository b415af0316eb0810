//! Cache of backed huge-page runs with adaptive sizing.
//!
//! Sits between users of contiguous huge-page runs and the underlying
//! allocator. Frees land here still backed by physical memory; a later get of
//! similar size is served without touching the kernel. Three control loops
//! keep the cache honest:
//! - grow: a miss raises the limit to cover the recent working set
//!   (peak-to-valley swing of demand plus the missed request), immediately;
//! - shrink: the limit drops only after the cache has stayed small for a
//!   window twice as long as the growth window, so the two estimates cannot
//!   oscillate;
//! - demand-based release: periodic release passes are capped so memory the
//!   workload just used (and will likely re-request) stays backed, while
//!   free memory held through the whole lookback (realized fragmentation) is
//!   always eligible.
//!
//! `HugeCache` is not internally locked: wrap it in a
//! [`SpinMutex`](crate::sync::SpinMutex) the way the rest of the allocator
//! does. The unback hook may issue a syscall while that lock is held; that is
//! the documented slow path.

use crate::backing::{HugeAllocator, MemoryModify, MemoryTag};
use crate::clock::Clock;
use crate::config::{CAP_DEMAND_INTERVAL_SECS, MIN_CACHE_LIMIT};
use crate::huge_address_map::HugeAddressMap;
use crate::huge_pages::{HugeLength, HugeRange};
use crate::minmax_tracker::MinMaxTracker;
use crate::stats::{BackingStats, PbtxtRegion, Printer};
use core::time::Duration;

/// Lookback intervals for demand-based release. Release is disabled unless
/// at least one of `short_interval` / `long_interval` is set;
/// `frag_interval` falls back to the 5-minute cap window.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipSubreleaseIntervals {
    pub short_interval: Option<Duration>,
    pub long_interval: Option<Duration>,
    pub frag_interval: Option<Duration>,
}

impl SkipSubreleaseIntervals {
    pub const fn unset() -> Self {
        Self {
            short_interval: None,
            long_interval: None,
            frag_interval: None,
        }
    }

    pub fn any_set(&self) -> bool {
        self.short_interval.is_some() || self.long_interval.is_some()
    }
}

/// Monotone counters, snapshot together under the cache lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HugeCacheCounters {
    pub hits: usize,
    pub misses: usize,
    pub fills: usize,
    pub overflows: usize,
    pub weighted_hits: u64,
    pub weighted_misses: u64,
    pub unback_failures: usize,
    /// Huge pages unbacked eagerly on release-path overflow.
    pub fast_unbacked: HugeLength,
    /// Huge pages unbacked by demand-based release passes.
    pub periodic_unbacked: HugeLength,
}

/// Epochs in the short (working-set) trackers.
const SHORT_EPOCHS: usize = 16;
/// Epochs in the long (demand-history) trackers.
const LONG_EPOCHS: usize = 600;
/// Window of the long trackers.
const LONG_WINDOW: Duration = Duration::from_secs(600);

pub struct HugeCache<'a, A: HugeAllocator> {
    allocator: A,
    cache: HugeAddressMap,
    /// Total length of runs in `cache`.
    size: HugeLength,
    /// Soft target for `size`; never below `MIN_CACHE_LIMIT`.
    limit: HugeLength,
    /// Sum of get lengths minus release lengths: backed pages our users hold.
    usage: HugeLength,

    hits: usize,
    misses: usize,
    fills: usize,
    overflows: usize,
    weighted_hits: u64,
    weighted_misses: u64,
    unback_failures: usize,
    total_fast_unbacked: HugeLength,
    total_periodic_unbacked: HugeLength,

    clock: Clock,
    cache_time_ticks: i64,
    born: i64,
    last_limit_change: i64,
    last_get: i64,

    /// Demand over the last `2 * cache_time`; drives growth.
    usage_tracker: MinMaxTracker<SHORT_EPOCHS>,
    /// Headroom below the recent demand peak; print surface only.
    off_peak_tracker: MinMaxTracker<SHORT_EPOCHS>,
    /// Cache size over the last `2 * cache_time`; drives shrinking.
    size_tracker: MinMaxTracker<SHORT_EPOCHS>,
    /// Demand over the last 10 minutes; caps demand-based release.
    demand_tracker: MinMaxTracker<LONG_EPOCHS>,
    /// Free-pool size over the last 10 minutes; realized fragmentation.
    free_tracker: MinMaxTracker<LONG_EPOCHS>,

    unback: &'a dyn MemoryModify,
    tag: Option<&'a dyn MemoryTag>,
}

impl<'a, A: HugeAllocator> HugeCache<'a, A> {
    /// Production constructor: platform monotonic clock.
    pub fn new(
        allocator: A,
        unback: &'a dyn MemoryModify,
        tag: Option<&'a dyn MemoryTag>,
        cache_time: Duration,
    ) -> Self {
        Self::with_clock(allocator, unback, tag, cache_time, Clock::system())
    }

    /// Constructor with an explicit clock, for tests.
    ///
    /// The short trackers span `2 * cache_time`: growth wants `cache_time` of
    /// history, and shrinking deliberately demands twice that much evidence
    /// before reversing an expansion.
    pub fn with_clock(
        allocator: A,
        unback: &'a dyn MemoryModify,
        tag: Option<&'a dyn MemoryTag>,
        cache_time: Duration,
        clock: Clock,
    ) -> Self {
        let now = (clock.now)();
        let short_window = cache_time * 2;
        let mut cache = Self {
            allocator,
            cache: HugeAddressMap::new(),
            size: HugeLength::ZERO,
            limit: HugeLength::new(MIN_CACHE_LIMIT),
            usage: HugeLength::ZERO,
            hits: 0,
            misses: 0,
            fills: 0,
            overflows: 0,
            weighted_hits: 0,
            weighted_misses: 0,
            unback_failures: 0,
            total_fast_unbacked: HugeLength::ZERO,
            total_periodic_unbacked: HugeLength::ZERO,
            clock,
            cache_time_ticks: clock.ticks_for(cache_time),
            born: now,
            last_limit_change: now,
            last_get: now,
            usage_tracker: MinMaxTracker::new(clock, short_window),
            off_peak_tracker: MinMaxTracker::new(clock, short_window),
            size_tracker: MinMaxTracker::new(clock, short_window),
            demand_tracker: MinMaxTracker::new(clock, LONG_WINDOW),
            free_tracker: MinMaxTracker::new(clock, LONG_WINDOW),
            unback,
            tag,
        };
        // The cache begins empty and unused; give the first window a true
        // valley to measure the working set against.
        cache.usage_tracker.report(HugeLength::ZERO);
        cache.demand_tracker.report(HugeLength::ZERO);
        cache.update_size();
        cache
    }

    /// Backed memory available in the cache.
    pub fn size(&self) -> HugeLength {
        self.size
    }

    /// Current cap on how much backed memory we will cache.
    pub fn limit(&self) -> HugeLength {
        self.limit
    }

    /// Sum total of unreleased requests.
    pub fn usage(&self) -> HugeLength {
        self.usage
    }

    pub fn counters(&self) -> HugeCacheCounters {
        HugeCacheCounters {
            hits: self.hits,
            misses: self.misses,
            fills: self.fills,
            overflows: self.overflows,
            weighted_hits: self.weighted_hits,
            weighted_misses: self.weighted_misses,
            unback_failures: self.unback_failures,
            fast_unbacked: self.total_fast_unbacked,
            periodic_unbacked: self.total_periodic_unbacked,
        }
    }

    pub fn stats(&self) -> BackingStats {
        BackingStats {
            system_bytes: (self.usage + self.size).in_bytes(),
            free_bytes: self.size.in_bytes(),
            unmapped_bytes: 0,
        }
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Allocate a run of exactly `n` contiguous huge pages.
    ///
    /// The boolean is false when the run comes backed out of the cache, true
    /// when it came from the underlying allocator (the caller backs it). An
    /// empty range reports out of memory.
    pub fn get(&mut self, n: HugeLength) -> (HugeRange, bool) {
        assert!(!n.is_zero());
        let now = (self.clock.now)();
        let weight = (n.raw() as u64) * self.recency_bucket(now);

        let node = self.cache.find(n);
        let (r, from_released) = if node.is_null() {
            self.misses += 1;
            self.weighted_misses += weight;
            self.maybe_grow_cache_limit(n, now);
            let r = self.allocator.get(n);
            if !r.valid() {
                #[cfg(feature = "debug")]
                std::println!("[huge_cache] backing allocator returned empty for {n:?}");
                self.last_get = now;
                return (HugeRange::nil(), false);
            }
            if let Some(tag) = self.tag {
                tag.tag(r, None);
            }
            (r, true)
        } else {
            self.hits += 1;
            self.weighted_hits += weight;
            let r = unsafe { self.cache.take(node, n) };
            self.size -= n;
            self.update_size();
            (r, false)
        };

        self.last_get = now;
        self.inc_usage(n);
        (r, from_released)
    }

    /// Return a backed run to the cache.
    ///
    /// With `demand_based_unback` false, a cache grown past its limit is
    /// immediately trimmed back (the trimmed pages are unbacked). With it
    /// true, the overflow sits until the next
    /// [`release_cached_pages_by_demand`](Self::release_cached_pages_by_demand)
    /// pass drains it.
    pub fn release(&mut self, r: HugeRange, demand_based_unback: bool) {
        assert!(r.valid());
        self.dec_usage(r.len());
        self.cache.insert(r);
        self.size += r.len();
        self.fills += 1;
        if !demand_based_unback && self.size > self.limit {
            self.overflows += 1;
            let evicted = self.shrink_cache(self.limit);
            self.total_fast_unbacked += evicted;
        }
        self.update_size();
    }

    /// Return a run that is *not* backed; it goes straight to the underlying
    /// allocator.
    pub fn release_unbacked(&mut self, r: HugeRange) {
        assert!(r.valid());
        self.dec_usage(r.len());
        self.allocator.release(r, false);
    }

    /// Unback up to `n` huge pages of cache contents; returns the number
    /// actually released (including any extra eviction from a limit shrink).
    pub fn release_cached_pages(&mut self, n: HugeLength) -> HugeLength {
        let mut released = self.shrink_cache(self.size - n);
        released += self.maybe_shrink_cache_limit();
        released
    }

    /// Unback up to `n` huge pages if recent demand allows.
    ///
    /// Disabled entirely when `hit_limit` is set or no lookback interval is
    /// given. The request is first raised to a fixed fraction of the cache
    /// (releasing dribs and drabs does nothing for fragmentation), then
    /// capped by [`Self::get_desired_releaseable_pages`].
    pub fn release_cached_pages_by_demand(
        &mut self,
        n: HugeLength,
        intervals: SkipSubreleaseIntervals,
        hit_limit: bool,
    ) -> HugeLength {
        if hit_limit || !intervals.any_set() {
            return HugeLength::ZERO;
        }
        let fraction = HugeLength::new(
            self.size.raw() * crate::config::FRACTION_TO_RELEASE_PERCENT / 100,
        );
        let desired = n.max(fraction).min(self.size);
        let target = self.get_desired_releaseable_pages(desired, intervals);
        let mut released = self.shrink_cache(self.size - target);
        released += self.maybe_shrink_cache_limit();
        self.total_periodic_unbacked += released;
        released
    }

    /// Human-readable dump of counters and controller state.
    pub fn print(&mut self, out: &mut Printer<'_>) {
        out.print(format_args!(
            "HugeCache: {} / {} hugepages cached / cache limit, {} in use\n",
            self.size, self.limit, self.usage
        ));
        out.print(format_args!(
            "HugeCache: {} hits, {} misses, {} fills, {} overflows\n",
            self.hits, self.misses, self.fills, self.overflows
        ));
        out.print(format_args!(
            "HugeCache: {} / {} weighted hits / misses\n",
            self.weighted_hits, self.weighted_misses
        ));
        out.print(format_args!(
            "HugeCache: {} MiB fast unbacked, {} MiB periodic, {} unback failures\n",
            self.total_fast_unbacked.in_bytes() >> 20,
            self.total_periodic_unbacked.in_bytes() >> 20,
            self.unback_failures
        ));
        out.print(format_args!("HugeCache: usage "));
        self.usage_tracker.print(out);
        out.print(format_args!("HugeCache: off-peak "));
        self.off_peak_tracker.print(out);
        out.print(format_args!("HugeCache: size "));
        self.size_tracker.print(out);
    }

    /// Structured dump: controller state plus per-epoch demand and free-pool
    /// extrema for the last 10 minutes.
    pub fn print_in_pbtxt(&mut self, region: &mut PbtxtRegion<'_>) {
        region.print_i64("limit_hugepages", self.limit.raw() as i64);
        region.print_i64("cached_hugepages", self.size.raw() as i64);
        region.print_i64("usage_hugepages", self.usage.raw() as i64);
        region.print_i64("hits", self.hits as i64);
        region.print_i64("misses", self.misses as i64);
        region.print_i64("fills", self.fills as i64);
        region.print_i64("overflows", self.overflows as i64);
        region.print_i64("weighted_hits", self.weighted_hits as i64);
        region.print_i64("weighted_misses", self.weighted_misses as i64);
        region.print_i64("fast_unbacked_hugepages", self.total_fast_unbacked.raw() as i64);
        region.print_i64(
            "periodic_unbacked_hugepages",
            self.total_periodic_unbacked.raw() as i64,
        );
        region.print_i64("unback_failures", self.unback_failures as i64);
        {
            let mut sub = region.create_sub_region("demand_history");
            self.demand_tracker.print_in_pbtxt(&mut sub);
        }
        {
            let mut sub = region.create_sub_region("free_history");
            self.free_tracker.print_in_pbtxt(&mut sub);
        }
    }

    /// A miss of `missed` pages: raise the limit if the last `cache_time` of
    /// demand (peak minus valley, plus this request) would not have fit.
    /// Growth is immediate; no smoothing.
    fn maybe_grow_cache_limit(&mut self, missed: HugeLength, now: i64) {
        let peak = self.usage_tracker.max_over(self.cache_time_ticks);
        let valley = self.usage_tracker.min_over(self.cache_time_ticks).min(peak);
        self.off_peak_tracker.report(peak - self.usage);
        self.update_size();

        let needed = (peak - valley) + missed;
        if needed > self.limit {
            self.limit = needed;
            self.last_limit_change = now;
        }
    }

    /// The hysteresis arm: lower the limit only when the cache has stayed
    /// below it for the full `2 * cache_time` window and the limit has been
    /// stable for at least `cache_time`. Returns pages evicted.
    fn maybe_shrink_cache_limit(&mut self) -> HugeLength {
        let now = (self.clock.now)();
        let maxsz = self.size_tracker.max_over(2 * self.cache_time_ticks);
        if maxsz < self.limit && now - self.last_limit_change >= self.cache_time_ticks {
            let new_limit = HugeLength::new(MIN_CACHE_LIMIT).max(maxsz);
            let evicted = if self.size > new_limit {
                self.shrink_cache(new_limit)
            } else {
                HugeLength::ZERO
            };
            self.limit = new_limit;
            self.last_limit_change = now;
            return evicted;
        }
        HugeLength::ZERO
    }

    /// Evict until `size <= target`, largest runs first (ties: highest
    /// address) so the surviving cache keeps its contiguity. The final
    /// victim is split if it overshoots: its low portion stays cached.
    fn shrink_cache(&mut self, target: HugeLength) -> HugeLength {
        let mut evicted = HugeLength::ZERO;
        while self.size > target {
            let node = self.cache.find_largest();
            if node.is_null() {
                break;
            }
            let r = unsafe { self.cache.remove(node) };
            let excess = self.size - target;
            let victim = if r.len() > excess {
                let keep = HugeLength::new(r.len().raw() - excess.raw());
                let (low, high) = r.split(keep);
                self.cache.insert(low);
                high
            } else {
                r
            };
            self.size -= victim.len();
            evicted += victim.len();
            self.unback_and_release(victim);
        }
        self.update_size();
        evicted
    }

    /// How much of `desired` we can release without inviting misses: recent
    /// demand must still fit in what stays backed. Free memory we have held
    /// for the entire fragmentation lookback is always releasable.
    fn get_desired_releaseable_pages(
        &mut self,
        desired: HugeLength,
        intervals: SkipSubreleaseIntervals,
    ) -> HugeLength {
        let Some(peak_interval) = intervals.short_interval.or(intervals.long_interval) else {
            return desired;
        };
        let recent_peak = self
            .demand_tracker
            .max_over(self.clock.ticks_for(peak_interval));
        let headroom = (self.size + self.usage) - recent_peak;
        let mut target = desired.min(headroom);

        let frag_interval = intervals
            .frag_interval
            .unwrap_or(Duration::from_secs(CAP_DEMAND_INTERVAL_SECS));
        let frag_ticks = self.clock.ticks_for(frag_interval);
        // "Held for the whole window" requires the cache to have existed
        // that long.
        if (self.clock.now)() - self.born >= frag_ticks {
            let frag = self.free_tracker.min_over(frag_ticks);
            if frag != HugeLength::MAX && !frag.is_zero() {
                target = target.max(frag.min(desired));
            }
        }
        target
    }

    fn unback_and_release(&mut self, r: HugeRange) {
        if !self.unback.modify(r) {
            // Pessimistic but safe: the range still leaves the cache and is
            // handed back as unbacked.
            self.unback_failures += 1;
            #[cfg(feature = "debug")]
            std::println!("[huge_cache] unback failed for {r:?}");
        }
        self.allocator.release(r, false);
    }

    fn inc_usage(&mut self, n: HugeLength) {
        self.usage += n;
        self.usage_tracker.report(self.usage);
        self.demand_tracker.report(self.usage);
    }

    fn dec_usage(&mut self, n: HugeLength) {
        assert!(self.usage >= n, "releasing more than was allocated");
        self.usage -= n;
        self.usage_tracker.report(self.usage);
        self.demand_tracker.report(self.usage);
    }

    fn update_size(&mut self) {
        self.size_tracker.report(self.size);
        self.free_tracker.report(self.size);
    }

    /// Weight bucket for the weighted hit/miss counters: requests arriving
    /// after a long quiet period count more, capped at the tracker window.
    fn recency_bucket(&self, now: i64) -> u64 {
        let epoch = self.usage_tracker.epoch_ticks();
        let elapsed = (now - self.last_get).max(0);
        1 + ((elapsed / epoch).min(SHORT_EPOCHS as i64 - 1)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::{advance, fake_clock, reset};
    use crate::huge_pages::HugePage;
    use alloc::vec::Vec;
    use core::cell::{Cell, RefCell};

    const CACHE_TIME: Duration = Duration::from_secs(1);

    fn hl(n: usize) -> HugeLength {
        HugeLength::new(n)
    }

    /// Hands out runs from a bump address space and records releases.
    #[derive(Default)]
    struct TestBacking {
        next: usize,
        released_unbacked: Vec<HugeRange>,
        oom: bool,
    }

    impl HugeAllocator for TestBacking {
        fn get(&mut self, n: HugeLength) -> HugeRange {
            if self.oom {
                return HugeRange::nil();
            }
            let r = HugeRange::new(HugePage::new(self.next), n);
            self.next += n.raw();
            r
        }

        fn release(&mut self, r: HugeRange, backed: bool) {
            assert!(!backed, "the cache only hands back unbacked ranges");
            self.released_unbacked.push(r);
        }
    }

    struct RecordingUnback {
        unbacked: RefCell<Vec<HugeRange>>,
        fail: Cell<bool>,
    }

    impl RecordingUnback {
        fn new() -> Self {
            Self {
                unbacked: RefCell::new(Vec::new()),
                fail: Cell::new(false),
            }
        }

        fn total(&self) -> usize {
            self.unbacked.borrow().iter().map(|r| r.len().raw()).sum()
        }
    }

    impl MemoryModify for RecordingUnback {
        fn modify(&self, r: HugeRange) -> bool {
            if self.fail.get() {
                return false;
            }
            self.unbacked.borrow_mut().push(r);
            true
        }
    }

    fn new_cache<'a>(unback: &'a RecordingUnback) -> HugeCache<'a, TestBacking> {
        HugeCache::with_clock(
            TestBacking::default(),
            unback,
            None,
            CACHE_TIME,
            fake_clock(),
        )
    }

    #[test]
    fn test_miss_then_hit_round_trip() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (r, from_released) = cache.get(hl(4));
        assert!(r.valid());
        assert!(from_released);
        assert_eq!(cache.usage(), hl(4));
        assert_eq!(cache.counters().misses, 1);

        cache.release(r, false);
        assert_eq!(cache.usage(), hl(0));
        assert_eq!(cache.size(), hl(4));
        assert_eq!(cache.counters().fills, 1);

        let (r2, from_released2) = cache.get(hl(4));
        assert!(!from_released2);
        assert_eq!(r2, r);
        assert_eq!(cache.counters().hits, 1);
        assert_eq!(cache.size(), hl(0));
    }

    #[test]
    fn test_size_tracks_cache_contents() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (a, _) = cache.get(hl(2));
        let (b, _) = cache.get(hl(3));
        cache.release(a, false);
        cache.release(b, false);
        assert_eq!(cache.size(), hl(5));
        assert_eq!(cache.stats().free_bytes, hl(5).in_bytes());
        assert_eq!(cache.stats().system_bytes, hl(5).in_bytes());
    }

    /// Get 14 pages (which grows the limit to 14), then let a quiet window
    /// shrink the limit back to the floor while the pages are still out.
    fn cache_with_outstanding_14<'a>(
        unback: &'a RecordingUnback,
    ) -> (HugeCache<'a, TestBacking>, HugeRange) {
        let mut cache = new_cache(unback);
        let (r, _) = cache.get(hl(14));
        advance(Duration::from_secs(3));
        cache.release_cached_pages(hl(0));
        assert_eq!(cache.limit(), hl(MIN_CACHE_LIMIT));
        (cache, r)
    }

    #[test]
    fn test_release_overflow_unbacks_excess() {
        reset();
        let unback = RecordingUnback::new();
        let (mut cache, r) = cache_with_outstanding_14(&unback);

        // Releasing 14 pages against a limit of 10 trims 4 eagerly.
        cache.release(r, false);

        assert_eq!(cache.size(), cache.limit());
        let c = cache.counters();
        assert_eq!(c.overflows, 1);
        assert_eq!(c.fast_unbacked, hl(4));
        assert_eq!(unback.total(), 4);
        // The unbacked pages went back to the allocator as unbacked.
        let back: usize = cache
            .allocator()
            .released_unbacked
            .iter()
            .map(|r| r.len().raw())
            .sum();
        assert_eq!(back, 4);
    }

    #[test]
    fn test_demand_based_release_defers_overflow() {
        reset();
        let unback = RecordingUnback::new();
        let (mut cache, r) = cache_with_outstanding_14(&unback);

        cache.release(r, true);
        // Nothing trimmed eagerly, even though size exceeds the limit.
        assert_eq!(cache.size(), hl(14));
        assert_eq!(cache.counters().overflows, 0);
        assert_eq!(unback.total(), 0);
    }

    #[test]
    fn test_release_unbacked_skips_cache() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (r, _) = cache.get(hl(3));
        cache.release_unbacked(r);
        assert_eq!(cache.usage(), hl(0));
        assert_eq!(cache.size(), hl(0));
        assert_eq!(cache.allocator().released_unbacked, [r]);
    }

    #[test]
    fn test_grow_limit_covers_working_set() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        // Demand has been 50 for the last second.
        let (r, _) = cache.get(hl(50));
        advance(Duration::from_millis(900));
        // Fresh miss of 20 on top of the peak-to-valley swing of 50.
        let (r2, _) = cache.get(hl(20));
        assert!(cache.limit() >= hl(70), "limit = {:?}", cache.limit());
        cache.release(r, true);
        cache.release(r2, true);
    }

    #[test]
    fn test_shrink_limit_after_quiet_window() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        // Grow the limit, then go quiet with a small cache.
        let (r, _) = cache.get(hl(50));
        advance(Duration::from_millis(900));
        let (r2, _) = cache.get(hl(20));
        let grown = cache.limit();
        assert!(grown >= hl(70));
        cache.release_unbacked(r);
        cache.release(r2, true);
        assert_eq!(cache.size(), hl(20));

        // Let the old peak age out; size stays 20 throughout.
        for _ in 0..8 {
            advance(Duration::from_millis(500));
            let (x, _) = cache.get(hl(1));
            cache.release(x, true);
        }
        let released = cache.release_cached_pages(hl(0));
        assert_eq!(cache.limit(), hl(20));
        assert!(cache.limit() < grown);
        // Cache held 20 <= limit, so the limit change evicted nothing.
        assert_eq!(released, hl(0));
    }

    #[test]
    fn test_limit_never_drops_below_floor() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (r, _) = cache.get(hl(2));
        cache.release(r, false);
        advance(Duration::from_secs(5));
        cache.release_cached_pages(hl(0));
        assert_eq!(cache.limit(), hl(MIN_CACHE_LIMIT));
    }

    #[test]
    fn test_release_cached_pages_evicts_largest_first() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        // Build cache runs {2, 5} at distinct addresses.
        let (a, _) = cache.get(hl(2));
        let (gap, _) = cache.get(hl(1));
        let (b, _) = cache.get(hl(5));
        cache.release(a, true);
        cache.release(b, true);

        let released = cache.release_cached_pages(hl(5));
        assert!(released >= hl(5));
        // The 5-run went first.
        assert_eq!(unback.unbacked.borrow()[0], b);
        cache.release(gap, true);
    }

    #[test]
    fn test_shrink_splits_final_victim() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (r, _) = cache.get(hl(8));
        cache.release(r, true);
        let released = cache.release_cached_pages(hl(3));
        assert_eq!(released, hl(3));
        assert_eq!(cache.size(), hl(5));
        // The high portion of the run was the victim.
        let victim = unback.unbacked.borrow()[0];
        assert_eq!(victim.len(), hl(3));
        assert_eq!(victim.start(), r.start().offset(hl(5)));
    }

    #[test]
    fn test_unback_failure_still_releases() {
        reset();
        let unback = RecordingUnback::new();
        let (mut cache, r) = cache_with_outstanding_14(&unback);
        unback.fail.set(true);

        cache.release(r, false);
        let c = cache.counters();
        assert_eq!(c.unback_failures, 1);
        assert_eq!(c.fast_unbacked, hl(4));
        // The range still left the cache and reached the allocator unbacked.
        assert_eq!(cache.size(), hl(10));
        assert!(!cache.allocator().released_unbacked.is_empty());
    }

    #[test]
    fn test_oom_returns_empty_range() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);
        cache.allocator_mut().oom = true;

        let (r, from_released) = cache.get(hl(4));
        assert!(!r.valid());
        assert!(!from_released);
        assert_eq!(cache.usage(), hl(0));
    }

    #[test]
    fn test_demand_release_disabled_without_intervals() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);
        let (r, _) = cache.get(hl(8));
        cache.release(r, true);

        assert_eq!(
            cache.release_cached_pages_by_demand(
                hl(8),
                SkipSubreleaseIntervals::unset(),
                false
            ),
            hl(0)
        );
        let intervals = SkipSubreleaseIntervals {
            short_interval: Some(Duration::from_secs(10)),
            ..SkipSubreleaseIntervals::unset()
        };
        assert_eq!(
            cache.release_cached_pages_by_demand(hl(8), intervals, true),
            hl(0)
        );
        assert_eq!(cache.size(), hl(8));
    }

    #[test]
    fn test_demand_release_capped_by_recent_peak() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        // Demand peaked at 120; 100 of it came back.
        let (big, _) = cache.get(hl(120));
        advance(Duration::from_secs(5));
        let (keep, trimmed) = big.split(hl(20));
        cache.release(trimmed, true);
        assert_eq!(cache.size(), hl(100));
        assert_eq!(cache.usage(), hl(20));

        let intervals = SkipSubreleaseIntervals {
            short_interval: Some(Duration::from_secs(10)),
            ..SkipSubreleaseIntervals::unset()
        };
        // headroom = (100 + 20) - 120 = 0: nothing may go.
        let released = cache.release_cached_pages_by_demand(hl(80), intervals, false);
        assert_eq!(released, hl(0));
        assert_eq!(cache.size(), hl(100));
        assert_eq!(cache.counters().periodic_unbacked, hl(0));
        cache.release(keep, true);
    }

    #[test]
    fn test_demand_release_allows_headroom() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        // Build up 80 cached pages, with recent demand only touching 40.
        let (a, _) = cache.get(hl(40));
        let (b, _) = cache.get(hl(40));
        cache.release(a, true);
        cache.release(b, true);
        assert_eq!(cache.size(), hl(80));
        advance(Duration::from_secs(25));
        let (c, _) = cache.get(hl(40));
        cache.release(c, true);
        advance(Duration::from_secs(5));

        let intervals = SkipSubreleaseIntervals {
            short_interval: Some(Duration::from_secs(10)),
            ..SkipSubreleaseIntervals::unset()
        };
        // Recent (10s) peak is 40; backed = 80; headroom = 40.
        let released = cache.release_cached_pages_by_demand(hl(60), intervals, false);
        assert_eq!(released, hl(40));
        assert_eq!(cache.size(), hl(40));
        assert_eq!(cache.counters().periodic_unbacked, hl(40));
    }

    #[test]
    fn test_weighted_counters_scale_with_length() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);

        let (r, _) = cache.get(hl(6));
        let c = cache.counters();
        assert!(c.weighted_misses >= 6);
        cache.release(r, true);
        let (_r2, _) = cache.get(hl(6));
        let c2 = cache.counters();
        assert!(c2.weighted_hits >= 6);
        // Monotone.
        assert!(c2.weighted_misses >= c.weighted_misses);
    }

    #[test]
    fn test_print_surfaces() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);
        let (r, _) = cache.get(hl(4));
        cache.release(r, false);

        let mut buf = alloc::string::String::new();
        {
            let mut p = Printer::new(&mut buf);
            cache.print(&mut p);
        }
        assert!(buf.contains("HugeCache:"));
        assert!(buf.contains("hits"));

        buf.clear();
        {
            let mut region = PbtxtRegion::new(&mut buf);
            cache.print_in_pbtxt(&mut region);
        }
        assert!(buf.contains("limit_hugepages: 10"));
        assert!(buf.contains("demand_history {"));
        assert!(buf.contains("free_history {"));
    }

    #[test]
    #[should_panic(expected = "releasing more than was allocated")]
    fn test_over_release_asserts() {
        reset();
        let unback = RecordingUnback::new();
        let mut cache = new_cache(&unback);
        let (r, _) = cache.get(hl(2));
        cache.release(r, false);
        // Same range again: usage would go negative.
        cache.release(r, false);
    }
}
