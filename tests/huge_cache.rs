//! End-to-end scenarios for the huge-page cache: adaptive limit growth and
//! shrinkage, demand-capped release, best-fit serving, and accounting
//! invariants over scripted operation sequences.

use core::cell::{Cell, RefCell};
use core::time::Duration;
use rtcache::backing::{HugeAllocator, MemoryModify};
use rtcache::clock::testing::{advance, fake_clock, reset};
use rtcache::huge_cache::{HugeCache, SkipSubreleaseIntervals};
use rtcache::{HugeLength, HugePage, HugeRange};

const CACHE_TIME: Duration = Duration::from_secs(1);

fn hl(n: usize) -> HugeLength {
    HugeLength::new(n)
}

/// Bump-allocates address space; remembers what came back and how.
#[derive(Default)]
struct Backing {
    next: usize,
    unbacked_returns: RefCell<Vec<HugeRange>>,
}

impl HugeAllocator for Backing {
    fn get(&mut self, n: HugeLength) -> HugeRange {
        let r = HugeRange::new(HugePage::new(self.next), n);
        self.next += n.raw();
        r
    }

    fn release(&mut self, r: HugeRange, backed: bool) {
        assert!(!backed, "the cache only returns unbacked ranges");
        self.unbacked_returns.borrow_mut().push(r);
    }
}

struct Unback {
    pages: Cell<usize>,
}

impl Unback {
    fn new() -> Self {
        Self { pages: Cell::new(0) }
    }
}

impl MemoryModify for Unback {
    fn modify(&self, r: HugeRange) -> bool {
        self.pages.set(self.pages.get() + r.len().raw());
        true
    }
}

fn new_cache<'a>(unback: &'a Unback) -> HugeCache<'a, Backing> {
    HugeCache::with_clock(Backing::default(), unback, None, CACHE_TIME, fake_clock())
}

#[test]
fn grow_on_miss_covers_recent_demand() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    // Hold 50 hugepages for most of a second, then miss on 20 more.
    let (r, from_released) = cache.get(hl(50));
    assert!(from_released);
    advance(Duration::from_millis(900));
    let (r2, _) = cache.get(hl(20));

    assert!(
        cache.limit() >= hl(70),
        "the working set plus the miss must fit: limit = {:?}",
        cache.limit()
    );
    cache.release(r, true);
    cache.release(r2, true);
}

#[test]
fn shrink_limit_needs_a_quiet_double_window() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    let (r, _) = cache.get(hl(64));
    let grown = cache.limit();
    assert!(grown >= hl(64));

    // Give back 34, keep 30 cached; go quiet past two windows.
    let (keep, back) = r.split(hl(30));
    cache.release_unbacked(back);
    cache.release(keep, true);
    for _ in 0..6 {
        advance(Duration::from_millis(500));
        let (x, _) = cache.get(hl(1));
        cache.release(x, true);
    }

    cache.release_cached_pages(hl(0));
    assert_eq!(cache.limit(), hl(30));
    assert!(cache.limit() < grown);
    // 30 cached <= new limit: the shrink itself evicted nothing.
    assert_eq!(cache.size(), hl(30));
}

#[test]
fn demand_cap_refuses_to_release_hot_memory() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    // Demand peaked at 120 inside the lookback; 100 pages now sit free.
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
    let released = cache.release_cached_pages_by_demand(hl(80), intervals, false);
    // headroom = (100 + 20) - 120 = 0.
    assert_eq!(released, hl(0));
    assert_eq!(cache.size(), hl(100));
    assert_eq!(unback.pages.get(), 0);
    cache.release(keep, true);
}

#[test]
fn best_fit_serving_splits_the_smallest_sufficient_run() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    // Build cache runs of {3, 5, 8} pages at separated addresses.
    let (r3, _) = cache.get(hl(3));
    let (gap1, _) = cache.get(hl(1));
    let (r5, _) = cache.get(hl(5));
    let (gap2, _) = cache.get(hl(1));
    let (r8, _) = cache.get(hl(8));
    cache.release(r3, true);
    cache.release(r5, true);
    cache.release(r8, true);
    assert_eq!(cache.size(), hl(16));

    // A 4-page request carves the 5-run, leaving its 1-page tail.
    let (got, from_released) = cache.get(hl(4));
    assert!(!from_released);
    assert_eq!(got.start(), r5.start());
    assert_eq!(got.len(), hl(4));
    assert_eq!(cache.size(), hl(12));

    // The tail is still served before any fresh allocation.
    let (tail, from_released) = cache.get(hl(1));
    assert!(!from_released);
    assert_eq!(tail.start(), r5.start().offset(hl(4)));

    cache.release(got, true);
    cache.release(tail, true);
    cache.release(gap1, true);
    cache.release(gap2, true);
}

#[test]
fn accounting_invariants_over_scripted_churn() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    let mut outstanding: Vec<HugeRange> = Vec::new();
    let mut got_total = 0usize;
    let mut released_total = 0usize;

    let mut state = 0x2545F4914F6CDD1Du64;
    let mut rng = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state as usize
    };

    for step in 0..400 {
        if rng() % 3 != 0 || outstanding.is_empty() {
            let n = 1 + rng() % 12;
            let (r, _) = cache.get(hl(n));
            assert!(r.valid());
            got_total += n;
            outstanding.push(r);
        } else {
            let r = outstanding.swap_remove(rng() % outstanding.len());
            released_total += r.len().raw();
            cache.release(r, false);
        }
        if step % 37 == 0 {
            advance(Duration::from_millis(40));
        }

        // usage = sum of gets - sum of releases, never negative.
        assert_eq!(cache.usage().raw(), got_total - released_total);
        // After any eager release, the cache respects its limit.
        assert!(cache.size() <= cache.limit());
        // Whatever was ever trimmed is accounted as fast-unbacked.
        assert_eq!(
            cache.counters().fast_unbacked.raw(),
            unback.pages.get(),
            "all eager trims flow through the unback hook"
        );
    }

    // Everything the unback hook saw reached the allocator as unbacked.
    let from_allocator: usize = cache
        .allocator()
        .unbacked_returns
        .borrow()
        .iter()
        .map(|r| r.len().raw())
        .sum();
    assert_eq!(from_allocator, unback.pages.get());

    let stats = cache.stats();
    assert_eq!(
        stats.system_bytes,
        (cache.usage() + cache.size()).in_bytes()
    );
    assert_eq!(stats.free_bytes, cache.size().in_bytes());
    assert_eq!(stats.unmapped_bytes, 0);
}

#[test]
fn counters_are_monotone() {
    reset();
    let unback = Unback::new();
    let mut cache = new_cache(&unback);

    let mut prev = cache.counters();
    for i in 1..=20 {
        let (r, _) = cache.get(hl(1 + i % 5));
        cache.release(r, false);
        let cur = cache.counters();
        assert!(cur.hits >= prev.hits);
        assert!(cur.misses >= prev.misses);
        assert!(cur.fills >= prev.fills);
        assert!(cur.overflows >= prev.overflows);
        assert!(cur.weighted_hits >= prev.weighted_hits);
        assert!(cur.weighted_misses >= prev.weighted_misses);
        prev = cur;
        advance(Duration::from_millis(100));
    }
    assert_eq!(prev.hits + prev.misses, 20);
}
