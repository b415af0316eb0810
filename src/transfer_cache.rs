//! Per-size-class transfer caches between CPU caches and central free lists.
//!
//! Each size class gets a fixed ring of object pointers guarded by a compact
//! spinlock. Batches of `num_objects_to_move` pointers are inserted and
//! removed in O(batch); overflow and underflow spill to the class's central
//! free list. The unsharded [`TransferCacheManager`] owns one ring per class
//! and arbitrates capacity between them: a full cache may steal one batch of
//! slots from a round-robin victim.
//!
//! Slot storage is sized for the class's maximum capacity up front (rounded
//! to a power of two), so capacity changes are pure bookkeeping and never
//! move pointers.

use crate::config::MAX_OBJECTS_TO_MOVE;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stats::TransferCacheStats;
use crate::sync::{Once, SpinMutex, SpinMutexGuard};
use crate::{metadata, stat_add};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Central free list of one size class, as seen by a transfer cache.
///
/// Implementations own their synchronization with the span/page layers;
/// the transfer cache serializes its own calls per cache instance.
pub trait ObjectFreeList {
    fn init(&mut self, size_class: usize);
    fn insert_range(&mut self, batch: &[*mut u8]);
    /// Fill `out` with up to `out.len()` objects; returns the count taken.
    fn remove_range(&mut self, out: &mut [*mut u8]) -> usize;
    fn size_class(&self) -> usize;
    fn length(&self) -> usize;
}

/// Ring storage. `head` is the insert cursor, `tail` the remove cursor; both
/// free-run and wrap through a power-of-two slot array, so `head - tail` is
/// the live count and resizes only touch `capacity`.
struct RingState {
    slots: *mut *mut u8,
    mask: u32,
    head: u32,
    tail: u32,
    capacity: u32,
    max_capacity: u32,
}

// SAFETY: RingState is only reached through the enclosing SpinMutex; the
// slot array lives in the process-lifetime metadata arena.
unsafe impl Send for RingState {}

impl RingState {
    #[inline]
    fn len(&self) -> usize {
        self.head.wrapping_sub(self.tail) as usize
    }

    #[inline]
    fn free_slots(&self) -> usize {
        (self.capacity as usize).saturating_sub(self.len())
    }

    /// # Safety
    /// Caller must have checked `free_slots() >= batch.len()`.
    unsafe fn push(&mut self, batch: &[*mut u8]) {
        for &p in batch {
            unsafe { *self.slots.add((self.head & self.mask) as usize) = p };
            self.head = self.head.wrapping_add(1);
        }
    }

    /// # Safety
    /// Caller must have checked `len() >= out.len()`.
    unsafe fn pop(&mut self, out: &mut [*mut u8]) {
        for o in out.iter_mut() {
            *o = unsafe { *self.slots.add((self.tail & self.mask) as usize) };
            self.tail = self.tail.wrapping_add(1);
        }
    }
}

/// One size class's FIFO pointer cache, backed by a central free list.
pub struct RingBufferTransferCache<F: ObjectFreeList> {
    size_class: usize,
    batch: usize,
    max_capacity: usize,
    ring: SpinMutex<RingState>,
    freelist: SpinMutex<F>,
    /// Set on every hit; cleared by `try_plunder`. Two quiet plunder
    /// intervals in a row drain the cache.
    active: AtomicBool,
    insert_hits: AtomicU64,
    insert_misses: AtomicU64,
    remove_hits: AtomicU64,
    remove_misses: AtomicU64,
}

impl<F: ObjectFreeList> RingBufferTransferCache<F> {
    /// Build a cache with `capacity` live slots, growable to `max_capacity`.
    /// A `max_capacity` of zero makes the cache a pass-through to the
    /// freelist (used for classes the sharded path leaves inactive).
    pub fn new(size_class: usize, freelist: F, capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.min(max_capacity);
        let batch = size_class::num_objects_to_move(size_class).max(1);
        debug_assert!(batch <= MAX_OBJECTS_TO_MOVE);

        let slots_len = if max_capacity == 0 {
            0
        } else {
            max_capacity.next_power_of_two()
        };
        let slots = if slots_len == 0 {
            ptr::null_mut()
        } else {
            metadata::alloc(slots_len * core::mem::size_of::<*mut u8>(), 64) as *mut *mut u8
        };
        assert!(
            slots_len == 0 || !slots.is_null(),
            "out of metadata for transfer cache slots"
        );

        Self {
            size_class,
            batch,
            max_capacity,
            ring: SpinMutex::new(RingState {
                slots,
                mask: slots_len.wrapping_sub(1) as u32,
                head: 0,
                tail: 0,
                capacity: capacity as u32,
                max_capacity: max_capacity as u32,
            }),
            freelist: SpinMutex::new(freelist),
            active: AtomicBool::new(false),
            insert_hits: AtomicU64::new(0),
            insert_misses: AtomicU64::new(0),
            remove_hits: AtomicU64::new(0),
            remove_misses: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn size_class(&self) -> usize {
        self.size_class
    }

    /// Batch size for this class (`num_objects_to_move`).
    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn tc_length(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.ring.lock().capacity as usize
    }

    pub fn freelist(&self) -> SpinMutexGuard<'_, F> {
        self.freelist.lock()
    }

    pub fn hit_rate_stats(&self) -> TransferCacheStats {
        TransferCacheStats {
            insert_hits: self.insert_hits.load(Ordering::Relaxed),
            insert_misses: self.insert_misses.load(Ordering::Relaxed),
            remove_hits: self.remove_hits.load(Ordering::Relaxed),
            remove_misses: self.remove_misses.load(Ordering::Relaxed),
        }
    }

    /// Insert a batch, overflowing to the freelist when the ring is full.
    /// No capacity growth: managers that can steal slots wrap this with
    /// [`TransferCacheManager::insert_range`].
    pub fn insert_range(&self, batch: &[*mut u8]) {
        if batch.is_empty() {
            return;
        }
        if self.try_insert(batch) {
            return;
        }
        self.insert_miss(batch);
    }

    /// Append the batch iff the ring has room. Counts a hit on success.
    pub fn try_insert(&self, batch: &[*mut u8]) -> bool {
        debug_assert!(!batch.is_empty() && batch.len() <= self.batch);
        {
            let mut ring = self.ring.lock();
            if ring.free_slots() < batch.len() {
                return false;
            }
            unsafe { ring.push(batch) };
        }
        self.insert_hits.fetch_add(1, Ordering::Relaxed);
        self.touch();
        true
    }

    /// Overflow path: count the miss and hand the batch to the freelist.
    /// The ring lock is not held across the freelist call.
    pub fn insert_miss(&self, batch: &[*mut u8]) {
        self.insert_misses.fetch_add(1, Ordering::Relaxed);
        self.freelist.lock().insert_range(batch);
    }

    /// Take up to `out.len()` pointers in FIFO order. On underflow the cache
    /// refills one full batch from the freelist, then serves oldest-first.
    pub fn remove_range(&self, out: &mut [*mut u8]) -> usize {
        let n = out.len();
        if n == 0 {
            return 0;
        }
        debug_assert!(n <= self.batch);
        {
            let mut ring = self.ring.lock();
            if ring.len() >= n {
                unsafe { ring.pop(out) };
                drop(ring);
                self.remove_hits.fetch_add(1, Ordering::Relaxed);
                self.touch();
                return n;
            }
        }
        self.remove_misses.fetch_add(1, Ordering::Relaxed);

        // Inactive cache: straight pass-through.
        if self.max_capacity == 0 {
            return self.freelist.lock().remove_range(out);
        }

        let mut buf = [ptr::null_mut::<u8>(); MAX_OBJECTS_TO_MOVE];
        let got = self.freelist.lock().remove_range(&mut buf[..self.batch]);

        let serve;
        let stash;
        {
            let mut ring = self.ring.lock();
            stash = got.min(ring.free_slots());
            unsafe { ring.push(&buf[..stash]) };
            serve = ring.len().min(n);
            unsafe { ring.pop(&mut out[..serve]) };
        }
        if stash < got {
            // Concurrent inserts took the room; hand the leftovers back.
            self.freelist.lock().insert_range(&buf[stash..got]);
        }
        if serve > 0 {
            self.touch();
        }
        serve
    }

    /// Give back one batch of capacity if the cache has that much slack.
    pub fn shrink_cache(&self) -> bool {
        let b = self.batch as u32;
        let mut ring = self.ring.lock();
        if (ring.len() as u32) < ring.capacity.saturating_sub(b) {
            ring.capacity -= b;
            true
        } else {
            false
        }
    }

    /// Take one batch of capacity, up to the class maximum.
    pub fn grow_cache(&self) -> bool {
        let b = self.batch as u32;
        let mut ring = self.ring.lock();
        if ring.capacity + b <= ring.max_capacity {
            ring.capacity += b;
            true
        } else {
            false
        }
    }

    /// Drain the cache to the freelist iff it has been idle since the last
    /// call; a touched cache just has its activity flag reset.
    pub fn try_plunder(&self) {
        if self.active.swap(false, Ordering::Relaxed) {
            return;
        }
        let mut buf = [ptr::null_mut::<u8>(); MAX_OBJECTS_TO_MOVE];
        loop {
            let k;
            {
                let mut ring = self.ring.lock();
                k = ring.len().min(self.batch);
                if k == 0 {
                    return;
                }
                unsafe { ring.pop(&mut buf[..k]) };
            }
            stat_add!(plundered_objects, k);
            self.freelist.lock().insert_range(&buf[..k]);
        }
    }

    #[inline]
    fn touch(&self) {
        self.active.store(true, Ordering::Relaxed);
    }
}

// SAFETY: all mutation is behind the ring/freelist SpinMutexes and atomics;
// the cached object pointers are owned by no one while they sit here.
unsafe impl<F: ObjectFreeList + Send> Send for RingBufferTransferCache<F> {}
unsafe impl<F: ObjectFreeList + Send> Sync for RingBufferTransferCache<F> {}

struct CacheSlot<F: ObjectFreeList>(UnsafeCell<MaybeUninit<RingBufferTransferCache<F>>>);

/// Flat per-class array of ring caches with a capacity-stealing policy.
///
/// The slots are built in place exactly once by [`init`](Self::init) and
/// never destroyed (process-lifetime, like all cache metadata).
pub struct TransferCacheManager<F: ObjectFreeList> {
    slots: [CacheSlot<F>; NUM_SIZE_CLASSES],
    init_once: Once,
    initialized: AtomicBool,
    next_to_evict: AtomicUsize,
}

impl<F: ObjectFreeList> Default for TransferCacheManager<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ObjectFreeList> TransferCacheManager<F> {
    pub const fn new() -> Self {
        Self {
            slots: [const { CacheSlot(UnsafeCell::new(MaybeUninit::uninit())) };
                NUM_SIZE_CLASSES],
            init_once: Once::new(),
            initialized: AtomicBool::new(false),
            next_to_evict: AtomicUsize::new(1),
        }
    }

    /// Construct every per-class cache. `make_freelist` builds the backing
    /// freelist for one class; it runs exactly once per class.
    pub fn init(&self, make_freelist: fn(usize) -> F) {
        self.init_once.call_once(|| {
            for cl in 0..NUM_SIZE_CLASSES {
                let mut fl = make_freelist(cl);
                fl.init(cl);
                let cache = RingBufferTransferCache::new(
                    cl,
                    fl,
                    size_class::initial_capacity(cl),
                    size_class::max_capacity(cl),
                );
                unsafe { (*self.slots[cl].0.get()).write(cache) };
            }
            self.initialized.store(true, Ordering::Release);
        });
    }

    /// The cache for one size class.
    pub fn cache(&self, size_class: usize) -> &RingBufferTransferCache<F> {
        assert!(
            self.initialized.load(Ordering::Acquire),
            "transfer cache manager used before init"
        );
        unsafe { (*self.slots[size_class].0.get()).assume_init_ref() }
    }

    /// Insert a batch; a full cache first tries to steal capacity from a
    /// victim class, then overflows to the freelist.
    pub fn insert_range(&self, size_class: usize, batch: &[*mut u8]) {
        if batch.is_empty() {
            return;
        }
        let cache = self.cache(size_class);
        if cache.try_insert(batch) {
            return;
        }
        if self.make_cache_space(size_class) && cache.try_insert(batch) {
            return;
        }
        cache.insert_miss(batch);
    }

    pub fn remove_range(&self, size_class: usize, out: &mut [*mut u8]) -> usize {
        self.cache(size_class).remove_range(out)
    }

    /// Drain every cache untouched since the previous pass.
    pub fn plunder(&self) {
        for cl in 1..NUM_SIZE_CLASSES {
            self.cache(cl).try_plunder();
        }
    }

    pub fn tc_length(&self, size_class: usize) -> usize {
        self.cache(size_class).tc_length()
    }

    pub fn hit_rate_stats(&self, size_class: usize) -> TransferCacheStats {
        self.cache(size_class).hit_rate_stats()
    }

    /// Grow `size_class`'s cache by one batch at a victim's expense.
    fn make_cache_space(&self, size_class: usize) -> bool {
        let Some(victim) = self.determine_size_class_to_evict(size_class) else {
            return false;
        };
        self.cache(victim).shrink_cache() && self.cache(size_class).grow_cache()
    }

    /// Round-robin victim scan starting past the previous pick, skipping the
    /// requester and classes with nothing cached. `None` means nothing is
    /// evictable right now.
    pub fn determine_size_class_to_evict(&self, size_class: usize) -> Option<usize> {
        let mut idx = self.next_to_evict.load(Ordering::Relaxed);
        for _ in 0..NUM_SIZE_CLASSES {
            idx += 1;
            if idx >= NUM_SIZE_CLASSES {
                idx = 1;
            }
            if idx == size_class {
                continue;
            }
            if self.cache(idx).tc_length() > 0 {
                self.next_to_evict.store(idx, Ordering::Relaxed);
                return Some(idx);
            }
        }
        None
    }
}

// SAFETY: slots are written exactly once under the Once before `initialized`
// is released; afterwards they are only read, and each cache synchronizes
// internally.
unsafe impl<F: ObjectFreeList + Send> Send for TransferCacheManager<F> {}
unsafe impl<F: ObjectFreeList + Send> Sync for TransferCacheManager<F> {}
