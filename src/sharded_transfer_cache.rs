//! L3-sharded transfer caches.
//!
//! One group of per-class ring caches per L3 cache domain, so cross-socket
//! traffic on the transfer-cache locks disappears for the classes that
//! matter (objects of 4 KiB and up). Shards are built lazily: the first
//! thread to touch a shard constructs all of its caches from the metadata
//! arena under a `Once`, then publishes an `initialized` flag with release
//! ordering. Readers that must not wait (stats, plunder) acquire that flag
//! and skip shards still under construction; the flag exists precisely
//! because the `Once` cannot be probed.

use crate::config::CPU_SETSIZE;
use crate::metadata;
use crate::size_class::{self, NUM_SIZE_CLASSES};
use crate::stat_inc;
use crate::sync::Once;
use crate::transfer_cache::{ObjectFreeList, RingBufferTransferCache};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// CPU topology collaborator: who am I running on, and which L3 domain does
/// each CPU belong to.
pub trait CpuLayout {
    /// Index of the current CPU, `0..CPU_SETSIZE`.
    fn current_cpu(&self) -> usize;
    /// Fill `map[cpu]` with the L3 shard index of each CPU; returns the
    /// number of distinct shards (at least 1).
    fn build_cache_map(&self, map: &mut [u8; CPU_SETSIZE]) -> usize;
}

struct Shard<F: ObjectFreeList> {
    /// Array of `NUM_SIZE_CLASSES` caches, null until built.
    caches: AtomicPtr<RingBufferTransferCache<F>>,
    once: Once,
    /// Published with release after `caches`; the probe for readers that
    /// must not block on a half-built shard.
    initialized: AtomicBool,
}

impl<F: ObjectFreeList> Shard<F> {
    fn new() -> Self {
        Self {
            caches: AtomicPtr::new(ptr::null_mut()),
            once: Once::new(),
            initialized: AtomicBool::new(false),
        }
    }
}

/// Per-L3-domain transfer caches with lazy shard construction.
///
/// `F` is the backing freelist of one class; in production it forwards to
/// the unsharded manager, tests substitute mocks. Freelists are built
/// through a plain constructor fn so shards can be created from any thread
/// without captured state.
pub struct ShardedTransferCacheManager<L: CpuLayout, F: ObjectFreeList> {
    layout: L,
    make_freelist: fn(usize) -> F,
    l3_index: [u8; CPU_SETSIZE],
    shards: *mut Shard<F>,
    num_shards: usize,
    active_for_class: [bool; NUM_SIZE_CLASSES],
}

impl<L: CpuLayout, F: ObjectFreeList> ShardedTransferCacheManager<L, F> {
    pub fn new(layout: L, make_freelist: fn(usize) -> F) -> Self {
        Self {
            layout,
            make_freelist,
            l3_index: [0; CPU_SETSIZE],
            shards: ptr::null_mut(),
            num_shards: 0,
            active_for_class: [false; NUM_SIZE_CLASSES],
        }
    }

    /// Build the CPU map and the (empty) shard table. Call once at startup,
    /// before the manager is shared.
    pub fn init(&mut self) {
        self.num_shards = self.layout.build_cache_map(&mut self.l3_index);
        assert!(self.num_shards > 0, "CPU layout reported zero shards");
        assert!(self.num_shards <= u8::MAX as usize + 1);

        let shards =
            metadata::alloc(self.num_shards * core::mem::size_of::<Shard<F>>(), 64)
                as *mut Shard<F>;
        assert!(!shards.is_null(), "out of metadata for shard table");
        for i in 0..self.num_shards {
            unsafe { shards.add(i).write(Shard::new()) };
        }
        self.shards = shards;

        for cl in 0..NUM_SIZE_CLASSES {
            self.active_for_class[cl] = size_class::sharded_active(cl);
        }
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Whether the sharded path serves this class at all.
    pub fn should_use(&self, size_class: usize) -> bool {
        self.active_for_class[size_class]
    }

    /// Push one object into the current CPU's shard.
    pub fn push(&self, size_class: usize, object: *mut u8) {
        self.get_cache(size_class).insert_range(&[object]);
    }

    /// Pop one object from the current CPU's shard, if any.
    pub fn pop(&self, size_class: usize) -> Option<*mut u8> {
        let mut buf = [ptr::null_mut(); 1];
        let got = self.get_cache(size_class).remove_range(&mut buf);
        if got == 1 { Some(buf[0]) } else { None }
    }

    /// Drain every cache in every built shard that has been idle since the
    /// previous pass.
    pub fn plunder(&self) {
        if self.shards.is_null() {
            return;
        }
        for shard in 0..self.num_shards {
            let Some(caches) = self.shard_caches(shard) else {
                continue;
            };
            for cl in 0..NUM_SIZE_CLASSES {
                unsafe { (*caches.add(cl)).try_plunder() };
            }
        }
    }

    /// Approximate bytes cached across all shards and classes.
    pub fn total_bytes(&self) -> usize {
        if self.shards.is_null() {
            return 0;
        }
        let mut out = 0;
        for shard in 0..self.num_shards {
            let Some(caches) = self.shard_caches(shard) else {
                continue;
            };
            for cl in 0..NUM_SIZE_CLASSES {
                let bytes_per_entry = size_class::class_to_size(cl);
                if bytes_per_entry == 0 {
                    continue;
                }
                out += unsafe { (*caches.add(cl)).tc_length() } * bytes_per_entry;
            }
        }
        out
    }

    /// Cached object count for `cpu`'s shard and one class; 0 when that
    /// shard has never been touched.
    pub fn tc_length(&self, cpu: usize, size_class: usize) -> usize {
        if self.shards.is_null() {
            return 0;
        }
        let shard = self.l3_index[cpu] as usize;
        match self.shard_caches(shard) {
            Some(caches) => unsafe { (*caches.add(size_class)).tc_length() },
            None => 0,
        }
    }

    pub fn shard_initialized(&self, shard: usize) -> bool {
        if self.shards.is_null() {
            return false;
        }
        let s = unsafe { &*self.shards.add(shard) };
        s.initialized.load(Ordering::Acquire)
    }

    /// The cache array of a built shard, or None while it is missing or
    /// under construction. The acquire load pairs with the release store in
    /// `init_shard`, making the fully-written array visible.
    fn shard_caches(&self, shard: usize) -> Option<*mut RingBufferTransferCache<F>> {
        let s = unsafe { &*self.shards.add(shard) };
        if !s.initialized.load(Ordering::Acquire) {
            return None;
        }
        Some(s.caches.load(Ordering::Relaxed))
    }

    /// The current CPU's cache for one class, building the shard on first
    /// touch.
    fn get_cache(&self, size_class: usize) -> &RingBufferTransferCache<F> {
        let cpu = self.layout.current_cpu();
        assert!(cpu < CPU_SETSIZE);
        let shard_index = self.l3_index[cpu] as usize;
        assert!(shard_index < self.num_shards, "shard index out of bounds");
        let shard = unsafe { &*self.shards.add(shard_index) };
        shard.once.call_once(|| self.init_shard(shard));
        // After call_once the pointer is set (by us or a racing thread).
        let caches = shard.caches.load(Ordering::Acquire);
        unsafe { &*caches.add(size_class) }
    }

    /// Build all of one shard's caches. Inactive classes get zero-capacity
    /// pass-through caches so every class is addressable.
    fn init_shard(&self, shard: &Shard<F>) {
        let caches = metadata::alloc(
            NUM_SIZE_CLASSES * core::mem::size_of::<RingBufferTransferCache<F>>(),
            64,
        ) as *mut RingBufferTransferCache<F>;
        assert!(!caches.is_null(), "out of metadata for shard caches");

        for cl in 0..NUM_SIZE_CLASSES {
            let capacity = if self.active_for_class[cl] {
                size_class::sharded_capacity(cl)
            } else {
                0
            };
            let mut freelist = (self.make_freelist)(cl);
            freelist.init(cl);
            unsafe {
                caches
                    .add(cl)
                    .write(RingBufferTransferCache::new(cl, freelist, capacity, capacity))
            };
        }

        shard.caches.store(caches, Ordering::Release);
        shard.initialized.store(true, Ordering::Release);
        stat_inc!(shard_inits);
    }
}

// SAFETY: the shard table is written only in `init` (exclusive &mut) and
// `init_shard` (guarded by the per-shard Once); everything else is reads of
// published pointers plus the caches' own internal locking.
unsafe impl<L: CpuLayout + Send, F: ObjectFreeList + Send> Send
    for ShardedTransferCacheManager<L, F>
{
}
unsafe impl<L: CpuLayout + Sync, F: ObjectFreeList + Send> Sync
    for ShardedTransferCacheManager<L, F>
{
}

/// Production layout for Linux: `sched_getcpu` plus the sysfs cache
/// topology. Falls back to a single shard when sysfs is unreadable.
#[cfg(feature = "std")]
pub struct ProdCpuLayout;

#[cfg(feature = "std")]
impl CpuLayout for ProdCpuLayout {
    fn current_cpu(&self) -> usize {
        crate::platform::current_cpu().min(CPU_SETSIZE - 1)
    }

    fn build_cache_map(&self, map: &mut [u8; CPU_SETSIZE]) -> usize {
        use std::vec::Vec;

        let mut l3_ids: Vec<u64> = Vec::new();
        let mut shards = 0usize;
        for cpu in 0..CPU_SETSIZE {
            let path = std::format!(
                "/sys/devices/system/cpu/cpu{}/cache/index3/id",
                cpu
            );
            let Ok(contents) = std::fs::read_to_string(&path) else {
                break;
            };
            let id: u64 = match contents.trim().parse() {
                Ok(id) => id,
                Err(_) => break,
            };
            let shard = match l3_ids.iter().position(|&x| x == id) {
                Some(idx) => idx,
                None => {
                    l3_ids.push(id);
                    l3_ids.len() - 1
                }
            };
            if shard > u8::MAX as usize {
                break;
            }
            map[cpu] = shard as u8;
            shards = shards.max(shard + 1);
        }
        if shards == 0 {
            // No topology information: everything in one shard.
            map.fill(0);
            1
        } else {
            shards
        }
    }
}
