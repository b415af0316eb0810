//! Global observational counters.
//!
//! All counters use `Relaxed` ordering — they are monitoring data, not
//! synchronization. The cache spinlocks provide the ordering guarantees for
//! correctness. Per-cache counters (hits, misses, release totals) live on the
//! cache structs themselves; the counters here are cross-cutting.
//!
//! Only compiled with the `stats` feature; increments go through the
//! `stat_inc!` / `stat_add!` macros so call sites compile to nothing when the
//! feature is off.

use core::sync::atomic::{AtomicU64, Ordering};

pub struct Stats {
    /// Bytes handed out by the metadata arena.
    pub metadata_bytes: AtomicU64,
    /// Slabs the metadata arena has mapped from the OS.
    pub metadata_slabs: AtomicU64,
    /// Transfer-cache shards initialized (first touch per L3 domain).
    pub shard_inits: AtomicU64,
    /// Objects drained back to free lists by plunder passes.
    pub plundered_objects: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            metadata_bytes: AtomicU64::new(0),
            metadata_slabs: AtomicU64::new(0),
            shard_inits: AtomicU64::new(0),
            plundered_objects: AtomicU64::new(0),
        }
    }
}

pub static STATS: Stats = Stats::new();

/// A point-in-time snapshot of the global counters.
///
/// Individual fields are each atomically read, but the snapshot as a whole is
/// not globally consistent; for monitoring purposes this is sufficient.
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub metadata_bytes: u64,
    pub metadata_slabs: u64,
    pub shard_inits: u64,
    pub plundered_objects: u64,
}

/// Load all counters with `Relaxed` ordering.
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        metadata_bytes: s.metadata_bytes.load(Ordering::Relaxed),
        metadata_slabs: s.metadata_slabs.load(Ordering::Relaxed),
        shard_inits: s.shard_inits.load(Ordering::Relaxed),
        plundered_objects: s.plundered_objects.load(Ordering::Relaxed),
    }
}
