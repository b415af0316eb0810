//! Size class table and per-class transfer-cache parameters.
//!
//! Small objects are bucketed into size classes; each class has one central
//! free list and one transfer cache per manager. The table itself is
//! generated by `build.rs` from `rtcache.toml`. Index 0 is a sentinel.

use crate::config::{
    MAX_TRANSFER_CAPACITY_BYTES, SHARDED_CAPACITY_BYTES, SHARDED_MIN_CLASS_BYTES,
};

/// Information about a single size class.
#[derive(Clone, Copy)]
pub struct SizeClassInfo {
    /// Object size for this class (bytes).
    pub size: usize,
    /// Objects moved between cache tiers in one batch.
    pub batch_size: usize,
}

include!(concat!(env!("OUT_DIR"), "/size_class_gen.rs"));

#[inline]
pub fn class_info(size_class: usize) -> SizeClassInfo {
    SIZE_CLASSES[size_class]
}

/// Object size of a class; 0 for the sentinel.
#[inline]
pub fn class_to_size(size_class: usize) -> usize {
    SIZE_CLASSES[size_class].size
}

/// Batch size for inter-tier transfers of a class.
#[inline]
pub fn num_objects_to_move(size_class: usize) -> usize {
    SIZE_CLASSES[size_class].batch_size
}

/// Unsharded transfer cache: starting capacity in objects.
#[inline]
pub fn initial_capacity(size_class: usize) -> usize {
    2 * num_objects_to_move(size_class)
}

/// Unsharded transfer cache: capacity ceiling in objects. Bounded both in
/// batches and in bytes so large classes cannot pin megabytes per class.
pub fn max_capacity(size_class: usize) -> usize {
    let info = class_info(size_class);
    if info.size == 0 {
        return 0;
    }
    (64 * info.batch_size).min(MAX_TRANSFER_CAPACITY_BYTES / info.size)
}

/// Whether the sharded transfer cache serves this class at all.
#[inline]
pub fn sharded_active(size_class: usize) -> bool {
    class_to_size(size_class) >= SHARDED_MIN_CLASS_BYTES
}

/// Sharded transfer cache: fixed per-shard capacity in objects (0 when the
/// class is inactive).
pub fn sharded_capacity(size_class: usize) -> usize {
    let size = class_to_size(size_class);
    if size == 0 || !sharded_active(size_class) {
        return 0;
    }
    SHARDED_CAPACITY_BYTES / size
}
