#![no_std]

//! rtcache: backing caches for a hugepage-aware memory allocator.
//!
//! Two cooperating layers sit between an allocator's fast paths and its
//! expensive producers:
//! - [`huge_cache::HugeCache`] keeps recently-freed runs of backed 2 MiB huge
//!   pages, adaptively sizing itself to the working set and unbacking memory
//!   (via an injected callback) when demand falls.
//! - [`sharded_transfer_cache::ShardedTransferCacheManager`] and
//!   [`transfer_cache::TransferCacheManager`] shuttle batches of small-object
//!   pointers between CPU caches and per-size-class central free lists.
//!
//! # Usage
//!
//! ```ignore
//! let cache = SpinMutex::new(HugeCache::new(backing, &unback, None, cache_time));
//! let (range, from_released) = cache.lock().get(HugeLength::new(4));
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod backing;
pub mod clock;
pub mod config;
pub mod huge_address_map;
pub mod huge_cache;
pub mod huge_pages;
pub mod metadata;
pub mod minmax_tracker;
pub mod platform;
pub mod sharded_transfer_cache;
pub mod size_class;
#[cfg(feature = "stats")]
pub mod stats_global;
pub mod stats;
pub mod sync;
pub mod transfer_cache;
mod macros;

// Re-export the core vocabulary types at crate root for convenience
pub use huge_pages::{HugeLength, HugePage, HugeRange};
