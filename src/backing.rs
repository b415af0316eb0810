//! Collaborator interfaces of the huge-page cache.
//!
//! The cache does not obtain address space or touch page tables itself; it
//! drives an underlying [`HugeAllocator`] and a borrowed pair of memory
//! modification hooks supplied by its owner. The hooks outlive the cache and
//! carry no ownership.

use crate::huge_pages::{HugeLength, HugeRange};
use crate::platform;

/// Source of raw huge-page address ranges.
///
/// `get` returns a backed run (or the empty range when the system is out of
/// memory); `release` takes a run back, with `backed` saying whether its
/// physical memory is still attached.
pub trait HugeAllocator {
    fn get(&mut self, n: HugeLength) -> HugeRange;
    fn release(&mut self, r: HugeRange, backed: bool);
}

/// A hook that changes the backing state of a range (e.g. unback via
/// madvise). Must be idempotent; returns false when the kernel rejected the
/// request. Failure is not fatal to the caller.
pub trait MemoryModify {
    fn modify(&self, r: HugeRange) -> bool;
}

// A plain function pointer works as a hook directly.
impl MemoryModify for fn(HugeRange) -> bool {
    fn modify(&self, r: HugeRange) -> bool {
        self(r)
    }
}

/// Optional hook for memory-tagging systems. `name` may be absent.
pub trait MemoryTag {
    fn tag(&self, r: HugeRange, name: Option<&str>);
}

/// The production unback hook: decommit the range's physical memory while
/// keeping it addressable.
pub struct SystemUnback;

impl MemoryModify for SystemUnback {
    fn modify(&self, r: HugeRange) -> bool {
        if r.is_empty() {
            return true;
        }
        unsafe { platform::page_decommit(r.start().addr() as *mut u8, r.len().in_bytes()) }
    }
}
