//! OS platform abstraction: virtual memory, monotonic time, CPU identity.
//!
//! Provides `page_alloc`/`page_dealloc` for metadata slabs, `page_decommit`
//! (the primitive behind the production unback hook), a monotonic tick clock,
//! and `current_cpu` for the sharded transfer cache's shard lookup.

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

/// Allocate `size` bytes of virtual memory, page-aligned and zeroed.
/// Returns null on failure.
///
/// # Safety
/// Caller must eventually call `page_dealloc` with the returned pointer and
/// the same `size`, or keep the mapping for the life of the process.
#[inline]
pub unsafe fn page_alloc(size: usize) -> *mut u8 {
    #[cfg(windows)]
    {
        unsafe { windows::page_alloc(size) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_alloc(size) }
    }
}

/// Free virtual memory previously allocated by `page_alloc`.
///
/// # Safety
/// `ptr` must have been returned by `page_alloc`, and `size` must match the
/// original allocation size.
#[inline]
pub unsafe fn page_dealloc(ptr: *mut u8, _size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::page_dealloc(ptr) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_dealloc(ptr, _size) };
    }
}

/// Return physical memory to the OS while keeping the virtual range mapped.
/// madvise(MADV_DONTNEED) on Unix, MEM_DECOMMIT on Windows. Returns false if
/// the kernel rejected the request.
///
/// # Safety
/// `ptr` and `size` must refer to a range within a live mapping.
#[inline]
pub unsafe fn page_decommit(ptr: *mut u8, size: usize) -> bool {
    #[cfg(windows)]
    {
        unsafe { windows::page_decommit(ptr, size) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::page_decommit(ptr, size) }
    }
}

/// Monotonic time in ticks. Pair with [`clock_freq`].
#[inline]
pub fn clock_now() -> i64 {
    #[cfg(windows)]
    {
        windows::clock_now()
    }
    #[cfg(unix)]
    {
        unix::clock_now()
    }
}

/// Ticks per second of [`clock_now`].
#[inline]
pub fn clock_freq() -> i64 {
    1_000_000_000
}

/// Index of the CPU the calling thread is running on, or 0 when the
/// platform cannot say.
#[inline]
pub fn current_cpu() -> usize {
    #[cfg(all(unix, target_os = "linux"))]
    {
        unix::current_cpu()
    }
    #[cfg(not(all(unix, target_os = "linux")))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_zeroed_and_writable() {
        unsafe {
            let size = 16 * 4096;
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            for i in 0..size {
                assert_eq!(*ptr.add(i), 0);
            }
            *ptr = 0xAA;
            *ptr.add(size - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(size - 1), 0xBB);
            page_dealloc(ptr, size);
        }
    }

    #[test]
    fn test_decommit_keeps_range_addressable() {
        unsafe {
            let size = 8 * 4096;
            let ptr = page_alloc(size);
            assert!(!ptr.is_null());
            *ptr = 7;
            assert!(page_decommit(ptr, size));
            // The range stays mapped; contents are permitted to be zapped.
            let _ = *ptr;
            page_dealloc(ptr, size);
        }
    }

    #[test]
    fn test_clock_and_cpu() {
        let a = clock_now();
        let b = clock_now();
        assert!(b >= a);
        assert!(clock_freq() > 0);
        let _ = current_cpu();
    }
}
