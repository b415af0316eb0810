//! Stats surfaces: snapshot structs and the print sinks.
//!
//! Print paths run inside an allocator and must never fail or allocate, so
//! [`Printer`] wraps any `core::fmt::Write` and swallows write errors, and
//! [`PbtxtRegion`] emits structured `key: value` text with nested regions
//! closed on drop.

use core::fmt::{self, Write};

/// Backed-memory accounting for one cache domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackingStats {
    /// Bytes the underlying allocator holds on behalf of this cache
    /// (handed out + cached).
    pub system_bytes: usize,
    /// Bytes cached and immediately reusable.
    pub free_bytes: usize,
    /// Bytes released back to the OS but still owned.
    pub unmapped_bytes: usize,
}

/// Hit/miss counters for one transfer cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferCacheStats {
    pub insert_hits: u64,
    pub insert_misses: u64,
    pub remove_hits: u64,
    pub remove_misses: u64,
}

/// Human-readable print sink. Write errors are dropped.
pub struct Printer<'a> {
    out: &'a mut dyn Write,
}

impl<'a> Printer<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self { out }
    }

    pub fn print(&mut self, args: fmt::Arguments<'_>) {
        let _ = self.out.write_fmt(args);
    }
}

/// Structured-text print sink (pbtxt-style nested regions).
///
/// A sub-region borrows its parent and writes its closing brace when
/// dropped, so nesting depth is tracked by the borrow checker.
pub struct PbtxtRegion<'a> {
    out: &'a mut dyn Write,
    depth: usize,
    close: bool,
}

impl<'a> PbtxtRegion<'a> {
    pub fn new(out: &'a mut dyn Write) -> Self {
        Self {
            out,
            depth: 0,
            close: false,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            let _ = self.out.write_str("  ");
        }
    }

    pub fn print_i64(&mut self, key: &str, value: i64) {
        self.indent();
        let _ = writeln!(self.out, "{key}: {value}");
    }

    pub fn print_bool(&mut self, key: &str, value: bool) {
        self.indent();
        let _ = writeln!(self.out, "{key}: {value}");
    }

    pub fn create_sub_region(&mut self, name: &str) -> PbtxtRegion<'_> {
        self.indent();
        let _ = writeln!(self.out, "{name} {{");
        PbtxtRegion {
            out: &mut *self.out,
            depth: self.depth + 1,
            close: true,
        }
    }
}

impl Drop for PbtxtRegion<'_> {
    fn drop(&mut self) {
        if self.close {
            self.depth -= 1;
            self.indent();
            let _ = self.out.write_str("}\n");
        }
    }
}
