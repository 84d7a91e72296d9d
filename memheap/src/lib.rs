//! # Simulated heap substrate
//!
//! Models the memory system the allocator runs on top of, the way the
//! original malloc lab's `memlib.c` does: one big chunk of real memory,
//! grown by a simulated `sbrk`, never shrunk, never freed back.
//!
//! Splitting this out of `memalloc` lets the allocator engine stay
//! `no_std` and generic over "anything that can grow/low/high/reset" — the
//! engine's tests can hand it a tiny substrate instead of the full 50 MiB
//! one, and the buggy allocator in `memalloc-bad` can share this same
//! substrate without depending on the real allocator's internals.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Maximum heap size in bytes (50 MiB, matching the original lab's `config.h`).
pub const MAX_HEAP: usize = 50 * (1 << 20);

/// The heap substrate refused to grow: the request would exceed `MAX_HEAP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap substrate exhausted (cap is {MAX_HEAP} bytes)")
    }
}

impl std::error::Error for OutOfMemory {}

/// The growth primitive an allocator engine consumes, abstracted so the
/// engine (in `memalloc`) doesn't need to know it's backed by a `Vec<u8>`.
///
/// Offsets returned and accepted here are always relative to this
/// substrate's own buffer, starting at 0 — never a process address. That
/// keeps the allocator crate free of any unsafe raw-pointer arithmetic
/// against real memory; only this crate touches the backing `Vec` directly.
pub trait HeapSubstrate {
    /// Atomically extend the heap by `n` bytes and return the offset of the
    /// start of the new region. Single shared point of mutation: uses a
    /// fetch-add so two logically concurrent growers can never be handed
    /// overlapping regions, with the increment reversed on overflow. This
    /// allocator is otherwise strictly single-threaded (see `memalloc`'s
    /// crate docs) — the atomic exists only to keep this one primitive
    /// correct if that ever changes, not to serialize `allocate`/`free`.
    fn grow(&self, n: usize) -> Result<usize, OutOfMemory>;

    /// The first valid offset (always 0 for this workspace's substrates).
    fn low(&self) -> usize {
        0
    }

    /// The last valid offset (inclusive), or `None` if the heap is empty.
    fn high(&self) -> Option<usize> {
        self.size().checked_sub(1)
    }

    /// Current heap size in bytes (one past the last valid offset).
    fn size(&self) -> usize;

    /// Reset the break pointer to the start, discarding every block. The
    /// backing storage itself is not released.
    fn reset(&mut self);

    /// Read-only view of the live region, `bytes()[0..size()]`.
    fn bytes(&self) -> &[u8];

    /// Mutable view of the live region, `bytes_mut()[0..size()]`.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// A fixed-capacity byte buffer with a simulated `sbrk` break pointer.
///
/// Mirrors `memlib.c`'s single `malloc(MAX_HEAP)` at `mem_init`: the backing
/// `Vec` is sized once, up front, and never resized. "Growing the heap" only
/// ever moves `brk` forward within that fixed allocation.
pub struct SimHeap {
    buf: Vec<u8>,
    brk: AtomicUsize,
}

impl SimHeap {
    /// A substrate capped at [`MAX_HEAP`] bytes, matching the original lab.
    pub fn new() -> Self {
        Self::with_capacity(MAX_HEAP)
    }

    /// A substrate capped at `capacity` bytes. Tests use this to keep unit
    /// tests from paying for a 50 MiB allocation per case.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            brk: AtomicUsize::new(0),
        }
    }

    /// The cap this substrate was constructed with.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl Default for SimHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapSubstrate for SimHeap {
    fn grow(&self, n: usize) -> Result<usize, OutOfMemory> {
        let old = self.brk.fetch_add(n, Ordering::SeqCst);
        let new = old + n;
        if new > self.buf.len() {
            self.brk.fetch_sub(n, Ordering::SeqCst);
            return Err(OutOfMemory);
        }
        Ok(old)
    }

    fn size(&self) -> usize {
        self.brk.load(Ordering::SeqCst)
    }

    fn reset(&mut self) {
        *self.brk.get_mut() = 0;
    }

    fn bytes(&self) -> &[u8] {
        let len = self.size();
        &self.buf[..len]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.size();
        &mut self.buf[..len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_returns_contiguous_offsets() {
        let heap = SimHeap::with_capacity(4096);
        let a = heap.grow(64).unwrap();
        let b = heap.grow(128).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 64);
        assert_eq!(heap.size(), 192);
    }

    #[test]
    fn grow_past_cap_is_exact_and_reversible() {
        let heap = SimHeap::with_capacity(100);
        assert_eq!(heap.grow(64), Ok(0));
        assert_eq!(heap.grow(64), Err(OutOfMemory));
        // the failed attempt must not have moved the break pointer
        assert_eq!(heap.size(), 64);
        assert_eq!(heap.grow(36), Ok(64));
        assert_eq!(heap.size(), 100);
    }

    #[test]
    fn reset_reproduces_fresh_offsets() {
        let mut heap = SimHeap::with_capacity(4096);
        let a1 = heap.grow(32).unwrap();
        heap.grow(32).unwrap();
        heap.reset();
        assert_eq!(heap.size(), 0);
        assert!(heap.high().is_none());
        let a2 = heap.grow(32).unwrap();
        assert_eq!(a1, a2);
    }

    #[test]
    fn high_is_none_when_empty_and_size_minus_one_otherwise() {
        let heap = SimHeap::with_capacity(4096);
        assert_eq!(heap.high(), None);
        heap.grow(10).unwrap();
        assert_eq!(heap.high(), Some(9));
    }
}
