//! # The deliberately broken allocator
//!
//! Grounded on `bad_allocator.c`'s `bad_malloc`/`bad_free`/`bad_realloc`:
//! this exists purely so `memdriver`'s `-b` flag has a known-bad
//! implementation to throw at `memvalidate`, proving the validator actually
//! catches misalignment, wasted space, and realloc data loss rather than
//! rubber-stamping anything handed to it.
//!
//! - `allocate` ignores the requested size entirely and grows the heap by a
//!   fixed, non-8-byte-aligned slab (`BAD_SIZE = 4101` bytes).
//! - `free` does nothing. Memory is never reclaimed.
//! - `reallocate` allocates a fresh (equally bogus) block and frees the old
//!   one, but never copies the payload — `memvalidate`'s P8 check is
//!   expected to fail against this allocator.
//!
//! Never used by the segregated allocator itself; wired into `memdriver`
//! behind a flag, nowhere else.

use memheap::HeapSubstrate;
use memiface::{CheckError, MallocImpl};

/// Matches `bad_allocator.c`'s `BAD_SIZE`: deliberately not a multiple of
/// the workspace's 8-byte alignment.
const BAD_SIZE: usize = 4101;

pub struct BadAllocator<H: HeapSubstrate> {
    heap: H,
}

impl<H: HeapSubstrate> BadAllocator<H> {
    pub fn new(heap: H) -> Self {
        Self { heap }
    }

    pub fn heap(&self) -> &H {
        &self.heap
    }
}

impl<H: HeapSubstrate + Default> Default for BadAllocator<H> {
    fn default() -> Self {
        Self::new(H::default())
    }
}

impl<H: HeapSubstrate> MallocImpl for BadAllocator<H> {
    fn init(&mut self) {
        // bad_init does nothing: no free-list state to prepare, since this
        // allocator never maintains one.
    }

    fn allocate(&mut self, _size: usize) -> Option<usize> {
        self.heap.grow(BAD_SIZE).ok()
    }

    fn reallocate(&mut self, ptr: Option<usize>, size: usize) -> Option<usize> {
        let new_ptr = self.allocate(size)?;
        if let Some(old) = ptr {
            self.free(old);
        }
        // Deliberately no copy: this is the bug memvalidate's P8 check
        // exists to catch.
        Some(new_ptr)
    }

    fn free(&mut self, _ptr: usize) {
        // bad_free does nothing: freed memory is never reclaimed.
    }

    fn check(&self) -> Result<(), CheckError> {
        // bad_check has no invariants of its own to verify.
        Ok(())
    }

    fn heap_low(&self) -> Option<usize> {
        (self.heap.size() > 0).then(|| self.heap.low())
    }

    fn heap_high(&self) -> Option<usize> {
        self.heap.high()
    }

    fn reset(&mut self) {
        self.heap.reset();
    }

    fn read_bytes(&self, ptr: usize, out: &mut [u8]) {
        out.copy_from_slice(&self.heap.bytes()[ptr..ptr + out.len()]);
    }

    fn write_bytes(&mut self, ptr: usize, data: &[u8]) {
        self.heap.bytes_mut()[ptr..ptr + data.len()].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memheap::SimHeap;

    #[test]
    fn allocate_ignores_requested_size_and_grows_by_a_fixed_slab() {
        let mut a = BadAllocator::new(SimHeap::with_capacity(1 << 16));
        a.init();
        let p1 = a.allocate(8).unwrap();
        let p2 = a.allocate(999999).unwrap();
        assert_eq!(p2 - p1, BAD_SIZE, "every block occupies exactly BAD_SIZE bytes regardless of request");
    }

    #[test]
    fn the_bad_slab_size_is_not_alignment_friendly() {
        assert_ne!(BAD_SIZE % 8, 0, "BAD_SIZE is deliberately misaligned as a stride");
    }

    #[test]
    fn free_never_shrinks_or_reclaims_anything() {
        let mut a = BadAllocator::new(SimHeap::with_capacity(1 << 16));
        a.init();
        let p = a.allocate(16).unwrap();
        let size_before = a.heap().size();
        a.free(p);
        assert_eq!(a.heap().size(), size_before, "free is a no-op");
    }

    #[test]
    fn reallocate_never_copies_the_old_payload() {
        let mut a = BadAllocator::new(SimHeap::with_capacity(1 << 16));
        a.init();
        let p1 = a.allocate(16).unwrap();
        a.write_bytes(p1, &[0x42u8; 16]);
        let p2 = a.reallocate(Some(p1), 16).unwrap();
        let mut out = [0u8; 16];
        a.read_bytes(p2, &mut out);
        assert!(out.iter().all(|&b| b == 0), "the new block must not contain the old payload's bytes");
    }
}
