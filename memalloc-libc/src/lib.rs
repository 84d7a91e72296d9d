//! # libc pass-through allocator
//!
//! Implements [`MallocImpl`] by delegating straight to the host's global
//! allocator, grounded on `libc_allocator.c`: `libc_malloc`/`libc_realloc`/
//! `libc_free` are thin wrappers around the system's own `malloc`/`realloc`/
//! `free`. This crate is the Rust equivalent, built on `std::alloc`.
//!
//! `std::alloc::{alloc, dealloc, realloc}` need a [`Layout`] at every call,
//! including `dealloc`/`realloc`, which the original C side-steps because
//! `free(3)` only needs a pointer. This crate keeps a side table from
//! payload offset (really: the returned pointer, cast to `usize` — see
//! `MallocImpl`'s doc comment on why pointers are offsets elsewhere in this
//! workspace but are real addresses here, since this allocator owns no
//! simulated heap buffer to index into) to the `Layout` used to allocate it,
//! so `free`/`reallocate` know what to pass back.
//!
//! Every raw-pointer operation lives in this module's handful of `unsafe`
//! blocks; nothing above this crate ever touches a raw pointer.

use std::alloc::{self, Layout};
use std::collections::HashMap;

use memiface::{CheckError, MallocImpl};

const ALIGNMENT: usize = 8;

/// Delegates every operation to the host's global allocator. Has no
/// simulated heap, so `heap_low`/`heap_high` are always `None` and `check`
/// always succeeds — there's no boundary-tag state of this crate's own to
/// corrupt.
pub struct LibcAllocator {
    live: HashMap<usize, Layout>,
}

impl LibcAllocator {
    pub fn new() -> Self {
        Self { live: HashMap::new() }
    }

    fn layout_for(size: usize) -> Layout {
        // size 0 is never requested here: MallocImpl::allocate callers in
        // this workspace only ever call with size > 0 (reallocate(_, 0)
        // is handled as a free before reaching here).
        Layout::from_size_align(size.max(1), ALIGNMENT).expect("layout overflow")
    }
}

impl Default for LibcAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl MallocImpl for LibcAllocator {
    fn init(&mut self) {
        // Libc needs no initialization, matching `libc_init`.
    }

    fn allocate(&mut self, size: usize) -> Option<usize> {
        let layout = Self::layout_for(size);
        // SAFETY: layout is non-zero-sized (size.max(1)) and validly aligned.
        let ptr = unsafe { alloc::alloc(layout) };
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        self.live.insert(addr, layout);
        Some(addr)
    }

    fn reallocate(&mut self, ptr: Option<usize>, size: usize) -> Option<usize> {
        let addr = match ptr {
            None => return self.allocate(size),
            Some(p) => p,
        };
        if size == 0 {
            self.free(addr);
            return None;
        }

        let old_layout = *self.live.get(&addr)?;
        let new_size = size.max(1);
        // SAFETY: `addr` was returned by a previous `alloc`/`realloc` call
        // with `old_layout`, and is still live (present in `self.live`).
        let new_ptr = unsafe { alloc::realloc(addr as *mut u8, old_layout, new_size) };
        if new_ptr.is_null() {
            return None;
        }
        self.live.remove(&addr);
        let new_addr = new_ptr as usize;
        let new_layout = Layout::from_size_align(new_size, ALIGNMENT).expect("layout overflow");
        self.live.insert(new_addr, new_layout);
        Some(new_addr)
    }

    fn free(&mut self, ptr: usize) {
        if let Some(layout) = self.live.remove(&ptr) {
            // SAFETY: `ptr` was returned by `alloc`/`realloc` with `layout`
            // and has not been freed since (removed from the map above).
            unsafe { alloc::dealloc(ptr as *mut u8, layout) };
        }
    }

    fn check(&self) -> Result<(), CheckError> {
        Ok(())
    }

    fn heap_low(&self) -> Option<usize> {
        None
    }

    fn heap_high(&self) -> Option<usize> {
        None
    }

    fn reset(&mut self) {
        for (ptr, layout) in self.live.drain() {
            // SAFETY: every entry in `live` is a still-outstanding
            // allocation made with `layout`.
            unsafe { alloc::dealloc(ptr as *mut u8, layout) };
        }
    }

    fn read_bytes(&self, ptr: usize, out: &mut [u8]) {
        // SAFETY: `ptr` is live (the caller must not read past the end of
        // its tracked allocation), so `out.len()` bytes starting there are
        // valid to read.
        unsafe { std::ptr::copy_nonoverlapping(ptr as *const u8, out.as_mut_ptr(), out.len()) };
    }

    fn write_bytes(&mut self, ptr: usize, data: &[u8]) {
        // SAFETY: see `read_bytes`.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len()) };
    }
}
