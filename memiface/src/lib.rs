//! # The `MallocImpl` contract
//!
//! Every allocator in this workspace — the segregated free-list allocator in
//! `memalloc`, the libc pass-through in `memalloc-libc`, and the deliberately
//! broken allocator in `memalloc-bad` — implements the same trait. `memdriver`
//! and `memvalidate` only ever talk to a `&mut dyn MallocImpl`, so neither one
//! needs to know which allocator it was handed.
//!
//! Pointers here are byte offsets into a heap substrate's buffer, not raw
//! pointers: the substrate owns the memory, the allocator only ever indexes
//! into it. This sidesteps lifetimes and ownership questions that a raw
//! `*mut u8` contract would raise for no benefit, since nothing in this
//! workspace ever hands a payload pointer to code outside the simulated heap.

#![cfg_attr(not(test), no_std)]

use core::fmt;

/// An invariant the heap-walking checker (`check`) found violated, and where.
///
/// Returned from `MallocImpl::check`. A failing check means the allocator's
/// internal state is corrupt; there is no recovery path, only a report of
/// what went wrong so a caller can print it before giving up on the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// `header.size != footer.size` for the block starting at this offset.
    TagMismatch { block_start: usize },
    /// The heap walk did not land exactly on `heap_high + 1`.
    WalkMisaligned { expected_end: usize, actual_end: usize },
    /// The heap walk ran off a block whose size was implausible (zero, or
    /// larger than the remaining heap) before it could reach the end.
    Runaway { block_start: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckError::TagMismatch { block_start } => {
                write!(f, "header/footer size mismatch for block at offset {block_start}")
            }
            CheckError::WalkMisaligned { expected_end, actual_end } => {
                write!(
                    f,
                    "heap walk ended at offset {actual_end}, expected {expected_end}"
                )
            }
            CheckError::Runaway { block_start } => {
                write!(f, "implausible block size while walking from offset {block_start}")
            }
        }
    }
}

/// The public contract every candidate allocator satisfies.
///
/// `init` is infallible in this workspace: every implementation (the
/// segregated allocator, the libc pass-through, and the buggy allocator)
/// unconditionally succeeds, matching the original malloc lab's `my_init`,
/// `libc_init`, and `bad_init`, which all unconditionally return `0`. The
/// upstream interface's `init() -> ok | error` is collapsed accordingly; see
/// `DESIGN.md` for the reasoning.
pub trait MallocImpl {
    /// Prepare the allocator for use. Idempotent; safe to call again after
    /// `reset`.
    fn init(&mut self);

    /// Request `size` bytes. Returns the payload offset, or `None` if the
    /// heap substrate could not grow far enough to satisfy the request.
    fn allocate(&mut self, size: usize) -> Option<usize>;

    /// Resize the allocation at `ptr` (or, if `ptr` is `None`, behave as
    /// `allocate`) to `size` bytes. `size == 0` frees `ptr` and returns
    /// `None`. Returns the (possibly unchanged) payload offset, or `None` on
    /// failure to grow.
    fn reallocate(&mut self, ptr: Option<usize>, size: usize) -> Option<usize>;

    /// Release the allocation at `ptr`. `ptr` must be a payload offset
    /// previously returned by `allocate`/`reallocate` on this allocator and
    /// not already freed.
    fn free(&mut self, ptr: usize);

    /// Walk the heap and verify every boundary-tag and coverage invariant.
    fn check(&self) -> Result<(), CheckError>;

    /// The first valid heap byte, or `None` if nothing has been allocated
    /// since `init`/`reset`.
    fn heap_low(&self) -> Option<usize>;

    /// The last valid heap byte (inclusive), or `None` if nothing has been
    /// allocated since `init`/`reset`.
    fn heap_high(&self) -> Option<usize>;

    /// Discard every block and return the heap to its empty state. The next
    /// `init` starts fresh.
    fn reset(&mut self);

    /// Copy `out.len()` bytes starting at payload offset `ptr` into `out`.
    ///
    /// Only ever used off the hot allocate/free path — by `memvalidate` to
    /// check data preservation (P8) and by `memdriver`'s write-touch op. Not
    /// part of the original malloc lab's interface (there, the driver holds
    /// a real pointer and dereferences it directly); this workspace's
    /// pointers are offsets into a substrate the caller doesn't otherwise
    /// have access to, so the trait needs an explicit way in.
    fn read_bytes(&self, ptr: usize, out: &mut [u8]);

    /// Copy `data` into the heap starting at payload offset `ptr`.
    fn write_bytes(&mut self, ptr: usize, data: &[u8]);
}
