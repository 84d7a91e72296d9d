//! # Payload range validator
//!
//! Grounded on `validator.h`'s range list: tracks the `(lo, hi)` extent of
//! every live allocation and rejects a candidate allocator the moment it
//! hands back something misaligned, out of bounds, overlapping, or (on
//! realloc) missing data it should have preserved.
//!
//! This is independent of `memalloc`: it only ever talks to a
//! `&mut dyn MallocImpl`, so it validates the segregated allocator, the
//! libc pass-through, and the deliberately broken allocator identically.

use std::fmt;

use memiface::MallocImpl;
use memtrace::{Trace, TraceOp};

const ALIGNMENT: usize = 8;

/// One live allocation's payload extent, inclusive on both ends (so a
/// zero-byte-sized notion of "payload" never has `hi < lo`; every payload
/// in this workspace is at least `MIN_PAYLOAD` bytes, so this is never hit
/// in practice, but the type doesn't special-case it away).
#[derive(Debug, Clone, Copy)]
struct Range {
    lo: usize,
    hi: usize,
}

impl Range {
    fn overlaps(&self, other: &Range) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

/// Why a trace replay was rejected, and roughly where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// `malloc`/`realloc` returned `None` when the trace didn't expect OOM.
    AllocationFailed { op_index: usize },
    /// A returned payload pointer wasn't 8-byte aligned.
    Misaligned { op_index: usize, ptr: usize },
    /// A returned payload extended past `heap_high`.
    OutOfBounds { op_index: usize, lo: usize, hi: usize },
    /// A returned payload overlapped one already live.
    Overlapping { op_index: usize, lo: usize, hi: usize },
    /// After a realloc, the preserved prefix didn't match what was written
    /// before the call (P8).
    DataNotPreserved { op_index: usize, id: usize },
    /// `check()` failed mid-replay (only when the caller asked for it).
    InvariantViolation { op_index: usize, detail: String },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::AllocationFailed { op_index } => {
                write!(f, "op {op_index}: allocation unexpectedly failed")
            }
            ValidationError::Misaligned { op_index, ptr } => {
                write!(f, "op {op_index}: payload at {ptr} is not {ALIGNMENT}-byte aligned")
            }
            ValidationError::OutOfBounds { op_index, lo, hi } => {
                write!(f, "op {op_index}: payload [{lo}, {hi}] lies outside the heap")
            }
            ValidationError::Overlapping { op_index, lo, hi } => {
                write!(f, "op {op_index}: payload [{lo}, {hi}] overlaps a live allocation")
            }
            ValidationError::DataNotPreserved { op_index, id } => {
                write!(f, "op {op_index}: reallocate(id={id}) lost previously written bytes")
            }
            ValidationError::InvariantViolation { op_index, detail } => {
                write!(f, "op {op_index}: invariant check failed: {detail}")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    fn add(&mut self, lo: usize, size: usize, heap_high: Option<usize>, op_index: usize) -> Result<(), ValidationError> {
        if lo % ALIGNMENT != 0 {
            return Err(ValidationError::Misaligned { op_index, ptr: lo });
        }
        let hi = lo + size - 1;
        if let Some(high) = heap_high {
            if hi > high {
                return Err(ValidationError::OutOfBounds { op_index, lo, hi });
            }
        }
        let candidate = Range { lo, hi };
        if self.ranges.iter().any(|r| r.overlaps(&candidate)) {
            return Err(ValidationError::Overlapping { op_index, lo, hi });
        }
        self.ranges.push(candidate);
        Ok(())
    }

    fn remove(&mut self, lo: usize) {
        self.ranges.retain(|r| r.lo != lo);
    }
}

/// Per-id bookkeeping the validator needs to resolve `Realloc`/`Free`/`Write`
/// ops back to a current pointer and size.
struct Slot {
    ptr: usize,
    size: usize,
}

/// Replay `trace` against `impl_` end to end, checking every op's result
/// against the range list and, on reallocation, against previously written
/// marker bytes. `run_check` additionally calls `impl_.check()` after every
/// op (the caller's `-c` flag in the driver).
pub fn eval_valid(impl_: &mut dyn MallocImpl, trace: &Trace, run_check: bool) -> Result<(), ValidationError> {
    impl_.reset();
    impl_.init();

    let mut ranges = RangeList::new();
    let mut slots: Vec<Option<Slot>> = (0..trace.num_ids).map(|_| None).collect();

    for (op_index, op) in trace.ops.iter().enumerate() {
        match *op {
            TraceOp::Alloc { id, size } => {
                let ptr = impl_
                    .allocate(size)
                    .ok_or(ValidationError::AllocationFailed { op_index })?;
                ranges.add(ptr, size, impl_.heap_high(), op_index)?;
                let marker = marker_byte(id);
                fill(impl_, ptr, size, marker);
                slots[id] = Some(Slot { ptr, size });
            }
            TraceOp::Realloc { id, size } => {
                let old = slots[id].as_ref().expect("realloc of an id that was never allocated");
                let old_ptr = old.ptr;
                let old_size = old.size;

                let new_ptr = impl_
                    .reallocate(Some(old_ptr), size)
                    .ok_or(ValidationError::AllocationFailed { op_index })?;

                ranges.remove(old_ptr);
                ranges.add(new_ptr, size, impl_.heap_high(), op_index)?;

                let preserved = old_size.min(size);
                let marker = marker_byte(id);
                let mut buf = vec![0u8; preserved];
                impl_.read_bytes(new_ptr, &mut buf);
                if buf.iter().any(|&b| b != marker) {
                    return Err(ValidationError::DataNotPreserved { op_index, id });
                }
                fill(impl_, new_ptr, size, marker);
                slots[id] = Some(Slot { ptr: new_ptr, size });
            }
            TraceOp::Free { id } => {
                let slot = slots[id].take().expect("free of an id that was never allocated");
                ranges.remove(slot.ptr);
                impl_.free(slot.ptr);
            }
            // Write-touch ops are a timing-harness construct, exercised by
            // memdriver's own replay to simulate memory traffic; they carry
            // no correctness check of their own, so the validator does
            // nothing with one.
            TraceOp::Write { .. } => {}
        }

        if run_check {
            if let Err(e) = impl_.check() {
                return Err(ValidationError::InvariantViolation {
                    op_index,
                    detail: e.to_string(),
                });
            }
        }
    }

    Ok(())
}

fn marker_byte(id: usize) -> u8 {
    id as u8
}

fn fill(impl_: &mut dyn MallocImpl, ptr: usize, size: usize, byte: u8) {
    let buf = vec![byte; size];
    impl_.write_bytes(ptr, &buf);
}

#[cfg(test)]
mod tests {
    use super::*;
    use memalloc::SegregatedAllocator;
    use memheap::SimHeap;
    use memtrace::parse;

    fn tiny_allocator() -> SegregatedAllocator<SimHeap> {
        SegregatedAllocator::new(SimHeap::with_capacity(1 << 16))
    }

    #[test]
    fn a_well_behaved_allocator_passes_a_small_trace() {
        let trace = parse(
            "1000 2 5 0\n\
             a 0 16\n\
             a 1 32\n\
             r 0 64\n\
             f 1\n\
             f 0\n",
        )
        .unwrap();
        let mut a = tiny_allocator();
        assert!(eval_valid(&mut a, &trace, true).is_ok());
    }

    #[test]
    fn overlapping_allocations_are_rejected() {
        use memheap::HeapSubstrate;

        struct BrokenDoubleVend {
            heap: SimHeap,
            handed_out: bool,
        }
        impl MallocImpl for BrokenDoubleVend {
            fn init(&mut self) {
                self.heap.reset();
                self.handed_out = false;
            }
            fn allocate(&mut self, _size: usize) -> Option<usize> {
                if !self.handed_out {
                    self.handed_out = true;
                    Some(self.heap.grow(64).ok()?)
                } else {
                    // Deliberately vend the same offset twice.
                    Some(0)
                }
            }
            fn reallocate(&mut self, ptr: Option<usize>, size: usize) -> Option<usize> {
                match ptr {
                    None => self.allocate(size),
                    Some(p) => Some(p),
                }
            }
            fn free(&mut self, _ptr: usize) {}
            fn check(&self) -> Result<(), memiface::CheckError> {
                Ok(())
            }
            fn heap_low(&self) -> Option<usize> {
                Some(0)
            }
            fn heap_high(&self) -> Option<usize> {
                self.heap.high()
            }
            fn reset(&mut self) {
                self.init();
            }
            fn read_bytes(&self, ptr: usize, out: &mut [u8]) {
                out.copy_from_slice(&self.heap.bytes()[ptr..ptr + out.len()]);
            }
            fn write_bytes(&mut self, ptr: usize, data: &[u8]) {
                self.heap.bytes_mut()[ptr..ptr + data.len()].copy_from_slice(data);
            }
        }

        let trace = parse("1000 2 2 0\na 0 16\na 1 16\n").unwrap();
        let mut bad = BrokenDoubleVend {
            heap: SimHeap::with_capacity(4096),
            handed_out: false,
        };
        let err = eval_valid(&mut bad, &trace, false).unwrap_err();
        assert!(matches!(err, ValidationError::Overlapping { .. }));
    }

    #[test]
    fn realloc_preserves_previously_written_bytes() {
        let trace = parse("1000 1 2 0\na 0 32\nr 0 4096\n").unwrap();
        let mut a = tiny_allocator();
        assert!(eval_valid(&mut a, &trace, false).is_ok());
    }
}
