//! # Segregated free-list allocator
//!
//! A general-purpose dynamic memory allocator over any [`memheap::HeapSubstrate`]:
//! an unbounded first-fit walk within a request's own size class, refined by
//! a best-of-K local search, promotion to the next non-empty class when the
//! current one has no fit, split-if-the-remainder-is-worth-it, and
//! boundary-tag coalescing on free.
//!
//! ```text
//! layout      — header/footer boundary tags, alignment, size-class hashing
//! free_list   — the CLASS_COUNT doubly linked free lists threaded through
//!               free blocks' own payload bytes
//! engine      — SegregatedAllocator<H>, implementing memiface::MallocImpl
//! ```
//!
//! The module boundary between `layout` and everything else is the crate's
//! one narrow unsafe-adjacent seam: `layout` is the only place that
//! reinterprets raw heap bytes as a header, a footer, or a pair of free-list
//! links. Everything above it only ever calls through those functions.
#![cfg_attr(not(test), no_std)]

pub mod engine;
pub mod free_list;
pub mod layout;

pub use engine::SegregatedAllocator;
