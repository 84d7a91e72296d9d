//! # Segregated free-list bookkeeping
//!
//! `CLASS_COUNT` doubly-linked lists, one per size class, each threaded
//! through the free blocks' own payload bytes via `layout::free_link_{next,prev}`.
//! This module only ever manipulates list heads and in-block links; it never
//! touches a block's header or footer, and never reads the heap bytes beyond
//! what's needed to follow a link.

use crate::layout::{self, CLASS_COUNT};

/// The `CLASS_COUNT` free-list heads. `heads[c]` is the offset of the first
/// free block in class `c`, or `None` if that class is empty.
pub struct FreeListTable {
    heads: [Option<usize>; CLASS_COUNT],
    /// Monotonic upper bound on the highest occupied class. Only ever grows
    /// on `insert`; `remove` never lowers it, even if it empties the class
    /// that held the bound. An upward scan that reaches this bound can stop
    /// instead of continuing to `CLASS_COUNT` — empty classes above the true
    /// max, but below this stale cached one, just get skipped for free
    /// since their head is `None`. See the crate-level open question about
    /// this never decreasing.
    max_occupied_class: usize,
}

impl FreeListTable {
    pub fn new() -> Self {
        Self {
            heads: [None; CLASS_COUNT],
            max_occupied_class: 0,
        }
    }

    pub fn reset(&mut self) {
        self.heads = [None; CLASS_COUNT];
        self.max_occupied_class = 0;
    }

    /// The head of class `class`, if any.
    pub fn head(&self, class: usize) -> Option<usize> {
        self.heads[class]
    }

    /// Cached, monotonically non-decreasing upper bound for an upward scan:
    /// every currently-occupied class is `<= this`, but classes at or below
    /// it are not guaranteed to still be occupied.
    pub fn scan_upper_bound(&self) -> usize {
        self.max_occupied_class
    }

    /// The highest class with a non-empty list right now, if any. This is an
    /// exact answer (unlike `scan_upper_bound`) — used by `check` and by the
    /// driver's scoring, which want the truth rather than a fast bound.
    pub fn highest_occupied_class(&self) -> Option<usize> {
        (0..CLASS_COUNT).rev().find(|&c| self.heads[c].is_some())
    }

    /// Link the free block at `block_start` (payload size `payload`) onto
    /// the front of its size class's list.
    pub fn insert(&mut self, bytes: &mut [u8], block_start: usize, payload: usize) {
        let class = layout::size_class(payload);
        let old_head = self.heads[class];

        layout::set_free_link_prev(bytes, block_start, None);
        layout::set_free_link_next(bytes, block_start, old_head);
        if let Some(old) = old_head {
            layout::set_free_link_prev(bytes, old, Some(block_start));
        }
        self.heads[class] = Some(block_start);
        self.max_occupied_class = self.max_occupied_class.max(class);
    }

    /// Unlink the free block at `block_start` (payload size `payload`) from
    /// its size class's list. `block_start` must currently be linked in —
    /// callers always know the class a block belongs to before calling this,
    /// since every free block's class is recomputed from its own payload.
    pub fn remove(&mut self, bytes: &mut [u8], block_start: usize, payload: usize) {
        let class = layout::size_class(payload);
        let prev = layout::free_link_prev(bytes, block_start);
        let next = layout::free_link_next(bytes, block_start);

        match prev {
            Some(p) => layout::set_free_link_next(bytes, p, next),
            None => self.heads[class] = next,
        }
        if let Some(n) = next {
            layout::set_free_link_prev(bytes, n, prev);
        }
    }
}

impl Default for FreeListTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::set_header;

    fn block(payload: usize) -> usize {
        payload
    }

    #[test]
    fn insert_then_head_finds_it_in_the_right_class() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 4096];
        set_header(&mut heap, 0, 64, true);
        table.insert(&mut heap, 0, 64);
        assert_eq!(table.head(layout::size_class(64)), Some(0));
    }

    #[test]
    fn insert_two_in_same_class_front_links_the_newest() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 4096];
        set_header(&mut heap, 0, 64, true);
        set_header(&mut heap, 200, 64, true);
        table.insert(&mut heap, 0, 64);
        table.insert(&mut heap, 200, 64);

        let class = layout::size_class(64);
        assert_eq!(table.head(class), Some(200));
        assert_eq!(layout::free_link_next(&heap, 200), Some(0));
        assert_eq!(layout::free_link_prev(&heap, 0), Some(200));
    }

    #[test]
    fn remove_middle_element_relinks_neighbors() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 4096];
        for off in [0usize, 200, 400] {
            set_header(&mut heap, off, 64, true);
            table.insert(&mut heap, off, 64);
        }
        // list is now 400 -> 200 -> 0
        table.remove(&mut heap, 200, 64);
        assert_eq!(layout::free_link_next(&heap, 400), Some(0));
        assert_eq!(layout::free_link_prev(&heap, 0), Some(400));
    }

    #[test]
    fn remove_head_updates_class_head() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 4096];
        set_header(&mut heap, 0, block(64), true);
        table.insert(&mut heap, 0, 64);
        table.remove(&mut heap, 0, 64);
        assert_eq!(table.head(layout::size_class(64)), None);
    }

    #[test]
    fn highest_occupied_class_tracks_the_largest_free_block() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 8192];
        set_header(&mut heap, 0, 64, true);
        set_header(&mut heap, 200, 4096, true);
        table.insert(&mut heap, 0, 64);
        table.insert(&mut heap, 200, 4096);
        assert_eq!(table.highest_occupied_class(), Some(layout::size_class(4096)));
    }

    #[test]
    fn scan_upper_bound_never_decreases_after_a_remove() {
        let mut table = FreeListTable::new();
        let mut heap = vec![0u8; 8192];
        set_header(&mut heap, 0, 4096, true);
        table.insert(&mut heap, 0, 4096);
        let bound_before = table.scan_upper_bound();
        table.remove(&mut heap, 0, 4096);
        assert_eq!(table.scan_upper_bound(), bound_before, "removing the only block in the top class must not lower the cached bound");
        assert_eq!(table.highest_occupied_class(), None, "but the exact query correctly sees the table is now empty");
    }
}
