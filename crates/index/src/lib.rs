//! Ordered-value index: an indexed skip list over `(key, value)` pairs.
//!
//! # Invariants
//! - Entries are totally ordered by `(value, key)`; value ties break on key,
//!   so removal of an exact pair is deterministic.
//! - Point operations are O(log N); range enumeration is O(log N + matches)
//!   and streams entries in ascending order together with their rank.
//! - Nodes live in a slab `Vec` with a free list; indices stay stable across
//!   unrelated mutations and no `unsafe` is involved.

mod skiplist;

pub use skiplist::RankedList;

pub fn crate_info() -> &'static str {
    "aoispace-index v0.1.0"
}
