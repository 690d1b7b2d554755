//! Area-of-interest group: who can see whom in a box-ranged world.
//!
//! Maintains, for a dynamic population of keyed points in a fixed-dimension
//! space, the bidirectional relation "watcher W sees maker M" together with
//! ENTER / LEAVE / MOVE events emitted inline whenever the relation changes.
//! Visibility is a strictly open axis-aligned box per watcher; moves pick
//! between a full recompute and a differential slab shift by estimated cost.
//!
//! # Invariants
//! - Relation sets always match the visibility predicate after every public
//!   operation; reciprocal membership is symmetric.
//! - Within one operation, LEAVE events precede MOVE, which precede ENTER.
//! - The callback runs inline on the caller's stack and cannot re-enter the
//!   engine.
//!
//! ```
//! use aoispace_group::{AoiGroup, WatchRole};
//!
//! let mut group: AoiGroup<u32, i64, 2> = AoiGroup::new([20, 20]);
//! group.set_callback(|receiver, sender, event| {
//!     println!("{sender} -> {receiver}: {}", event.kind);
//! });
//!
//! group.enter(1, [0, 0], WatchRole::BOTH, [10, 10]).unwrap();
//! group.enter(2, [5, 5], WatchRole::BOTH, [10, 10]).unwrap();
//! group.move_to(&2, [6, 5]).unwrap();
//! assert_eq!(group.makers_of(&1).unwrap(), vec![2]);
//! group.leave(&2).unwrap();
//! assert!(group.makers_of(&1).unwrap().is_empty());
//! ```

mod diff;
mod element;
mod error;
mod group;
mod query;

pub use aoispace_common::{AoiEvent, AoiKey, Coord, EventKind, WatchRole};
pub use error::AoiError;
pub use group::{AoiGroup, EventCallback};

pub fn crate_info() -> &'static str {
    "aoispace-group v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("group"));
    }
}
