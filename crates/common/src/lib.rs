//! Shared vocabulary for the aoispace crates: key/coordinate bounds,
//! watch roles, and the event record delivered to callbacks.

mod types;

pub use types::{AoiEvent, AoiKey, Coord, EventKind, WatchRole};

pub fn crate_info() -> &'static str {
    "aoispace-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
