use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::ops::{Add, BitOr, Sub};

/// Bounds every entity key must satisfy.
///
/// Keys are opaque to the engine: copied freely, hashed into the relation
/// store, and totally ordered so that index ties and event fan-out are
/// deterministic.
pub trait AoiKey: Copy + Ord + Hash + fmt::Debug {}

impl<T: Copy + Ord + Hash + fmt::Debug> AoiKey for T {}

/// Bounds every coordinate scalar must satisfy.
///
/// `Default::default()` is the zero used for range clamping. Floating-point
/// coordinates are supported; NaN is excluded by contract (comparisons
/// against NaN would silently drop entries from the ordered indexes).
pub trait Coord:
    Copy + PartialOrd + Default + Add<Output = Self> + Sub<Output = Self> + fmt::Debug
{
}

impl<T: Copy + PartialOrd + Default + Add<Output = T> + Sub<Output = T> + fmt::Debug> Coord for T {}

/// Bitmask over the two independent entity roles.
///
/// A watcher observes others; a maker can be observed. An entity may be
/// either, both, or neither (neither is still tracked for position queries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchRole(u8);

impl WatchRole {
    pub const NONE: Self = Self(0);
    pub const WATCHER: Self = Self(1);
    pub const MAKER: Self = Self(2);
    pub const BOTH: Self = Self(3);

    pub fn is_watcher(self) -> bool {
        self.0 & Self::WATCHER.0 != 0
    }

    pub fn is_maker(self) -> bool {
        self.0 & Self::MAKER.0 != 0
    }
}

impl BitOr for WatchRole {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Discriminant of an event delivered to the engine callback.
///
/// `User` carries a caller-chosen id for broadcast events; the engine never
/// generates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Enter,
    Leave,
    Move,
    User(i32),
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Enter => write!(f, "ENTER"),
            EventKind::Leave => write!(f, "LEAVE"),
            EventKind::Move => write!(f, "MOVE"),
            EventKind::User(id) => write!(f, "USER({id})"),
        }
    }
}

/// Event record handed to the callback.
///
/// `pos` is the sender's position (for MOVE, the new position) and `pos_from`
/// is only meaningful for MOVE events, where it holds the previous position.
/// `userdata` is an opaque passthrough for user-originated broadcasts; engine
/// events leave it zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AoiEvent<P, const D: usize> {
    pub kind: EventKind,
    pub pos: [P; D],
    pub pos_from: [P; D],
    pub userdata: u64,
}

impl<P: Copy, const D: usize> AoiEvent<P, D> {
    pub fn enter(pos: [P; D]) -> Self {
        Self {
            kind: EventKind::Enter,
            pos,
            pos_from: pos,
            userdata: 0,
        }
    }

    pub fn leave(pos: [P; D]) -> Self {
        Self {
            kind: EventKind::Leave,
            pos,
            pos_from: pos,
            userdata: 0,
        }
    }

    pub fn movement(pos: [P; D], pos_from: [P; D]) -> Self {
        Self {
            kind: EventKind::Move,
            pos,
            pos_from,
            userdata: 0,
        }
    }

    pub fn user(id: i32, pos: [P; D]) -> Self {
        Self {
            kind: EventKind::User(id),
            pos,
            pos_from: pos,
            userdata: 0,
        }
    }
}
