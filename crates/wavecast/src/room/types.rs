//! Shared types for the room system.

use std::ops::BitOr;

/// Lifecycle notifications a [`RoomManager`](super::RoomManager) can fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEvent {
    /// A room was created by its first join.
    Created,
    /// A room lost its last member and was dropped from the table.
    Removed,
}

/// Per-connection option bits tracked by the room manager.
///
/// Options live on the connection's membership record, not on any single
/// room: they describe how the manager treats the connection across all of
/// its memberships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionOptions(u32);

impl ConnectionOptions {
    /// No options set.
    pub const NONE: Self = Self(0);

    /// Close the connection when it leaves its last room.
    pub const CLOSE_ON_LAST_LEAVE: Self = Self(1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ConnectionOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
