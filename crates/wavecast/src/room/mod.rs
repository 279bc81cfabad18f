//! Named broadcast rooms.
//!
//! A [`Room`] is an independent task owning a set of member connections; a
//! [`RoomManager`] creates rooms lazily on first join, reference-counts
//! membership and removes each room when its last member leaves.

pub mod manager;
pub mod room;
pub mod types;


pub use manager::RoomManager;
pub use room::Room;
pub use types::{ConnectionOptions, RoomEvent};
