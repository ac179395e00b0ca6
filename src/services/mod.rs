//! Business logic: presence store, its sweeper, and room fan-out.

pub mod presence;
pub mod room_hub;
pub(crate) mod sweeper;

pub use presence::{Eviction, PresenceConfig, PresenceStore, SweepReport};
pub use room_hub::RoomHub;
