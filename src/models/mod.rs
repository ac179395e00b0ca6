//! Data models for presence snapshots and transport events.

pub mod event;
pub mod presence;

pub use event::*;
pub use presence::*;
