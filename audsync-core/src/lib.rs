//! audsync - Core Library
//!
//! Keeps media playback aligned across the devices in a room. One host
//! writes the authoritative playback snapshot to a shared store; every
//! client projects it onto the server clock and corrects its local player
//! when drift grows past a threshold.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod player;
pub mod presence;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use clock::{Clock, ClockOffsetEstimator, ManualClock, SharedClock, SkewedClock, SystemClock};
pub use config::SyncConfig;
pub use controller::{HostController, SessionDeps};
pub use error::SyncError;
pub use presence::DeviceIdentity;
pub use reconciler::SyncStatus;
pub use session::{init_tracing, init_tracing_with, RoomSession, SessionEvent, SessionHandle};
pub use store::{MemoryBackend, RoomLinks};
pub use sync::{Device, HostCommand, MediaSource, PlaybackState, PlaybackStatus, RoomCode};
