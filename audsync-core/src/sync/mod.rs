//! Sync Model
//!
//! The authoritative playback record, device presence records and the host
//! command protocol.

mod protocol;
mod room_code;
mod state;

pub use protocol::*;
pub use room_code::RoomCode;
pub use state::*;
