//! Shared Playback Store and Presence Directory
//!
//! Both are externally owned records reached through these traits; the engine
//! never assumes a storage technology. Writes are unconditional overwrites
//! (last writer wins) and subscriptions deliver the latest value.

mod memory;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::sync::{Device, PlaybackState};

pub use memory::{MemoryBackend, MemoryPlaybackStore, MemoryPresenceDirectory, MemoryRoom};

/// Errors from store and directory operations; all are treated as transient
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Malformed record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Presence records keyed by device id
pub type DeviceMap = BTreeMap<String, Device>;

/// The per-room authoritative playback record
#[async_trait]
pub trait PlaybackStore: Send + Sync {
    /// Read the current record
    async fn read(&self) -> Result<PlaybackState, StoreError>;

    /// Replace the whole record in one write
    async fn write_all(&self, snapshot: PlaybackState) -> Result<(), StoreError>;

    /// Receive the record every time it changes
    fn subscribe(&self) -> watch::Receiver<PlaybackState>;
}

/// The per-room set of device presence records
#[async_trait]
pub trait PresenceDirectory: Send + Sync {
    /// Create or merge a device record. An existing record keeps its `is_host` flag.
    async fn upsert(&self, device: Device) -> Result<(), StoreError>;

    /// Change the display name of an existing record
    async fn rename(&self, device_id: &str, display_name: &str) -> Result<(), StoreError>;

    /// Delete a record; deleting a missing record is not an error
    async fn remove(&self, device_id: &str) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<Device>, StoreError>;

    /// Receive the full directory every time it changes
    fn subscribe(&self) -> watch::Receiver<DeviceMap>;
}

/// Everything a client needs to take part in one room
#[derive(Clone)]
pub struct RoomLinks {
    /// Identity of the room's host, fixed at creation
    pub host_id: String,
    pub playback: Arc<dyn PlaybackStore>,
    pub presence: Arc<dyn PresenceDirectory>,
    /// Dedicated (server - local) offset signal in ms, when the backend has one
    pub offset_signal: Option<watch::Receiver<i64>>,
}
