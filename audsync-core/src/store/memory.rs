//! In-process store backend
//!
//! Keeps each room's playback record as a JSON document (the same shape a
//! remote document store would hold) and fans changes out over watch
//! channels. The backend owns the authoritative clock and publishes each
//! connected client's offset from it.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{DeviceMap, PlaybackStore, PresenceDirectory, RoomLinks, StoreError};
use crate::clock::SharedClock;
use crate::sync::{Device, PlaybackState, RoomCode};

/// Playback record held in memory
pub struct MemoryPlaybackStore {
    document: RwLock<serde_json::Value>,
    tx: watch::Sender<PlaybackState>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl MemoryPlaybackStore {
    pub fn new(initial: PlaybackState) -> Result<Self, StoreError> {
        let document = serde_json::to_value(&initial)?;
        let (tx, _) = watch::channel(initial);
        Ok(Self {
            document: RwLock::new(document),
            tx,
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        })
    }

    /// Simulate the store going offline (reads and writes fail) or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// The raw record as stored
    pub fn document(&self) -> serde_json::Value {
        self.document.read().clone()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("playback store offline".to_string()))
        }
    }
}

#[async_trait]
impl PlaybackStore for MemoryPlaybackStore {
    async fn read(&self) -> Result<PlaybackState, StoreError> {
        self.check_available()?;
        let document = self.document.read().clone();
        Ok(serde_json::from_value(document)?)
    }

    async fn write_all(&self, snapshot: PlaybackState) -> Result<(), StoreError> {
        self.check_available()?;

        // Reject anything that would not read back (e.g. a NaN position)
        let document = serde_json::to_value(&snapshot)?;
        let stored: PlaybackState = serde_json::from_value(document.clone())?;

        *self.document.write() = document;
        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Playback record written: {:?} at {:.2}s (ts={})",
            stored.state, stored.position, stored.timestamp
        );
        self.tx.send_replace(stored);
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.tx.subscribe()
    }
}

/// Presence directory held in memory
pub struct MemoryPresenceDirectory {
    devices: RwLock<DeviceMap>,
    tx: watch::Sender<DeviceMap>,
    available: AtomicBool,
}

impl MemoryPresenceDirectory {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(DeviceMap::new());
        Self {
            devices: RwLock::new(DeviceMap::new()),
            tx,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.read().get(device_id).cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("presence directory offline".to_string()))
        }
    }
}

impl Default for MemoryPresenceDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PresenceDirectory for MemoryPresenceDirectory {
    async fn upsert(&self, device: Device) -> Result<(), StoreError> {
        self.check_available()?;
        let mut devices = self.devices.write();
        match devices.get_mut(&device.id) {
            Some(existing) => {
                existing.display_name = device.display_name;
                existing.last_seen = device.last_seen;
            }
            None => {
                debug!("Presence record created for {}", device.id);
                devices.insert(device.id.clone(), device);
            }
        }
        self.tx.send_replace(devices.clone());
        Ok(())
    }

    async fn rename(&self, device_id: &str, display_name: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut devices = self.devices.write();
        if let Some(device) = devices.get_mut(device_id) {
            device.display_name = display_name.to_string();
            self.tx.send_replace(devices.clone());
        }
        Ok(())
    }

    async fn remove(&self, device_id: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut devices = self.devices.write();
        if devices.remove(device_id).is_some() {
            debug!("Presence record removed for {}", device_id);
            self.tx.send_replace(devices.clone());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Device>, StoreError> {
        self.check_available()?;
        Ok(self.devices.read().values().cloned().collect())
    }

    fn subscribe(&self) -> watch::Receiver<DeviceMap> {
        self.tx.subscribe()
    }
}

/// One room held by the in-memory backend
pub struct MemoryRoom {
    pub code: RoomCode,
    pub host_id: String,
    /// Server time (ms) at creation
    pub created_at: u64,
    pub playback: Arc<MemoryPlaybackStore>,
    pub presence: Arc<MemoryPresenceDirectory>,
}

/// A connected client's clock and the channel carrying its offset
struct OffsetLink {
    client_clock: SharedClock,
    tx: watch::Sender<i64>,
}

/// In-process rooms sharing one authoritative clock
pub struct MemoryBackend {
    server_clock: SharedClock,
    rooms: RwLock<HashMap<RoomCode, Arc<MemoryRoom>>>,
    offset_links: Mutex<Vec<OffsetLink>>,
}

impl MemoryBackend {
    pub fn new(server_clock: SharedClock) -> Self {
        Self {
            server_clock,
            rooms: RwLock::new(HashMap::new()),
            offset_links: Mutex::new(Vec::new()),
        }
    }

    /// Authoritative time in ms
    pub fn server_now_ms(&self) -> u64 {
        self.server_clock.now_ms()
    }

    /// Create a room owned by `host_id`, starting paused with nothing loaded
    pub fn create_room(&self, host_id: &str) -> Result<RoomCode, StoreError> {
        let mut rooms = self.rooms.write();
        let code = loop {
            let candidate = RoomCode::random();
            if !rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = self.server_now_ms();
        let room = MemoryRoom {
            code: code.clone(),
            host_id: host_id.to_string(),
            created_at: now,
            playback: Arc::new(MemoryPlaybackStore::new(PlaybackState::initial(now))?),
            presence: Arc::new(MemoryPresenceDirectory::new()),
        };
        rooms.insert(code.clone(), Arc::new(room));

        info!("Created room {} for host {}", code, host_id);
        Ok(code)
    }

    pub fn open_room(&self, code: &RoomCode) -> Result<Arc<MemoryRoom>, StoreError> {
        self.rooms
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| StoreError::RoomNotFound(code.to_string()))
    }

    /// Connect a client (identified by its local clock) to a room
    pub fn connect(&self, code: &RoomCode, client_clock: SharedClock) -> Result<RoomLinks, StoreError> {
        let room = self.open_room(code)?;

        let offset = self.offset_for(&client_clock);
        let (tx, rx) = watch::channel(offset);
        self.offset_links.lock().push(OffsetLink { client_clock, tx });

        Ok(RoomLinks {
            host_id: room.host_id.clone(),
            playback: room.playback.clone(),
            presence: room.presence.clone(),
            offset_signal: Some(rx),
        })
    }

    /// Recompute and publish every connected client's offset
    pub fn refresh_offsets(&self) {
        let mut links = self.offset_links.lock();
        links.retain(|link| !link.tx.is_closed());
        for link in links.iter() {
            let offset = self.offset_for(&link.client_clock);
            link.tx.send_replace(offset);
        }
    }

    fn offset_for(&self, client_clock: &SharedClock) -> i64 {
        self.server_now_ms() as i64 - client_clock.now_ms() as i64
    }
}
