//! File player
//!
//! A software transport over the room's track catalog. Position is derived
//! from an anchor (position, local time) and advances at `rate` while
//! playing, so a rate other than 1.0 models a device whose audio clock runs
//! fast or slow.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{MediaPlayer, PlayerError, PlayerState};
use crate::clock::SharedClock;

/// An uploaded audio file available to the room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    /// Where the file lives in external storage
    pub storage_path: String,
    pub title: String,
    pub artist: Option<String>,
    /// Length in seconds
    pub duration: f64,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, duration: f64) -> Self {
        let id = id.into();
        Self {
            storage_path: format!("tracks/{}", id),
            id,
            title: title.into(),
            artist: None,
            duration: valid_duration(duration),
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }
}

/// Negative or NaN lengths count as empty media
fn valid_duration(duration: f64) -> f64 {
    if duration.is_nan() {
        0.0
    } else {
        duration.max(0.0)
    }
}

/// Tracks available to a room, ordered by id
#[derive(Debug, Default)]
pub struct TrackCatalog {
    tracks: RwLock<BTreeMap<String, Track>>,
}

impl TrackCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, mut track: Track) {
        track.duration = valid_duration(track.duration);
        self.tracks.write().insert(track.id.clone(), track);
    }

    pub fn get(&self, id: &str) -> Option<Track> {
        self.tracks.read().get(id).cloned()
    }

    /// Track with the lowest id
    pub fn first(&self) -> Option<Track> {
        self.tracks.read().values().next().cloned()
    }

    pub fn list(&self) -> Vec<Track> {
        self.tracks.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }
}

#[derive(Debug, Default)]
struct Transport {
    loaded: Option<Track>,
    state: PlayerState,
    /// Position (seconds) at `anchor_ms`
    anchor_position: f64,
    /// Local clock time of the anchor
    anchor_ms: u64,
}

/// Plays catalog tracks against a local clock
pub struct FilePlayer {
    catalog: Arc<TrackCatalog>,
    clock: SharedClock,
    rate: f64,
    requires_gesture: bool,
    unlocked: AtomicBool,
    transport: Mutex<Transport>,
}

impl FilePlayer {
    pub fn new(catalog: Arc<TrackCatalog>, clock: SharedClock) -> Self {
        Self {
            catalog,
            clock,
            rate: 1.0,
            requires_gesture: false,
            unlocked: AtomicBool::new(false),
            transport: Mutex::new(Transport::default()),
        }
    }

    /// Playback speed relative to real time
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate.max(0.0);
        self
    }

    /// Refuse `play()` until [`MediaPlayer::unlock`] is called
    pub fn with_autoplay_policy(mut self, requires_gesture: bool) -> Self {
        self.requires_gesture = requires_gesture;
        self
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    fn position_at(&self, transport: &Transport, now_ms: u64) -> f64 {
        let duration = transport.loaded.as_ref().map_or(0.0, |t| t.duration);
        match transport.state {
            PlayerState::Playing => {
                let elapsed = now_ms.saturating_sub(transport.anchor_ms) as f64 / 1000.0;
                (transport.anchor_position + elapsed * self.rate).min(duration)
            }
            _ => transport.anchor_position,
        }
    }

    /// Move the anchor to now, switching to Ended if the track ran out
    fn settle(&self, transport: &mut Transport) {
        let now = self.clock.now_ms();
        let position = self.position_at(transport, now);
        transport.anchor_position = position;
        transport.anchor_ms = now;

        if transport.state == PlayerState::Playing {
            let duration = transport.loaded.as_ref().map_or(0.0, |t| t.duration);
            if position >= duration {
                debug!("File player reached end of track at {:.2}s", position);
                transport.state = PlayerState::Ended;
            }
        }
    }
}

#[async_trait]
impl MediaPlayer for FilePlayer {
    async fn current_position(&self) -> Result<f64, PlayerError> {
        let mut transport = self.transport.lock();
        self.settle(&mut transport);
        Ok(transport.anchor_position)
    }

    async fn duration(&self) -> Result<Option<f64>, PlayerError> {
        Ok(self.transport.lock().loaded.as_ref().map(|t| t.duration))
    }

    async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        let mut transport = self.transport.lock();
        self.settle(&mut transport);
        let duration = match &transport.loaded {
            Some(track) => track.duration,
            None => return Err(PlayerError::NoMedia),
        };

        transport.anchor_position = position.clamp(0.0, duration);
        if transport.state == PlayerState::Ended && transport.anchor_position < duration {
            transport.state = PlayerState::Paused;
        }
        Ok(())
    }

    async fn play(&self) -> Result<(), PlayerError> {
        let mut transport = self.transport.lock();
        if transport.loaded.is_none() {
            return Err(PlayerError::NoMedia);
        }
        if self.requires_gesture && !self.unlocked.load(Ordering::SeqCst) {
            return Err(PlayerError::AutoplayBlocked);
        }

        self.settle(&mut transport);
        if transport.state == PlayerState::Ended {
            transport.anchor_position = 0.0;
        }
        transport.state = PlayerState::Playing;
        Ok(())
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        let mut transport = self.transport.lock();
        self.settle(&mut transport);
        if transport.loaded.is_some() && transport.state != PlayerState::Ended {
            transport.state = PlayerState::Paused;
        }
        Ok(())
    }

    async fn player_state(&self) -> Result<PlayerState, PlayerError> {
        let mut transport = self.transport.lock();
        self.settle(&mut transport);
        Ok(transport.state)
    }

    async fn load_media(&self, media_ref: &str) -> Result<(), PlayerError> {
        let track = self
            .catalog
            .get(media_ref)
            .ok_or_else(|| PlayerError::UnknownMedia(media_ref.to_string()))?;

        debug!("File player loading '{}' ({:.0}s)", track.title, track.duration);
        let mut transport = self.transport.lock();
        *transport = Transport {
            loaded: Some(track),
            state: PlayerState::Paused,
            anchor_position: 0.0,
            anchor_ms: self.clock.now_ms(),
        };
        Ok(())
    }

    fn loaded_media(&self) -> Option<String> {
        self.transport.lock().loaded.as_ref().map(|t| t.id.clone())
    }

    fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
    }
}
