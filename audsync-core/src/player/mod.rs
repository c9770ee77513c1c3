//! Media Player Adapters
//!
//! The reconciler and host controller drive playback through [`MediaPlayer`]
//! only. Which adapter handles a snapshot is decided by its `source` field.

mod file;
mod video;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::sync::MediaSource;

pub use file::{FilePlayer, Track, TrackCatalog};
pub use video::{BridgeState, ExternalVideoPlayer, VideoBridgeClient, DEFAULT_BRIDGE_PORT};

/// Transport state reported by a player
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    /// Nothing loaded, or loaded but never started
    #[default]
    Unstarted,
    Playing,
    Paused,
    /// Reached the end of the media
    Ended,
}

/// Errors that can occur when driving a player
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The player refuses to start without a prior user gesture
    #[error("Playback blocked until the user interacts")]
    AutoplayBlocked,

    #[error("No media loaded")]
    NoMedia,

    #[error("Unknown media: {0}")]
    UnknownMedia(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Player bridge error: {0}")]
    Bridge(String),
}

impl PlayerError {
    /// Whether the same call may succeed later without user action
    pub fn is_transient(&self) -> bool {
        matches!(self, PlayerError::Http(_) | PlayerError::Bridge(_))
    }
}

/// Capability set shared by every player variant
#[async_trait]
pub trait MediaPlayer: Send + Sync {
    /// Current playback position in seconds
    async fn current_position(&self) -> Result<f64, PlayerError>;

    /// Length of the loaded media in seconds, if known
    async fn duration(&self) -> Result<Option<f64>, PlayerError>;

    async fn seek(&self, position: f64) -> Result<(), PlayerError>;

    async fn play(&self) -> Result<(), PlayerError>;

    async fn pause(&self) -> Result<(), PlayerError>;

    async fn player_state(&self) -> Result<PlayerState, PlayerError>;

    /// Load media by reference; the player ends up paused at 0
    async fn load_media(&self, media_ref: &str) -> Result<(), PlayerError>;

    /// Reference of the media currently loaded
    fn loaded_media(&self) -> Option<String>;

    /// Record a user gesture that allows playback to start
    fn unlock(&self) {}
}

/// The two adapters a client holds, one per media source
#[derive(Clone)]
pub struct Players {
    pub file: Arc<dyn MediaPlayer>,
    pub external_video: Arc<dyn MediaPlayer>,
}

impl Players {
    pub fn new(file: Arc<dyn MediaPlayer>, external_video: Arc<dyn MediaPlayer>) -> Self {
        Self {
            file,
            external_video,
        }
    }

    /// The adapter that renders `source`
    pub fn for_source(&self, source: MediaSource) -> &Arc<dyn MediaPlayer> {
        match source {
            MediaSource::File => &self.file,
            MediaSource::ExternalVideo => &self.external_video,
        }
    }

    /// The adapter that does not render `source`
    pub fn other_than(&self, source: MediaSource) -> &Arc<dyn MediaPlayer> {
        match source {
            MediaSource::File => &self.external_video,
            MediaSource::ExternalVideo => &self.file,
        }
    }

    pub fn all(&self) -> [&Arc<dyn MediaPlayer>; 2] {
        [&self.file, &self.external_video]
    }

    pub fn unlock_all(&self) {
        for player in self.all() {
            player.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn test_transient_classification() {
        assert!(PlayerError::Bridge("connection refused".into()).is_transient());
        assert!(!PlayerError::AutoplayBlocked.is_transient());
        assert!(!PlayerError::UnknownMedia("x".into()).is_transient());
    }

    #[tokio::test]
    async fn test_adapter_selected_by_source() {
        let clock = Arc::new(ManualClock::new(0));
        let catalog = Arc::new(TrackCatalog::new());
        catalog.add(Track::new("t1", "Song", 120.0));

        let file = Arc::new(FilePlayer::new(catalog.clone(), clock.clone()));
        let video = Arc::new(FilePlayer::new(catalog, clock));
        let players = Players::new(file.clone(), video);

        players.for_source(MediaSource::File).load_media("t1").await.unwrap();
        assert_eq!(file.loaded_media().as_deref(), Some("t1"));
        assert!(players.other_than(MediaSource::File).loaded_media().is_none());
    }
}
