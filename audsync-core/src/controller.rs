//! Host Controller
//!
//! Turns host intents into new authoritative snapshots. Every command writes
//! exactly one complete snapshot (or nothing, when it is refused or fails
//! before the write) stamped with a fresh server time. Callers other than the
//! host are refused without touching the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::SharedClockOffset;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::media::{MetadataLookup, VideoId};
use crate::player::{MediaPlayer, PlayerError, Players, TrackCatalog};
use crate::reconciler::LocalState;
use crate::store::PlaybackStore;
use crate::sync::{HostCommand, MediaSource, PlaybackState, PlaybackStatus};

/// Collaborators a client brings into a room
#[derive(Clone)]
pub struct SessionDeps {
    pub players: Players,
    pub catalog: Arc<TrackCatalog>,
    pub lookup: Arc<dyn MetadataLookup>,
}

struct Inner {
    is_host: bool,
    playback: Arc<dyn PlaybackStore>,
    players: Players,
    catalog: Arc<TrackCatalog>,
    lookup: Arc<dyn MetadataLookup>,
    offset: SharedClockOffset,
    local: Arc<LocalState>,
    seek_guard: Duration,
    active: AtomicBool,
}

/// Host-only playback commands
#[derive(Clone)]
pub struct HostController {
    inner: Arc<Inner>,
}

impl HostController {
    pub fn new(
        is_host: bool,
        playback: Arc<dyn PlaybackStore>,
        deps: &SessionDeps,
        offset: SharedClockOffset,
        local: Arc<LocalState>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                is_host,
                playback,
                players: deps.players.clone(),
                catalog: deps.catalog.clone(),
                lookup: deps.lookup.clone(),
                offset,
                local,
                seek_guard: config.seek_guard(),
                active: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_host(&self) -> bool {
        self.inner.is_host
    }

    /// Refuse all further commands; in-flight ones are dropped before writing
    pub fn deactivate(&self) {
        self.inner.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    pub async fn execute(&self, command: HostCommand) -> Result<(), SyncError> {
        debug!("Host command: {}", command.name());
        match command {
            HostCommand::Play => self.play().await,
            HostCommand::Pause => self.pause().await,
            HostCommand::Toggle => self.toggle().await,
            HostCommand::Seek { position } => self.seek(position).await,
            HostCommand::LoadMedia { reference } => self.load_media(&reference).await,
            HostCommand::LoadTrack { track_id } => self.load_track(&track_id).await,
            HostCommand::SetVolume { volume } => self.set_volume(volume).await,
        }
    }

    /// Start playback from the host player's current position. With nothing
    /// loaded, the first catalog track is loaded and started in the same write.
    pub async fn play(&self) -> Result<(), SyncError> {
        self.authorize("play")?;
        let current = self.inner.playback.read().await?;

        if current.media_ref.is_none() {
            return self.play_first_track(&current).await;
        }

        let now = self.server_now();
        let player = self.inner.players.for_source(current.source);
        let position = self.host_position(player.as_ref(), &current, now).await?;

        let next = current.with_transport(PlaybackStatus::Playing, position, now);
        self.commit(next.clone()).await?;
        self.prime(&next).await?;
        start(player.as_ref()).await
    }

    /// Pause at the host player's current position
    pub async fn pause(&self) -> Result<(), SyncError> {
        self.authorize("pause")?;
        let current = self.inner.playback.read().await?;
        let now = self.server_now();
        let player = self.inner.players.for_source(current.source);
        let position = self.host_position(player.as_ref(), &current, now).await?;

        self.commit(current.with_transport(PlaybackStatus::Paused, position, now))
            .await?;
        if player.loaded_media().is_some() {
            player.pause().await?;
        }
        Ok(())
    }

    pub async fn toggle(&self) -> Result<(), SyncError> {
        self.authorize("toggle")?;
        if self.inner.playback.read().await?.is_playing() {
            self.pause().await
        } else {
            self.play().await
        }
    }

    /// Jump to `position` seconds, keeping the transport state
    pub async fn seek(&self, position: f64) -> Result<(), SyncError> {
        self.authorize("seek")?;
        let position = position.max(0.0);

        // Local player first so the host hears the seek immediately
        self.inner.local.arm_seek_guard(self.inner.seek_guard);
        let current = self.inner.playback.read().await?;
        let player = self.inner.players.for_source(current.source);
        if player.loaded_media().is_some() {
            player.seek(position).await?;
        }

        let now = self.server_now();
        self.commit(current.with_transport(current.state, position, now))
            .await
    }

    /// Load an external video by URL or id, resolving its display metadata first
    pub async fn load_media(&self, reference: &str) -> Result<(), SyncError> {
        self.authorize("load_media")?;
        let video = VideoId::parse(reference)
            .ok_or_else(|| SyncError::InvalidMediaReference(reference.to_string()))?;

        let metadata = self.inner.lookup.lookup(&video).await.map_err(|e| {
            warn!("Metadata lookup for {} failed: {}", video, e);
            SyncError::from(e)
        })?;

        if !self.is_active() {
            debug!("Discarding lookup result for {} after leaving", video);
            return Err(SyncError::Departed);
        }

        let current = self.inner.playback.read().await?;
        let next = PlaybackState {
            state: PlaybackStatus::Paused,
            source: MediaSource::ExternalVideo,
            media_ref: Some(video.to_string()),
            display_title: Some(metadata.title),
            display_artist: Some(metadata.author),
            position: 0.0,
            timestamp: self.server_now(),
            volume: current.volume,
        };

        info!("Loading video {} ({:?})", video, next.display_title);
        self.commit(next.clone()).await?;
        self.prime(&next).await
    }

    /// Load a track from the room's catalog, paused at the start
    pub async fn load_track(&self, track_id: &str) -> Result<(), SyncError> {
        self.authorize("load_track")?;
        let track = self
            .inner
            .catalog
            .get(track_id)
            .ok_or_else(|| SyncError::InvalidMediaReference(track_id.to_string()))?;

        let current = self.inner.playback.read().await?;
        let next = PlaybackState {
            state: PlaybackStatus::Paused,
            source: MediaSource::File,
            media_ref: Some(track.id),
            display_title: Some(track.title),
            display_artist: track.artist,
            position: 0.0,
            timestamp: self.server_now(),
            volume: current.volume,
        };

        self.commit(next.clone()).await?;
        self.prime(&next).await
    }

    /// Set the shared volume hint (clamped to 0..1)
    pub async fn set_volume(&self, volume: f64) -> Result<(), SyncError> {
        self.authorize("set_volume")?;
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };

        let current = self.inner.playback.read().await?;
        let now = self.server_now();
        let player = self.inner.players.for_source(current.source);
        let position = self.host_position(player.as_ref(), &current, now).await?;

        self.commit(PlaybackState {
            volume: Some(volume),
            ..current.with_transport(current.state, position, now)
        })
        .await
    }

    fn authorize(&self, command: &str) -> Result<(), SyncError> {
        if !self.is_active() {
            return Err(SyncError::NotInRoom);
        }
        if !self.inner.is_host {
            warn!("Refusing {} from a non-host client", command);
            return Err(SyncError::NotAuthorized);
        }
        Ok(())
    }

    fn server_now(&self) -> u64 {
        self.inner.offset.read().server_now_ms()
    }

    /// Position to publish: the host player's, or the projected one when the
    /// player doesn't hold the current media
    async fn host_position(
        &self,
        player: &dyn MediaPlayer,
        current: &PlaybackState,
        now: u64,
    ) -> Result<f64, SyncError> {
        if current.media_ref.is_some() && player.loaded_media() == current.media_ref {
            Ok(player.current_position().await?)
        } else {
            Ok(current.expected_position(now))
        }
    }

    /// Write one complete snapshot and remember it as our own
    async fn commit(&self, snapshot: PlaybackState) -> Result<(), SyncError> {
        if !self.is_active() {
            return Err(SyncError::Departed);
        }
        // Marked first: stores may notify listeners before the write returns
        self.inner.local.note_own_write(snapshot.timestamp);
        self.inner.playback.write_all(snapshot).await?;
        Ok(())
    }

    /// Make the host's local players match `snapshot`'s media and position
    async fn prime(&self, snapshot: &PlaybackState) -> Result<(), SyncError> {
        let Some(media_ref) = snapshot.media_ref.as_deref() else {
            return Ok(());
        };

        let other = self.inner.players.other_than(snapshot.source);
        if other.loaded_media().is_some() {
            other.pause().await?;
        }

        let player = self.inner.players.for_source(snapshot.source);
        let fresh = player.loaded_media().as_deref() != Some(media_ref);
        if fresh {
            player.load_media(media_ref).await?;
        }
        if !snapshot.is_playing() {
            player.pause().await?;
        }
        if fresh || !snapshot.is_playing() {
            player.seek(snapshot.position).await?;
        }
        Ok(())
    }

    async fn play_first_track(&self, current: &PlaybackState) -> Result<(), SyncError> {
        let track = self.inner.catalog.first().ok_or(SyncError::NoMedia)?;
        info!("Nothing loaded, starting first track '{}'", track.title);

        let next = PlaybackState {
            state: PlaybackStatus::Playing,
            source: MediaSource::File,
            media_ref: Some(track.id),
            display_title: Some(track.title),
            display_artist: track.artist,
            position: 0.0,
            timestamp: self.server_now(),
            volume: current.volume,
        };
        self.commit(next.clone()).await?;
        self.prime(&next).await?;
        start(self.inner.players.file.as_ref()).await
    }
}

/// Start the host's own player; the host command itself counts as the user gesture
async fn start(player: &dyn MediaPlayer) -> Result<(), SyncError> {
    player.unlock();
    match player.play().await {
        Ok(()) => Ok(()),
        Err(PlayerError::AutoplayBlocked) => Err(SyncError::PlayerAutoplayBlocked),
        Err(e) => Err(e.into()),
    }
}
