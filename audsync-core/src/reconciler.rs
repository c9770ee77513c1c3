//! Playback Reconciler
//!
//! Keeps the local player aligned with the authoritative snapshot. Runs on
//! every notification and on a periodic tick while playing:
//!
//! - load the snapshot's media if the adapter holds something else
//! - project the expected position on the server clock
//! - hard-seek only when drift exceeds the threshold for the transport state
//! - bring the transport to the snapshot's state, without force-playing a
//!   player that has ended or that refused to start without a user gesture

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::SharedClockOffset;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::player::{PlayerError, PlayerState, Players};
use crate::sync::{MediaSource, PlaybackState, PlaybackStatus};

/// Client-local bookkeeping shared by the reconciler and the host controller
#[derive(Debug, Default)]
pub struct LocalState {
    seek_guard_until: Mutex<Option<Instant>>,
    /// Timestamp of the newest snapshot this client wrote itself
    last_own_write: Mutex<Option<u64>>,
}

impl LocalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress periodic reconciliation for `window` after a local seek
    pub fn arm_seek_guard(&self, window: Duration) {
        *self.seek_guard_until.lock() = Some(Instant::now() + window);
    }

    pub fn seek_guard_active(&self) -> bool {
        self.seek_guard_until
            .lock()
            .map_or(false, |until| Instant::now() < until)
    }

    pub fn note_own_write(&self, timestamp: u64) {
        let mut last = self.last_own_write.lock();
        if last.map_or(true, |t| timestamp > t) {
            *last = Some(timestamp);
        }
    }

    /// Whether `snapshot` is one we wrote (or predates our latest write)
    pub fn is_own_write(&self, snapshot: &PlaybackState) -> bool {
        self.last_own_write
            .lock()
            .map_or(false, |t| snapshot.timestamp <= t)
    }
}

/// Diagnostics from one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatus {
    /// Local minus expected position, before any correction (seconds)
    pub drift: f64,
    pub expected: f64,
    pub actual: f64,
    /// Whether a hard seek was issued
    pub corrected: bool,
    /// Server seconds since the snapshot was taken
    pub elapsed: f64,
    /// Player transport after the pass
    pub transport: PlayerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    OwnWrite,
    SeekGuard,
    NotPlaying,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    Applied(SyncStatus),
    /// Applied, but the player refused to start. Reported once until unlocked.
    AutoplayBlocked(SyncStatus),
    /// Older than a snapshot already applied
    Discarded,
    Skipped(SkipReason),
    /// The snapshot has nothing loaded; players were paused
    NoMedia,
}

pub struct Reconciler {
    players: Players,
    offset: SharedClockOffset,
    local: Arc<LocalState>,
    playing_threshold: f64,
    paused_threshold: f64,
    /// Timestamp of the newest snapshot seen
    last_seen: Option<u64>,
    /// The last pass failed and should be retried on the next tick
    retry_pending: bool,
    autoplay_blocked: bool,
    /// Source whose counterpart has already been paused
    silenced_for: Option<MediaSource>,
}

impl Reconciler {
    pub fn new(
        players: Players,
        offset: SharedClockOffset,
        local: Arc<LocalState>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            players,
            offset,
            local,
            playing_threshold: config.playing_threshold_secs,
            paused_threshold: config.paused_threshold_secs,
            last_seen: None,
            retry_pending: false,
            autoplay_blocked: false,
            silenced_for: None,
        }
    }

    /// Handle an authoritative-state change notification
    pub async fn on_snapshot(&mut self, snapshot: &PlaybackState) -> Result<ReconcileOutcome, SyncError> {
        if self.is_out_of_order(snapshot) {
            debug!(
                "Discarding out-of-order snapshot (ts={} < {:?})",
                snapshot.timestamp, self.last_seen
            );
            return Ok(ReconcileOutcome::Discarded);
        }
        self.last_seen = Some(snapshot.timestamp);

        if self.local.is_own_write(snapshot) {
            self.retry_pending = false;
            return Ok(ReconcileOutcome::Skipped(SkipReason::OwnWrite));
        }

        self.run(snapshot).await
    }

    /// Handle the periodic tick with the latest known snapshot
    pub async fn on_tick(&mut self, snapshot: &PlaybackState) -> Result<ReconcileOutcome, SyncError> {
        if !snapshot.is_playing() && !self.retry_pending {
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotPlaying));
        }
        if self.local.seek_guard_active() {
            return Ok(ReconcileOutcome::Skipped(SkipReason::SeekGuard));
        }
        if self.is_out_of_order(snapshot) {
            return Ok(ReconcileOutcome::Discarded);
        }
        if self.local.is_own_write(snapshot) {
            return Ok(ReconcileOutcome::Skipped(SkipReason::OwnWrite));
        }

        self.run(snapshot).await
    }

    /// Allow force-play again after a user gesture
    pub fn unlock(&mut self) {
        if self.autoplay_blocked {
            info!("Playback unlocked by user gesture");
        }
        self.autoplay_blocked = false;
        self.players.unlock_all();
    }

    pub fn is_autoplay_blocked(&self) -> bool {
        self.autoplay_blocked
    }

    fn is_out_of_order(&self, snapshot: &PlaybackState) -> bool {
        self.last_seen.map_or(false, |last| snapshot.timestamp < last)
    }

    async fn run(&mut self, snapshot: &PlaybackState) -> Result<ReconcileOutcome, SyncError> {
        let result = self.apply(snapshot).await;
        self.retry_pending = result.is_err();
        result
    }

    async fn apply(&mut self, snapshot: &PlaybackState) -> Result<ReconcileOutcome, SyncError> {
        let player = self.players.for_source(snapshot.source).clone();

        // Only one adapter may be audible; pause the other once per source change
        if self.silenced_for != Some(snapshot.source) {
            let other = self.players.other_than(snapshot.source);
            let silenced = match other.loaded_media() {
                Some(_) => match other.pause().await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Failed to pause inactive player: {}", e);
                        false
                    }
                },
                None => true,
            };
            if silenced {
                self.silenced_for = Some(snapshot.source);
            }
        }

        let Some(media_ref) = snapshot.media_ref.as_deref() else {
            if player.loaded_media().is_some() {
                player.pause().await?;
            }
            return Ok(ReconcileOutcome::NoMedia);
        };

        if player.loaded_media().as_deref() != Some(media_ref) {
            info!("Loading {:?} media {}", snapshot.source, media_ref);
            player.load_media(media_ref).await?;
        }

        // Projected after the load so load latency is accounted for
        let server_now = self.offset.read().server_now_ms();
        let mut expected = snapshot.expected_position(server_now);
        if let Some(duration) = player.duration().await? {
            expected = expected.min(duration);
        }

        let actual = player.current_position().await?;
        let drift = actual - expected;
        let threshold = match snapshot.state {
            PlaybackStatus::Playing => self.playing_threshold,
            PlaybackStatus::Paused => self.paused_threshold,
        };

        let corrected = drift.abs() > threshold;
        if corrected {
            info!(
                "Drift {:+.2}s exceeds {:.1}s, seeking {:.2}s -> {:.2}s",
                drift, threshold, actual, expected
            );
            player.seek(expected).await?;
        }

        let mut transport = player.player_state().await?;
        let mut newly_blocked = false;
        match snapshot.state {
            PlaybackStatus::Paused => {
                if transport == PlayerState::Playing {
                    player.pause().await?;
                    transport = PlayerState::Paused;
                }
            }
            PlaybackStatus::Playing => {
                if transport == PlayerState::Ended {
                    debug!("Player has ended, not forcing play");
                } else if transport != PlayerState::Playing && !self.autoplay_blocked {
                    match player.play().await {
                        Ok(()) => transport = PlayerState::Playing,
                        Err(PlayerError::AutoplayBlocked) => {
                            warn!("Autoplay blocked, waiting for a user gesture");
                            self.autoplay_blocked = true;
                            newly_blocked = true;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        let status = SyncStatus {
            drift,
            expected,
            actual,
            corrected,
            elapsed: snapshot.elapsed_secs(server_now),
            transport,
        };

        if newly_blocked {
            Ok(ReconcileOutcome::AutoplayBlocked(status))
        } else {
            Ok(ReconcileOutcome::Applied(status))
        }
    }
}
