//! Sync tunables

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Drift tolerated while playing before a hard seek (seconds)
pub const PLAYING_DRIFT_THRESHOLD_SECS: f64 = 1.5;

/// Drift tolerated while paused before a hard seek (seconds)
pub const PAUSED_DRIFT_THRESHOLD_SECS: f64 = 0.5;

/// How often each client refreshes its presence record
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;

/// Age after which a non-host presence record counts as stale
pub const STALE_TTL_MS: u64 = 30_000;

/// How often the host sweeps the directory for stale devices
pub const SWEEP_INTERVAL_MS: u64 = 20_000;

/// Reconciliation is suppressed for this long after a local seek
pub const SEEK_GUARD_MS: u64 = 500;

/// Periodic reconciliation interval while playing
pub const RECONCILE_TICK_MS: u64 = 500;

/// Number of clock offset samples averaged together
pub const OFFSET_SAMPLE_WINDOW: usize = 5;

/// Tunable constants used by the reconciler, presence manager and session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub playing_threshold_secs: f64,
    pub paused_threshold_secs: f64,
    pub heartbeat_interval_ms: u64,
    pub stale_ttl_ms: u64,
    pub sweep_interval_ms: u64,
    pub seek_guard_ms: u64,
    pub reconcile_tick_ms: u64,
    pub offset_window: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            playing_threshold_secs: PLAYING_DRIFT_THRESHOLD_SECS,
            paused_threshold_secs: PAUSED_DRIFT_THRESHOLD_SECS,
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
            stale_ttl_ms: STALE_TTL_MS,
            sweep_interval_ms: SWEEP_INTERVAL_MS,
            seek_guard_ms: SEEK_GUARD_MS,
            reconcile_tick_ms: RECONCILE_TICK_MS,
            offset_window: OFFSET_SAMPLE_WINDOW,
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn stale_ttl(&self) -> Duration {
        Duration::from_millis(self.stale_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn seek_guard(&self) -> Duration {
        Duration::from_millis(self.seek_guard_ms)
    }

    pub fn reconcile_tick(&self) -> Duration {
        Duration::from_millis(self.reconcile_tick_ms)
    }
}
