//! Playback and presence records

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transport state of the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackStatus {
    Playing,
    #[default]
    Paused,
}

/// Which player variant renders the active media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    #[default]
    File,
    ExternalVideo,
}

/// The single authoritative playback record of a room.
///
/// `position` is the offset as of `timestamp` (server ms). It is never
/// current on its own: while playing it must be projected forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub state: PlaybackStatus,
    pub source: MediaSource,
    pub media_ref: Option<String>,
    pub display_title: Option<String>,
    pub display_artist: Option<String>,
    /// Seconds into the media
    pub position: f64,
    /// Server time (ms since epoch) at which `position` was recorded
    pub timestamp: u64,
    /// Shared volume hint (0..1), independent of each device's local volume
    pub volume: Option<f64>,
}

impl PlaybackState {
    /// State of a freshly created room
    pub fn initial(timestamp: u64) -> Self {
        Self {
            state: PlaybackStatus::Paused,
            source: MediaSource::File,
            media_ref: None,
            display_title: None,
            display_artist: None,
            position: 0.0,
            timestamp,
            volume: None,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state == PlaybackStatus::Playing
    }

    /// Seconds elapsed on the server clock since this snapshot was taken.
    /// A timestamp ahead of `server_now_ms` counts as zero elapsed.
    pub fn elapsed_secs(&self, server_now_ms: u64) -> f64 {
        server_now_ms.saturating_sub(self.timestamp) as f64 / 1000.0
    }

    /// Where playback should be at `server_now_ms`
    pub fn expected_position(&self, server_now_ms: u64) -> f64 {
        match self.state {
            PlaybackStatus::Playing => self.position + self.elapsed_secs(server_now_ms),
            PlaybackStatus::Paused => self.position,
        }
    }

    /// Whether this snapshot was taken before `other` and must not be applied after it
    pub fn is_older_than(&self, other: &PlaybackState) -> bool {
        self.timestamp < other.timestamp
    }

    /// Copy with a new transport state, position and timestamp written together
    pub fn with_transport(&self, state: PlaybackStatus, position: f64, timestamp: u64) -> Self {
        Self {
            state,
            position,
            timestamp,
            ..self.clone()
        }
    }
}

/// A device present in a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Stable client identity
    pub id: String,
    pub display_name: String,
    /// Set at room creation and never changed
    pub is_host: bool,
    /// Server time (ms) of the last heartbeat
    pub last_seen: u64,
}

impl Device {
    /// Whether the last heartbeat is older than `ttl` at `server_now_ms`
    pub fn is_stale(&self, server_now_ms: u64, ttl: Duration) -> bool {
        server_now_ms.saturating_sub(self.last_seen) > ttl.as_millis() as u64
    }
}

/// Order devices for display: host first, then others by display name
pub fn sort_devices(devices: &mut [Device]) {
    devices.sort_by(|a, b| match (a.is_host, b.is_host) {
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        _ => a
            .display_name
            .to_lowercase()
            .cmp(&b.display_name.to_lowercase()),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing_at(position: f64, timestamp: u64) -> PlaybackState {
        PlaybackState::initial(timestamp).with_transport(PlaybackStatus::Playing, position, timestamp)
    }

    #[test]
    fn test_playing_projection() {
        // Host pressed play at t=0 from 0s; at t=5s the follower should be at 5s
        let snapshot = playing_at(0.0, 0);
        assert_eq!(snapshot.expected_position(5_000), 5.0);

        // Seek to 42s at t0, projected 3s later
        let snapshot = playing_at(42.0, 1_000_000);
        assert_eq!(snapshot.expected_position(1_003_000), 45.0);
    }

    #[test]
    fn test_paused_position_does_not_grow() {
        let snapshot = PlaybackState::initial(0).with_transport(PlaybackStatus::Paused, 12.5, 0);
        assert_eq!(snapshot.expected_position(0), 12.5);
        assert_eq!(snapshot.expected_position(3_600_000), 12.5);
    }

    #[test]
    fn test_future_timestamp_counts_as_zero_elapsed() {
        let snapshot = playing_at(10.0, 20_000);
        assert_eq!(snapshot.expected_position(19_000), 10.0);
    }

    #[test]
    fn test_wire_format() {
        let snapshot = PlaybackState {
            state: PlaybackStatus::Playing,
            source: MediaSource::ExternalVideo,
            media_ref: Some("dQw4w9WgXcQ".to_string()),
            display_title: Some("Title".to_string()),
            display_artist: None,
            position: 1.5,
            timestamp: 42,
            volume: Some(0.5),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "playing");
        assert_eq!(json["source"], "external_video");
        assert_eq!(json["mediaRef"], "dQw4w9WgXcQ");
        assert_eq!(json["displayArtist"], serde_json::Value::Null);
        assert_eq!(json["timestamp"], 42);

        let back: PlaybackState = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn test_stale_device() {
        let device = Device {
            id: "a".into(),
            display_name: "A".into(),
            is_host: false,
            last_seen: 0,
        };
        let ttl = Duration::from_secs(30);
        assert!(!device.is_stale(20_000, ttl));
        assert!(!device.is_stale(30_000, ttl));
        assert!(device.is_stale(40_000, ttl));
    }

    #[test]
    fn test_device_order() {
        let device = |id: &str, name: &str, is_host: bool| Device {
            id: id.into(),
            display_name: name.into(),
            is_host,
            last_seen: 0,
        };
        let mut devices = vec![
            device("1", "zed", false),
            device("2", "Alice", false),
            device("3", "bob", true),
        ];
        sort_devices(&mut devices);
        let names: Vec<&str> = devices.iter().map(|d| d.display_name.as_str()).collect();
        assert_eq!(names, vec!["bob", "Alice", "zed"]);
    }
}
