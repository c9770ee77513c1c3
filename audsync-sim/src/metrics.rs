//! Metrics tracking for the simulated room

use audsync_core::{Device, PlaybackState, PlaybackStatus, SyncStatus};
use chrono::{DateTime, Local};
use std::collections::VecDeque;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 200;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Host,
    Sync,
    Presence,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Host => "HOST",
            LogLevel::Sync => "SYNC",
            LogLevel::Presence => "PRES",
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
pub enum SimStatus {
    Starting,
    Running,
    Stopping,
    Error,
}

/// What one simulated device has been doing
#[derive(Clone)]
pub struct DeviceStats {
    pub id: String,
    pub name: String,
    pub is_host: bool,
    /// Local clock skew against the server (ms)
    pub skew_ms: i64,
    /// Player speed relative to real time
    pub rate: f64,
    /// Drift before correction on the last pass (seconds)
    pub last_drift: f64,
    pub max_drift: f64,
    pub corrections: u64,
    pub transport: String,
    /// Listed in the room's presence directory
    pub present: bool,
    pub last_sync: Option<DateTime<Local>>,
}

/// Simulation metrics
pub struct Metrics {
    pub start_time: DateTime<Local>,
    pub room_code: Option<String>,
    pub status: SimStatus,
    /// Latest authoritative snapshot seen by the host
    pub playback: Option<PlaybackState>,
    pub devices: Vec<DeviceStats>,
    pub total_corrections: u64,
    pub evictions: u64,
    pub logs: VecDeque<LogEntry>,
    /// Entries logged so far, including ones the ring buffer dropped
    pub log_seq: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            room_code: None,
            status: SimStatus::Starting,
            playback: None,
            devices: Vec::new(),
            total_corrections: 0,
            evictions: 0,
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            log_seq: 0,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
        self.log_seq += 1;
    }

    pub fn register_device(&mut self, id: &str, name: &str, is_host: bool, skew_ms: i64, rate: f64) {
        self.devices.push(DeviceStats {
            id: id.to_string(),
            name: name.to_string(),
            is_host,
            skew_ms,
            rate,
            last_drift: 0.0,
            max_drift: 0.0,
            corrections: 0,
            transport: "-".to_string(),
            present: false,
            last_sync: None,
        });
        self.log(
            LogLevel::Presence,
            format!("{} joined (skew {:+}ms, rate {:.3})", name, skew_ms, rate),
        );
    }

    /// Record a reconciliation pass for a device
    pub fn record_sync(&mut self, id: &str, status: &SyncStatus) {
        let Some(device) = self.devices.iter_mut().find(|d| d.id == id) else {
            return;
        };

        device.last_drift = status.drift;
        device.max_drift = device.max_drift.max(status.drift.abs());
        device.transport = format!("{:?}", status.transport);
        device.last_sync = Some(Local::now());

        if status.corrected {
            device.corrections += 1;
            let name = device.name.clone();
            self.total_corrections += 1;
            self.log(
                LogLevel::Sync,
                format!(
                    "{} corrected {:+.2}s ({:.2}s -> {:.2}s)",
                    name, status.drift, status.actual, status.expected
                ),
            );
        }
    }

    pub fn set_playback(&mut self, snapshot: &PlaybackState) {
        self.playback = Some(snapshot.clone());
    }

    /// Update presence flags from the directory; returns names that vanished
    pub fn set_directory(&mut self, listed: &[Device]) -> Vec<String> {
        let mut vanished = Vec::new();
        for device in &mut self.devices {
            let present = listed.iter().any(|d| d.id == device.id);
            if device.present && !present {
                vanished.push(device.name.clone());
            }
            device.present = present;
            if let Some(entry) = listed.iter().find(|d| d.id == device.id) {
                device.name = entry.display_name.clone();
            }
        }
        self.evictions += vanished.len() as u64;
        vanished
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        format_secs(duration.num_seconds().max(0) as f64)
    }

    /// One-line description of the current snapshot
    pub fn now_playing(&self) -> String {
        match &self.playback {
            Some(PlaybackState {
                media_ref: Some(_),
                display_title,
                display_artist,
                state,
                ..
            }) => {
                let icon = match state {
                    PlaybackStatus::Playing => "▶",
                    PlaybackStatus::Paused => "⏸",
                };
                format!(
                    "{} {} - {}",
                    icon,
                    display_title.as_deref().unwrap_or("Untitled"),
                    display_artist.as_deref().unwrap_or("Unknown")
                )
            }
            _ => "Nothing loaded".to_string(),
        }
    }
}

/// Format seconds as "1h 2m", "3m 4s" or "5s"
pub fn format_secs(secs: f64) -> String {
    let secs = secs as i64;
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audsync_core::player::PlayerState;

    fn status(drift: f64, corrected: bool) -> SyncStatus {
        SyncStatus {
            drift,
            expected: 10.0,
            actual: 10.0 + drift,
            corrected,
            elapsed: 1.0,
            transport: PlayerState::Playing,
        }
    }

    #[test]
    fn test_record_sync() {
        let mut metrics = Metrics::new();
        metrics.register_device("f1", "Follower 1", false, 1200, 1.01);

        metrics.record_sync("f1", &status(0.4, false));
        metrics.record_sync("f1", &status(-2.0, true));
        metrics.record_sync("unknown", &status(9.0, true));

        let device = &metrics.devices[0];
        assert_eq!(device.corrections, 1);
        assert_eq!(device.max_drift, 2.0);
        assert_eq!(device.transport, "Playing");
        assert_eq!(metrics.total_corrections, 1);
    }

    #[test]
    fn test_directory_vanish() {
        let mut metrics = Metrics::new();
        metrics.register_device("h", "Host", true, 0, 1.0);
        metrics.register_device("f1", "Follower 1", false, 0, 1.0);

        let listed = |ids: &[&str]| -> Vec<Device> {
            ids.iter()
                .map(|id| Device {
                    id: id.to_string(),
                    display_name: id.to_uppercase(),
                    is_host: *id == "h",
                    last_seen: 0,
                })
                .collect()
        };

        assert!(metrics.set_directory(&listed(&["h", "f1"])).is_empty());
        assert_eq!(metrics.set_directory(&listed(&["h"])), vec!["F1".to_string()]);
        assert_eq!(metrics.evictions, 1);
    }

    #[test]
    fn test_log_ring_buffer() {
        let mut metrics = Metrics::new();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            metrics.log(LogLevel::Info, format!("entry {}", i));
        }
        assert_eq!(metrics.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(metrics.logs.front().unwrap().message, "entry 5");
        assert_eq!(metrics.log_seq, (MAX_LOG_ENTRIES + 5) as u64);

        // A full buffer keeps its length but the sequence still moves
        metrics.log(LogLevel::Info, "one more");
        assert_eq!(metrics.logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(metrics.log_seq, (MAX_LOG_ENTRIES + 6) as u64);
    }

    #[test]
    fn test_format_secs() {
        assert_eq!(format_secs(42.0), "42s");
        assert_eq!(format_secs(125.0), "2m 5s");
        assert_eq!(format_secs(3_720.0), "1h 2m");
    }
}
