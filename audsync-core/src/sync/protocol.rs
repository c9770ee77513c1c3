//! Host command protocol

use serde::{Deserialize, Serialize};

/// A user intent the host turns into a new authoritative snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum HostCommand {
    /// Start or resume playback from the host player's current position
    Play,

    /// Pause at the host player's current position
    Pause,

    /// Flip between playing and paused
    Toggle,

    /// Jump to a position (seconds), keeping the transport state
    Seek { position: f64 },

    /// Load an external video by URL or id
    LoadMedia { reference: String },

    /// Load a track from the room's catalog
    LoadTrack { track_id: String },

    /// Change the shared volume hint (0..1)
    SetVolume { volume: f64 },
}

impl HostCommand {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            HostCommand::Play => "play",
            HostCommand::Pause => "pause",
            HostCommand::Toggle => "toggle",
            HostCommand::Seek { .. } => "seek",
            HostCommand::LoadMedia { .. } => "load_media",
            HostCommand::LoadTrack { .. } => "load_track",
            HostCommand::SetVolume { .. } => "set_volume",
        }
    }

    /// Whether the command needs an external metadata lookup before it can commit
    pub fn needs_lookup(&self) -> bool {
        matches!(self, HostCommand::LoadMedia { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json() {
        let cmd: HostCommand =
            serde_json::from_str(r#"{ "command": "seek", "position": 42.0 }"#).unwrap();
        assert_eq!(cmd, HostCommand::Seek { position: 42.0 });
        assert_eq!(cmd.name(), "seek");
        assert!(!cmd.needs_lookup());

        let cmd: HostCommand = serde_json::from_str(
            r#"{ "command": "load_media", "reference": "https://youtu.be/dQw4w9WgXcQ" }"#,
        )
        .unwrap();
        assert!(cmd.needs_lookup());
    }
}
