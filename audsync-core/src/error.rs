//! Error types shared across the sync engine

use thiserror::Error;

use crate::player::PlayerError;
use crate::store::StoreError;

/// Errors surfaced by host commands and session operations
///
/// None of these are fatal: the worst outcome is a client that stays out of
/// sync until the next successful reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A non-host client attempted a host-only command
    #[error("Only the host can control playback")]
    NotAuthorized,

    #[error("Invalid media reference: {0}")]
    InvalidMediaReference(String),

    #[error("Metadata lookup failed: {0}")]
    MetadataLookupFailed(String),

    #[error("Playback needs a user gesture before it can start")]
    PlayerAutoplayBlocked,

    /// Our own presence record was evicted; the client must leave the room
    #[error("Device was removed from the room")]
    PresenceExpired,

    #[error("Nothing to play")]
    NoMedia,

    #[error("Not in a room")]
    NotInRoom,

    /// The session was left while the operation was in flight
    #[error("Left the room before the operation completed")]
    Departed,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),
}

impl SyncError {
    /// Whether retrying the same operation later could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::MetadataLookupFailed(_) | SyncError::Store(_) => true,
            SyncError::Player(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<crate::media::LookupError> for SyncError {
    fn from(e: crate::media::LookupError) -> Self {
        SyncError::MetadataLookupFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::MetadataLookupFailed("timeout".into()).is_retryable());
        assert!(SyncError::Store(StoreError::Unavailable("offline".into())).is_retryable());
        assert!(!SyncError::NotAuthorized.is_retryable());
        assert!(!SyncError::InvalidMediaReference("bad-url".into()).is_retryable());
        assert!(!SyncError::Player(PlayerError::AutoplayBlocked).is_retryable());
    }
}
