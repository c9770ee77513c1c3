//! Presence / heartbeat
//!
//! Each client keeps its own device record fresh; the host sweeps out
//! non-host records whose heartbeat is older than the TTL. Departure
//! cleanup is best-effort only, so liveness always comes from
//! heartbeat + TTL + sweep.

use std::time::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::SharedClockOffset;
use crate::config::SyncConfig;
use crate::store::{DeviceMap, PresenceDirectory, StoreError};
use crate::sync::Device;

/// Who this client is
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: String,
    pub display_name: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Our own record as seen in the latest directory snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfStatus {
    Present,
    /// Our first heartbeat hasn't shown up yet
    NotYetRegistered,
    /// Our record was there and is now gone
    Removed,
}

/// Ids of non-host devices whose heartbeat is older than `ttl`
pub fn stale_devices(devices: &[Device], server_now_ms: u64, ttl: Duration) -> Vec<String> {
    devices
        .iter()
        .filter(|d| !d.is_host && d.is_stale(server_now_ms, ttl))
        .map(|d| d.id.clone())
        .collect()
}

pub struct PresenceManager {
    identity: DeviceIdentity,
    is_host: bool,
    directory: Arc<dyn PresenceDirectory>,
    offset: SharedClockOffset,
    stale_ttl: Duration,
    seen_self: bool,
}

impl PresenceManager {
    pub fn new(
        identity: DeviceIdentity,
        is_host: bool,
        directory: Arc<dyn PresenceDirectory>,
        offset: SharedClockOffset,
        config: &SyncConfig,
    ) -> Self {
        Self {
            identity,
            is_host,
            directory,
            offset,
            stale_ttl: config.stale_ttl(),
            seen_self: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn record(&self) -> Device {
        Device {
            id: self.identity.id.clone(),
            display_name: self.identity.display_name.clone(),
            is_host: self.is_host,
            last_seen: self.offset.read().server_now_ms(),
        }
    }

    /// Create or refresh our record with the current server time
    pub async fn heartbeat(&self) -> Result<(), StoreError> {
        let record = self.record();
        debug!("Heartbeat for {} (last_seen={})", record.id, record.last_seen);
        self.directory.upsert(record).await
    }

    pub async fn rename(&mut self, display_name: &str) -> Result<(), StoreError> {
        self.identity.display_name = display_name.to_string();
        self.directory.rename(&self.identity.id, display_name).await
    }

    /// Best-effort removal of our record on a graceful leave
    pub async fn depart(&self) {
        match self.directory.remove(&self.identity.id).await {
            Ok(()) => info!("Removed presence record for {}", self.identity.id),
            Err(e) => warn!("Could not remove presence record, it will expire: {}", e),
        }
    }

    /// Evict stale non-host devices. Only the host sweeps; other clients get
    /// an empty list back without reading the directory.
    pub async fn sweep(&self) -> Result<Vec<String>, StoreError> {
        if !self.is_host {
            return Ok(Vec::new());
        }

        let devices = self.directory.list().await?;
        let now = self.offset.read().server_now_ms();
        let stale = stale_devices(&devices, now, self.stale_ttl);

        let mut evicted = Vec::with_capacity(stale.len());
        for id in stale {
            match self.directory.remove(&id).await {
                Ok(()) => {
                    info!("Evicted stale device {}", id);
                    evicted.push(id);
                }
                Err(e) => warn!("Failed to evict {}: {}", id, e),
            }
        }
        Ok(evicted)
    }

    /// Check the directory for our own record
    pub fn observe(&mut self, directory: &DeviceMap) -> SelfStatus {
        if directory.contains_key(&self.identity.id) {
            self.seen_self = true;
            SelfStatus::Present
        } else if self.seen_self {
            SelfStatus::Removed
        } else {
            SelfStatus::NotYetRegistered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{new_shared_offset, ManualClock};
    use crate::store::MemoryPresenceDirectory;

    fn device(id: &str, is_host: bool, last_seen: u64) -> Device {
        Device {
            id: id.into(),
            display_name: id.into(),
            is_host,
            last_seen,
        }
    }

    fn manager(
        id: &str,
        is_host: bool,
        clock: &Arc<ManualClock>,
        directory: &Arc<MemoryPresenceDirectory>,
    ) -> PresenceManager {
        PresenceManager::new(
            DeviceIdentity::new(id, id.to_uppercase()),
            is_host,
            directory.clone(),
            new_shared_offset(clock.clone(), 5),
            &SyncConfig::default(),
        )
    }

    #[test]
    fn test_stale_devices_never_include_host() {
        let ttl = Duration::from_secs(30);
        let devices = vec![
            device("host", true, 0),
            device("fresh", false, 35_000),
            device("gone", false, 0),
        ];
        assert_eq!(stale_devices(&devices, 40_000, ttl), vec!["gone".to_string()]);
        assert!(stale_devices(&devices, 30_000, ttl).is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_stamps_server_time() {
        let clock = Arc::new(ManualClock::new(1_000));
        let directory = Arc::new(MemoryPresenceDirectory::new());
        let presence = manager("a", false, &clock, &directory);

        presence.heartbeat().await.unwrap();
        assert_eq!(directory.get("a").unwrap().last_seen, 1_000);

        clock.advance(Duration::from_secs(15));
        presence.heartbeat().await.unwrap();
        let record = directory.get("a").unwrap();
        assert_eq!(record.last_seen, 16_000);
        assert_eq!(record.display_name, "A");
        assert!(!record.is_host);
    }

    #[tokio::test]
    async fn test_sweep_timeline() {
        // Follower's last heartbeat at t=0, host's at t=-25s
        let clock = Arc::new(ManualClock::new(100_000));
        let directory = Arc::new(MemoryPresenceDirectory::new());
        let host = manager("host", true, &clock, &directory);
        directory.upsert(device("host", true, 75_000)).await.unwrap();
        directory.upsert(device("follower", false, 100_000)).await.unwrap();

        // First sweep at t=20s: within the TTL
        clock.set(120_000);
        assert!(host.sweep().await.unwrap().is_empty());

        // Next sweep at t=40s removes the follower, never the host
        clock.set(140_000);
        assert_eq!(host.sweep().await.unwrap(), vec!["follower".to_string()]);
        assert!(directory.get("follower").is_none());
        assert!(directory.get("host").is_some());
    }

    #[tokio::test]
    async fn test_only_host_sweeps() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let directory = Arc::new(MemoryPresenceDirectory::new());
        directory.upsert(device("old", false, 0)).await.unwrap();

        let follower = manager("f", false, &clock, &directory);
        assert!(follower.sweep().await.unwrap().is_empty());
        assert!(directory.get("old").is_some());
    }

    #[tokio::test]
    async fn test_observe_own_record() {
        let clock = Arc::new(ManualClock::new(0));
        let directory = Arc::new(MemoryPresenceDirectory::new());
        let mut presence = manager("me", false, &clock, &directory);

        assert_eq!(presence.observe(&DeviceMap::new()), SelfStatus::NotYetRegistered);

        presence.heartbeat().await.unwrap();
        let snapshot = directory.subscribe().borrow().clone();
        assert_eq!(presence.observe(&snapshot), SelfStatus::Present);

        directory.remove("me").await.unwrap();
        let snapshot = directory.subscribe().borrow().clone();
        assert_eq!(presence.observe(&snapshot), SelfStatus::Removed);
    }

    #[tokio::test]
    async fn test_depart_is_best_effort() {
        let clock = Arc::new(ManualClock::new(0));
        let directory = Arc::new(MemoryPresenceDirectory::new());
        let mut presence = manager("me", false, &clock, &directory);
        presence.heartbeat().await.unwrap();
        presence.rename("Kitchen").await.unwrap();
        assert_eq!(directory.get("me").unwrap().display_name, "Kitchen");

        directory.set_available(false);
        presence.depart().await;
        directory.set_available(true);
        assert!(directory.get("me").is_some());

        presence.depart().await;
        assert!(directory.get("me").is_none());
    }
}
