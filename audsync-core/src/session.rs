//! Room session
//!
//! One actor task per client per room. It owns the reconciler and presence
//! manager and is driven by store notifications, timers and commands from
//! its [`SessionHandle`]. Host commands run on the caller's task through
//! the [`HostController`]; their writes come back to every actor as
//! ordinary notifications.

use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::{new_shared_offset, SharedClock, SharedClockOffset};
use crate::config::SyncConfig;
use crate::controller::{HostController, SessionDeps};
use crate::error::SyncError;
use crate::player::Players;
use crate::presence::{DeviceIdentity, PresenceManager, SelfStatus};
use crate::reconciler::{LocalState, ReconcileOutcome, Reconciler, SyncStatus};
use crate::store::{DeviceMap, RoomLinks};
use crate::sync::{sort_devices, Device, PlaybackState};

static TRACING_INIT: Once = Once::new();

/// Events held for an owner that isn't reading; newer ones are dropped past this
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Install a stderr `tracing` subscriber once per process.
/// `RUST_LOG` directives are honored on top of the defaults.
pub fn init_tracing() {
    init_tracing_with(&[]);
}

/// Like [`init_tracing`], with extra filter directives (e.g. `"my_app=info"`)
pub fn init_tracing_with(extra: &[&str]) {
    TRACING_INIT.call_once(|| {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        let defaults = ["audsync_core=debug", "hyper_util=off", "reqwest=off", "hyper=off"];
        for directive in defaults.iter().chain(extra) {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        tracing_subscriber::fmt()
            .with_target(false)
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Events reported to the session's owner
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The authoritative snapshot changed
    PlaybackChanged(PlaybackState),
    /// Devices in the room, host first
    DevicesChanged(Vec<Device>),
    /// Result of a reconciliation pass
    SyncStatus(SyncStatus),
    /// The player needs a user gesture; call [`SessionHandle::unlock`]
    AutoplayBlocked,
    /// A non-fatal failure worth showing to the user
    Error(String),
    /// Our presence record was removed; the session has ended
    Removed,
    /// The session ended after [`SessionHandle::leave`]
    Left,
}

enum SessionCommand {
    Unlock,
    Rename(String),
    Leave(oneshot::Sender<()>),
}

/// Joins clients to rooms
pub struct RoomSession;

impl RoomSession {
    /// Register in the room's directory and start the session actor.
    /// The client is the host when its id matches the room's host id.
    pub async fn join(
        links: RoomLinks,
        identity: DeviceIdentity,
        clock: SharedClock,
        deps: SessionDeps,
        config: SyncConfig,
    ) -> Result<SessionHandle, SyncError> {
        let is_host = identity.id == links.host_id;
        let device_id = identity.id.clone();

        let offset = new_shared_offset(clock, config.offset_window);
        if let Some(signal) = &links.offset_signal {
            offset.write().record_sample(*signal.borrow());
        }

        let local = Arc::new(LocalState::new());
        let controller = HostController::new(
            is_host,
            links.playback.clone(),
            &deps,
            offset.clone(),
            local.clone(),
            &config,
        );
        let presence = PresenceManager::new(
            identity,
            is_host,
            links.presence.clone(),
            offset.clone(),
            &config,
        );
        presence.heartbeat().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let actor = SessionActor {
            is_host,
            reconciler: Reconciler::new(deps.players.clone(), offset.clone(), local, &config),
            presence,
            controller: controller.clone(),
            players: deps.players,
            offset: offset.clone(),
            playback_rx: links.playback.subscribe(),
            directory_rx: links.presence.subscribe(),
            offset_rx: links.offset_signal,
            command_rx,
            event_tx,
            config,
        };

        info!(
            "Joined room as {} ({})",
            device_id,
            if is_host { "host" } else { "follower" }
        );
        let task = tokio::spawn(actor.run());

        Ok(SessionHandle {
            device_id,
            controller,
            offset,
            command_tx,
            event_rx,
            task,
        })
    }
}

/// Owner's handle to a running session
pub struct SessionHandle {
    device_id: String,
    controller: HostController,
    offset: SharedClockOffset,
    command_tx: mpsc::UnboundedSender<SessionCommand>,
    event_rx: mpsc::Receiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_host(&self) -> bool {
        self.controller.is_host()
    }

    /// Playback commands; refused unless this client is the host
    pub fn host(&self) -> &HostController {
        &self.controller
    }

    /// Current estimate of the server clock
    pub fn server_now_ms(&self) -> u64 {
        self.offset.read().server_now_ms()
    }

    /// Record the user gesture that lets playback start
    pub fn unlock(&self) -> Result<(), SyncError> {
        self.send(SessionCommand::Unlock)
    }

    pub fn rename(&self, display_name: impl Into<String>) -> Result<(), SyncError> {
        self.send(SessionCommand::Rename(display_name.into()))
    }

    /// Next event. At most [`EVENT_QUEUE_CAPACITY`] are held; later ones are
    /// dropped until the owner catches up.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Cancel all timers, drop our presence record and stop the players
    pub async fn leave(&self) -> Result<(), SyncError> {
        self.controller.deactivate();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(SessionCommand::Leave(ack_tx))?;
        ack_rx.await.map_err(|_| SyncError::NotInRoom)
    }

    /// Stop the actor without any cleanup, as if the process died
    pub fn abort(&self) {
        self.controller.deactivate();
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    fn send(&self, command: SessionCommand) -> Result<(), SyncError> {
        self.command_tx
            .send(command)
            .map_err(|_| SyncError::NotInRoom)
    }
}

struct SessionActor {
    is_host: bool,
    reconciler: Reconciler,
    presence: PresenceManager,
    controller: HostController,
    players: Players,
    offset: SharedClockOffset,
    playback_rx: watch::Receiver<PlaybackState>,
    directory_rx: watch::Receiver<DeviceMap>,
    offset_rx: Option<watch::Receiver<i64>>,
    command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    event_tx: mpsc::Sender<SessionEvent>,
    config: SyncConfig,
}

fn timer(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Next value of the offset signal; `None` once the signal has closed,
/// pending forever when there is no signal
async fn next_offset(signal: &mut Option<watch::Receiver<i64>>) -> Option<i64> {
    match signal {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

impl SessionActor {
    async fn run(mut self) {
        let initial = self.playback_rx.borrow_and_update().clone();
        self.emit(SessionEvent::PlaybackChanged(initial.clone()));
        let result = self.reconciler.on_snapshot(&initial).await;
        self.report(result);

        let directory = self.directory_rx.borrow_and_update().clone();
        if self.on_directory(&directory) {
            return;
        }

        let mut reconcile_tick = timer(self.config.reconcile_tick());
        let mut heartbeat_tick = timer(self.config.heartbeat_interval());
        let mut sweep_tick = timer(self.config.sweep_interval());

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SessionCommand::Unlock) => {
                            self.reconciler.unlock();
                            let snapshot = self.playback_rx.borrow().clone();
                            let result = self.reconciler.on_tick(&snapshot).await;
                            self.report(result);
                        }
                        Some(SessionCommand::Rename(name)) => {
                            if let Err(e) = self.presence.rename(&name).await {
                                warn!("Rename failed: {}", e);
                                self.emit(SessionEvent::Error(e.to_string()));
                            }
                        }
                        Some(SessionCommand::Leave(ack)) => {
                            self.shutdown().await;
                            self.emit(SessionEvent::Left);
                            let _ = ack.send(());
                            break;
                        }
                        None => {
                            debug!("Session handle dropped, leaving");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                changed = self.playback_rx.changed() => {
                    if changed.is_err() {
                        warn!("Playback store closed");
                        self.emit(SessionEvent::Error("playback store closed".to_string()));
                        self.shutdown().await;
                        break;
                    }
                    let snapshot = self.playback_rx.borrow_and_update().clone();
                    self.offset.write().observe_write(snapshot.timestamp);
                    self.emit(SessionEvent::PlaybackChanged(snapshot.clone()));
                    let result = self.reconciler.on_snapshot(&snapshot).await;
                    self.report(result);
                }
                changed = self.directory_rx.changed() => {
                    if changed.is_err() {
                        warn!("Presence directory closed");
                        self.shutdown().await;
                        break;
                    }
                    let directory = self.directory_rx.borrow_and_update().clone();
                    if self.on_directory(&directory) {
                        break;
                    }
                }
                sample = next_offset(&mut self.offset_rx) => {
                    match sample {
                        Some(offset_ms) => self.offset.write().record_sample(offset_ms),
                        None => {
                            debug!("Offset signal closed, keeping last estimate");
                            self.offset_rx = None;
                        }
                    }
                }
                _ = reconcile_tick.tick() => {
                    let snapshot = self.playback_rx.borrow().clone();
                    let result = self.reconciler.on_tick(&snapshot).await;
                    self.report(result);
                }
                _ = heartbeat_tick.tick() => {
                    if let Err(e) = self.presence.heartbeat().await {
                        warn!("Heartbeat failed, retrying next interval: {}", e);
                    }
                }
                _ = sweep_tick.tick(), if self.is_host => {
                    if let Err(e) = self.presence.sweep().await {
                        warn!("Stale sweep failed: {}", e);
                    }
                }
            }
        }

        debug!("Session actor for {} stopped", self.presence.identity().id);
    }

    /// Publish the device list; returns true when our own record is gone
    fn on_directory(&mut self, directory: &DeviceMap) -> bool {
        let mut devices: Vec<Device> = directory.values().cloned().collect();
        sort_devices(&mut devices);
        self.emit(SessionEvent::DevicesChanged(devices));

        match self.presence.observe(directory) {
            SelfStatus::Removed => {
                warn!("{}", SyncError::PresenceExpired);
                self.controller.deactivate();
                self.pause_players();
                self.emit(SessionEvent::Removed);
                true
            }
            SelfStatus::Present | SelfStatus::NotYetRegistered => false,
        }
    }

    async fn shutdown(&mut self) {
        self.controller.deactivate();
        self.presence.depart().await;
        for player in self.players.all() {
            if player.loaded_media().is_some() {
                if let Err(e) = player.pause().await {
                    debug!("Failed to pause player on leave: {}", e);
                }
            }
        }
        self.offset.write().clear();
        info!("Left room");
    }

    /// Stop playback without waiting on the players
    fn pause_players(&self) {
        let players = self.players.clone();
        tokio::spawn(async move {
            for player in players.all() {
                if player.loaded_media().is_some() {
                    let _ = player.pause().await;
                }
            }
        });
    }

    fn report(&self, result: Result<ReconcileOutcome, SyncError>) {
        match result {
            Ok(ReconcileOutcome::Applied(status)) => {
                self.emit(SessionEvent::SyncStatus(status));
            }
            Ok(ReconcileOutcome::AutoplayBlocked(status)) => {
                self.emit(SessionEvent::SyncStatus(status));
                self.emit(SessionEvent::AutoplayBlocked);
            }
            Ok(ReconcileOutcome::Discarded)
            | Ok(ReconcileOutcome::Skipped(_))
            | Ok(ReconcileOutcome::NoMedia) => {}
            Err(e) if e.is_retryable() => {
                warn!("Reconciliation failed, retrying next tick: {}", e);
            }
            Err(e) => {
                warn!("Reconciliation failed: {}", e);
                self.emit(SessionEvent::Error(e.to_string()));
            }
        }
    }

    fn emit(&self, event: SessionEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => debug!("Event queue full, dropping {:?}", event),
            // The owner stopped listening
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::{LookupError, MediaMetadata, MetadataLookup, VideoId};
    use crate::player::{FilePlayer, MediaPlayer, PlayerState, Track, TrackCatalog};
    use crate::store::{MemoryBackend, PlaybackStore, PresenceDirectory, StoreError};
    use crate::sync::RoomCode;
    use async_trait::async_trait;

    struct NoLookup;

    #[async_trait]
    impl MetadataLookup for NoLookup {
        async fn lookup(&self, video: &VideoId) -> Result<MediaMetadata, LookupError> {
            Err(LookupError::NotFound(video.to_string()))
        }
    }

    /// Notifies subscribers before acknowledging the write, like a store
    /// with latency compensation
    struct EagerStore {
        inner: Arc<dyn PlaybackStore>,
    }

    #[async_trait]
    impl PlaybackStore for EagerStore {
        async fn read(&self) -> Result<PlaybackState, StoreError> {
            self.inner.read().await
        }

        async fn write_all(&self, snapshot: PlaybackState) -> Result<(), StoreError> {
            self.inner.write_all(snapshot).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        }

        fn subscribe(&self) -> watch::Receiver<PlaybackState> {
            self.inner.subscribe()
        }
    }

    struct Client {
        handle: SessionHandle,
        file: Arc<FilePlayer>,
    }

    struct Room {
        clock: Arc<ManualClock>,
        backend: MemoryBackend,
        code: RoomCode,
        catalog: Arc<TrackCatalog>,
    }

    impl Room {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1_000_000));
            let backend = MemoryBackend::new(clock.clone());
            let code = backend.create_room("host").unwrap();
            let catalog = Arc::new(TrackCatalog::new());
            catalog.add(Track::new("t1", "First", 600.0));
            Self {
                clock,
                backend,
                code,
                catalog,
            }
        }

        async fn join(&self, id: &str, requires_gesture: bool) -> Client {
            self.join_with(id, requires_gesture, |links| links).await
        }

        async fn join_with<F>(&self, id: &str, requires_gesture: bool, wrap: F) -> Client
        where
            F: FnOnce(RoomLinks) -> RoomLinks,
        {
            let clock: SharedClock = self.clock.clone();
            let file = Arc::new(
                FilePlayer::new(self.catalog.clone(), clock.clone())
                    .with_autoplay_policy(requires_gesture),
            );
            let video = Arc::new(FilePlayer::new(Arc::new(TrackCatalog::new()), clock.clone()));
            let deps = SessionDeps {
                players: Players::new(file.clone(), video),
                catalog: self.catalog.clone(),
                lookup: Arc::new(NoLookup),
            };
            let links = wrap(self.backend.connect(&self.code, clock.clone()).unwrap());
            let handle = RoomSession::join(
                links,
                DeviceIdentity::new(id, id.to_uppercase()),
                clock,
                deps,
                SyncConfig::default(),
            )
            .await
            .unwrap();
            Client { handle, file }
        }
    }

    async fn wait_for<F>(handle: &mut SessionHandle, matches: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        let wait = async {
            loop {
                match handle.next_event().await {
                    Some(event) if matches(&event) => return event,
                    Some(_) => continue,
                    None => panic!("session ended before the expected event"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(120), wait)
            .await
            .expect("timed out waiting for session event")
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_tracks_host() {
        let room = Room::new();
        let host = room.join("host", false).await;
        let mut follower = room.join("f1", false).await;
        assert!(host.handle.is_host());
        assert!(!follower.handle.is_host());

        host.handle.host().play().await.unwrap();
        wait_for(&mut follower.handle, |e| {
            matches!(e, SessionEvent::SyncStatus(s) if s.transport == PlayerState::Playing)
        })
        .await;
        assert_eq!(follower.file.loaded_media().as_deref(), Some("t1"));

        // Follower fell 3s behind; the next tick pulls it back
        room.clock.advance(Duration::from_secs(5));
        follower.file.seek(2.0).await.unwrap();
        let event = wait_for(&mut follower.handle, |e| {
            matches!(e, SessionEvent::SyncStatus(s) if s.corrected)
        })
        .await;
        if let SessionEvent::SyncStatus(status) = event {
            assert_eq!(status.expected, 5.0);
        }
        assert_eq!(follower.file.current_position().await.unwrap(), 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_host_commands_refused() {
        let room = Room::new();
        let _host = room.join("host", false).await;
        let follower = room.join("f1", false).await;

        let before = room.backend.open_room(&room.code).unwrap().playback.document();
        assert!(matches!(
            follower.handle.host().pause().await,
            Err(SyncError::NotAuthorized)
        ));
        assert_eq!(
            room.backend.open_room(&room.code).unwrap().playback.document(),
            before
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_removes_presence() {
        let room = Room::new();
        let mut host = room.join("host", false).await;
        let mut follower = room.join("f1", false).await;

        wait_for(&mut host.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.len() == 2)
        })
        .await;

        follower.handle.leave().await.unwrap();
        wait_for(&mut follower.handle, |e| matches!(e, SessionEvent::Left)).await;

        let event = wait_for(&mut host.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.len() == 1)
        })
        .await;
        if let SessionEvent::DevicesChanged(devices) = event {
            assert_eq!(devices[0].id, "host");
        }
        assert!(matches!(
            follower.handle.host().play().await,
            Err(SyncError::NotInRoom)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_follower_is_swept() {
        let room = Room::new();
        let mut host = room.join("host", false).await;
        let follower = room.join("f1", false).await;
        wait_for(&mut host.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.len() == 2)
        })
        .await;

        // No departure cleanup; only the TTL sweep can remove it
        follower.handle.abort();
        room.clock.advance(Duration::from_secs(31));

        wait_for(&mut host.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.len() == 1 && d[0].is_host)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_follower_ends_session() {
        let room = Room::new();
        let _host = room.join("host", false).await;
        let mut follower = room.join("f1", false).await;
        wait_for(&mut follower.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.iter().any(|d| d.id == "f1"))
        })
        .await;

        let presence = room.backend.open_room(&room.code).unwrap().presence.clone();
        presence.remove("f1").await.unwrap();

        wait_for(&mut follower.handle, |e| matches!(e, SessionEvent::Removed)).await;
        assert!(matches!(
            follower.handle.host().play().await,
            Err(SyncError::NotInRoom)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoplay_unlock() {
        let room = Room::new();
        let host = room.join("host", false).await;
        let mut follower = room.join("f1", true).await;

        host.handle.host().play().await.unwrap();
        wait_for(&mut follower.handle, |e| matches!(e, SessionEvent::AutoplayBlocked)).await;
        assert_eq!(follower.file.player_state().await.unwrap(), PlayerState::Paused);

        follower.handle.unlock().unwrap();
        wait_for(&mut follower.handle, |e| {
            matches!(e, SessionEvent::SyncStatus(s) if s.transport == PlayerState::Playing)
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_reaches_directory() {
        let room = Room::new();
        let mut host = room.join("host", false).await;
        let follower = room.join("f1", false).await;

        follower.handle.rename("Kitchen").unwrap();
        wait_for(&mut host.handle, |e| {
            matches!(e, SessionEvent::DevicesChanged(d) if d.iter().any(|d| d.display_name == "Kitchen"))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_skips_own_write_seen_before_ack() {
        let room = Room::new();
        let mut host = room
            .join_with("host", false, |links| RoomLinks {
                playback: Arc::new(EagerStore {
                    inner: links.playback.clone(),
                }),
                ..links
            })
            .await;

        host.handle.host().play().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let mut statuses = Vec::new();
        while let Some(event) = host.handle.try_next_event() {
            if let SessionEvent::SyncStatus(status) = event {
                statuses.push(status);
            }
        }
        assert!(statuses.is_empty(), "host reconciled its own write: {:?}", statuses);
        assert_eq!(host.file.player_state().await.unwrap(), PlayerState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undrained_event_queue_stays_bounded() {
        let room = Room::new();
        let host = room.join("host", false).await;
        let mut follower = room.join("f1", false).await;
        host.handle.host().play().await.unwrap();

        // Minutes of reconcile ticks with nobody reading events
        tokio::time::sleep(Duration::from_secs(300)).await;

        let mut queued = 0;
        while follower.handle.try_next_event().is_some() {
            queued += 1;
        }
        assert_eq!(queued, EVENT_QUEUE_CAPACITY);

        // Once drained, events flow again
        tokio::time::sleep(Duration::from_secs(1)).await;
        let mut resumed = false;
        while let Some(event) = follower.handle.try_next_event() {
            resumed |= matches!(event, SessionEvent::SyncStatus(_));
        }
        assert!(resumed);
    }
}
