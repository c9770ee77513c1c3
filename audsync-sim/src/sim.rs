//! The simulated room
//!
//! One host and N followers share an in-memory backend. Followers get a
//! skewed local clock and a player that runs slightly fast or slow, so
//! drift builds up and the reconciler has real work to do. One follower
//! "crashes" partway through to show stale-device eviction.

use crate::metrics::{LogLevel, Metrics, SimStatus};
use audsync_core::media::OEmbedClient;
use audsync_core::player::{ExternalVideoPlayer, FilePlayer, Players, Track, TrackCatalog, VideoBridgeClient};
use audsync_core::{
    init_tracing_with, DeviceIdentity, HostController, MemoryBackend, RoomCode, RoomSession,
    SessionDeps, SessionEvent, SessionHandle, SharedClock, SkewedClock, SyncConfig, SyncError,
    SystemClock,
};
use parking_lot::RwLock;
use rand::Rng;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How often the backend republishes clock offsets
const OFFSET_REFRESH: Duration = Duration::from_secs(5);

/// Command line options
#[derive(Debug, Clone)]
pub struct SimOptions {
    pub followers: usize,
    /// Follower (by index) that stops without leaving, and when
    pub crash: Option<(usize, Duration)>,
    pub config: SyncConfig,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            followers: 3,
            crash: Some((0, Duration::from_secs(45))),
            config: SyncConfig::default(),
        }
    }
}

/// Tracks the simulated devices play from
fn demo_catalog() -> TrackCatalog {
    let catalog = TrackCatalog::new();
    catalog.add(Track::new("01-intro", "Intro", 95.0).with_artist("The Offsets"));
    catalog.add(Track::new("02-drift", "Drift", 212.0).with_artist("The Offsets"));
    catalog.add(Track::new("03-heartbeat", "Heartbeat", 184.0).with_artist("Stale Records"));
    catalog
}

/// A device taking part in the simulation
struct SimDevice {
    id: String,
    players: Players,
}

fn build_device(
    id: &str,
    clock: SharedClock,
    rate: f64,
    catalog: &Arc<TrackCatalog>,
) -> Result<SimDevice, Box<dyn Error>> {
    let file = FilePlayer::new(catalog.clone(), clock).with_rate(rate);
    // Video commands only reach the bridge if an external video gets loaded
    let video = ExternalVideoPlayer::new(VideoBridgeClient::new()?);
    Ok(SimDevice {
        id: id.to_string(),
        players: Players::new(Arc::new(file), Arc::new(video)),
    })
}

async fn join(
    backend: &MemoryBackend,
    code: &RoomCode,
    device: &SimDevice,
    name: &str,
    clock: SharedClock,
    catalog: &Arc<TrackCatalog>,
    options: &SimOptions,
) -> Result<SessionHandle, Box<dyn Error>> {
    let links = backend.connect(code, clock.clone())?;
    let deps = SessionDeps {
        players: device.players.clone(),
        catalog: catalog.clone(),
        lookup: Arc::new(OEmbedClient::new()?),
    };
    let handle = RoomSession::join(
        links,
        DeviceIdentity::new(device.id.clone(), name),
        clock,
        deps,
        options.config.clone(),
    )
    .await?;
    Ok(handle)
}

/// Forward one device's session events into the metrics until shutdown
fn spawn_pump(
    mut handle: SessionHandle,
    metrics: Arc<RwLock<Metrics>>,
    mut shutdown: watch::Receiver<bool>,
    crash_after: Option<Duration>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let id = handle.device_id().to_string();
        let crash = async {
            match crash_after {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(crash);

        loop {
            tokio::select! {
                event = handle.next_event() => {
                    let Some(event) = event else { break };
                    if record_event(&metrics, &id, handle.is_host(), event) {
                        break;
                    }
                }
                _ = &mut crash => {
                    handle.abort();
                    metrics.write().log(LogLevel::Warning, format!("{} crashed (no leave)", id));
                    break;
                }
                _ = shutdown.changed() => {
                    if let Err(e) = handle.leave().await {
                        warn!("{} failed to leave: {}", id, e);
                    }
                    break;
                }
            }
        }
    })
}

/// Apply one event; returns true when the session is over
fn record_event(metrics: &RwLock<Metrics>, id: &str, is_host: bool, event: SessionEvent) -> bool {
    let mut m = metrics.write();
    match event {
        SessionEvent::PlaybackChanged(snapshot) => {
            if is_host {
                m.set_playback(&snapshot);
            }
        }
        SessionEvent::DevicesChanged(devices) => {
            if is_host {
                for name in m.set_directory(&devices) {
                    m.log(LogLevel::Presence, format!("{} left the room", name));
                }
            }
        }
        SessionEvent::SyncStatus(status) => m.record_sync(id, &status),
        SessionEvent::AutoplayBlocked => {
            m.log(LogLevel::Warning, format!("{} needs a user gesture to play", id));
        }
        SessionEvent::Error(message) => m.log(LogLevel::Error, format!("{}: {}", id, message)),
        SessionEvent::Removed => {
            m.log(LogLevel::Presence, format!("{} was removed from the room", id));
            return true;
        }
        SessionEvent::Left => return true,
    }
    false
}

/// Drive the host through a fixed set of commands, forever
async fn script_host(controller: HostController, catalog: Arc<TrackCatalog>, metrics: Arc<RwLock<Metrics>>) {
    let tracks = catalog.list();
    if tracks.is_empty() {
        return;
    }
    let mut round = 0usize;

    loop {
        let track = &tracks[round % tracks.len()];
        let steps: Vec<(&str, Duration)> = vec![
            ("load", Duration::from_secs(2)),
            ("play", Duration::from_secs(20)),
            ("seek", Duration::from_secs(15)),
            ("pause", Duration::from_secs(5)),
            ("play", Duration::from_secs(25)),
        ];

        for (step, wait) in steps {
            let result = match step {
                "load" => controller.load_track(&track.id).await,
                "play" => controller.play().await,
                "pause" => controller.pause().await,
                _ => controller.seek(track.duration / 2.0).await,
            };

            {
                let mut m = metrics.write();
                match result {
                    Ok(()) => m.log(LogLevel::Host, format!("{} ({})", step, track.title)),
                    Err(SyncError::NotInRoom) | Err(SyncError::Departed) => return,
                    Err(e) => m.log(LogLevel::Error, format!("Host {} failed: {}", step, e)),
                }
            }

            tokio::time::sleep(wait).await;
        }
        round += 1;
    }
}

/// Run the simulation until `shutdown` flips to true
pub async fn run(
    metrics: Arc<RwLock<Metrics>>,
    options: SimOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn Error>> {
    let server_clock: SharedClock = Arc::new(SystemClock);
    let backend = Arc::new(MemoryBackend::new(server_clock.clone()));
    let catalog = Arc::new(demo_catalog());

    let host = build_device("host", server_clock.clone(), 1.0, &catalog)?;
    let code = backend.create_room(&host.id)?;
    {
        let mut m = metrics.write();
        m.room_code = Some(code.to_string());
        m.log(LogLevel::Info, format!("Room {} created", code));
        m.register_device(&host.id, "Host", true, 0, 1.0);
    }

    let host_handle = join(&backend, &code, &host, "Host", server_clock, &catalog, &options).await?;
    let controller = host_handle.host().clone();
    let mut pumps = vec![spawn_pump(host_handle, metrics.clone(), shutdown.clone(), None)];

    for i in 0..options.followers {
        let (skew_ms, rate) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(-3_000i64..=3_000), rng.gen_range(0.98..1.02))
        };
        let clock: SharedClock = Arc::new(SkewedClock::new(skew_ms));
        let id = format!("follower-{}", i + 1);
        let name = format!("Follower {}", i + 1);
        let device = build_device(&id, clock.clone(), rate, &catalog)?;

        metrics.write().register_device(&id, &name, false, skew_ms, rate);
        let handle = join(&backend, &code, &device, &name, clock, &catalog, &options).await?;

        let crash_after = options
            .crash
            .and_then(|(index, after)| (index == i).then_some(after));
        pumps.push(spawn_pump(handle, metrics.clone(), shutdown.clone(), crash_after));
    }

    metrics.write().status = SimStatus::Running;
    info!("Simulation running with {} followers", options.followers);

    let refresher = {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(OFFSET_REFRESH);
            loop {
                interval.tick().await;
                backend.refresh_offsets();
            }
        })
    };
    let script = tokio::spawn(script_host(controller.clone(), catalog.clone(), metrics.clone()));

    // Wait for the stop signal, then let every device leave
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    metrics.write().status = SimStatus::Stopping;
    controller.deactivate();
    script.abort();
    refresher.abort();
    for result in futures::future::join_all(pumps).await {
        if let Err(e) = result {
            warn!("Device task failed: {}", e);
        }
    }
    info!("Simulation stopped");
    Ok(())
}

/// Run with plain logging (no dashboard) until Ctrl-C
pub async fn run_with_logging(metrics: Arc<RwLock<Metrics>>, options: SimOptions) -> Result<(), Box<dyn Error>> {
    init_tracing_with(&["audsync_sim=info"]);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let result = run(metrics.clone(), options, shutdown_rx).await;
    if result.is_err() {
        metrics.write().status = SimStatus::Error;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_catalog() {
        let catalog = demo_catalog();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.first().unwrap().id, "01-intro");
    }

    #[test]
    fn test_defaults_crash_one_follower() {
        let options = SimOptions::default();
        assert_eq!(options.crash.map(|(i, _)| i), Some(0));
        assert!(options.followers > 0);
    }
}
