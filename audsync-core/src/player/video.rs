//! External video player
//!
//! The embedded video player runs out of process (a browser or webview) and
//! exposes a small HTTP control bridge on localhost.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{MediaPlayer, PlayerError, PlayerState};

/// Default control bridge port
pub const DEFAULT_BRIDGE_PORT: u16 = 10787;

/// Connection timeout (short since it's localhost)
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(1);

/// Request timeout (short since it's localhost)
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Player snapshot reported by `GET /state`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeState {
    /// Id of the cued or playing video
    #[serde(default)]
    pub video_id: Option<String>,

    /// Embedded player state code
    pub state: i32,

    /// Current playback time in seconds
    #[serde(default)]
    pub current_time: f64,

    /// Video length in seconds (0 until metadata has loaded)
    #[serde(default)]
    pub duration: f64,
}

impl BridgeState {
    pub fn player_state(&self) -> PlayerState {
        player_state_from_code(self.state)
    }
}

/// Map the embedded player's numeric state onto [`PlayerState`].
/// Buffering counts as playing and cued as paused.
pub fn player_state_from_code(code: i32) -> PlayerState {
    match code {
        0 => PlayerState::Ended,
        1 | 3 => PlayerState::Playing,
        2 | 5 => PlayerState::Paused,
        _ => PlayerState::Unstarted,
    }
}

#[derive(Debug, Clone, Serialize)]
struct SeekRequest {
    position: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadRequest {
    video_id: String,
}

/// HTTP client for the video control bridge
#[derive(Debug, Clone)]
pub struct VideoBridgeClient {
    http: Client,
    base_url: String,
}

impl VideoBridgeClient {
    /// Client for the bridge on localhost at the default port
    pub fn new() -> Result<Self, PlayerError> {
        Self::with_port(DEFAULT_BRIDGE_PORT)
    }

    pub fn with_port(port: u16) -> Result<Self, PlayerError> {
        // Use 127.0.0.1 explicitly to avoid IPv6 issues
        Self::with_base_url(format!("http://127.0.0.1:{}", port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, PlayerError> {
        let http = Client::builder()
            .connect_timeout(CONNECTION_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.http.request(method, &url)
    }

    /// Send a control request and map the bridge's status codes
    async fn command(&self, req: reqwest::RequestBuilder) -> Result<(), PlayerError> {
        let resp = req.send().await.map_err(|e| {
            warn!("Video bridge unreachable: {}", e);
            PlayerError::Http(e)
        })?;

        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::FORBIDDEN => Err(PlayerError::AutoplayBlocked),
            StatusCode::NOT_FOUND => Err(PlayerError::NoMedia),
            s => Err(PlayerError::Bridge(format!("Unexpected response (HTTP {})", s.as_u16()))),
        }
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn state(&self) -> Result<BridgeState, PlayerError> {
        let resp = self
            .request(reqwest::Method::GET, "/state")
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn play(&self) -> Result<(), PlayerError> {
        self.command(self.request(reqwest::Method::POST, "/play")).await
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn pause(&self) -> Result<(), PlayerError> {
        self.command(self.request(reqwest::Method::POST, "/pause")).await
    }

    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        self.command(
            self.request(reqwest::Method::POST, "/seek")
                .json(&SeekRequest { position }),
        )
        .await
    }

    /// Cue a video by id without starting it
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn load(&self, video_id: &str) -> Result<(), PlayerError> {
        self.command(
            self.request(reqwest::Method::POST, "/load")
                .json(&LoadRequest {
                    video_id: video_id.to_string(),
                }),
        )
        .await
    }
}

/// [`MediaPlayer`] over the video control bridge
pub struct ExternalVideoPlayer {
    client: VideoBridgeClient,
    loaded: Mutex<Option<String>>,
}

impl ExternalVideoPlayer {
    pub fn new(client: VideoBridgeClient) -> Self {
        Self {
            client,
            loaded: Mutex::new(None),
        }
    }

    pub fn client(&self) -> &VideoBridgeClient {
        &self.client
    }
}

#[async_trait]
impl MediaPlayer for ExternalVideoPlayer {
    async fn current_position(&self) -> Result<f64, PlayerError> {
        Ok(self.client.state().await?.current_time)
    }

    async fn duration(&self) -> Result<Option<f64>, PlayerError> {
        let state = self.client.state().await?;
        Ok((state.duration > 0.0).then_some(state.duration))
    }

    async fn seek(&self, position: f64) -> Result<(), PlayerError> {
        self.client.seek(position.max(0.0)).await
    }

    async fn play(&self) -> Result<(), PlayerError> {
        self.client.play().await
    }

    async fn pause(&self) -> Result<(), PlayerError> {
        self.client.pause().await
    }

    async fn player_state(&self) -> Result<PlayerState, PlayerError> {
        Ok(self.client.state().await?.player_state())
    }

    async fn load_media(&self, media_ref: &str) -> Result<(), PlayerError> {
        debug!("Cueing video {}", media_ref);
        self.client.load(media_ref).await?;
        *self.loaded.lock() = Some(media_ref.to_string());
        Ok(())
    }

    fn loaded_media(&self) -> Option<String> {
        self.loaded.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = VideoBridgeClient::new().unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:10787");

        let client = VideoBridgeClient::with_base_url("http://localhost:9000/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:9000");
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(player_state_from_code(-1), PlayerState::Unstarted);
        assert_eq!(player_state_from_code(0), PlayerState::Ended);
        assert_eq!(player_state_from_code(1), PlayerState::Playing);
        assert_eq!(player_state_from_code(2), PlayerState::Paused);
        assert_eq!(player_state_from_code(3), PlayerState::Playing);
        assert_eq!(player_state_from_code(5), PlayerState::Paused);
    }

    #[test]
    fn test_bridge_state_json() {
        let state: BridgeState = serde_json::from_str(
            r#"{ "videoId": "dQw4w9WgXcQ", "state": 3, "currentTime": 12.25, "duration": 212.0 }"#,
        )
        .unwrap();
        assert_eq!(state.video_id.as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(state.player_state(), PlayerState::Playing);
        assert_eq!(state.current_time, 12.25);

        let state: BridgeState = serde_json::from_str(r#"{ "state": -1 }"#).unwrap();
        assert_eq!(state.player_state(), PlayerState::Unstarted);
        assert_eq!(state.duration, 0.0);
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transient() {
        // Nothing listens on port 9 (discard) on a test machine
        let player = ExternalVideoPlayer::new(VideoBridgeClient::with_port(9).unwrap());
        let err = player.play().await.unwrap_err();
        assert!(err.is_transient());
        assert!(player.loaded_media().is_none());
    }
}
