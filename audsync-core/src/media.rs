//! External video references and metadata lookup

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

/// Length of a video id
const VIDEO_ID_LENGTH: usize = 11;

/// Default oEmbed provider
pub const DEFAULT_OEMBED_URL: &str = "https://www.youtube.com";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// A validated external video id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    /// Extract the id from a share link, watch/embed/shorts URL or a bare id
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if is_video_id(input) {
            return Some(VideoId(input.to_string()));
        }

        let url = Url::parse(input)
            .or_else(|_| Url::parse(&format!("https://{}", input)))
            .ok()?;
        let host = url.host_str()?;
        let host = host
            .trim_start_matches("www.")
            .trim_start_matches("m.")
            .trim_start_matches("music.");
        let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();

        let candidate = match host {
            "youtu.be" => segments.first().map(|s| s.to_string()),
            "youtube.com" | "youtube-nocookie.com" => match segments.as_slice() {
                ["watch"] => url
                    .query_pairs()
                    .find(|(k, _)| k == "v")
                    .map(|(_, v)| v.into_owned()),
                ["embed" | "shorts" | "live" | "v", id, ..] => Some(id.to_string()),
                _ => None,
            },
            _ => None,
        }?;

        is_video_id(&candidate).then_some(VideoId(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical watch URL, as metadata providers expect it
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_video_id(s: &str) -> bool {
    s.len() == VIDEO_ID_LENGTH
        && s
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Display metadata for a video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMetadata {
    pub title: String,
    pub author: String,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No metadata for {0}")]
    NotFound(String),
}

/// Resolves display metadata for an external video
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, video: &VideoId) -> Result<MediaMetadata, LookupError>;
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    title: String,
    author_name: String,
}

/// Metadata lookup over an oEmbed endpoint
#[derive(Debug, Clone)]
pub struct OEmbedClient {
    http: Client,
    base_url: String,
}

impl OEmbedClient {
    pub fn new() -> Result<Self, LookupError> {
        Self::with_base_url(DEFAULT_OEMBED_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self, LookupError> {
        let http = Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl MetadataLookup for OEmbedClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn lookup(&self, video: &VideoId) -> Result<MediaMetadata, LookupError> {
        let url = format!("{}/oembed", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("url", video.watch_url().as_str()), ("format", "json")])
            .send()
            .await?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                return Err(LookupError::NotFound(video.to_string()));
            }
            _ => {}
        }

        let body: OEmbedResponse = resp.error_for_status()?.json().await?;
        debug!("Resolved {} -> '{}' by {}", video, body.title, body.author_name);
        Ok(MediaMetadata {
            title: body.title,
            author: body.author_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "dQw4w9WgXcQ";

    #[test]
    fn test_parse_reference_forms() {
        let forms = [
            "dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtu.be/dQw4w9WgXcQ?t=42",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ&list=PL123",
            "https://m.youtube.com/watch?feature=share&v=dQw4w9WgXcQ",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
            "https://youtube.com/shorts/dQw4w9WgXcQ",
            "  https://www.youtube-nocookie.com/embed/dQw4w9WgXcQ  ",
        ];
        for form in forms {
            assert_eq!(VideoId::parse(form).map(|v| v.0), Some(ID.to_string()), "{}", form);
        }
    }

    #[test]
    fn test_reject_bad_references() {
        let bad = [
            "bad-url",
            "",
            "https://vimeo.com/dQw4w9WgXcQ",
            "https://www.youtube.com/watch?v=short",
            "https://www.youtube.com/channel/dQw4w9WgXcQ",
            "dQw4w9WgXc!",
        ];
        for input in bad {
            assert!(VideoId::parse(input).is_none(), "{}", input);
        }
    }

    #[test]
    fn test_watch_url() {
        let id = VideoId::parse(ID).unwrap();
        assert_eq!(id.watch_url(), "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(id.to_string(), ID);
    }

    #[test]
    fn test_oembed_response() {
        let body: OEmbedResponse = serde_json::from_str(
            r#"{ "title": "Song", "author_name": "Artist", "type": "video", "version": "1.0" }"#,
        )
        .unwrap();
        assert_eq!(body.title, "Song");
        assert_eq!(body.author_name, "Artist");

        let client = OEmbedClient::with_base_url("http://localhost:8080/").unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
    }
}
