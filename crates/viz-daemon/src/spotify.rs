use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use viz_proto::config::SpotifyConfig;

use crate::service::{
    ArtistDetails, ArtistRef, MusicService, NowPlaying, PlaybackAction, ServiceError,
};

pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

/// Fixed token from config or environment.
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token)
    }
}

impl TokenSource for StaticToken {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

// ── wire models ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CurrentlyPlayingResponse {
    #[serde(default)]
    is_playing: bool,
    #[serde(default)]
    progress_ms: Option<u64>,
    #[serde(default)]
    item: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    artists: Vec<SimpleArtist>,
    #[serde(default)]
    album: Option<AlbumObject>,
}

#[derive(Debug, Deserialize)]
struct SimpleArtist {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    #[serde(default)]
    images: Vec<ImageObject>,
}

#[derive(Debug, Deserialize)]
struct ImageObject {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    #[serde(default)]
    images: Vec<ImageObject>,
    #[serde(default)]
    genres: Vec<String>,
}

impl CurrentlyPlayingResponse {
    fn into_now_playing(self) -> Option<NowPlaying> {
        let item = self.item?;
        // Local files have no id; their uri is still stable per file.
        let track_id = item.id.or(item.uri).unwrap_or_default();
        let images = item.album.map(|a| a.images).unwrap_or_default();
        // Images come largest first; the medium one suits the overlay.
        let album_art_url = images
            .get(1)
            .or_else(|| images.first())
            .map(|i| i.url.clone())
            .unwrap_or_default();

        Some(NowPlaying {
            track_id,
            title: item.name,
            artists: item
                .artists
                .into_iter()
                .map(|a| ArtistRef {
                    id: a.id.filter(|id| !id.is_empty()),
                    name: a.name,
                })
                .collect(),
            album_art_url,
            progress_ms: self.progress_ms.unwrap_or(0),
            duration_ms: item.duration_ms,
            is_playing: self.is_playing,
        })
    }
}

impl From<ArtistObject> for ArtistDetails {
    fn from(artist: ArtistObject) -> Self {
        Self {
            image_url: artist
                .images
                .into_iter()
                .next()
                .map(|i| i.url)
                .unwrap_or_default(),
            genres: artist.genres,
        }
    }
}

// ── client ────────────────────────────────────────────────────────────────────

pub struct SpotifyClient {
    http: Client,
    api_base: String,
    tokens: Arc<dyn TokenSource>,
}

impl SpotifyClient {
    pub fn new(config: &SpotifyConfig, tokens: Arc<dyn TokenSource>) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent(concat!("spectrum-viz/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ServiceError> {
        let token = self.tokens.access_token().ok_or(ServiceError::NoToken)?;
        let response = request.bearer_auth(token).send().await?;
        check_status(response.status(), response.headers())?;
        Ok(response)
    }

    async fn control_request(&self, request: RequestBuilder) -> Result<(), ServiceError> {
        self.send(request.header(CONTENT_LENGTH, 0)).await.map(|_| ())
    }
}

/// Map a non-success status onto the error taxonomy.
fn check_status(status: StatusCode, headers: &HeaderMap) -> Result<(), ServiceError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::UNAUTHORIZED => ServiceError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        other => ServiceError::Status {
            code: other.as_u16(),
        },
    })
}

#[async_trait]
impl MusicService for SpotifyClient {
    async fn currently_playing(&self) -> Result<Option<NowPlaying>, ServiceError> {
        let response = self
            .send(self.http.get(self.url("/me/player/currently-playing")))
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(None);
        }
        let parsed: CurrentlyPlayingResponse =
            serde_json::from_slice(&body).map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(parsed.into_now_playing())
    }

    async fn artist(&self, artist_id: &str) -> Result<ArtistDetails, ServiceError> {
        debug!("Looking up artist {}", artist_id);
        let response = self
            .send(self.http.get(self.url(&format!("/artists/{}", artist_id))))
            .await?;
        let artist: ArtistObject = response
            .json()
            .await
            .map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(artist.into())
    }

    async fn control(&self, action: PlaybackAction) -> Result<(), ServiceError> {
        let request = match action {
            PlaybackAction::Play => self.http.put(self.url("/me/player/play")),
            PlaybackAction::Pause => self.http.put(self.url("/me/player/pause")),
            PlaybackAction::Next => self.http.post(self.url("/me/player/next")),
            PlaybackAction::Previous => self.http.post(self.url("/me/player/previous")),
        };
        self.control_request(request).await
    }
}
