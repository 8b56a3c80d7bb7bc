use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Artist reference as listed on the playing item.  Local files have no id.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtistRef {
    pub id: Option<String>,
    pub name: String,
}

/// Result of a "currently playing" query with an item present.
#[derive(Debug, Clone, PartialEq)]
pub struct NowPlaying {
    pub track_id: String,
    pub title: String,
    pub artists: Vec<ArtistRef>,
    pub album_art_url: String,
    pub progress_ms: u64,
    pub duration_ms: u64,
    pub is_playing: bool,
}

impl NowPlaying {
    /// First artist that can be looked up by id.
    pub fn lookup_artist_id(&self) -> Option<&str> {
        self.artists.iter().find_map(|a| a.id.as_deref())
    }

    pub fn artist_names(&self) -> Vec<String> {
        self.artists.iter().map(|a| a.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArtistDetails {
    pub image_url: String,
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackAction {
    Play,
    Pause,
    Next,
    Previous,
}

impl PlaybackAction {
    /// Parse the action segment of `/control/<action>`.
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "next" => Some(Self::Next),
            "back" | "previous" | "prev" => Some(Self::Previous),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no access token available")]
    NoToken,
    #[error("access token rejected")]
    Unauthorized,
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("service returned status {code}")]
    Status { code: u16 },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ServiceError {
    /// Server-requested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[async_trait]
pub trait MusicService: Send + Sync {
    /// `Ok(None)` when nothing is playing.
    async fn currently_playing(&self) -> Result<Option<NowPlaying>, ServiceError>;

    async fn artist(&self, artist_id: &str) -> Result<ArtistDetails, ServiceError>;

    async fn control(&self, action: PlaybackAction) -> Result<(), ServiceError>;
}
