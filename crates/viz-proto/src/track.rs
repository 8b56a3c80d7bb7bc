use serde::{Deserialize, Serialize};

/// Last-known "now playing" record.
///
/// Only the poller builds new values; everyone else reads a shared copy.  An
/// empty `track_id` means nothing has been seen yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackState {
    pub track_id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album_art_url: String,
    pub artist_icon_url: String,
    pub genres: Vec<String>,
    /// Playback position as a fraction of the track, always within [0, 1].
    pub progress: f64,
    pub is_playing: bool,
}

impl TrackState {
    pub fn is_empty(&self) -> bool {
        self.track_id.is_empty()
    }

    /// Artist names as a single display line ("A, B, C").
    pub fn artists_display(&self) -> String {
        self.artists.join(", ")
    }

    /// Update `progress` from millisecond timings reported upstream.
    ///
    /// A missing or zero duration yields 0; positions past the end (the
    /// service sometimes reports progress > duration right at a track
    /// boundary) clamp to 1.
    pub fn set_progress(&mut self, progress_ms: u64, duration_ms: u64) {
        self.progress = progress_fraction(progress_ms, duration_ms);
    }
}

pub fn progress_fraction(progress_ms: u64, duration_ms: u64) -> f64 {
    if duration_ms == 0 {
        return 0.0;
    }
    (progress_ms as f64 / duration_ms as f64).clamp(0.0, 1.0)
}
