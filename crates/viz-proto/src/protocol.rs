use serde::Serialize;

use crate::bands::BandVector;
use crate::track::TrackState;

/// `song` object of the push message.  Field names are the wire contract the
/// browser frontend reads.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SongPayload<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub artists: String,
    pub album_cover: &'a str,
    pub artist_icon: &'a str,
    pub progress: f64,
    pub is_playing: bool,
    pub genres: &'a [String],
}

impl<'a> From<&'a TrackState> for SongPayload<'a> {
    fn from(state: &'a TrackState) -> Self {
        Self {
            id: &state.track_id,
            title: &state.title,
            artists: state.artists_display(),
            album_cover: &state.album_art_url,
            artist_icon: &state.artist_icon_url,
            progress: state.progress.clamp(0.0, 1.0),
            is_playing: state.is_playing,
            genres: &state.genres,
        }
    }
}

/// Band vector + track state as seen at one push tick.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot<'a> {
    pub song: &'a TrackState,
    pub bands: BandVector,
}

#[derive(Serialize)]
struct PushMessage<'a> {
    song: SongPayload<'a>,
    bands: BandVector,
}

impl<'a> Snapshot<'a> {
    pub fn new(song: &'a TrackState, bands: BandVector) -> Self {
        Self { song, bands }
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "song": SongPayload::from(self.song),
            "bands": self.bands,
        })
    }

    /// Encode as one JSON text frame.
    pub fn encode(&self) -> anyhow::Result<String> {
        let msg = PushMessage {
            song: SongPayload::from(self.song),
            bands: self.bands,
        };
        Ok(serde_json::to_string(&msg)?)
    }
}
