use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::service::{
    ArtistDetails, ArtistRef, MusicService, NowPlaying, PlaybackAction, ServiceError,
};

pub fn now_playing(track_id: &str, artist_id: &str, progress_ms: u64, duration_ms: u64) -> NowPlaying {
    NowPlaying {
        track_id: track_id.to_string(),
        title: format!("Song {}", track_id),
        artists: vec![ArtistRef {
            id: Some(artist_id.to_string()),
            name: format!("Artist {}", artist_id),
        }],
        album_art_url: format!("https://img/album/{}", track_id),
        progress_ms,
        duration_ms,
        is_playing: true,
    }
}

#[derive(Default)]
pub struct FakeService {
    script: Mutex<VecDeque<Result<Option<NowPlaying>, ServiceError>>>,
    repeat: Mutex<Option<NowPlaying>>,
    playing_calls: AtomicUsize,
    artist_calls: Mutex<Vec<String>>,
    fail_artists: AtomicBool,
    controls: Mutex<Vec<PlaybackAction>>,
    fail_controls: AtomicBool,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_playing(&self, np: NowPlaying) {
        self.script.lock().push_back(Ok(Some(np)));
    }

    pub fn push_nothing(&self) {
        self.script.lock().push_back(Ok(None));
    }

    pub fn push_error(&self, err: ServiceError) {
        self.script.lock().push_back(Err(err));
    }

    /// Answer with `np` once the script runs dry.
    pub fn repeat_playing(&self, np: NowPlaying) {
        *self.repeat.lock() = Some(np);
    }

    pub fn fail_artist_lookups(&self, fail: bool) {
        self.fail_artists.store(fail, Ordering::SeqCst);
    }

    pub fn fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::SeqCst);
    }

    pub fn playing_calls(&self) -> usize {
        self.playing_calls.load(Ordering::SeqCst)
    }

    pub fn artist_calls(&self) -> Vec<String> {
        self.artist_calls.lock().clone()
    }

    pub fn controls(&self) -> Vec<PlaybackAction> {
        self.controls.lock().clone()
    }
}

#[async_trait]
impl MusicService for FakeService {
    async fn currently_playing(&self) -> Result<Option<NowPlaying>, ServiceError> {
        self.playing_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(self.repeat.lock().clone()),
        }
    }

    async fn artist(&self, artist_id: &str) -> Result<ArtistDetails, ServiceError> {
        self.artist_calls.lock().push(artist_id.to_string());
        if self.fail_artists.load(Ordering::SeqCst) {
            return Err(ServiceError::Status { code: 500 });
        }
        Ok(ArtistDetails {
            image_url: format!("https://img/{}", artist_id),
            genres: vec![format!("genre-{}", artist_id)],
        })
    }

    async fn control(&self, action: PlaybackAction) -> Result<(), ServiceError> {
        self.controls.lock().push(action);
        if self.fail_controls.load(Ordering::SeqCst) {
            return Err(ServiceError::Status { code: 502 });
        }
        Ok(())
    }
}
