//! Periodic "now playing" refresh.
//!
//! Every tick:
//!
//! ```text
//!   Idle ─► Query ─┬─► Failed          keep previous state, back off
//!                  ├─► NothingPlaying  is_playing = false, keep last track
//!                  ├─► Unchanged       same track id: progress + is_playing only
//!                  └─► Changed         new track: primary fields + artist lookup
//! ```
//!
//! New states are always built on a private copy and published in one
//! `store`, so readers never see a record whose id and fields disagree.
//! Cancellation is only observed while sleeping between ticks.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use viz_proto::config::PollerConfig;
use viz_proto::track::TrackState;

use crate::service::{MusicService, NowPlaying, ServiceError};
use crate::store::Latest;

// ── retry policy ──────────────────────────────────────────────────────────────

/// Delay schedule between ticks.
///
/// Healthy ticks run at `interval`.  After `n` consecutive failures the delay
/// is `interval * multiplier^n`, capped at `max_backoff`, then spread by
/// ±`jitter` (fraction of the delay) so many daemons don't retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    /// Non-finite multiplier or jitter values fall back to the defaults.
    pub fn from_config(config: &PollerConfig) -> Self {
        let defaults = PollerConfig::default();
        let finite_or = |value: f64, fallback: f64| if value.is_finite() { value } else { fallback };
        Self {
            interval: config.interval(),
            max_backoff: config.max_backoff(),
            multiplier: finite_or(config.backoff_multiplier, defaults.backoff_multiplier).max(1.0),
            jitter: finite_or(config.jitter, defaults.jitter).clamp(0.0, 1.0),
        }
    }

    /// Constant cadence regardless of failures.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_backoff: interval,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay before jitter.
    pub fn base_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return self.interval;
        }
        let factor = self.multiplier.powi(failures.min(64) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(self.interval.as_secs_f64()))
    }

    pub fn delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(failures);
        if failures == 0 || self.jitter <= 0.0 {
            return base;
        }
        let spread: f64 = rng.gen_range(-self.jitter..=self.jitter);
        let secs = base.as_secs_f64() * (1.0 + spread);
        Duration::from_secs_f64(secs.clamp(0.0, self.max_backoff.as_secs_f64()))
    }
}

// ── tick outcome ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TickOutcome {
    Unchanged,
    Changed {
        track_id: String,
        /// False when the artist lookup failed and icon/genres were left empty.
        lookup_ok: bool,
    },
    NothingPlaying,
    Failed(ServiceError),
}

// ── poller ────────────────────────────────────────────────────────────────────

/// Wakes the poller's sleep early, e.g. right after a playback control.
#[derive(Clone)]
pub struct PollerHandle {
    wake: Arc<Notify>,
}

impl PollerHandle {
    pub fn poke(&self) {
        self.wake.notify_one();
    }
}

pub struct TrackStatePoller {
    service: Arc<dyn MusicService>,
    track: Latest<Arc<TrackState>>,
    policy: RetryPolicy,
    failures: u32,
    wake: Arc<Notify>,
}

impl TrackStatePoller {
    pub fn new(
        service: Arc<dyn MusicService>,
        track: Latest<Arc<TrackState>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            track,
            policy,
            failures: 0,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> PollerHandle {
        PollerHandle {
            wake: Arc::clone(&self.wake),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// One Query step plus the resulting state transition.
    pub async fn tick(&mut self) -> TickOutcome {
        let now_playing = match self.service.currently_playing().await {
            Ok(np) => np,
            Err(e) => {
                self.failures = self.failures.saturating_add(1);
                return TickOutcome::Failed(e);
            }
        };
        self.failures = 0;

        let current = self.track.load();
        match now_playing {
            None => {
                if current.is_playing {
                    let mut next = TrackState::clone(&current);
                    next.is_playing = false;
                    self.track.store(Arc::new(next));
                }
                TickOutcome::NothingPlaying
            }
            Some(np) if np.track_id == current.track_id => {
                let mut next = TrackState::clone(&current);
                next.set_progress(np.progress_ms, np.duration_ms);
                next.is_playing = np.is_playing;
                if next != *current {
                    self.track.store(Arc::new(next));
                }
                TickOutcome::Unchanged
            }
            Some(np) => self.track_changed(np).await,
        }
    }

    async fn track_changed(&mut self, np: NowPlaying) -> TickOutcome {
        let (artist_icon_url, genres, lookup_ok) = match np.lookup_artist_id() {
            Some(artist_id) => match self.service.artist(artist_id).await {
                Ok(details) => (details.image_url, details.genres, true),
                Err(e) => {
                    warn!("Artist lookup for {} failed: {}", artist_id, e);
                    (String::new(), Vec::new(), false)
                }
            },
            None => (String::new(), Vec::new(), true),
        };

        let mut next = TrackState {
            track_id: String::new(),
            title: np.title.clone(),
            artists: np.artist_names(),
            album_art_url: np.album_art_url.clone(),
            artist_icon_url,
            genres,
            progress: 0.0,
            is_playing: np.is_playing,
        };
        next.set_progress(np.progress_ms, np.duration_ms);
        // Identity goes in last; the record is published only once complete.
        next.track_id = np.track_id;

        let track_id = next.track_id.clone();
        info!(
            "Now playing {:?} by {} ({})",
            next.title,
            next.artists_display(),
            track_id
        );
        self.track.store(Arc::new(next));

        TickOutcome::Changed {
            track_id,
            lookup_ok,
        }
    }

    fn next_delay(&self, outcome: &TickOutcome) -> Duration {
        let computed = {
            let mut rng = rand::thread_rng();
            self.policy.delay(self.failures, &mut rng)
        };
        match outcome {
            TickOutcome::Failed(e) => match e.retry_after() {
                Some(wait) => wait.max(computed).min(self.policy.max_backoff),
                None => computed,
            },
            _ => computed,
        }
    }

    /// Tick until `cancel` fires.  A tick in flight always completes; the
    /// token is checked while sleeping between ticks.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            "Track poller started (interval {:?}, max backoff {:?})",
            self.policy.interval, self.policy.max_backoff
        );

        loop {
            let outcome = self.tick().await;
            match &outcome {
                TickOutcome::Failed(e) => warn!(
                    "Now-playing query failed ({} in a row): {}",
                    self.consecutive_failures(),
                    e
                ),
                TickOutcome::Changed {
                    track_id,
                    lookup_ok: false,
                } => debug!("Track changed to {}; artist details unavailable", track_id),
                other => debug!("Poll tick: {:?}", other),
            }

            let delay = self.next_delay(&outcome);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => debug!("Poller woken early"),
            }
        }

        info!("Track poller stopped");
    }
}
