use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use viz_proto::bands::BandVector;
use viz_proto::config::BroadcastConfig;
use viz_proto::protocol::Snapshot;
use viz_proto::track::TrackState;

use crate::store::Latest;

/// Read side of the two shared stores.
#[derive(Clone)]
pub struct SnapshotSource {
    bands: Latest<BandVector>,
    track: Latest<Arc<TrackState>>,
}

impl SnapshotSource {
    pub fn new(bands: Latest<BandVector>, track: Latest<Arc<TrackState>>) -> Self {
        Self { bands, track }
    }

    pub fn track(&self) -> Arc<TrackState> {
        self.track.load()
    }

    /// Band publishes dropped by the audio thread because a reader held the slot.
    pub fn dropped_band_updates(&self) -> u64 {
        self.bands.dropped()
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let track = self.track.load();
        Snapshot::new(&track, self.bands.load()).encode()
    }

    pub fn to_value(&self) -> serde_json::Value {
        let track = self.track.load();
        Snapshot::new(&track, self.bands.load()).to_value()
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("send failed: {0}")]
    Failed(String),
}

/// Somewhere to push encoded snapshots.
#[async_trait]
pub trait SnapshotSink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), SinkError>;

    async fn close(&mut self) {}
}

#[derive(Debug)]
pub enum SubscriberExit {
    Cancelled,
    SendFailed(SinkError),
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct PushTiming {
    pub cadence: Duration,
    pub send_timeout: Duration,
}

impl From<&BroadcastConfig> for PushTiming {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            cadence: config.cadence(),
            send_timeout: config.send_timeout(),
        }
    }
}

/// Push snapshots to one subscriber until it fails, stalls past
/// `send_timeout`, or `cancel` fires.
pub async fn run_subscriber<S>(
    id: usize,
    sink: &mut S,
    source: &SnapshotSource,
    timing: PushTiming,
    cancel: &CancellationToken,
) -> SubscriberExit
where
    S: SnapshotSink + ?Sized,
{
    let mut ticker = tokio::time::interval(timing.cadence);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return SubscriberExit::Cancelled,
            _ = ticker.tick() => {}
        }

        let text = match source.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Subscriber {}: failed to encode snapshot: {}", id, e);
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return SubscriberExit::Cancelled,
            sent = tokio::time::timeout(timing.send_timeout, sink.send_text(text)) => match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return SubscriberExit::SendFailed(e),
                Err(_) => return SubscriberExit::TimedOut,
            },
        }
    }
}

// ── registry ──────────────────────────────────────────────────────────────────

/// Live subscriber bookkeeping for logs and `/api/status`.
#[derive(Clone, Default)]
pub struct Subscribers {
    next_id: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

/// Counts as live until dropped.
pub struct SubscriberGuard {
    pub id: usize,
    live: Arc<AtomicUsize>,
}

impl Subscribers {
    pub fn register(&self) -> SubscriberGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.fetch_add(1, Ordering::Relaxed);
        SubscriberGuard {
            id,
            live: Arc::clone(&self.live),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    /// Records the instant of every delivered frame.
    struct RecordingSink {
        deliveries: Arc<Mutex<Vec<Instant>>>,
        last: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl SnapshotSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<(), SinkError> {
            self.deliveries.lock().push(Instant::now());
            *self.last.lock() = Some(text);
            Ok(())
        }
    }

    /// Never completes a send.
    struct StalledSink;

    #[async_trait]
    impl SnapshotSink for StalledSink {
        async fn send_text(&mut self, _text: String) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl SnapshotSink for ClosedSink {
        async fn send_text(&mut self, _text: String) -> Result<(), SinkError> {
            Err(SinkError::Failed("connection reset".into()))
        }
    }

    fn source() -> (SnapshotSource, Latest<BandVector>, Latest<Arc<TrackState>>) {
        let bands = Latest::new(BandVector::silent());
        let track = Latest::new(Arc::new(TrackState::default()));
        (SnapshotSource::new(bands.clone(), track.clone()), bands, track)
    }

    fn timing() -> PushTiming {
        PushTiming {
            cadence: Duration::from_millis(75),
            send_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_snapshot_reflects_latest_values() {
        let (source, bands, track) = source();
        let mut v = BandVector::silent();
        v.0[0] = 4.0;
        bands.store(v);
        track.store(Arc::new(TrackState {
            track_id: "t1".into(),
            title: "Teardrop".into(),
            ..Default::default()
        }));

        let value = source.to_value();
        assert_eq!(value["song"]["id"], "t1");
        assert_eq!(value["song"]["title"], "Teardrop");
        assert_eq!(value["bands"]["bucket1"].as_f64(), Some(4.0));
    }

    #[test]
    fn test_registry_counts_live_subscribers() {
        let subs = Subscribers::default();
        let a = subs.register();
        let b = subs.register();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(subs.live(), 2);
        drop(a);
        assert_eq!(subs.live(), 1);
        drop(b);
        assert_eq!(subs.live(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_ends_only_its_loop() {
        let (source, _, _) = source();
        let cancel = CancellationToken::new();
        let exit = run_subscriber(1, &mut ClosedSink, &source, timing(), &cancel).await;
        assert!(matches!(exit, SubscriberExit::SendFailed(SinkError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_does_not_hold_back_others() {
        let (source, bands, _) = source();
        let cancel = CancellationToken::new();
        let timing = timing();

        let mut healthy = Vec::new();
        for id in 0..49 {
            let deliveries = Arc::new(Mutex::new(Vec::new()));
            let mut sink = RecordingSink {
                deliveries: deliveries.clone(),
                last: Arc::new(Mutex::new(None)),
            };
            let source = source.clone();
            let cancel = cancel.clone();
            let task = tokio::spawn(async move {
                run_subscriber(id, &mut sink, &source, timing, &cancel).await
            });
            healthy.push((task, deliveries));
        }

        let stalled = {
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                run_subscriber(99, &mut StalledSink, &source, timing, &cancel).await
            })
        };

        // Producers keep publishing while the stalled send is pending.
        let start = Instant::now();
        for i in 0..30u32 {
            let mut v = BandVector::silent();
            v.0[0] = i as f32;
            bands.store(v);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(bands.version(), 30);
        assert!(start.elapsed() >= Duration::from_millis(1500));

        let exit = stalled.await.unwrap();
        assert!(matches!(exit, SubscriberExit::TimedOut));

        cancel.cancel();
        for (task, deliveries) in healthy {
            assert!(matches!(task.await.unwrap(), SubscriberExit::Cancelled));
            let times = deliveries.lock().clone();
            // One immediate tick plus one per 75 ms over 1.5 s.
            assert!(times.len() >= 20, "only {} deliveries", times.len());
            for pair in times.windows(2) {
                let gap = pair[1] - pair[0];
                assert!(gap <= Duration::from_millis(100), "gap {:?}", gap);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_subscriber_promptly() {
        let (source, _, _) = source();
        let cancel = CancellationToken::new();
        let deliveries = Arc::new(Mutex::new(Vec::new()));
        let last = Arc::new(Mutex::new(None));
        let mut sink = RecordingSink {
            deliveries: deliveries.clone(),
            last: last.clone(),
        };

        let task = {
            let cancel = cancel.clone();
            let source = source.clone();
            tokio::spawn(async move {
                run_subscriber(1, &mut sink, &source, timing(), &cancel).await
            })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        assert!(matches!(task.await.unwrap(), SubscriberExit::Cancelled));

        let count = deliveries.lock().len();
        assert!((3..=4).contains(&count), "got {}", count);
        let text = last.lock().clone().unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(json["bands"]["bucket25"].is_f64());
    }
}
