use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};
use viz_proto::config::BroadcastConfig;

use crate::broadcast::{
    run_subscriber, PushTiming, SinkError, SnapshotSink, SnapshotSource, SubscriberExit,
    Subscribers,
};
use crate::poller::PollerHandle;
use crate::service::{MusicService, PlaybackAction};

#[derive(Clone)]
pub struct AppState {
    pub source: SnapshotSource,
    pub service: Arc<dyn MusicService>,
    pub poller: PollerHandle,
    pub subscribers: Subscribers,
    pub timing: PushTiming,
    /// Cancelled at shutdown to end every subscriber loop.
    pub cancel: CancellationToken,
    pub audio_active: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        source: SnapshotSource,
        service: Arc<dyn MusicService>,
        poller: PollerHandle,
        broadcast: &BroadcastConfig,
        cancel: CancellationToken,
        audio_active: Arc<AtomicBool>,
    ) -> Self {
        Self {
            source,
            service,
            poller,
            subscribers: Subscribers::default(),
            timing: PushTiming::from(broadcast),
            cancel,
            audio_active,
        }
    }
}

#[derive(Serialize)]
struct ApiStatus {
    subscribers: usize,
    audio_active: bool,
    track_id: String,
    dropped_band_updates: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handle_websocket))
        .route("/control/:action", post(control))
        .route("/api/state", get(get_state))
        .route("/api/status", get(get_status))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: AppState,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("Visualizer server listening on http://{} (ws at /ws)", addr);

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        match result {
            Ok(()) => info!("HTTP server stopped"),
            Err(e) => error!("HTTP server error: {}", e),
        }
    })
}

// ── handlers ──────────────────────────────────────────────────────────────────

async fn get_state(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(state.source.to_value())
}

async fn get_status(State(state): State<AppState>) -> Json<ApiStatus> {
    Json(ApiStatus {
        subscribers: state.subscribers.live(),
        audio_active: state.audio_active.load(Ordering::Relaxed),
        track_id: state.source.track().track_id.clone(),
        dropped_band_updates: state.source.dropped_band_updates(),
    })
}

async fn control(State(state): State<AppState>, Path(action): Path<String>) -> StatusCode {
    let Some(action) = PlaybackAction::from_path(&action) else {
        debug!("HTTP API: unknown control action {:?}", action);
        return StatusCode::NOT_FOUND;
    };

    info!("HTTP API: {:?}", action);
    match state.service.control(action).await {
        Ok(()) => {
            state.poller.poke();
            StatusCode::NO_CONTENT
        }
        Err(e) => {
            warn!("Playback control {:?} failed: {}", action, e);
            StatusCode::BAD_GATEWAY
        }
    }
}

async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_subscriber(socket, state))
        .into_response()
}

// ── websocket subscribers ─────────────────────────────────────────────────────

struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl SnapshotSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), SinkError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| SinkError::Failed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

async fn serve_subscriber(socket: WebSocket, state: AppState) {
    let guard = state.subscribers.register();
    let id = guard.id;
    info!("Subscriber {} connected ({} live)", id, state.subscribers.live());

    let (sender, mut receiver) = socket.split();
    let mut sink = WsSink(sender);

    // Inbound frames are ignored; the reader only notices the peer leaving.
    let done = state.cancel.child_token();
    let reader = {
        let done = done.clone();
        tokio::spawn(async move {
            while let Some(frame) = receiver.next().await {
                match frame {
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            done.cancel();
        })
    };

    let exit = run_subscriber(id, &mut sink, &state.source, state.timing, &done).await;
    match &exit {
        SubscriberExit::Cancelled => debug!("Subscriber {} finished", id),
        SubscriberExit::SendFailed(e) => debug!("Subscriber {} send failed: {}", id, e),
        SubscriberExit::TimedOut => warn!(
            "Subscriber {} stalled for {:?}; dropping it",
            id, state.timing.send_timeout
        ),
    }

    sink.close().await;
    reader.abort();
    drop(guard);
    info!("Subscriber {} disconnected ({} live)", id, state.subscribers.live());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{RetryPolicy, TrackStatePoller};
    use crate::store::Latest;
    use crate::testing::FakeService;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsFrame;
    use tower::ServiceExt;
    use viz_proto::bands::BandVector;
    use viz_proto::track::TrackState;

    fn app(service: Arc<FakeService>) -> (Router, AppState) {
        let track = Latest::new(Arc::new(TrackState {
            track_id: "t9".into(),
            title: "Roygbiv".into(),
            ..Default::default()
        }));
        let source = SnapshotSource::new(Latest::new(BandVector::silent()), track.clone());
        let poller = TrackStatePoller::new(
            service.clone(),
            track,
            RetryPolicy::fixed(Duration::from_secs(1)),
        );
        let state = AppState::new(
            source,
            service,
            poller.handle(),
            &BroadcastConfig::default(),
            CancellationToken::new(),
            Arc::new(AtomicBool::new(false)),
        );
        (router(state.clone()), state)
    }

    async fn post(app: Router, uri: &str) -> StatusCode {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        app.oneshot(req).await.unwrap().status()
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_control_forwards_action() {
        let service = Arc::new(FakeService::new());
        let (app, _) = app(service.clone());

        assert_eq!(post(app.clone(), "/control/pause").await, StatusCode::NO_CONTENT);
        assert_eq!(post(app, "/control/back").await, StatusCode::NO_CONTENT);
        assert_eq!(
            service.controls(),
            vec![PlaybackAction::Pause, PlaybackAction::Previous]
        );
    }

    #[tokio::test]
    async fn test_control_upstream_failure_is_bad_gateway() {
        let service = Arc::new(FakeService::new());
        service.fail_controls(true);
        let (app, _) = app(service);
        assert_eq!(post(app, "/control/next").await, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unknown_action_is_not_found() {
        let service = Arc::new(FakeService::new());
        let (app, _) = app(service.clone());
        assert_eq!(post(app, "/control/shuffle").await, StatusCode::NOT_FOUND);
        assert!(service.controls().is_empty());
    }

    #[tokio::test]
    async fn test_state_endpoint_returns_snapshot() {
        let (app, _) = app(Arc::new(FakeService::new()));
        let json = get_json(app, "/api/state").await;
        assert_eq!(json["song"]["id"], "t9");
        assert_eq!(json["song"]["title"], "Roygbiv");
        assert_eq!(json["bands"].as_object().unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let (app, state) = app(Arc::new(FakeService::new()));
        state.audio_active.store(true, Ordering::Relaxed);
        let _sub = state.subscribers.register();

        let json = get_json(app, "/api/status").await;
        assert_eq!(json["subscribers"], 1);
        assert_eq!(json["audio_active"], true);
        assert_eq!(json["track_id"], "t9");
        assert_eq!(json["dropped_band_updates"], 0);
    }

    async fn next_snapshot<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<WsFrame, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame within 5s")
                .expect("stream ended")
                .expect("websocket error");
            if let WsFrame::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_disconnect_drops_only_that_subscriber() {
        let (app, state) = app(Arc::new(FakeService::new()));
        let status_app = app.clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let url = format!("ws://{}/ws", addr);
        let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

        for ws in [&mut first, &mut second] {
            let json = next_snapshot(ws).await;
            assert_eq!(json["song"]["id"], "t9");
            assert_eq!(json["bands"].as_object().unwrap().len(), 25);
        }
        assert_eq!(state.subscribers.live(), 2);

        first.close(None).await.unwrap();
        drop(first);

        let mut live = usize::MAX;
        for _ in 0..100 {
            let json = get_json(status_app.clone(), "/api/status").await;
            live = json["subscribers"].as_u64().unwrap() as usize;
            if live == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(live, 1);

        // The remaining subscriber keeps getting fresh frames.
        for _ in 0..3 {
            let json = next_snapshot(&mut second).await;
            assert_eq!(json["bands"].as_object().unwrap().len(), 25);
        }
        assert_eq!(state.subscribers.live(), 1);
    }
}
