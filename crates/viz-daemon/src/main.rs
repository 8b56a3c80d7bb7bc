mod audio;
mod broadcast;
mod http;
mod poller;
mod service;
mod spectrum;
mod spotify;
mod store;
#[cfg(test)]
mod testing;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use viz_proto::bands::{BandTable, BandVector};
use viz_proto::config::Config;
use viz_proto::track::TrackState;

use crate::broadcast::SnapshotSource;
use crate::poller::{RetryPolicy, TrackStatePoller};
use crate::spotify::{SpotifyClient, StaticToken};
use crate::store::Latest;

fn init_logging() -> anyhow::Result<std::path::PathBuf> {
    let log_path = viz_proto::platform::log_path();
    if let Some(dir) = log_path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    // File writer + stderr
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,viz_daemon=debug")),
        )
        .init();

    Ok(log_path)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = init_logging()?;
    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    BandTable::standard()
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid band table: {}", e))?;

    // Shared latest-value stores
    let bands = Latest::new(BandVector::silent());
    let track = Latest::new(Arc::new(TrackState::default()));

    // Audio capture stays on this thread; a failure leaves the bands silent.
    let audio_active = Arc::new(AtomicBool::new(false));
    let capture = if config.audio.enabled {
        match audio::start_capture(&config.audio, bands.clone(), audio_active.clone()) {
            Ok(capture) => {
                info!(
                    "Audio active: {:?} @ {} Hz, {} channel(s)",
                    capture.device_name, capture.sample_rate, capture.channels
                );
                Some(capture)
            }
            Err(e) => {
                warn!("Audio capture unavailable, serving silent bands: {}", e);
                None
            }
        }
    } else {
        info!("Audio capture disabled in config");
        None
    };

    let token = config.access_token();
    if token.is_none() {
        warn!(
            "No Spotify access token (set {} or spotify.access_token); track info will stay empty",
            viz_proto::config::ACCESS_TOKEN_ENV
        );
    }
    let service = Arc::new(SpotifyClient::new(
        &config.spotify,
        Arc::new(StaticToken::new(token)),
    )?);

    let poller = TrackStatePoller::new(
        service.clone(),
        track.clone(),
        RetryPolicy::from_config(&config.poller),
    );
    let poller_handle = poller.handle();
    let poller_cancel = CancellationToken::new();
    let poller_task = tokio::spawn(poller.run(poller_cancel.clone()));

    let subscriber_cancel = CancellationToken::new();
    let state = http::AppState::new(
        SnapshotSource::new(bands.clone(), track.clone()),
        service,
        poller_handle,
        &config.broadcast,
        subscriber_cancel.clone(),
        audio_active,
    );

    let server_cancel = CancellationToken::new();
    let server_task = http::start_server(
        config.http.bind_address.clone(),
        config.http.port,
        state,
        server_cancel.clone(),
    );

    info!("Daemon initialised, waiting for ctrl-c");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
    info!("Shutting down");

    poller_cancel.cancel();
    if let Err(e) = poller_task.await {
        error!("Poller task failed: {}", e);
    }

    if let Some(capture) = capture {
        capture.stop();
    }

    subscriber_cancel.cancel();
    server_cancel.cancel();
    if let Err(e) = server_task.await {
        error!("HTTP server task failed: {}", e);
    }

    info!("Daemon stopped");
    Ok(())
}
