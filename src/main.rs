use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use serde_json::json;
use std::{
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::signal;
use tower_http::cors::CorsLayer;

use pagecast::models::{Scene, Settings, StreamerStatus};
use pagecast::services::{
    AudioResolver, DestinationRegistry, LiveAudioProvider, ProcessLauncher, Streamer,
    StreamerContext, StreamerError, YtDlpProvider,
};

// ============================================================================
// Application State
// ============================================================================

#[derive(Clone)]
struct AppState {
    streamer: Streamer,
    started_at: Instant,
}

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl InvokeResponse {
    fn ok(state: impl Into<String>) -> Self {
        Self { ok: true, state: Some(state.into()), error: None }
    }

    fn err(error: impl Into<String>) -> Self {
        Self { ok: false, state: None, error: Some(error.into()) }
    }
}

fn error_response(err: StreamerError) -> Response {
    let status = match err {
        StreamerError::AlreadyRunning | StreamerError::NotRunning | StreamerError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        StreamerError::NoDirector | StreamerError::SceneSwitchInProgress => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(InvokeResponse::err(err.to_string()))).into_response()
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Option<Mutex<std::fs::File>>,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: Option<&std::path::Path>, level: LevelFilter) -> Result<Self, Box<dyn std::error::Error>> {
        let file = match log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join("pagecast-server.log"))?;
                Some(Mutex::new(file))
            }
            None => None,
        };
        Ok(Self { file, level })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let line = format!("[{date}][{time}][{target}][{level}] {}", record.args());

        println!("{line}");
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.try_lock() {
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

fn init_logger(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(settings.log_dir.as_deref(), settings.log_level)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(settings.log_level);
    Ok(())
}

// ============================================================================
// Process Memory
// ============================================================================

/// Resident set size in bytes from a `/proc/<pid>/status` body
fn parse_vm_rss(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

fn memory_rss_bytes() -> Option<u64> {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .as_deref()
        .and_then(parse_vm_rss)
}

// ============================================================================
// Request Handlers
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    #[serde(flatten)]
    status: StreamerStatus,
    memory_rss_bytes: Option<u64>,
    process_uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: state.streamer.status(),
        memory_rss_bytes: memory_rss_bytes(),
        process_uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.streamer.status();
    Json(json!({
        "state": status.state,
        "scene": status.scene,
        "frameCount": status.frame_count,
        "rtmpConnected": status.rtmp_connected,
        "uptimeSecs": status.uptime_secs,
        "restartCount": status.restart_count,
    }))
}

async fn start(State(state): State<AppState>) -> Response {
    match state.streamer.start().await {
        Ok(()) => Json(InvokeResponse::ok(state_name(&state))).into_response(),
        Err(e) => {
            log::warn!("Start request rejected: {e}");
            error_response(e)
        }
    }
}

async fn stop(State(state): State<AppState>) -> Response {
    match state.streamer.stop().await {
        Ok(()) => Json(InvokeResponse::ok(state_name(&state))).into_response(),
        Err(e) => {
            log::warn!("Stop request rejected: {e}");
            error_response(e)
        }
    }
}

async fn force_scene(State(state): State<AppState>, Path(scene): Path<String>) -> Response {
    let Some(scene) = Scene::parse(&scene) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(InvokeResponse::err(format!("Unknown scene: {scene}"))),
        )
            .into_response();
    };

    match state.streamer.force_scene(scene).await {
        Ok(()) => Json(InvokeResponse::ok(scene.as_str())).into_response(),
        Err(e) => error_response(e),
    }
}

fn state_name(state: &AppState) -> String {
    serde_json::to_value(state.streamer.state())
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

// ============================================================================
// Server
// ============================================================================

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or_else(|_| {
        log::warn!("Invalid HOST {host:?}, binding to 0.0.0.0");
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    })
}

/// Waits for Ctrl+C or SIGTERM, then stops the broadcast gracefully
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, stopping broadcast...");
    match state.streamer.stop().await {
        Ok(()) | Err(StreamerError::NotRunning) => {}
        Err(e) => log::warn!("Error stopping broadcast: {e}"),
    }
    log::info!("Broadcast stopped, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env();
    init_logger(&settings)?;

    let provider = YtDlpProvider::discover(settings.binaries.ytdlp.as_deref())
        .map(|p| Arc::new(p) as Arc<dyn LiveAudioProvider>);
    if provider.is_none() && settings.audio.source_url.is_some() {
        log::warn!("yt-dlp not found; live audio will fall back to the local loop");
    }

    let streamer = Streamer::spawn(StreamerContext {
        registry: DestinationRegistry::from_env(),
        audio: AudioResolver::new(settings.audio.clone(), provider),
        launcher: Arc::new(ProcessLauncher::new(settings.clone())),
        settings: settings.clone(),
    });

    let state = AppState {
        streamer: streamer.clone(),
        started_at: Instant::now(),
    };

    if settings.auto_start {
        tokio::spawn(async move {
            log::info!("AUTO_START enabled, starting broadcast");
            if let Err(e) = streamer.start().await {
                log::error!("Auto start failed: {e}");
            }
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/scene/:scene", post(force_scene))
        .with_state(state.clone())
        .layer(CorsLayer::permissive());

    let address = SocketAddr::new(parse_host(&settings.host), settings.port);
    log::info!("Pagecast control API listening on http://{address}");

    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}
