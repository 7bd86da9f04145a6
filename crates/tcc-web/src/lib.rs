//! Local transport for TCC Sensor
//!
//! Streams the local trace store to observers over WebSocket and exposes
//! read-only REST views of it.

mod api;
pub mod client;
mod ws;

pub use client::watch;

use axum::{response::Json, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tcc_export::LocalSpanExporter;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

/// Ports tried in order when none is configured
pub const PREFERRED_PORTS: &[u16] = &[8081, 3001, 3002, 3003, 3004, 3005, 8000, 8001, 8080];

/// Web server configuration
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub host: String,

    /// Fixed port; `None` walks `PREFERRED_PORTS`
    pub port: Option<u16>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
        }
    }
}

impl From<&tcc_core::config::WebSettings> for WebConfig {
    fn from(settings: &tcc_core::config::WebSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}

/// Shared application state
pub struct AppState {
    pub exporter: Arc<LocalSpanExporter>,
    pub started_at: Instant,
}

/// Bind the configured port, else the first free preferred port, else an
/// ephemeral one
pub async fn bind_listener(config: &WebConfig) -> anyhow::Result<TcpListener> {
    if let Some(port) = config.port {
        let listener = TcpListener::bind((config.host.as_str(), port)).await?;
        return Ok(listener);
    }

    for &port in PREFERRED_PORTS {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => debug!("Port {} unavailable: {}", port, e),
        }
    }

    debug!("No preferred port free, using an ephemeral port");
    Ok(TcpListener::bind((config.host.as_str(), 0)).await?)
}

/// Build the router over a local store
pub fn router(exporter: Arc<LocalSpanExporter>) -> Router {
    let state = Arc::new(AppState {
        exporter,
        started_at: Instant::now(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/store", get(api::get_store))
        .route("/api/runs", get(api::get_runs))
        .route("/api/runs/{trace_id}", get(api::get_run))
        .route("/api/failures", get(api::get_failures))
        .route("/api/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, exporter: Arc<LocalSpanExporter>) -> anyhow::Result<()> {
    let addr: SocketAddr = listener.local_addr()?;
    info!("Local transport available at http://{}", addr);
    info!("  - WebSocket at ws://{}/ws", addr);
    info!("  - API at /api/*");

    axum::serve(listener, router(exporter)).await?;
    Ok(())
}

/// Start the web server
pub async fn start_server(config: WebConfig, exporter: Arc<LocalSpanExporter>) -> anyhow::Result<()> {
    let listener = bind_listener(&config).await?;
    serve(listener, exporter).await
}

/// Health check endpoint
async fn health_check(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tcc-sensor",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "subscribers": state.exporter.subscriber_count(),
    }))
}
