use crate::collector::Collector;
use crate::data::Snapshot;
use crate::exporter::{self, ExportError};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use prometheus::Registry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

// Shared server state
#[derive(Clone)]
struct AppState {
    collector: Arc<Collector>,
    registry: Arc<Registry>,
    telemetry_path: Arc<str>,
}

pub fn router(collector: Arc<Collector>, telemetry_path: &str) -> Result<Router, ExportError> {
    let registry = Arc::new(exporter::registry(Arc::clone(&collector))?);
    let state = AppState {
        collector,
        registry,
        telemetry_path: Arc::from(telemetry_path),
    };

    Ok(Router::new()
        .route("/", get(landing))
        .route(telemetry_path, get(metrics))
        .route("/snapshot", get(snapshot))
        .with_state(state))
}

pub async fn serve(listen_address: &str, router: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_address).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html><head><title>NVIDIA GPU Exporter</title></head><body>\
         <h1>NVIDIA GPU Exporter</h1>\
         <p><a href=\"{0}\">{0}</a></p>\
         <p><a href=\"/snapshot\">/snapshot</a></p>\
         </body></html>",
        state.telemetry_path
    ))
}

// Passes block on driver calls, so they run off the async workers
async fn metrics(State(state): State<AppState>) -> Response {
    let registry = Arc::clone(&state.registry);
    match tokio::task::spawn_blocking(move || exporter::render(&registry)).await {
        Ok(Ok(body)) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Ok(Err(err)) => {
            error!("Rendering metrics failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
        Err(err) => {
            error!("Scrape task failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn snapshot(State(state): State<AppState>) -> Response {
    let collector = Arc::clone(&state.collector);
    match tokio::task::spawn_blocking(move || collector.collect()).await {
        Ok(Ok(snapshot)) => Json(snapshot).into_response(),
        Ok(Err(err)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": err.to_string(),
                "snapshot": Snapshot::empty(),
            })),
        )
            .into_response(),
        Err(err) => {
            error!("Snapshot task failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
