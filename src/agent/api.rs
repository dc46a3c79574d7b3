use crate::agent::control::{ControlPlane, SurfaceError};

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metriken::Value;
use ringlog::{debug, info};
use serde_json::Map;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use std::net::SocketAddr;
use std::sync::Arc;

/// Serves the control surface until `shutdown` is notified.
pub async fn serve(
    listen: SocketAddr,
    control: Arc<ControlPlane>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind control listener on {listen}"))?;

    info!(
        "control surface listening on http://{}",
        listener.local_addr().context("failed to get local addr")?
    );

    axum::serve(listener, app(control))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await
        .context("control surface failed")
}

pub fn app(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/vars", get(vars))
        .route("/{attr}", get(read).put(write).post(write))
        .with_state(control)
}

async fn index(State(control): State<Arc<ControlPlane>>) -> String {
    let mut names = control.attributes().join("\n");
    names.push('\n');
    names
}

// reads and writes take the control lock, which is held while sampler
// threads are joined

async fn read(State(control): State<Arc<ControlPlane>>, Path(attr): Path<String>) -> Response {
    let result = tokio::task::spawn_blocking(move || control.read(&attr)).await;

    match result {
        Ok(Ok(text)) => text.into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            debug!("control read task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn write(
    State(control): State<Arc<ControlPlane>>,
    Path(attr): Path<String>,
    body: String,
) -> Response {
    let result = tokio::task::spawn_blocking(move || control.write(&attr, &body)).await;

    match result {
        Ok(Ok(count)) => format!("{count}\n").into_response(),
        Ok(Err(e)) => error_response(e),
        Err(e) => {
            debug!("control write task failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn error_response(e: SurfaceError) -> Response {
    let status = match e {
        SurfaceError::Unknown(_) => StatusCode::NOT_FOUND,
        SurfaceError::NotWritable(_) => StatusCode::METHOD_NOT_ALLOWED,
    };

    (status, format!("{e}\n")).into_response()
}

/// Agent self-telemetry as a flat JSON object.
async fn vars() -> Json<Map<String, serde_json::Value>> {
    let mut map = Map::new();

    for metric in &metriken::metrics() {
        let value = match metric.value() {
            Some(Value::Counter(v)) => serde_json::Value::from(v),
            Some(Value::Gauge(v)) => serde_json::Value::from(v),
            _ => continue,
        };

        map.insert(metric.name().to_string(), value);
    }

    Json(map)
}
