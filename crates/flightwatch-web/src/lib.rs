//! Read-only JSON view of the latest flight snapshot.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Local, NaiveDateTime};
use flightwatch_core::{Flight, Snapshot};
use flightwatch_storage::{SnapshotRead, SnapshotStore};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "flightwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub store: SnapshotStore,
}

impl AppState {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            store: SnapshotStore::new(snapshot_path),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NextArrivalView {
    pub flight: Flight,
    pub minutes_until_arrival: Option<i64>,
    #[serde(with = "flightwatch_core::wall_clock_timestamp")]
    pub last_updated_at: NaiveDateTime,
}

impl NextArrivalView {
    pub fn from_snapshot(snapshot: &Snapshot, now: NaiveDateTime) -> Option<Self> {
        snapshot.next_arrival_flight.as_ref().map(|flight| Self {
            minutes_until_arrival: flight.minutes_until_arrival(now),
            flight: flight.clone(),
            last_updated_at: snapshot.generated_at,
        })
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/next-arrival", get(next_arrival_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FLIGHTWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let snapshot_path = std::env::var("FLIGHTWATCH_SNAPSHOT_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "./flight_data.json".to_string());
    let state = AppState::new(snapshot_path);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving snapshot api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    match load(&state).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(resp) => resp,
    }
}

async fn next_arrival_handler(State(state): State<Arc<AppState>>) -> Response {
    match load(&state).await {
        Ok(snapshot) => {
            let view = NextArrivalView::from_snapshot(&snapshot, Local::now().naive_local());
            Json(view).into_response()
        }
        Err(resp) => resp,
    }
}

async fn load(state: &AppState) -> Result<Snapshot, Response> {
    match state.store.load().await {
        SnapshotRead::Loaded(snapshot) => Ok(snapshot),
        SnapshotRead::Missing => Err(no_data("no flight data yet")),
        SnapshotRead::Unreadable(reason) => {
            warn!(%reason, "snapshot unreadable");
            Err(no_data("flight data unavailable"))
        }
    }
}

fn no_data(message: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": message })),
    )
        .into_response()
}
