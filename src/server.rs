use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, warn};

use crate::{
    error::StoreError,
    netdetect::SystemInfo,
    orchestrator::{Orchestrator, RunOutcome},
    store::{RawRecord, RecordStore},
    types::ScanResult,
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<RecordStore>,
    orchestrator: Arc<Orchestrator>,
    system: SystemInfo,
    ui_dir: PathBuf,
    // run started by this surface, if any; used to refuse overlapping triggers
    active: Arc<Mutex<Option<JoinHandle<RunOutcome>>>>,
}

/// Result of asking for a new scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started,
    AlreadyRunning,
}

impl AppState {
    pub fn new(
        store: Arc<RecordStore>,
        orchestrator: Arc<Orchestrator>,
        system: SystemInfo,
        ui_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            system,
            ui_dir: ui_dir.into(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a run unless the previous one started here is still going.
    pub async fn try_trigger(&self) -> TriggerOutcome {
        let mut active = self.active.lock().await;
        if active.as_ref().is_some_and(|h| !h.is_finished()) {
            return TriggerOutcome::AlreadyRunning;
        }
        *active = Some(self.orchestrator.trigger());
        TriggerOutcome::Started
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/scan", post(post_scan))
        .route("/scans", get(list_scans).post(import_scan))
        .route("/scans/{filename}", get(get_scan))
        .route("/latest_scan", get(get_latest_scan));

    let static_svc = ServeDir::new(&state.ui_dir).append_index_html_on_directories(true);

    Router::new()
        .nest("/api", api)
        .route("/system_info", get(get_system_info))
        .route("/ws", get(ws_events))
        .with_state(state)
        .fallback_service(static_svc)
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving UI on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::NoRecords => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "no scans available" }))).into_response()
        }
        StoreError::NotFound(_) => {
            (StatusCode::NOT_FOUND, Json(json!({ "error": "scan not found" }))).into_response()
        }
        other => {
            warn!("record store error: {other}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": other.to_string() })),
            )
                .into_response()
        }
    }
}

fn raw_response(raw: RawRecord) -> Response {
    ([(header::CONTENT_TYPE, raw.content_type)], raw.bytes).into_response()
}

async fn get_system_info(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.system.clone())
}

async fn list_scans(State(app): State<AppState>) -> Response {
    match app.store.list().await {
        Ok(scans) => (StatusCode::OK, Json(scans)).into_response(),
        Err(e) => store_error(e),
    }
}

async fn get_scan(State(app): State<AppState>, Path(filename): Path<String>) -> Response {
    match app.store.read_raw(&filename).await {
        Ok(raw) => raw_response(raw),
        Err(e) => store_error(e),
    }
}

async fn get_latest_scan(State(app): State<AppState>) -> Response {
    match app.store.latest_raw().await {
        Ok(raw) => raw_response(raw),
        Err(e) => store_error(e),
    }
}

async fn post_scan(State(app): State<AppState>) -> Response {
    match app.try_trigger().await {
        TriggerOutcome::Started => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
        }
        TriggerOutcome::AlreadyRunning => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "already_running" })),
        )
            .into_response(),
    }
}

/// Store a result produced elsewhere (e.g. a remote agent) as a new local
/// record. A record that already exists under the derived name is left alone.
async fn import_scan(State(app): State<AppState>, Json(body): Json<ScanResult>) -> Response {
    let checked = match body.validated() {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "status": "error", "message": e.to_string() })),
            )
                .into_response()
        }
    };

    match app.store.persist_new(checked).await {
        Ok(stored) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "filename": stored.filename(),
            })),
        )
            .into_response(),
        Err(e @ StoreError::AlreadyExists(_)) => (
            StatusCode::CONFLICT,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "message": e.to_string() })),
        )
            .into_response(),
    }
}

async fn ws_events(State(app): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, app))
}

/// Forward every event to the client; a `start_scan` text frame triggers a run.
async fn handle_ws(mut socket: WebSocket, app: AppState) {
    let mut rx = app.orchestrator.events().subscribe();
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(event.as_ref()) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("cannot encode {} event: {e}", event.name());
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(n)) => debug!(missed = n, "websocket subscriber lagging"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(t))) if t.as_str().trim() == "start_scan" => {
                    let outcome = app.try_trigger().await;
                    debug!(?outcome, "scan requested over websocket");
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
