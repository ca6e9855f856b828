//! # Launcher API
//!
//! Status, relaunch and a live event stream for a running launcher.

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use launcher_core::error::CapabilityError;
use launcher_core::launcher::{LauncherEvent, LauncherHandle, RunStatus};
use launcher_core::state::{CatalogState, CatalogStates, CatalogStatus, Diagnostic};

/// Shared server state
pub struct AppState {
    pub handle: LauncherHandle,
    pub event_tx: broadcast::Sender<LauncherEvent>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Bridge every bus message of `handle` into a broadcast channel
    pub fn new(handle: LauncherHandle) -> SharedState {
        let (event_tx, _) = broadcast::channel::<LauncherEvent>(100);
        let tx = event_tx.clone();
        let generation = handle.subscribe_generation();
        handle.bus().subscribe_all(move |_, msg| {
            let _ = tx.send(LauncherEvent::new(msg, *generation.borrow()));
        });
        Arc::new(Self { handle, event_tx })
    }
}

/// One catalog as reported by the API and the CLI
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSummary {
    pub key: String,
    pub url: String,
    pub optional: bool,
    pub status: CatalogStatus,
    pub locator_id: Option<String>,
    pub download_size: u64,
    pub loaded_modules: Vec<String>,
    pub error: Option<CapabilityError>,
}

impl From<&CatalogState> for CatalogSummary {
    fn from(state: &CatalogState) -> Self {
        Self {
            key: state.key().to_string(),
            url: state.descriptor.url.clone(),
            optional: state.is_optional,
            status: state.status(),
            locator_id: state.locator_id.clone(),
            download_size: state.download_size,
            loaded_modules: state.loaded_modules.clone(),
            error: state.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: RunStatus,
    pub generation: u64,
    pub catalogs: Vec<CatalogSummary>,
    pub diagnostics: Vec<Diagnostic>,
}

impl StatusResponse {
    pub fn new(status: RunStatus, generation: u64, states: &CatalogStates) -> Self {
        Self {
            status,
            generation,
            catalogs: states.iter().map(CatalogSummary::from).collect(),
            diagnostics: states.diagnostics().to_vec(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RelaunchResponse {
    pub success: bool,
    pub generation: u64,
}

pub fn launcher_routes() -> Router<SharedState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/relaunch", post(relaunch))
        .route("/events", get(events))
}

/// Run status, catalog table and diagnostics
async fn get_status(State(state): State<SharedState>) -> Json<StatusResponse> {
    let handle = &state.handle;
    Json(StatusResponse::new(
        handle.status(),
        handle.generation(),
        &handle.states(),
    ))
}

/// Abandon the current run and start over
async fn relaunch(State(state): State<SharedState>) -> Json<RelaunchResponse> {
    let generation = state.handle.relaunch();
    tracing::info!(generation, "relaunch requested over http");
    Json(RelaunchResponse {
        success: true,
        generation,
    })
}

/// SSE stream of launcher events with heartbeat
async fn events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();

    let stream = stream::unfold(rx, |mut rx| async move {
        let next = tokio::time::timeout(Duration::from_secs(15), rx.recv()).await;
        let event = match next {
            Ok(Ok(event)) => {
                let json = serde_json::to_string(&event).unwrap_or_default();
                Event::default().event("launcher").data(json)
            }
            Ok(Err(RecvError::Lagged(skipped))) => {
                Event::default().comment(format!("lagged {}", skipped))
            }
            Ok(Err(RecvError::Closed)) => return None,
            Err(_) => Event::default().comment("heartbeat"),
        };
        Some((Ok(event), rx))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
