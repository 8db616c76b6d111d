use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use rollout_engine::TriggerController;
use rollout_store::EventLog;

use crate::config::ServerConfig;
use crate::handlers;
use crate::health;

/// Shared state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub log: Arc<EventLog>,
    pub controller: TriggerController,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(log: Arc<EventLog>, controller: TriggerController) -> Self {
        Self {
            log,
            controller,
            start_time: Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/events", get(handlers::list_events))
        .route("/deploy", post(handlers::deploy))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` is cancelled. In-flight requests are
/// allowed to finish.
pub async fn start(
    config: &ServerConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<ServerHandle, std::io::Error> {
    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "rollout server listening");

    let router = build_router(state);
    let task = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr: local_addr,
        task,
    })
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The serving task; completes after graceful shutdown.
    pub fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let head = match state.log.head() {
        Ok(head) => Some(head),
        Err(e) => {
            warn!(error = %e, "health check could not read the event log head");
            None
        }
    };
    let resp = health::health_check(
        state.start_time,
        state.controller.is_accepting(),
        head,
        state.controller.phases(),
    );
    let status = if resp.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(resp))
}
