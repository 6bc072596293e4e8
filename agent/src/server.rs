use crate::connection::ConnectionManager;
use crate::storage::TelemetryStore;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::fs;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Local runtime API port; loopback only.
pub const RUNTIME_PORT: u16 = 7700;

/// Shared state behind the runtime HTTP service.
pub struct RuntimeState {
    pub agent_id: String,
    pub connection: Arc<ConnectionManager>,
    pub store: Arc<TelemetryStore>,
    pub services: Vec<String>,
    pub degraded: bool,
    telemetry_seq: AtomicU64,
}

impl RuntimeState {
    pub fn new(
        agent_id: String,
        connection: Arc<ConnectionManager>,
        store: Arc<TelemetryStore>,
        services: Vec<String>,
        degraded: bool,
    ) -> Self {
        RuntimeState {
            agent_id,
            connection,
            store,
            services,
            degraded,
            telemetry_seq: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusSnapshot {
    agent_id: String,
    state: String,
    assigned_ip: Option<String>,
    assigned_subnet: Option<String>,
    colony_endpoint: Option<String>,
    last_heartbeat_age_secs: Option<u64>,
    services: Vec<String>,
    degraded: bool,
}

#[derive(Debug, Serialize)]
struct SystemMetrics {
    load_1m: f64,
    mem_total_kb: u64,
    mem_available_kb: u64,
}

pub fn router(state: Arc<RuntimeState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/telemetry", post(ingest_telemetry))
        .route("/metrics/system", get(system_metrics))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
}

/// Serve the runtime API until the shutdown signal flips; the caller bounds
/// the drain.
pub async fn serve(
    state: Arc<RuntimeState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<()>> {
    let addr: SocketAddr = ([127, 0, 0, 1], RUNTIME_PORT).into();
    let listener = TcpListener::bind(addr).await?;
    info!(component = "runtime", addr = %addr, "runtime service listening");

    let app = router(state);
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
    });

    Ok(handle)
}

async fn healthz() -> &'static str {
    "ok"
}

/// GET /status
/// Steady-state view operators use to tell `waiting_discovery` from a hang.
async fn status(State(state): State<Arc<RuntimeState>>) -> Json<StatusSnapshot> {
    Json(StatusSnapshot {
        agent_id: state.agent_id.clone(),
        state: state.connection.state().to_string(),
        assigned_ip: state.connection.assigned_ip(),
        assigned_subnet: state.connection.assigned_subnet(),
        colony_endpoint: state.connection.colony_endpoint(),
        last_heartbeat_age_secs: state
            .connection
            .last_successful_heartbeat()
            .map(|at| at.elapsed().as_secs()),
        services: state.services.clone(),
        degraded: state.degraded,
    })
}

/// POST /telemetry
/// Accepts one JSON document and files it in the local store.
async fn ingest_telemetry(
    State(state): State<Arc<RuntimeState>>,
    Json(doc): Json<serde_json::Value>,
) -> StatusCode {
    let seq = state.telemetry_seq.fetch_add(1, Ordering::Relaxed);
    let key = format!("telemetry-{:08}", seq);

    match state.store.put(&key, &doc) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// GET /metrics/system
async fn system_metrics() -> Json<SystemMetrics> {
    Json(read_system_metrics())
}

fn read_system_metrics() -> SystemMetrics {
    let load_1m = fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse().ok()))
        .unwrap_or(0.0);

    let meminfo = fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let field = |name: &str| {
        meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    SystemMetrics {
        load_1m,
        mem_total_kb: field("MemTotal:"),
        mem_available_kb: field("MemAvailable:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_metrics_never_panic() {
        // Values are best-effort; absence of /proc entries degrades to zero.
        let metrics = read_system_metrics();
        assert!(metrics.load_1m >= 0.0);
    }
}
