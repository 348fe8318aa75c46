use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use switchboard_runtime::Coordinator;
use tracing::{error, info};

#[derive(Clone)]
pub struct HealthState {
    coordinator: Arc<Coordinator>,
}

impl HealthState {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub key_value_store: HealthCheck,
    pub source_of_record: HealthCheck,
    pub active_sessions: usize,
    pub checked_at: String,
}

pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new().route("/health", get(health)).with_state(HealthState::new(coordinator))
}

pub async fn spawn(bind_address: &str, port: u16, coordinator: Arc<Coordinator>) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(event_name = "system.health.start", bind_address = %address, "health endpoint started");

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(coordinator)).await {
            error!(
                event_name = "system.health.error",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let coordinator = &state.coordinator;
    let (kv, records) = tokio::join!(coordinator.kv().ping(), coordinator.records().ping());

    let key_value_store = check(coordinator.kv().backend(), kv);
    let source_of_record = check(coordinator.records().backend(), records);
    let ready = key_value_store.status == "ready" && source_of_record.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        key_value_store,
        source_of_record,
        active_sessions: coordinator.sessions().len(),
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn check<E: std::fmt::Display>(backend: &str, result: Result<(), E>) -> HealthCheck {
    match result {
        Ok(()) => HealthCheck { status: "ready", detail: format!("{backend} reachable") },
        Err(error) => HealthCheck { status: "degraded", detail: format!("{backend} check failed: {error}") },
    }
}
