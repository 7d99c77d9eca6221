//! HTTP server for health, metrics and status endpoints

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::db::LedgerStore;
use crate::orchestrator::FlowJournal;
use crate::types::ClaimRequestStatus;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub journal: Arc<dyn FlowJournal>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Flow runs per status
    pub flows: BTreeMap<&'static str, i64>,
    pub pending_claim_requests: i64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(State(state): State<AppState>) -> Response {
    let flows = match state.journal.count_by_status().await {
        Ok(counts) => counts
            .into_iter()
            .map(|(status, count)| (status.as_str(), count))
            .collect(),
        Err(e) => {
            warn!(error = %e, "Failed to count flow runs");
            return (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response();
        }
    };
    let pending_claim_requests = match state
        .ledger
        .count_claim_requests(ClaimRequestStatus::Pending)
        .await
    {
        Ok(count) => count,
        Err(e) => {
            warn!(error = %e, "Failed to count pending claim requests");
            return (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response();
        }
    };

    Json(StatusResponse {
        flows,
        pending_claim_requests,
    })
    .into_response()
}

/// Prometheus metrics endpoint
async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the API until shutdown
pub async fn start_server(
    bind_address: &str,
    port: u16,
    state: AppState,
    mut shutdown: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port)
        .parse()
        .map_err(|e| eyre!("Invalid bind address {}:{}: {}", bind_address, port, e))?;
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("API server stopped");
    Ok(())
}
