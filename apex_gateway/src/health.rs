//! `/health`, `/ready`, `/metrics` endpoints for orchestrator probes and
//! scraping. Grounded on the teacher's health router shape, generalized to
//! read actual discovery state instead of a hardcoded placeholder.

use crate::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::{Router, http::StatusCode};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/health", get(health_check))
    .route("/ready", get(readiness_check))
    .route("/metrics", get(metrics))
}

async fn health_check(State(_state): State<AppState>) -> impl IntoResponse {
  let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
  (
    StatusCode::OK,
    Json(serde_json::json!({
      "status": "healthy",
      "timestamp": timestamp,
      "version": env!("CARGO_PKG_VERSION"),
    })),
  )
}

/// Not ready until the configured auth-service has at least one instance
/// discovery reports as healthy: the gateway can't serve `/auth/refresh`
/// without it, so neither should the orchestrator route traffic here yet.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
  let canonical_service = &state.config.auth.auth_service_name;
  let instances = state.discovery.get_instances(canonical_service).await;
  let ready = instances.iter().any(|i| i.healthy);

  let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
  (
    status,
    Json(serde_json::json!({
      "status": if ready { "ready" } else { "not_ready" },
      "auth_service": canonical_service,
      "healthy_instances": instances.iter().filter(|i| i.healthy).count(),
    })),
  )
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
  (StatusCode::OK, state.prometheus_handle.render())
}
