//! Local authentication endpoints: `/auth/refresh` rotates (or simply
//! re-validates) a refresh token by delegating to the backend auth-service,
//! `/auth/revoke` ends a session (or every session for a user) locally.
//!
//! `/auth/refresh` is the one gateway endpoint that both consults
//! discovery/load-balancing (to find the auth-service, same as a proxied
//! request would) and also owns the refresh-token bookkeeping directly,
//! rather than forwarding the client's refresh token downstream: the
//! gateway is the only party that should ever see it.

use crate::auth::token_manager::RefreshTokenRecord;
use crate::error::GatewayError;
use crate::observability::audit::{AuditEventType, AuditLogEntry, record};
use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::routing::post;
use axum::{Router, http::StatusCode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn router() -> Router<AppState> {
  Router::new()
    .route("/auth/refresh", post(refresh))
    .route("/auth/revoke", post(revoke))
}

#[derive(Deserialize)]
struct RefreshRequest {
  refresh_token: String,
}

#[derive(Serialize)]
struct RefreshResponse {
  access_token: String,
  refresh_token: String,
  token_type: String,
  expires_in: u64,
}

/// The auth-service's own `/auth/refresh` response shape.
#[derive(Deserialize)]
struct UpstreamRefreshResponse {
  access_token: String,
  refresh_token: String,
  #[serde(default = "default_token_type")]
  token_type: String,
  expires_in: u64,
}

fn default_token_type() -> String {
  "Bearer".to_string()
}

async fn refresh(
  State(state): State<AppState>,
  Json(payload): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, GatewayError> {
  let request_id = Uuid::new_v4().to_string();

  let Some(record): Option<RefreshTokenRecord> = state.refresh_tokens.validate(&payload.refresh_token).await? else {
    emit_audit(&state, AuditEventType::AuthenticationFailure, &request_id, None).await;
    return Err(GatewayError::Unauthenticated);
  };

  // §4.C11 step 2 is explicit that "none" (whether discovery has no
  // instances at all, or none are healthy) surfaces as 503 here — unlike
  // the general proxy pipeline's 502/503 split on the same distinction.
  let service_name = &state.config.auth.auth_service_name;
  let instances = state.discovery.get_instances(service_name).await;
  let instance = state
    .balancer
    .select(service_name, &instances)
    .cloned()
    .ok_or_else(|| GatewayError::NoHealthyInstance(service_name.clone()))?;

  let upstream_url = format!("{}/auth/refresh", instance.base_url());
  let upstream: UpstreamRefreshResponse = state
    .http_client
    .post(&upstream_url)
    .header("x-user-id", &record.user_id)
    .json(&serde_json::json!({ "refresh_token": payload.refresh_token }))
    .send()
    .await
    .map_err(GatewayError::from)?
    .json()
    .await
    .map_err(GatewayError::from)?;

  let old_token = if state.config.auth.rotation_enabled { Some(payload.refresh_token.as_str()) } else { None };

  state
    .refresh_tokens
    .store(&record.user_id, &upstream.refresh_token, upstream.expires_in, Some(&record.family_id), old_token)
    .await?;

  emit_audit(&state, AuditEventType::TokenRefreshed, &request_id, Some(&record.user_id)).await;

  Ok(Json(RefreshResponse {
    access_token: upstream.access_token,
    refresh_token: upstream.refresh_token,
    token_type: upstream.token_type,
    expires_in: upstream.expires_in,
  }))
}

#[derive(Deserialize)]
struct RevokeRequest {
  refresh_token: Option<String>,
  user_id: Option<String>,
  #[serde(default)]
  all_sessions: bool,
}

/// §4.C11: revocation is idempotent — an already-invalid token still
/// returns 200, it does not surface `Unauthenticated`.
async fn revoke(
  State(state): State<AppState>,
  Json(payload): Json<RevokeRequest>,
) -> Result<StatusCode, GatewayError> {
  let request_id = Uuid::new_v4().to_string();

  if payload.all_sessions {
    let user_id = payload
      .user_id
      .ok_or_else(|| GatewayError::BadRequest("user_id is required when all_sessions is true".to_string()))?;
    state.refresh_tokens.revoke_all(&user_id).await?;
    emit_audit(&state, AuditEventType::TokenRevoked, &request_id, Some(&user_id)).await;
    return Ok(StatusCode::OK);
  }

  let token = payload.refresh_token.ok_or_else(|| GatewayError::BadRequest("refresh_token is required".to_string()))?;
  let user_id = state.refresh_tokens.validate(&token).await?.map(|r| r.user_id);
  state.refresh_tokens.revoke(&token).await?;
  emit_audit(&state, AuditEventType::TokenRevoked, &request_id, user_id.as_deref()).await;
  Ok(StatusCode::OK)
}

async fn emit_audit(state: &AppState, event_type: AuditEventType, request_id: &str, user_id: Option<&str>) {
  let Some(pool) = &state.db_pool else { return };
  let mut entry = AuditLogEntry::new(event_type, request_id.to_string()).with_service(state.config.auth.auth_service_name.clone());
  if let Some(user_id) = user_id {
    entry = entry.with_user(user_id.to_string());
  }
  record(pool, &entry).await;
}
