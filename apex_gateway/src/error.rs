//! Gateway-wide error type and its mapping onto HTTP status codes.
//!
//! Every fallible operation in the request pipeline funnels into
//! [`GatewayError`] so the terminal handler has one place that decides what
//! the client sees, independent of which component failed.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
  #[error("no route matches {method} {path}")]
  RouteNotFound { method: String, path: String },

  #[error("missing or malformed authorization header")]
  Unauthenticated,

  #[error("authentication failed: {0}")]
  AuthenticationFailed(String),

  #[error("caller lacks required permission: {0}")]
  Forbidden(String),

  #[error("rate limit exceeded for {identity}")]
  RateLimited { identity: String, retry_after_secs: u64 },

  #[error("no instances registered for service {0}")]
  ServiceUnavailable(String),

  #[error("no healthy instance available for service {0}")]
  NoHealthyInstance(String),

  #[error("circuit open for service {0}")]
  CircuitOpen(String),

  #[error("upstream request failed: {0}")]
  UpstreamUnavailable(String),

  #[error("upstream timed out after retries")]
  UpstreamTimeout,

  #[error("invalid request: {0}")]
  BadRequest(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl From<apex_core::CoreError> for GatewayError {
  fn from(err: apex_core::CoreError) -> Self {
    match err {
      apex_core::CoreError::Authentication(msg) => GatewayError::AuthenticationFailed(msg),
      apex_core::CoreError::Validation(msg) => GatewayError::BadRequest(msg),
      apex_core::CoreError::NotFound(msg) => GatewayError::BadRequest(msg),
      apex_core::CoreError::Unavailable(msg) => GatewayError::Internal(msg),
      apex_core::CoreError::Internal(msg) => GatewayError::Internal(msg),
    }
  }
}

impl From<reqwest::Error> for GatewayError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      GatewayError::UpstreamTimeout
    } else {
      GatewayError::UpstreamUnavailable(err.to_string())
    }
  }
}

impl From<redis::RedisError> for GatewayError {
  fn from(err: redis::RedisError) -> Self {
    GatewayError::Internal(format!("fast-kv error: {err}"))
  }
}

impl From<sqlx::Error> for GatewayError {
  fn from(err: sqlx::Error) -> Self {
    GatewayError::Internal(format!("durable store error: {err}"))
  }
}

impl GatewayError {
  pub fn status_code(&self) -> StatusCode {
    match self {
      GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
      GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
      GatewayError::AuthenticationFailed(_) => StatusCode::UNAUTHORIZED,
      GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
      GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
      // §7: no instances at all is a 502 (discovery miss); instances that
      // exist but are all unhealthy, or a call blocked by an open circuit
      // on a service known to have instances, is a 503.
      GatewayError::ServiceUnavailable(_) => StatusCode::BAD_GATEWAY,
      GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
      GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
      GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
      GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
      GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
      GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for GatewayError {
  fn into_response(self) -> Response {
    let status = self.status_code();
    let mut body = json!({ "error": self.to_string() });
    if let GatewayError::RateLimited { retry_after_secs, .. } = &self {
      body["retry_after_seconds"] = json!(retry_after_secs);
    }
    let mut response = (status, Json(body)).into_response();
    if let GatewayError::RateLimited { retry_after_secs, .. } = &self {
      if let Ok(value) = axum::http::HeaderValue::from_str(&retry_after_secs.to_string()) {
        response.headers_mut().insert(axum::http::header::RETRY_AFTER, value);
      }
    }
    response
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rate_limited_maps_to_429() {
    let err = GatewayError::RateLimited {
      identity: "u-1".to_string(),
      retry_after_secs: 30,
    };
    assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
  }

  #[test]
  fn circuit_open_maps_to_503() {
    let err = GatewayError::CircuitOpen("billing".to_string());
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
  }
}
