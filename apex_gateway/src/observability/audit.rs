//! Application-level audit events (distinct from the rate-limit audit tier
//! in [`crate::ratelimit::audit_store`]): security and lifecycle events
//! that get a durable row in `audit_logs` in addition to a structured log
//! line.
//!
//! Event taxonomy and severity mapping grounded on the teacher's
//! `proxy::audit::AuditEventType`, trimmed to the events this gateway
//! actually emits (no CORS/cache-specific variants, which belonged to the
//! teacher's Pingora-era cache layer).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
  AuthenticationSuccess,
  AuthenticationFailure,
  TokenRefreshed,
  TokenRevoked,
  TokenReuseDetected,
  RateLimitExceeded,
  CircuitOpened,
  CircuitClosed,
  RouteNotFound,
  UpstreamUnavailable,
}

impl AuditEventType {
  pub fn severity(&self) -> AuditSeverity {
    match self {
      AuditEventType::TokenReuseDetected => AuditSeverity::Critical,
      AuditEventType::AuthenticationFailure | AuditEventType::CircuitOpened => AuditSeverity::High,
      AuditEventType::RateLimitExceeded | AuditEventType::UpstreamUnavailable => AuditSeverity::Medium,
      AuditEventType::RouteNotFound => AuditSeverity::Low,
      _ => AuditSeverity::Info,
    }
  }

  /// The bare `snake_case` tag, matching the enum's serde representation
  /// but without the surrounding quotes a full JSON encode would add —
  /// used for the `event_type` TEXT column rather than `serde_json::to_string`.
  pub fn as_str(&self) -> &'static str {
    match self {
      AuditEventType::AuthenticationSuccess => "authentication_success",
      AuditEventType::AuthenticationFailure => "authentication_failure",
      AuditEventType::TokenRefreshed => "token_refreshed",
      AuditEventType::TokenRevoked => "token_revoked",
      AuditEventType::TokenReuseDetected => "token_reuse_detected",
      AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
      AuditEventType::CircuitOpened => "circuit_opened",
      AuditEventType::CircuitClosed => "circuit_closed",
      AuditEventType::RouteNotFound => "route_not_found",
      AuditEventType::UpstreamUnavailable => "upstream_unavailable",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
  Critical,
  High,
  Medium,
  Low,
  Info,
}

impl AuditSeverity {
  /// The bare `lowercase` tag; see [`AuditEventType::as_str`] for why this
  /// isn't just `serde_json::to_string`.
  pub fn as_str(&self) -> &'static str {
    match self {
      AuditSeverity::Critical => "critical",
      AuditSeverity::High => "high",
      AuditSeverity::Medium => "medium",
      AuditSeverity::Low => "low",
      AuditSeverity::Info => "info",
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
  pub event_id: String,
  pub timestamp: DateTime<Utc>,
  pub event_type: AuditEventType,
  pub severity: AuditSeverity,
  pub request_id: String,
  pub user_id: Option<String>,
  pub service: Option<String>,
  pub ip_address: Option<String>,
  pub user_agent: Option<String>,
  pub details: HashMap<String, serde_json::Value>,
}

impl AuditLogEntry {
  pub fn new(event_type: AuditEventType, request_id: String) -> Self {
    let severity = event_type.severity();
    Self {
      event_id: Uuid::new_v4().to_string(),
      timestamp: Utc::now(),
      event_type,
      severity,
      request_id,
      user_id: None,
      service: None,
      ip_address: None,
      user_agent: None,
      details: HashMap::new(),
    }
  }

  pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
    self.user_id = Some(user_id.into());
    self
  }

  pub fn with_service(mut self, service: impl Into<String>) -> Self {
    self.service = Some(service.into());
    self
  }

  pub fn with_ip_address(mut self, ip_address: impl Into<String>) -> Self {
    self.ip_address = Some(ip_address.into());
    self
  }

  pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
    self.user_agent = Some(user_agent.into());
    self
  }

  pub fn with_detail<T: Serialize>(mut self, key: &str, value: T) -> Self {
    if let Ok(json) = serde_json::to_value(value) {
      self.details.insert(key.to_string(), json);
    }
    self
  }

  pub fn log_level(&self) -> tracing::Level {
    match self.severity {
      AuditSeverity::Critical | AuditSeverity::High => tracing::Level::WARN,
      AuditSeverity::Medium | AuditSeverity::Low => tracing::Level::INFO,
      AuditSeverity::Info => tracing::Level::INFO,
    }
  }
}

/// Persist an audit entry and emit it as a structured log line on the
/// `audit` target. Persistence failures are logged but never propagated:
/// observability must not be able to fail a request.
pub async fn record(pool: &PgPool, entry: &AuditLogEntry) {
  let details = serde_json::to_value(&entry.details).unwrap_or_default();
  let result = sqlx::query(
    "INSERT INTO audit_logs (event_id, occurred_at, event_type, severity, request_id, user_id, service, ip_address, user_agent, details) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
  )
  .bind(&entry.event_id)
  .bind(entry.timestamp)
  .bind(entry.event_type.as_str())
  .bind(entry.severity.as_str())
  .bind(&entry.request_id)
  .bind(&entry.user_id)
  .bind(&entry.service)
  .bind(&entry.ip_address)
  .bind(&entry.user_agent)
  .bind(details)
  .execute(pool)
  .await;

  if let Err(e) = result {
    tracing::error!(error = %e, event_id = %entry.event_id, "failed to persist audit log entry");
  }

  tracing::event!(target: "audit", tracing::Level::INFO, event_type = ?entry.event_type, severity = ?entry.severity, request_id = %entry.request_id, "audit event");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn token_reuse_is_critical_severity() {
    let entry = AuditLogEntry::new(AuditEventType::TokenReuseDetected, "req-1".to_string());
    assert_eq!(entry.severity, AuditSeverity::Critical);
  }

  #[test]
  fn as_str_is_bare_not_json_quoted() {
    assert_eq!(AuditEventType::TokenReuseDetected.as_str(), "token_reuse_detected");
    assert_eq!(AuditSeverity::Critical.as_str(), "critical");
  }

  #[test]
  fn route_not_found_is_low_severity() {
    let entry = AuditLogEntry::new(AuditEventType::RouteNotFound, "req-1".to_string());
    assert_eq!(entry.severity, AuditSeverity::Low);
  }
}
