//! Per-identity rate limiting: a fixed-window counter in the fast KV tier
//! gates the request, and every decision is mirrored to a durable audit
//! tier that never blocks the request path.
//!
//! Identity resolution order, most to least specific:
//!   user_id > login_identifier > api_key > ip
//!
//! A fast-KV outage fails open — the request is allowed through rather
//! than rejected, on the reasoning that an unreachable counter store is a
//! gateway problem, not a signal that the caller is abusive.

pub mod audit_store;

pub use audit_store::{AuditMode, RateLimitAuditRecord, RateLimitAuditStore};

use crate::config::RateLimitWindow;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitBucket {
  pub identity: String,
  pub window_start: i64,
  pub count: u64,
  pub limit: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitDecision {
  pub allowed: bool,
  pub remaining: u64,
  pub retry_after_secs: u64,
}

fn bucket_key_for(identity: &str, window_label: &str, window_start: i64, route: Option<&str>) -> String {
  match route {
    Some(route) => format!("rate_limit:{identity}:{window_label}:{window_start}:{route}"),
    None => format!("rate_limit:{identity}:{window_label}:{window_start}"),
  }
}

pub struct RateLimiter {
  conn: ConnectionManager,
  window: RateLimitWindow,
  default_limit: u64,
  audit_store: RateLimitAuditStore,
}

impl RateLimiter {
  pub fn new(conn: ConnectionManager, window: RateLimitWindow, default_limit: u64, audit_store: RateLimitAuditStore) -> Self {
    Self { conn, window, default_limit, audit_store }
  }

  fn bucket_key(&self, identity: &str, window_start: i64, route: Option<&str>) -> String {
    bucket_key_for(identity, self.window_label(), window_start, route)
  }

  fn window_label(&self) -> &'static str {
    match self.window {
      RateLimitWindow::Minute => "minute",
      RateLimitWindow::Hour => "hour",
      RateLimitWindow::Day => "day",
    }
  }

  /// Check and increment the bucket for `identity`. On any fast-KV error
  /// this fails open: the call is allowed and the failure is only logged,
  /// never surfaced to the caller as a rejection.
  pub async fn check(&self, identity: &str, limit_override: Option<u64>, route: Option<&str>) -> RateLimitDecision {
    let limit = limit_override.unwrap_or(self.default_limit);
    let now = Utc::now().timestamp();
    let window_start = self.window.truncate(now);
    let key = self.bucket_key(identity, window_start, route);
    let window_secs = self.window.duration().as_secs();

    let mut conn = self.conn.clone();
    let result: redis::RedisResult<u64> = async {
      let count: u64 = conn.incr(&key, 1).await?;
      if count == 1 {
        let _: () = conn.expire(&key, window_secs as i64).await?;
      }
      Ok(count)
    }
    .await;

    let (decision, count) = match result {
      Ok(count) if count <= limit => (
        RateLimitDecision { allowed: true, remaining: limit.saturating_sub(count), retry_after_secs: 0 },
        count,
      ),
      Ok(count) => (
        RateLimitDecision {
          allowed: false,
          remaining: 0,
          retry_after_secs: window_secs - (now - window_start).max(0) as u64,
        },
        count,
      ),
      Err(e) => {
        warn!(identity, error = %e, "fast-kv unavailable for rate limiting, failing open");
        (RateLimitDecision { allowed: true, remaining: limit, retry_after_secs: 0 }, 0)
      }
    };

    self
      .audit_store
      .record(RateLimitAuditRecord {
        identity: identity.to_string(),
        window_type: self.window_label().to_string(),
        route_path: route.map(|r| r.to_string()),
        window_start,
        window_end: window_start + window_secs as i64,
        request_count: count,
        allowed: decision.allowed,
        recorded_at: Utc::now(),
      })
      .await;

    decision
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bucket_key_namespaces_by_route_when_present() {
    let with_route = bucket_key_for("user:u-1", "minute", 0, Some("/api/v1/widgets"));
    let without_route = bucket_key_for("user:u-1", "minute", 0, None);
    assert_ne!(with_route, without_route);
    assert!(with_route.ends_with("/api/v1/widgets"));
  }
}
