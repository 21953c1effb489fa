//! The typed, mutable per-request context threaded through the dispatch
//! pipeline. Each pipeline step reads what earlier steps filled in and
//! adds its own piece; nothing downstream re-derives state a prior step
//! already computed.

use apex_core::UserContext;
use axum::http::Method;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

pub struct RequestContext {
  pub request_id: String,
  pub trace_id: String,
  pub received_at: DateTime<Utc>,
  pub started_at: Instant,
  pub method: Method,
  pub path: String,
  pub client_ip: String,
  pub user_agent: Option<String>,

  pub route_pattern: Option<String>,
  pub service_name: Option<String>,
  pub path_params: HashMap<String, String>,

  pub body: Option<Bytes>,

  pub user: Option<UserContext>,
  pub api_key_identity: Option<String>,
  /// Username/email pulled from a cached `/auth/login` or `/auth/register`
  /// body, used only to namespace the rate-limit identity before a user
  /// is authenticated.
  pub login_identifier: Option<String>,

  pub rate_limit_identity: Option<String>,
  pub rate_limit_remaining: Option<u64>,

  pub selected_instance_id: Option<String>,
  pub upstream_url: Option<String>,
}

impl RequestContext {
  pub fn new(method: Method, path: String, client_ip: String, user_agent: Option<String>) -> Self {
    Self {
      request_id: Uuid::new_v4().to_string(),
      trace_id: Uuid::new_v4().to_string(),
      received_at: Utc::now(),
      started_at: Instant::now(),
      method,
      path,
      client_ip,
      user_agent,
      route_pattern: None,
      service_name: None,
      path_params: HashMap::new(),
      body: None,
      user: None,
      api_key_identity: None,
      login_identifier: None,
      rate_limit_identity: None,
      rate_limit_remaining: None,
      selected_instance_id: None,
      upstream_url: None,
    }
  }

  pub fn elapsed_ms(&self) -> u64 {
    self.started_at.elapsed().as_millis() as u64
  }

  /// Resolve the namespaced rate-limit identity per the priority order:
  /// `user:{id}` > `login:{identifier}` > `api_key:{key}` > `ip:{addr}`.
  pub fn resolve_rate_limit_identity(&self) -> String {
    if let Some(user) = &self.user {
      return format!("user:{}", user.user_id);
    }
    if let Some(login) = &self.login_identifier {
      return format!("login:{login}");
    }
    if let Some(api_key) = &self.api_key_identity {
      return format!("api_key:{api_key}");
    }
    format!("ip:{}", self.client_ip)
  }

  /// Extract a login identifier (`username`/`user_name`/`user`/`email`/
  /// `email_address`) from the cached request body, used only for
  /// `/auth/login` and `/auth/register`. Parse failure or a missing field
  /// falls through to IP-based rate limiting, same as an absent body.
  pub fn extract_login_identifier(&mut self) {
    let Some(body) = &self.body else { return };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else { return };
    let identifier = ["username", "user_name", "user", "email", "email_address"]
      .iter()
      .find_map(|key| value.get(key).and_then(|v| v.as_str()))
      .map(|s| s.to_string());
    self.login_identifier = identifier;
  }

  /// Whether this request targets the local login/registration surface
  /// that the rate limiter namespaces by submitted identifier rather than
  /// by authenticated user or IP.
  pub fn is_login_path(path: &str) -> bool {
    path.ends_with("/auth/login") || path.ends_with("/auth/register")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ctx() -> RequestContext {
    RequestContext::new(Method::POST, "/auth/login".to_string(), "203.0.113.9".to_string(), None)
  }

  #[test]
  fn identity_resolution_prefers_user_over_login_over_api_key_over_ip() {
    let mut c = ctx();
    c.login_identifier = Some("alice".to_string());
    c.api_key_identity = Some("key-1".to_string());
    assert_eq!(c.resolve_rate_limit_identity(), "login:alice");

    c.user = Some(UserContext {
      user_id: "u-1".to_string(),
      username: None,
      email: None,
      tenant_id: None,
      roles: vec![],
      permissions: vec![],
      is_active: true,
    });
    assert_eq!(c.resolve_rate_limit_identity(), "user:u-1");
  }

  #[test]
  fn identity_falls_back_to_api_key_then_ip() {
    let mut c = ctx();
    assert_eq!(c.resolve_rate_limit_identity(), "ip:203.0.113.9");

    c.api_key_identity = Some("key-1".to_string());
    assert_eq!(c.resolve_rate_limit_identity(), "api_key:key-1");
  }

  #[test]
  fn extract_login_identifier_prefers_username_field() {
    let mut c = ctx();
    c.body = Some(Bytes::from_static(br#"{"username":"alice","password":"x"}"#));
    c.extract_login_identifier();
    assert_eq!(c.login_identifier.as_deref(), Some("alice"));
  }

  #[test]
  fn extract_login_identifier_falls_back_through_field_aliases() {
    let mut c = ctx();
    c.body = Some(Bytes::from_static(br#"{"email_address":"bob@example.com"}"#));
    c.extract_login_identifier();
    assert_eq!(c.login_identifier.as_deref(), Some("bob@example.com"));
  }

  #[test]
  fn extract_login_identifier_is_a_noop_on_unparseable_body() {
    let mut c = ctx();
    c.body = Some(Bytes::from_static(b"not json"));
    c.extract_login_identifier();
    assert_eq!(c.login_identifier, None);
  }

  #[test]
  fn distinct_login_identifiers_namespace_separately() {
    let mut alice = ctx();
    alice.login_identifier = Some("alice".to_string());
    let mut bob = ctx();
    bob.login_identifier = Some("bob".to_string());
    assert_ne!(alice.resolve_rate_limit_identity(), bob.resolve_rate_limit_identity());
  }

  #[test]
  fn is_login_path_matches_login_and_register_only() {
    assert!(RequestContext::is_login_path("/auth/login"));
    assert!(RequestContext::is_login_path("/api/auth/register"));
    assert!(!RequestContext::is_login_path("/auth/refresh"));
  }
}
