//! Header synthesis for the outbound (gateway -> upstream) and inbound
//! (upstream -> client) legs of a proxied request.

use super::context::RequestContext;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailers",
  "transfer-encoding",
  "upgrade",
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
}

/// Build the headers the gateway injects before forwarding to the
/// upstream: identity, tracing correlation, and the original caller's
/// network details, on top of whatever the client already sent.
///
/// `api_key_header` is stripped unconditionally: a caller's own
/// credential to the gateway must never reach a backend that has no
/// business seeing it.
pub fn build_upstream_headers(ctx: &RequestContext, mut headers: HeaderMap, api_key_header: Option<&str>) -> HeaderMap {
  strip_hop_by_hop(&mut headers);
  if let Some(name) = api_key_header {
    headers.remove(name);
  }

  insert(&mut headers, "x-request-id", &ctx.request_id);
  insert(&mut headers, "x-trace-id", &ctx.trace_id);
  insert(&mut headers, "x-forwarded-for", &ctx.client_ip);

  if let Some(user) = &ctx.user {
    insert(&mut headers, "x-user-id", &user.user_id);
    insert(&mut headers, "x-active", &user.is_active.to_string());
    if let Some(username) = &user.username {
      insert(&mut headers, "x-username", username);
    }
    if let Some(tenant_id) = &user.tenant_id {
      insert(&mut headers, "x-tenant-id", tenant_id);
    }
    if !user.roles.is_empty() {
      insert(&mut headers, "x-roles", &user.roles.join(","));
    }
  }

  for (name, value) in &ctx.path_params {
    insert(&mut headers, &format!("x-param-{name}"), value);
  }

  headers
}

/// Merge a route's configured `extra_headers` onto the outbound request;
/// route configuration wins over anything synthesized above.
pub fn apply_route_headers(headers: &mut HeaderMap, extra: &std::collections::HashMap<String, String>) {
  for (name, value) in extra {
    insert(headers, name, value);
  }
}

/// Headers the gateway adds to the response before it reaches the client.
pub fn build_response_headers(ctx: &RequestContext, mut headers: HeaderMap) -> HeaderMap {
  insert(&mut headers, "x-request-id", &ctx.request_id);
  insert(&mut headers, "x-trace-id", &ctx.trace_id);
  insert(&mut headers, "x-response-time-ms", &ctx.elapsed_ms().to_string());
  if let Some(remaining) = ctx.rate_limit_remaining {
    insert(&mut headers, "x-ratelimit-remaining", &remaining.to_string());
  }
  headers
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
  if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(value)) {
    headers.insert(name, value);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use axum::http::Method;

  #[test]
  fn strips_hop_by_hop_headers() {
    let mut headers = HeaderMap::new();
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-custom", HeaderValue::from_static("keep"));
    strip_hop_by_hop(&mut headers);
    assert!(headers.get("connection").is_none());
    assert!(headers.get("x-custom").is_some());
  }

  #[test]
  fn injects_user_identity_headers() {
    let mut ctx = RequestContext::new(Method::GET, "/x".to_string(), "1.2.3.4".to_string(), None);
    ctx.user = Some(apex_core::UserContext {
      user_id: "u-1".to_string(),
      username: None,
      email: None,
      tenant_id: Some("t-1".to_string()),
      roles: vec!["admin".to_string()],
      permissions: vec![],
      is_active: true,
    });

    let headers = build_upstream_headers(&ctx, HeaderMap::new(), Some("x-api-key"));
    assert_eq!(headers.get("x-user-id").unwrap(), "u-1");
    assert_eq!(headers.get("x-tenant-id").unwrap(), "t-1");
    assert_eq!(headers.get("x-roles").unwrap(), "admin");
    assert_eq!(headers.get("x-active").unwrap(), "true");
  }

  #[test]
  fn strips_client_api_key_header() {
    let ctx = RequestContext::new(Method::GET, "/x".to_string(), "1.2.3.4".to_string(), None);
    let mut inbound = HeaderMap::new();
    inbound.insert("x-api-key", HeaderValue::from_static("client-secret"));
    let headers = build_upstream_headers(&ctx, inbound, Some("x-api-key"));
    assert!(headers.get("x-api-key").is_none());
  }

  #[test]
  fn route_extra_headers_are_applied() {
    let mut headers = HeaderMap::new();
    let mut extra = std::collections::HashMap::new();
    extra.insert("x-service-tier".to_string(), "gold".to_string());
    apply_route_headers(&mut headers, &extra);
    assert_eq!(headers.get("x-service-tier").unwrap(), "gold");
  }
}
