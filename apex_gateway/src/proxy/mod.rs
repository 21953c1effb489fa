//! The proxy/dispatch pipeline: a single ordered sequence of steps that
//! turns an inbound request into an outbound call to a backend service.
//!
//! Axum's own tracing layer and `tower_http::trace::TraceLayer` cover the
//! span-creation and access-log steps around this handler (registered in
//! `main.rs`); everything else — route match through response headers —
//! happens here, in the order the steps are numbered, so the pipeline
//! stays a single place to read rather than a chain of opaque middleware.

pub mod context;
pub mod headers;

use crate::error::GatewayError;
use crate::state::AppState;
use axum::body::Body;
use bytes::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use context::RequestContext;
use std::net::SocketAddr;
use tracing::{info, warn};

/// Step 1: build the per-request context. Steps 2-3 (span + request log)
/// are handled by the tracing layers wrapping this handler.
fn inject_context(req: &Request<Body>, client_addr: SocketAddr) -> RequestContext {
  let user_agent = req
    .headers()
    .get(axum::http::header::USER_AGENT)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string());

  let client_ip = req
    .headers()
    .get("x-forwarded-for")
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.split(',').next())
    .map(|s| s.trim().to_string())
    .unwrap_or_else(|| client_addr.ip().to_string());

  let mut ctx = RequestContext::new(req.method().clone(), req.uri().path().to_string(), client_ip, user_agent);
  if let Some(trace_id) = req.headers().get("x-trace-id").and_then(|v| v.to_str().ok()) {
    ctx.trace_id = trace_id.to_string();
  }
  ctx
}

pub async fn handle_request(
  State(state): State<AppState>,
  ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
  req: Request<Body>,
) -> Response {
  match dispatch(state, client_addr, req).await {
    Ok(response) => response,
    Err(err) => {
      warn!(error = %err, "request failed");
      err.into_response()
    }
  }
}

async fn dispatch(state: AppState, client_addr: SocketAddr, req: Request<Body>) -> Result<Response, GatewayError> {
  // Step 1: context injection.
  let mut ctx = inject_context(&req, client_addr);
  let method = req.method().clone();
  let headers = req.headers().clone();

  // Step 4: route match.
  let route_match = {
    let router = state.router.read().unwrap();
    router
      .find(method.as_str(), &ctx.path)
      .map(|m| (m.route.clone(), m.params))
  };
  let Some((route, path_params)) = route_match else {
    return Err(GatewayError::RouteNotFound { method: method.to_string(), path: ctx.path.clone() });
  };
  ctx.route_pattern = Some(route.pattern.clone());
  ctx.service_name = Some(route.service.clone());
  ctx.path_params = path_params;

  // Step 5: body extraction, cached exactly once so retries don't need to
  // re-read a stream that's already been consumed. Login/register bodies
  // are additionally parsed for a rate-limit identifier.
  let (parts, body) = req.into_parts();
  let body_bytes: Bytes = axum::body::to_bytes(body, usize::MAX)
    .await
    .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
  ctx.body = Some(body_bytes.clone());
  if context::RequestContext::is_login_path(&ctx.path) {
    ctx.extract_login_identifier();
  }

  // Step 6: authentication. The raw API-key header is captured for rate-
  // limit identity purposes even on routes that don't require auth; only
  // `auth_required` routes actually verify it.
  capture_api_key_identity(&state, &headers, &mut ctx);
  if route.auth_required {
    authenticate(&state, &headers, &mut ctx).await?;
  }

  // Step 7: rate limiting.
  let identity = ctx.resolve_rate_limit_identity();
  let decision = state.rate_limiter.check(&identity, route.rate_limit_override, Some(&route.pattern)).await;
  ctx.rate_limit_identity = Some(identity.clone());
  ctx.rate_limit_remaining = Some(decision.remaining);
  if !decision.allowed {
    crate::observability::metrics::collectors::RateLimitMetrics::rejected(&identity);
    return Err(GatewayError::RateLimited { identity, retry_after_secs: decision.retry_after_secs });
  }

  // Step 8: discovery. No instances registered at all is a discovery miss
  // (502), distinct from instances existing but none being healthy (503).
  let instances = state.discovery.get_instances(&route.service).await;
  if instances.is_empty() {
    return Err(GatewayError::ServiceUnavailable(route.service.clone()));
  }

  // Step 9: selection. `select` filters to `healthy == true` internally.
  let instance = state
    .balancer
    .select(&route.service, &instances)
    .ok_or_else(|| GatewayError::NoHealthyInstance(route.service.clone()))?;
  ctx.selected_instance_id = Some(instance.instance_id.clone());

  // Step 10: path rewrite.
  let upstream_path = rewrite_path(&route, &ctx.path, &ctx.path_params);
  let upstream_url = format!("{}{}", instance.base_url(), upstream_path);
  ctx.upstream_url = Some(upstream_url.clone());

  // Step 11: header synthesis.
  let api_key_header = state.authenticator.api_key_header_name();
  let mut outbound_headers = headers::build_upstream_headers(&ctx, headers.clone(), api_key_header);
  headers::apply_route_headers(&mut outbound_headers, &route.extra_headers);

  // Step 12: dispatch via circuit breaker + retry.
  let service_name = route.service.clone();
  let timeout = route
    .timeout_secs
    .map(std::time::Duration::from_secs)
    .unwrap_or_else(|| std::time::Duration::from_secs(state.config.server.request_timeout_secs));
  let response = dispatch_with_breaker_and_retry(
    &state,
    &service_name,
    &parts.method,
    &upstream_url,
    &outbound_headers,
    body_bytes,
    timeout,
  )
  .await;

  let response = match response {
    Ok(response) => {
      state.balancer.release_connection(&route.service, &instance.instance_id);
      response
    }
    Err(err) => {
      state.balancer.release_connection(&route.service, &instance.instance_id);
      state.discovery.record_failure(&route.service, &instance.instance_id).await;
      return Err(err);
    }
  };

  let status = response.status();
  let response_headers = response.headers().clone();

  // Step 13: response headers.
  let mut out_headers = headers::build_response_headers(&ctx, response_headers);
  headers::strip_hop_by_hop(&mut out_headers);

  // Step 14: logging tail. The body is streamed to the client below without
  // buffering, so duration/status are logged against the headers-received
  // point rather than waiting on the full body to drain.
  info!(
    request_id = %ctx.request_id,
    method = %method,
    path = %ctx.path,
    service = %service_name,
    status = status.as_u16(),
    elapsed_ms = ctx.elapsed_ms(),
    "request completed"
  );
  if status.as_u16() >= 400 {
    tracing::error!(
      request_id = %ctx.request_id,
      path = %ctx.path,
      service = %service_name,
      status = status.as_u16(),
      "backend returned error status"
    );
  }
  crate::observability::metrics::collectors::RequestMetrics::completed(
    &service_name,
    status.as_u16(),
    std::time::Duration::from_millis(ctx.elapsed_ms()),
  );

  // The upstream body is copied to the client as a chunked stream rather
  // than buffered in memory: retries (step 12) only ever happen before the
  // first byte of a response is read, so streaming the body here never
  // interacts with the retry loop above.
  let body = Body::from_stream(response.bytes_stream());
  let mut builder = Response::builder().status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK));
  for (name, value) in out_headers.iter() {
    builder = builder.header(name, value);
  }
  Ok(builder.body(body).unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Capture the raw API-key header value (unverified) for rate-limit
/// identity purposes, independent of whether the matched route actually
/// requires authentication.
fn capture_api_key_identity(state: &AppState, headers: &HeaderMap, ctx: &mut RequestContext) {
  if let Some(header_name) = state.authenticator.api_key_header_name() {
    if let Some(api_key) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
      ctx.api_key_identity = Some(api_key.to_string());
    }
  }
}

async fn authenticate(state: &AppState, headers: &HeaderMap, ctx: &mut RequestContext) -> Result<(), GatewayError> {
  if let Some(token) = headers
    .get(axum::http::header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .and_then(|v| v.strip_prefix("Bearer "))
  {
    let user = state.authenticator.authenticate_bearer(token)?;
    ctx.user = Some(user);
    return Ok(());
  }

  if let Some(api_key) = ctx.api_key_identity.clone() {
    let user = state.authenticator.authenticate_api_key(&api_key).await?;
    ctx.user = Some(user);
    return Ok(());
  }

  Err(GatewayError::Unauthenticated)
}

/// Step 10: `rewrite_path` takes precedence when set, substituting
/// captured `{name}` path parameters into the template; otherwise
/// `strip_prefix` removes a literal leading segment.
fn rewrite_path(route: &crate::router::Route, path: &str, params: &std::collections::HashMap<String, String>) -> String {
  if let Some(template) = &route.rewrite_path {
    let mut rewritten = template.clone();
    for (name, value) in params {
      rewritten = rewritten.replace(&format!("{{{name}}}"), value);
    }
    return rewritten;
  }
  match &route.strip_prefix {
    Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path).to_string(),
    None => path.to_string(),
  }
}

async fn dispatch_with_breaker_and_retry(
  state: &AppState,
  service_name: &str,
  method: &axum::http::Method,
  url: &str,
  headers: &HeaderMap,
  body: Bytes,
  timeout: std::time::Duration,
) -> Result<reqwest::Response, GatewayError> {
  if !state.circuit_breakers.is_call_permitted(service_name) {
    return Err(GatewayError::CircuitOpen(service_name.to_string()));
  }

  let mut attempt = 0u32;
  loop {
    let request = state
      .http_client
      .request(method.clone(), url)
      .headers(headers.clone())
      .timeout(timeout)
      .body(body.clone());

    match request.send().await {
      Ok(response) if response.status().is_server_error() => {
        state.circuit_breakers.record_failure(service_name);
        if !state.retry_policy.should_retry(attempt) {
          return Ok(response);
        }
      }
      Ok(response) => {
        state.circuit_breakers.record_success(service_name);
        return Ok(response);
      }
      Err(e) => {
        state.circuit_breakers.record_failure(service_name);
        if !state.retry_policy.should_retry(attempt) {
          return Err(GatewayError::from(e));
        }
      }
    }

    let delay = state.retry_policy.delay_for_attempt(attempt);
    tokio::time::sleep(delay).await;
    attempt += 1;
    if !state.circuit_breakers.is_call_permitted(service_name) {
      return Err(GatewayError::CircuitOpen(service_name.to_string()));
    }
  }
}
