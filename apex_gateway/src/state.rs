//! Shared application state: one instance per process, handed to every
//! axum handler and middleware layer behind an `Arc`.

use crate::auth::{Authenticator, RefreshTokenManager};
use crate::balancer::LoadBalancer;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::GatewayConfig;
use crate::discovery::ServiceDiscovery;
use crate::ratelimit::RateLimiter;
use crate::router::Router as GatewayRouter;
use apex_core::RetryPolicy;
use std::sync::{Arc, RwLock};

#[derive(Clone)]
pub struct AppState {
  pub config: Arc<GatewayConfig>,
  pub router: Arc<RwLock<GatewayRouter>>,
  pub discovery: Arc<dyn ServiceDiscovery>,
  pub balancer: Arc<LoadBalancer>,
  pub circuit_breakers: Arc<CircuitBreakerRegistry>,
  pub retry_policy: RetryPolicy,
  pub authenticator: Arc<Authenticator>,
  pub refresh_tokens: Arc<RefreshTokenManager>,
  pub rate_limiter: Arc<RateLimiter>,
  pub http_client: reqwest::Client,
  /// Present whenever a durable store was configured (rate-limit audit
  /// mode other than `disabled`, or an API-key header is in use); shared
  /// with the application-level audit log and the API-key credential store.
  pub db_pool: Option<sqlx::PgPool>,
  pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}
