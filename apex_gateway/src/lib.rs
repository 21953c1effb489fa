pub mod auth;
pub mod auth_router;
pub mod balancer;
pub mod circuit_breaker;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod observability;
pub mod proxy;
pub mod ratelimit;
pub mod router;
pub mod state;

use apex_core::{AuthConfig, RetryPolicy, TokenManager};
use auth::{ApiKeyStore, Authenticator, RefreshTokenManager};
use axum::Router as AxumRouter;
use balancer::{LoadBalancer, LoadBalancingStrategy};
use circuit_breaker::CircuitBreakerRegistry;
use config::GatewayConfig;
use discovery::{ServiceDiscovery, StaticFileDiscovery};
use jsonwebtoken::Algorithm;
use ratelimit::{RateLimitAuditStore, RateLimiter};
use router::Router as GatewayRouter;
use state::AppState;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;

/// Owns every background task the gateway spawns (audit writers, discovery
/// pollers) so shutdown has one place to wait on them instead of letting
/// the process exit out from under an in-flight write.
pub struct GatewayApp {
  state: AppState,
  background_tasks: JoinSet<()>,
}

impl GatewayApp {
  pub async fn build(config: GatewayConfig) -> anyhow::Result<Self> {
    let config = Arc::new(config);
    let mut background_tasks = JoinSet::new();

    let prometheus_handle = observability::metrics::init();

    let routes_path = config.routes_file.clone().unwrap_or_else(|| "routes.yaml".to_string());
    let gateway_router = GatewayRouter::from_file(&routes_path)
      .unwrap_or_else(|_| GatewayRouter::from_routes(Vec::new()).expect("empty route table is always valid"));

    let discovery: Arc<dyn ServiceDiscovery> = match &config.discovery {
      config::DiscoveryConfig::Static { path, .. } => {
        Arc::new(StaticFileDiscovery::from_file(path).unwrap_or_else(|_| StaticFileDiscovery::empty()))
      }
      config::DiscoveryConfig::Nacos { server_addr, namespace, poll_interval_secs } => {
        let nacos = Arc::new(discovery::NacosDiscovery::new(server_addr.clone(), namespace.clone()));
        let interval = std::time::Duration::from_secs(*poll_interval_secs);
        for service_name in gateway_router.service_names() {
          let handle = nacos.spawn_poller(service_name, interval);
          background_tasks.spawn(async move {
            let _ = handle.await;
          });
        }
        nacos as Arc<dyn ServiceDiscovery>
      }
    };

    let lb_strategy = match config.load_balancer.strategy {
      config::LoadBalancerStrategy::RoundRobin => LoadBalancingStrategy::RoundRobin,
      config::LoadBalancerStrategy::LeastConnections => LoadBalancingStrategy::LeastConnections,
      config::LoadBalancerStrategy::WeightedRoundRobin => LoadBalancingStrategy::WeightedRoundRobin,
      config::LoadBalancerStrategy::Random => LoadBalancingStrategy::Random,
    };
    let balancer = Arc::new(LoadBalancer::new(lb_strategy));

    let circuit_breakers = Arc::new(CircuitBreakerRegistry::new(
      config.circuit_breaker.enabled,
      config.circuit_breaker.failure_threshold,
      config.circuit_breaker.success_threshold,
      std::time::Duration::from_secs(config.circuit_breaker.open_duration_secs),
    ));

    let retry_policy = RetryPolicy {
      max_retries: config.retry.max_retries,
      backoff_factor: config.retry.backoff_factor,
      max_delay: std::time::Duration::from_secs(config.retry.max_delay_secs),
      formula: config.retry.backoff_formula,
    };

    let algorithm = Algorithm::from_str(&config.auth.algorithm).unwrap_or(Algorithm::HS256);
    let shared_secret = config
      .auth
      .shared_secret_env
      .as_ref()
      .and_then(|var| std::env::var(var).ok());
    let public_key_pem = config
      .auth
      .public_key_path
      .as_ref()
      .and_then(|path| std::fs::read_to_string(path).ok());

    let token_manager = TokenManager::new(AuthConfig {
      algorithm,
      public_key_pem,
      shared_secret,
      audience: config.auth.audience.clone(),
      issuer: config.auth.issuer.clone(),
      leeway_seconds: config.auth.leeway_seconds,
    })?;

    let redis_url = std::env::var("GATEWAY_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let redis_client = redis::Client::open(redis_url)?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;

    let refresh_tokens = Arc::new(RefreshTokenManager::new(redis_conn.clone()));

    // A single Postgres pool, shared by the rate-limit audit tier, the
    // application audit log, and the API-key credential store. Any of the
    // three being configured is enough reason to open it; none needing it
    // (and no GATEWAY_DATABASE_URL) leaves it absent and every durable
    // feature degrades gracefully (audit disabled, API keys rejected).
    let db_pool = match std::env::var("GATEWAY_DATABASE_URL") {
      Ok(url) => match sqlx::PgPool::connect(&url).await {
        Ok(pool) => {
          sqlx::migrate!("./migrations").run(&pool).await?;
          Some(pool)
        }
        Err(_) => None,
      },
      Err(_) => None,
    };

    let audit_store = match (config.rate_limit.audit_mode, &db_pool) {
      (config::AuditMode::Disabled, _) | (_, None) => RateLimitAuditStore::disabled(),
      (config::AuditMode::Async, Some(pool)) => {
        let (store, handle) = RateLimitAuditStore::spawn_async(pool.clone());
        background_tasks.spawn(async move {
          let _ = handle.await;
        });
        store
      }
      (config::AuditMode::Sync, Some(pool)) => RateLimitAuditStore::sync(pool.clone()),
    };

    if let Some(pool) = &db_pool {
      let handle = ratelimit::audit_store::spawn_retention_cleanup(pool.clone(), config.rate_limit.audit_retention_days);
      background_tasks.spawn(async move {
        let _ = handle.await;
      });
    }

    let api_key_store = db_pool.clone().map(|pool| Arc::new(ApiKeyStore::new(pool)));
    let authenticator =
      Arc::new(Authenticator::new(token_manager, config.auth.api_key_header.clone(), api_key_store));

    let rate_limiter = Arc::new(RateLimiter::new(
      redis_conn,
      config.rate_limit.window,
      config.rate_limit.requests_per_window,
      audit_store,
    ));

    let http_client = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(config.server.request_timeout_secs))
      .build()?;

    let state = AppState {
      config,
      router: Arc::new(RwLock::new(gateway_router)),
      discovery,
      balancer,
      circuit_breakers,
      retry_policy,
      authenticator,
      refresh_tokens,
      rate_limiter,
      http_client,
      db_pool,
      prometheus_handle,
    };

    Ok(Self { state, background_tasks })
  }

  pub fn router(&self) -> AxumRouter {
    AxumRouter::new()
      .merge(health::router())
      .merge(auth_router::router())
      .fallback(proxy::handle_request)
      .layer(TraceLayer::new_for_http())
      .with_state(self.state.clone())
  }

  pub async fn run(mut self) -> anyhow::Result<()> {
    let addr: SocketAddr = self.state.config.server.listen_addr.parse()?;
    let app = self.router();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "gateway listening");

    let grace_period = std::time::Duration::from_secs(self.state.config.server.shutdown_grace_period_secs);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
      .with_graceful_shutdown(shutdown_signal())
      .await?;

    tracing::info!("shutdown signal received, waiting up to {:?} for background tasks", grace_period);
    let _ = tokio::time::timeout(grace_period, async {
      while self.background_tasks.join_next().await.is_some() {}
    })
    .await;
    self.background_tasks.shutdown().await;
    Ok(())
  }
}

async fn shutdown_signal() {
  let _ = tokio::signal::ctrl_c().await;
}
