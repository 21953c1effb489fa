//! Typed, immutable configuration snapshot, assembled once at startup from
//! a YAML file plus environment variable overrides and never mutated after.
//!
//! Load order follows the teacher's `GatewayConfig::load`: an explicit
//! `GATEWAY_CONFIG` env var wins, then a short list of conventional paths is
//! tried in order, and the first one that parses and validates is used.

use anyhow::{Context, Result, bail};
use apex_core::retry::BackoffFormula;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
  pub server: ServerConfig,
  pub discovery: DiscoveryConfig,
  pub auth: AuthSettings,
  pub rate_limit: RateLimitSettings,
  pub circuit_breaker: CircuitBreakerSettings,
  pub retry: RetrySettings,
  #[serde(default)]
  pub load_balancer: LoadBalancerSettings,
  #[serde(default)]
  pub routes_file: Option<String>,
  #[serde(default)]
  pub services_file: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerStrategy {
  #[default]
  RoundRobin,
  LeastConnections,
  WeightedRoundRobin,
  Random,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoadBalancerSettings {
  #[serde(default)]
  pub strategy: LoadBalancerStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
  pub listen_addr: String,
  pub request_timeout_secs: u64,
  pub shutdown_grace_period_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      listen_addr: "0.0.0.0:8080".to_string(),
      request_timeout_secs: 30,
      shutdown_grace_period_secs: 10,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum DiscoveryConfig {
  Static {
    #[serde(default = "default_services_path")]
    path: String,
    #[serde(default = "default_discovery_refresh_secs")]
    refresh_interval_secs: u64,
  },
  Nacos {
    server_addr: String,
    namespace: String,
    #[serde(default = "default_discovery_refresh_secs")]
    poll_interval_secs: u64,
  },
}

fn default_services_path() -> String {
  "services.yaml".to_string()
}

fn default_discovery_refresh_secs() -> u64 {
  15
}

impl Default for DiscoveryConfig {
  fn default() -> Self {
    DiscoveryConfig::Static {
      path: default_services_path(),
      refresh_interval_secs: default_discovery_refresh_secs(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSettings {
  pub algorithm: String,
  #[serde(default)]
  pub public_key_path: Option<String>,
  #[serde(default)]
  pub shared_secret_env: Option<String>,
  #[serde(default)]
  pub audience: Option<String>,
  #[serde(default)]
  pub issuer: Option<String>,
  #[serde(default = "default_leeway")]
  pub leeway_seconds: u64,
  #[serde(default)]
  pub api_key_header: Option<String>,
  pub refresh_token_ttl_secs: u64,
  /// Whether a successful `/auth/refresh` deletes the presented refresh
  /// token immediately (rotation) or leaves it valid until it expires.
  #[serde(default = "default_rotation_enabled")]
  pub rotation_enabled: bool,
  /// Canonical service name the auth router discovers via `C2` to forward
  /// refresh/login calls to.
  #[serde(default = "default_auth_service_name")]
  pub auth_service_name: String,
}

fn default_leeway() -> u64 {
  30
}

fn default_rotation_enabled() -> bool {
  true
}

fn default_auth_service_name() -> String {
  "auth-service".to_string()
}

impl Default for AuthSettings {
  fn default() -> Self {
    Self {
      algorithm: "HS256".to_string(),
      public_key_path: None,
      shared_secret_env: Some("GATEWAY_JWT_SECRET".to_string()),
      audience: None,
      issuer: None,
      leeway_seconds: default_leeway(),
      api_key_header: Some("x-api-key".to_string()),
      refresh_token_ttl_secs: 30 * 24 * 3600,
      rotation_enabled: default_rotation_enabled(),
      auth_service_name: default_auth_service_name(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
  pub requests_per_window: u64,
  pub window: RateLimitWindow,
  #[serde(default)]
  pub audit_mode: AuditMode,
  #[serde(default = "default_audit_retention_days")]
  pub audit_retention_days: u32,
}

fn default_audit_retention_days() -> u32 {
  30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuditMode {
  #[default]
  Async,
  Sync,
  Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitWindow {
  Minute,
  Hour,
  Day,
}

impl RateLimitWindow {
  pub fn duration(&self) -> Duration {
    match self {
      RateLimitWindow::Minute => Duration::from_secs(60),
      RateLimitWindow::Hour => Duration::from_secs(3600),
      RateLimitWindow::Day => Duration::from_secs(86400),
    }
  }

  /// Truncate a unix timestamp to the start of the window it falls in, used
  /// to build the fast-KV bucket key.
  pub fn truncate(&self, unix_secs: i64) -> i64 {
    let window_secs = self.duration().as_secs() as i64;
    unix_secs - unix_secs.rem_euclid(window_secs)
  }
}

impl Default for RateLimitSettings {
  fn default() -> Self {
    Self {
      requests_per_window: 100,
      window: RateLimitWindow::Minute,
      audit_mode: AuditMode::default(),
      audit_retention_days: default_audit_retention_days(),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
  pub enabled: bool,
  pub failure_threshold: u32,
  pub success_threshold: u32,
  pub open_duration_secs: u64,
}

impl Default for CircuitBreakerSettings {
  fn default() -> Self {
    Self {
      enabled: true,
      failure_threshold: 5,
      success_threshold: 2,
      open_duration_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
  pub max_retries: u32,
  pub backoff_factor: f64,
  pub max_delay_secs: u64,
  #[serde(default)]
  pub backoff_formula: BackoffFormula,
}

impl Default for RetrySettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      backoff_factor: 2.0,
      max_delay_secs: 30,
      backoff_formula: BackoffFormula::default(),
    }
  }
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      discovery: DiscoveryConfig::default(),
      auth: AuthSettings::default(),
      rate_limit: RateLimitSettings::default(),
      circuit_breaker: CircuitBreakerSettings::default(),
      retry: RetrySettings::default(),
      load_balancer: LoadBalancerSettings::default(),
      routes_file: Some("routes.yaml".to_string()),
      services_file: Some("services.yaml".to_string()),
    }
  }
}

impl GatewayConfig {
  /// Load configuration, trying `GATEWAY_CONFIG` first and then a short
  /// list of conventional paths, in order. The first path that exists and
  /// parses wins; everything else is silently skipped.
  pub fn load() -> Result<Self> {
    if let Ok(path) = std::env::var("GATEWAY_CONFIG") {
      return Self::from_file(&path)
        .with_context(|| format!("failed to load config from GATEWAY_CONFIG={path}"));
    }

    let candidates = [
      "/etc/apex-gateway/gateway.yaml",
      "/app/config/gateway.yaml",
      "gateway.yaml",
    ];

    for path in candidates {
      if let Ok(config) = Self::from_file(path) {
        return Ok(config);
      }
    }

    bail!(
      "gateway configuration not found; set GATEWAY_CONFIG or place gateway.yaml in one of {:?}",
      candidates
    )
  }

  pub fn from_file(path: &str) -> Result<Self> {
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("reading config file {path}"))?;
    let mut config: GatewayConfig =
      serde_yaml::from_str(&content).with_context(|| format!("parsing config file {path}"))?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
  }

  /// Environment variables always win over the file, matching the spec's
  /// "typed immutable snapshot ... env var overrides" requirement. Every
  /// variable §6 recognizes is parsed here, once, into its matching typed
  /// field; nothing downstream reads the environment directly afterward
  /// (`GATEWAY_REDIS_URL` and `GATEWAY_DATABASE_URL` are the two
  /// exceptions, consumed once during `GatewayApp::build` to open the
  /// fast-KV/durable-store connections this snapshot doesn't itself own).
  fn apply_env_overrides(&mut self) {
    fn set<T: std::str::FromStr>(var: &str, slot: &mut T) {
      if let Ok(val) = std::env::var(var) {
        if let Ok(parsed) = val.parse() {
          *slot = parsed;
        }
      }
    }
    fn set_opt(var: &str, slot: &mut Option<String>) {
      if let Ok(val) = std::env::var(var) {
        *slot = Some(val);
      }
    }

    // server
    if let Ok(addr) = std::env::var("GATEWAY_LISTEN_ADDR") {
      self.server.listen_addr = addr;
    }
    set("GATEWAY_REQUEST_TIMEOUT_SECS", &mut self.server.request_timeout_secs);
    set("GATEWAY_SHUTDOWN_GRACE_PERIOD_SECS", &mut self.server.shutdown_grace_period_secs);

    // auth / JWT
    if let Ok(algo) = std::env::var("GATEWAY_JWT_ALGORITHM") {
      self.auth.algorithm = algo;
    }
    set_opt("GATEWAY_JWT_PUBLIC_KEY_PATH", &mut self.auth.public_key_path);
    set_opt("GATEWAY_JWT_SHARED_SECRET_ENV", &mut self.auth.shared_secret_env);
    set_opt("GATEWAY_JWT_AUDIENCE", &mut self.auth.audience);
    set_opt("GATEWAY_JWT_ISSUER", &mut self.auth.issuer);
    set("GATEWAY_JWT_LEEWAY_SECONDS", &mut self.auth.leeway_seconds);
    set_opt("GATEWAY_API_KEY_HEADER", &mut self.auth.api_key_header);
    set("GATEWAY_REFRESH_TOKEN_TTL_SECS", &mut self.auth.refresh_token_ttl_secs);
    set("GATEWAY_ROTATION_ENABLED", &mut self.auth.rotation_enabled);
    if let Ok(name) = std::env::var("GATEWAY_AUTH_SERVICE_NAME") {
      self.auth.auth_service_name = name;
    }

    // discovery: only the fields relevant to whichever backend the file
    // already selected are overridden — the backend tag itself is a
    // structural choice left to the config file.
    match &mut self.discovery {
      DiscoveryConfig::Static { path, refresh_interval_secs } => {
        if let Ok(p) = std::env::var("GATEWAY_DISCOVERY_PATH") {
          *path = p;
        }
        set("GATEWAY_DISCOVERY_REFRESH_SECS", refresh_interval_secs);
      }
      DiscoveryConfig::Nacos { server_addr, namespace, poll_interval_secs } => {
        if let Ok(addr) = std::env::var("GATEWAY_NACOS_SERVER_ADDR") {
          *server_addr = addr;
        }
        if let Ok(ns) = std::env::var("GATEWAY_NACOS_NAMESPACE") {
          *namespace = ns;
        }
        set("GATEWAY_DISCOVERY_REFRESH_SECS", poll_interval_secs);
      }
    }

    // rate limiting
    set("GATEWAY_RATE_LIMIT_RPM", &mut self.rate_limit.requests_per_window);
    if let Ok(window) = std::env::var("GATEWAY_RATE_LIMIT_WINDOW") {
      self.rate_limit.window = match window.as_str() {
        "hour" => RateLimitWindow::Hour,
        "day" => RateLimitWindow::Day,
        _ => RateLimitWindow::Minute,
      };
    }
    if let Ok(mode) = std::env::var("GATEWAY_RATE_LIMIT_AUDIT_MODE") {
      self.rate_limit.audit_mode = match mode.as_str() {
        "sync" => AuditMode::Sync,
        "disabled" => AuditMode::Disabled,
        _ => AuditMode::Async,
      };
    }
    set("GATEWAY_RATE_LIMIT_AUDIT_RETENTION_DAYS", &mut self.rate_limit.audit_retention_days);

    // circuit breaker
    set("GATEWAY_CIRCUIT_BREAKER_ENABLED", &mut self.circuit_breaker.enabled);
    set("GATEWAY_CIRCUIT_BREAKER_FAILURE_THRESHOLD", &mut self.circuit_breaker.failure_threshold);
    set("GATEWAY_CIRCUIT_BREAKER_SUCCESS_THRESHOLD", &mut self.circuit_breaker.success_threshold);
    set("GATEWAY_CIRCUIT_BREAKER_OPEN_DURATION_SECS", &mut self.circuit_breaker.open_duration_secs);

    // retry
    set("GATEWAY_RETRY_MAX_RETRIES", &mut self.retry.max_retries);
    set("GATEWAY_RETRY_BACKOFF_FACTOR", &mut self.retry.backoff_factor);
    set("GATEWAY_RETRY_MAX_DELAY_SECS", &mut self.retry.max_delay_secs);
    if let Ok(formula) = std::env::var("GATEWAY_RETRY_BACKOFF_FORMULA") {
      self.retry.backoff_formula = match formula.as_str() {
        "shifted" => BackoffFormula::ShiftedByOne,
        _ => BackoffFormula::Literal,
      };
    }

    // load balancer
    if let Ok(strategy) = std::env::var("GATEWAY_LOAD_BALANCER_STRATEGY") {
      self.load_balancer.strategy = match strategy.as_str() {
        "least_connections" => LoadBalancerStrategy::LeastConnections,
        "weighted_round_robin" => LoadBalancerStrategy::WeightedRoundRobin,
        "random" => LoadBalancerStrategy::Random,
        _ => LoadBalancerStrategy::RoundRobin,
      };
    }

    set_opt("GATEWAY_ROUTES_FILE", &mut self.routes_file);
    set_opt("GATEWAY_SERVICES_FILE", &mut self.services_file);
  }

  pub fn validate(&self) -> Result<()> {
    if self.server.listen_addr.is_empty() {
      bail!("server.listen_addr must not be empty");
    }
    if self.circuit_breaker.failure_threshold == 0 {
      bail!("circuit_breaker.failure_threshold must be greater than zero");
    }
    if self.rate_limit.requests_per_window == 0 {
      bail!("rate_limit.requests_per_window must be greater than zero");
    }
    Ok(())
  }

  #[cfg(test)]
  pub fn for_testing() -> Self {
    GatewayConfig::default()
  }
}
