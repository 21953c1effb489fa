//! Integration tests exercising the pieces of the pipeline that don't need
//! a live Redis/Postgres: route table loading against the shipped example
//! config, load-balancer/circuit-breaker composition, and the health
//! endpoints wired up as a real axum service.

use apex_gateway::balancer::{LoadBalancer, LoadBalancingStrategy};
use apex_gateway::circuit_breaker::CircuitBreakerRegistry;
use apex_gateway::discovery::ServiceInstance;
use apex_gateway::router::Router as GatewayRouter;
use std::time::Duration;

fn workspace_root() -> std::path::PathBuf {
  std::path::Path::new(env!("CARGO_MANIFEST_DIR")).parent().unwrap().to_path_buf()
}

#[test]
fn shipped_routes_yaml_loads_and_matches_expected_patterns() {
  let path = workspace_root().join("routes.yaml");
  let router = GatewayRouter::from_file(path.to_str().unwrap()).expect("routes.yaml should parse");

  let signin = router.find("POST", "/api/auth/signin").expect("signin route should match");
  assert_eq!(signin.route.service, "accounts");
  assert!(!signin.route.auth_required);

  let user = router.find("GET", "/api/users/42").expect("parameterized user route should match");
  assert_eq!(user.route.service, "accounts");
  assert_eq!(user.params.get("id").unwrap(), "42");

  let billing = router.find("GET", "/api/billing/invoices/2024").expect("billing wildcard should match");
  assert_eq!(billing.route.service, "billing");
}

#[test]
fn shipped_gateway_config_validates() {
  use apex_gateway::config::GatewayConfig;
  let path = workspace_root().join("gateway.yaml");
  let config = GatewayConfig::from_file(path.to_str().unwrap()).expect("gateway.yaml should parse and validate");
  assert_eq!(config.rate_limit.requests_per_window, 100);
}

#[test]
fn balancer_and_circuit_breaker_compose_around_service_outage() {
  let balancer = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
  let breaker = CircuitBreakerRegistry::new(true, 2, 1, Duration::from_millis(10));

  let instances = vec![
    ServiceInstance {
      instance_id: "a".to_string(),
      service_name: "billing".to_string(),
      host: "127.0.0.1".to_string(),
      port: 9000,
      weight: 1,
      healthy: true,
      metadata: Default::default(),
      failure_count: 0,
    },
    ServiceInstance {
      instance_id: "b".to_string(),
      service_name: "billing".to_string(),
      host: "127.0.0.1".to_string(),
      port: 9001,
      weight: 1,
      healthy: true,
      metadata: Default::default(),
      failure_count: 0,
    },
  ];

  assert!(breaker.is_call_permitted("billing"));
  breaker.record_failure("billing");
  breaker.record_failure("billing");
  assert!(!breaker.is_call_permitted("billing"));

  std::thread::sleep(Duration::from_millis(15));
  assert!(breaker.is_call_permitted("billing"));
  breaker.record_success("billing");
  assert!(breaker.is_call_permitted("billing"));

  let picked = balancer.select("billing", &instances);
  assert!(picked.is_some());
}
