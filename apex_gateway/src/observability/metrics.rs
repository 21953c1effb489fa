//! Prometheus metrics. Unlike the teacher's notify_server, which exposes
//! metrics on a second listener, this gateway's `/metrics` lives on the same
//! HTTP surface as everything else — one process, one port, one set of
//! orchestrator probes to configure.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the global recorder and register the gauges/counters the
/// pipeline emits, returning a handle the `/metrics` route renders from.
pub fn init() -> PrometheusHandle {
  let handle = PrometheusBuilder::new()
    .install_recorder()
    .expect("installing the Prometheus recorder twice in one process");
  register_gateway_metrics();
  handle
}

fn register_gateway_metrics() {
  use metrics::{counter, gauge, histogram};

  counter!("gateway_requests_total", "status" => "success").absolute(0);
  counter!("gateway_requests_total", "status" => "error").absolute(0);
  histogram!("gateway_request_duration_seconds").record(0.0);
  counter!("gateway_rate_limit_rejections_total").absolute(0);
  counter!("gateway_circuit_breaker_trips_total").absolute(0);
  gauge!("gateway_circuit_breaker_open").set(0.0);
}

pub mod collectors {
  use metrics::{counter, gauge, histogram};
  use std::time::Duration;

  pub struct RequestMetrics;

  impl RequestMetrics {
    pub fn completed(service: &str, status: u16, duration: Duration) {
      let outcome = if status < 500 { "success" } else { "error" };
      counter!("gateway_requests_total", "status" => outcome.to_string(), "service" => service.to_string()).increment(1);
      histogram!("gateway_request_duration_seconds", "service" => service.to_string()).record(duration.as_secs_f64());
    }
  }

  pub struct CircuitBreakerMetrics;

  impl CircuitBreakerMetrics {
    pub fn opened(service: &str) {
      counter!("gateway_circuit_breaker_trips_total", "service" => service.to_string()).increment(1);
      gauge!("gateway_circuit_breaker_open", "service" => service.to_string()).set(1.0);
    }

    pub fn closed(service: &str) {
      gauge!("gateway_circuit_breaker_open", "service" => service.to_string()).set(0.0);
    }
  }

  pub struct RateLimitMetrics;

  impl RateLimitMetrics {
    pub fn rejected(identity: &str) {
      counter!("gateway_rate_limit_rejections_total", "identity" => identity.to_string()).increment(1);
    }
  }
}
