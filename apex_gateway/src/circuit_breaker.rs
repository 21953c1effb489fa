//! Per-service circuit breaker state machine: CLOSED -> OPEN on repeated
//! failures, OPEN -> HALF_OPEN after a cooldown, HALF_OPEN -> CLOSED on
//! enough successes or back to OPEN on any failure.
//!
//! Grounded on the teacher's `high_performance_publisher::CircuitBreaker`
//! for the atomic-counter shape, generalized to a per-service registry
//! keyed by `DashMap` since this gateway fronts many independent services
//! rather than one publisher connection.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
  Closed,
  Open,
  HalfOpen,
}

struct CircuitInner {
  state: RwLock<CircuitState>,
  failure_count: AtomicU32,
  success_count: AtomicU32,
  opened_at: RwLock<Option<Instant>>,
}

impl Default for CircuitInner {
  fn default() -> Self {
    Self {
      state: RwLock::new(CircuitState::Closed),
      failure_count: AtomicU32::new(0),
      success_count: AtomicU32::new(0),
      opened_at: RwLock::new(None),
    }
  }
}

pub struct CircuitBreakerRegistry {
  enabled: bool,
  failure_threshold: u32,
  success_threshold: u32,
  open_duration: Duration,
  circuits: DashMap<String, Arc<CircuitInner>>,
}

impl CircuitBreakerRegistry {
  pub fn new(enabled: bool, failure_threshold: u32, success_threshold: u32, open_duration: Duration) -> Self {
    Self {
      enabled,
      failure_threshold,
      success_threshold,
      open_duration,
      circuits: DashMap::new(),
    }
  }

  fn circuit_for(&self, service_name: &str) -> Arc<CircuitInner> {
    self
      .circuits
      .entry(service_name.to_string())
      .or_insert_with(|| Arc::new(CircuitInner::default()))
      .clone()
  }

  /// Whether a call to `service_name` is currently allowed. When the
  /// breaker is disabled this is a pure pass-through. An `Open` circuit
  /// that has outlived its cooldown transitions to `HalfOpen` and allows
  /// exactly the probing calls through from that point on.
  pub fn is_call_permitted(&self, service_name: &str) -> bool {
    if !self.enabled {
      return true;
    }

    let circuit = self.circuit_for(service_name);
    let current = *circuit.state.read().unwrap();

    match current {
      CircuitState::Closed | CircuitState::HalfOpen => true,
      CircuitState::Open => {
        let elapsed_enough = circuit
          .opened_at
          .read()
          .unwrap()
          .map(|opened_at| opened_at.elapsed() >= self.open_duration)
          .unwrap_or(true);

        if elapsed_enough {
          *circuit.state.write().unwrap() = CircuitState::HalfOpen;
          circuit.success_count.store(0, Ordering::SeqCst);
          info!(service_name, "circuit transitioning OPEN -> HALF_OPEN");
          true
        } else {
          false
        }
      }
    }
  }

  pub fn record_success(&self, service_name: &str) {
    if !self.enabled {
      return;
    }
    let circuit = self.circuit_for(service_name);
    let current = *circuit.state.read().unwrap();

    match current {
      CircuitState::Closed => {
        circuit.failure_count.store(0, Ordering::SeqCst);
      }
      CircuitState::HalfOpen => {
        let successes = circuit.success_count.fetch_add(1, Ordering::SeqCst) + 1;
        if successes >= self.success_threshold {
          self.reset(service_name);
          info!(service_name, "circuit transitioning HALF_OPEN -> CLOSED");
        }
      }
      CircuitState::Open => {}
    }
  }

  pub fn record_failure(&self, service_name: &str) {
    if !self.enabled {
      return;
    }
    let circuit = self.circuit_for(service_name);
    let current = *circuit.state.read().unwrap();

    match current {
      CircuitState::Closed => {
        let failures = circuit.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.failure_threshold {
          self.trip(service_name, &circuit);
        }
      }
      CircuitState::HalfOpen => {
        self.trip(service_name, &circuit);
        warn!(service_name, "probe failed, circuit transitioning HALF_OPEN -> OPEN");
      }
      CircuitState::Open => {}
    }
  }

  fn trip(&self, service_name: &str, circuit: &CircuitInner) {
    *circuit.state.write().unwrap() = CircuitState::Open;
    *circuit.opened_at.write().unwrap() = Some(Instant::now());
    circuit.success_count.store(0, Ordering::SeqCst);
    warn!(service_name, "circuit transitioning -> OPEN");
    crate::observability::metrics::collectors::CircuitBreakerMetrics::opened(service_name);
  }

  /// Force a service's circuit back to `Closed`, clearing counters. Used
  /// by admin tooling and by the HALF_OPEN -> CLOSED transition.
  pub fn reset(&self, service_name: &str) {
    let circuit = self.circuit_for(service_name);
    *circuit.state.write().unwrap() = CircuitState::Closed;
    circuit.failure_count.store(0, Ordering::SeqCst);
    circuit.success_count.store(0, Ordering::SeqCst);
    *circuit.opened_at.write().unwrap() = None;
    crate::observability::metrics::collectors::CircuitBreakerMetrics::closed(service_name);
  }

  pub fn state_of(&self, service_name: &str) -> CircuitState {
    *self.circuit_for(service_name).state.read().unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn registry() -> CircuitBreakerRegistry {
    CircuitBreakerRegistry::new(true, 3, 2, Duration::from_millis(20))
  }

  #[test]
  fn trips_open_after_threshold_failures() {
    let reg = registry();
    reg.record_failure("svc");
    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Closed);
    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Open);
  }

  #[test]
  fn disabled_breaker_always_permits_calls() {
    let reg = CircuitBreakerRegistry::new(false, 1, 1, Duration::from_secs(30));
    reg.record_failure("svc");
    reg.record_failure("svc");
    assert!(reg.is_call_permitted("svc"));
  }

  #[test]
  fn half_open_failure_reopens_circuit() {
    let reg = registry();
    reg.record_failure("svc");
    reg.record_failure("svc");
    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Open);

    std::thread::sleep(Duration::from_millis(30));
    assert!(reg.is_call_permitted("svc"));
    assert_eq!(reg.state_of("svc"), CircuitState::HalfOpen);

    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Open);
  }

  #[test]
  fn half_open_enough_successes_closes_circuit() {
    let reg = registry();
    reg.record_failure("svc");
    reg.record_failure("svc");
    reg.record_failure("svc");
    std::thread::sleep(Duration::from_millis(30));
    assert!(reg.is_call_permitted("svc"));

    reg.record_success("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::HalfOpen);
    reg.record_success("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Closed);
  }

  #[test]
  fn reset_clears_state_unconditionally() {
    let reg = registry();
    reg.record_failure("svc");
    reg.record_failure("svc");
    reg.record_failure("svc");
    reg.reset("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Closed);
  }

  /// threshold=2, timeout=1s, half_open_max=2: two failures open the
  /// circuit, a call within the timeout is rejected, a call after the
  /// timeout transitions to half-open, and two consecutive half-open
  /// successes close it with the failure count reset.
  #[test]
  fn circuit_breaker_recovery_scenario() {
    let reg = CircuitBreakerRegistry::new(true, 2, 2, Duration::from_millis(1000));

    reg.record_failure("svc");
    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Open);
    assert!(!reg.is_call_permitted("svc"), "a call within the timeout must be rejected");

    std::thread::sleep(Duration::from_millis(1010));
    assert!(reg.is_call_permitted("svc"), "a call after the timeout transitions to half-open");
    assert_eq!(reg.state_of("svc"), CircuitState::HalfOpen);

    reg.record_success("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::HalfOpen);
    reg.record_success("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Closed);

    // failure_count was reset to 0 on close: a single subsequent failure
    // must not retrip a circuit with threshold=2.
    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Closed);
  }

  #[test]
  fn circuit_breaker_half_open_failure_reopens_immediately() {
    let reg = CircuitBreakerRegistry::new(true, 2, 2, Duration::from_millis(1000));
    reg.record_failure("svc");
    reg.record_failure("svc");
    std::thread::sleep(Duration::from_millis(1010));
    assert!(reg.is_call_permitted("svc"));
    assert_eq!(reg.state_of("svc"), CircuitState::HalfOpen);

    reg.record_failure("svc");
    assert_eq!(reg.state_of("svc"), CircuitState::Open);
  }
}
