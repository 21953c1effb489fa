//! Load balancing strategies over the healthy instances returned by
//! discovery. Grounded directly on `gateway-service/app/core/load_balancer.py`:
//! round-robin, least-connections, weighted round-robin (cumulative-weight
//! walk, falling back to round-robin if total weight is 0), and random.

use crate::discovery::ServiceInstance;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
  RoundRobin,
  LeastConnections,
  WeightedRoundRobin,
  Random,
}

#[derive(Default)]
struct PerServiceState {
  round_robin_cursor: AtomicUsize,
  connection_counts: DashMap<String, AtomicU32>,
}

/// Picks an instance per service according to the configured strategy.
/// Round-robin cursors and connection counts are keyed per service name so
/// unrelated services don't perturb each other's rotation.
pub struct LoadBalancer {
  strategy: LoadBalancingStrategy,
  state: DashMap<String, Arc<PerServiceState>>,
}

impl LoadBalancer {
  pub fn new(strategy: LoadBalancingStrategy) -> Self {
    Self { strategy, state: DashMap::new() }
  }

  fn state_for(&self, service_name: &str) -> Arc<PerServiceState> {
    self
      .state
      .entry(service_name.to_string())
      .or_insert_with(|| Arc::new(PerServiceState::default()))
      .clone()
  }

  /// Select an instance from the raw instance list discovery returned.
  /// Filters to `healthy == true` first, per §4.C3; `None` means either the
  /// input was empty or nothing in it was healthy.
  pub fn select<'a>(&self, service_name: &str, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
    let healthy: Vec<&'a ServiceInstance> = instances.iter().filter(|i| i.healthy).collect();
    if healthy.is_empty() {
      return None;
    }
    if healthy.len() == 1 {
      return Some(healthy[0]);
    }

    match self.strategy {
      LoadBalancingStrategy::RoundRobin => self.round_robin(service_name, &healthy),
      LoadBalancingStrategy::LeastConnections => self.least_connections(service_name, &healthy),
      LoadBalancingStrategy::WeightedRoundRobin => self.weighted_round_robin(service_name, &healthy),
      LoadBalancingStrategy::Random => self.random(&healthy),
    }
  }

  /// Release a connection slot claimed by a prior `least_connections`
  /// selection. Saturates at zero; never goes negative.
  pub fn release_connection(&self, service_name: &str, instance_id: &str) {
    let state = self.state_for(service_name);
    if let Some(counter) = state.connection_counts.get(instance_id) {
      let _ = counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
        Some(v.saturating_sub(1))
      });
    }
  }

  fn round_robin<'a>(&self, service_name: &str, instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
    let state = self.state_for(service_name);
    let index = state.round_robin_cursor.fetch_add(1, Ordering::SeqCst) % instances.len();
    instances.get(index).copied()
  }

  fn least_connections<'a>(&self, service_name: &str, instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
    let state = self.state_for(service_name);
    let chosen = *instances.iter().min_by_key(|i| {
      state
        .connection_counts
        .get(&i.instance_id)
        .map(|c| c.load(Ordering::SeqCst))
        .unwrap_or(0)
    })?;

    state
      .connection_counts
      .entry(chosen.instance_id.clone())
      .or_insert_with(|| AtomicU32::new(0))
      .fetch_add(1, Ordering::SeqCst);

    Some(chosen)
  }

  fn weighted_round_robin<'a>(&self, service_name: &str, instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
    let total_weight: u32 = instances.iter().map(|i| i.weight).sum();
    if total_weight == 0 {
      return self.round_robin(service_name, instances);
    }

    let state = self.state_for(service_name);
    let tick = state.round_robin_cursor.fetch_add(1, Ordering::SeqCst) as u32 % total_weight;

    let mut cumulative = 0u32;
    for instance in instances {
      cumulative += instance.weight;
      if tick < cumulative {
        return Some(instance);
      }
    }
    instances.last().copied()
  }

  fn random<'a>(&self, instances: &[&'a ServiceInstance]) -> Option<&'a ServiceInstance> {
    let index = rand::thread_rng().gen_range(0..instances.len());
    instances.get(index).copied()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn instance(id: &str, weight: u32) -> ServiceInstance {
    ServiceInstance {
      instance_id: id.to_string(),
      service_name: "svc".to_string(),
      host: "127.0.0.1".to_string(),
      port: 8080,
      weight,
      healthy: true,
      metadata: Default::default(),
      failure_count: 0,
    }
  }

  #[test]
  fn round_robin_cycles_through_all_instances() {
    let lb = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
    let instances = vec![instance("a", 1), instance("b", 1), instance("c", 1)];
    let picks: Vec<&str> = (0..6)
      .map(|_| lb.select("svc", &instances).unwrap().instance_id.as_str())
      .collect();
    assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
  }

  #[test]
  fn least_connections_prefers_idle_instance() {
    let lb = LoadBalancer::new(LoadBalancingStrategy::LeastConnections);
    let instances = vec![instance("a", 1), instance("b", 1)];

    let first = lb.select("svc", &instances).unwrap().instance_id.clone();
    let second = lb.select("svc", &instances).unwrap().instance_id.clone();
    assert_ne!(first, second);

    lb.release_connection("svc", &first);
    let third = lb.select("svc", &instances).unwrap().instance_id.clone();
    assert_eq!(third, first);
  }

  #[test]
  fn weighted_round_robin_falls_back_when_total_weight_zero() {
    let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
    let instances = vec![instance("a", 0), instance("b", 0)];
    assert!(lb.select("svc", &instances).is_some());
  }

  #[test]
  fn weighted_round_robin_favors_higher_weight_over_a_full_cycle() {
    let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
    let instances = vec![instance("a", 3), instance("b", 1)];
    let mut a_count = 0;
    for _ in 0..4 {
      if lb.select("svc", &instances).unwrap().instance_id == "a" {
        a_count += 1;
      }
    }
    assert_eq!(a_count, 3);
  }

  #[test]
  fn single_instance_short_circuits_strategy() {
    let lb = LoadBalancer::new(LoadBalancingStrategy::Random);
    let instances = vec![instance("only", 1)];
    assert_eq!(lb.select("svc", &instances).unwrap().instance_id, "only");
  }
}
