//! Static-file-backed discovery: `services.yaml` is parsed once at startup
//! into an in-memory map, reloadable on demand. `register`/`deregister` are
//! "not supported" for this backend (§4.C2) — the table only changes via
//! `reload()`.

use super::{ServiceDiscovery, ServiceInstance};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, serde::Deserialize)]
struct ServicesFile {
  #[serde(default)]
  services: Vec<ServiceInstance>,
}

pub struct StaticFileDiscovery {
  instances: Arc<DashMap<String, Vec<ServiceInstance>>>,
}

impl StaticFileDiscovery {
  pub fn from_file(path: &str) -> anyhow::Result<Self> {
    let content = std::fs::read_to_string(path)?;
    let parsed: ServicesFile = serde_yaml::from_str(&content)?;
    let instances: DashMap<String, Vec<ServiceInstance>> = DashMap::new();
    for instance in parsed.services {
      instances.entry(instance.service_name.clone()).or_default().push(instance);
    }
    Ok(Self { instances: Arc::new(instances) })
  }

  pub fn empty() -> Self {
    Self { instances: Arc::new(DashMap::new()) }
  }

  /// Replace the whole table from a freshly re-read file. Errors are
  /// logged and swallowed: a malformed reload must never take the gateway
  /// down or clear out a previously-good registry.
  pub fn reload(&self, path: &str) {
    match std::fs::read_to_string(path).and_then(|content| {
      serde_yaml::from_str::<ServicesFile>(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }) {
      Ok(parsed) => {
        self.instances.clear();
        for instance in parsed.services {
          self.instances.entry(instance.service_name.clone()).or_default().push(instance);
        }
      }
      Err(e) => {
        error!(error = %e, path, "failed to reload services file, keeping previous registry");
      }
    }
  }
}

#[async_trait]
impl ServiceDiscovery for StaticFileDiscovery {
  async fn get_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
    self
      .instances
      .get(service_name)
      .map(|entry| entry.value().clone())
      .unwrap_or_default()
  }

  /// Static discovery is a read-only snapshot of `services.yaml`; the
  /// instance list only changes on `reload()`. Registration is "not
  /// supported" here, not an error — logged and dropped.
  async fn register(&self, instance: ServiceInstance) {
    warn!(
      service_name = %instance.service_name,
      instance_id = %instance.instance_id,
      "register not supported by static file discovery"
    );
  }

  async fn deregister(&self, service_name: &str, instance_id: &str) {
    warn!(service_name, instance_id, "deregister not supported by static file discovery");
  }

  async fn record_failure(&self, service_name: &str, instance_id: &str) {
    if let Some(mut entry) = self.instances.get_mut(service_name) {
      if let Some(instance) = entry.iter_mut().find(|i| i.instance_id == instance_id) {
        instance.failure_count += 1;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn instance(id: &str, service: &str) -> ServiceInstance {
    ServiceInstance {
      instance_id: id.to_string(),
      service_name: service.to_string(),
      host: "127.0.0.1".to_string(),
      port: 9000,
      weight: 1,
      healthy: true,
      metadata: Default::default(),
      failure_count: 0,
    }
  }

  #[tokio::test]
  async fn register_is_not_supported_and_does_not_mutate_the_table() {
    let discovery = StaticFileDiscovery::empty();
    discovery.register(instance("i-1", "billing")).await;
    assert!(discovery.get_instances("billing").await.is_empty());
  }

  #[tokio::test]
  async fn deregister_is_not_supported_and_does_not_mutate_the_table() {
    let discovery = StaticFileDiscovery::empty();
    discovery.instances.entry("billing".to_string()).or_default().push(instance("i-1", "billing"));
    discovery.deregister("billing", "i-1").await;
    assert_eq!(discovery.get_instances("billing").await.len(), 1);
  }

  #[tokio::test]
  async fn record_failure_increments_the_stored_instance() {
    let discovery = StaticFileDiscovery::empty();
    discovery.instances.entry("billing".to_string()).or_default().push(instance("i-1", "billing"));

    discovery.record_failure("billing", "i-1").await;
    discovery.record_failure("billing", "i-1").await;

    let instances = discovery.get_instances("billing").await;
    assert_eq!(instances[0].failure_count, 2);
  }

  #[tokio::test]
  async fn record_failure_on_unknown_instance_is_a_no_op() {
    let discovery = StaticFileDiscovery::empty();
    discovery.record_failure("billing", "ghost").await;
    assert!(discovery.get_instances("billing").await.is_empty());
  }

  #[tokio::test]
  async fn unknown_service_returns_empty_not_error() {
    let discovery = StaticFileDiscovery::empty();
    assert!(discovery.get_instances("ghost").await.is_empty());
  }

  #[tokio::test]
  async fn reload_replaces_the_table_from_disk() {
    let dir = std::env::temp_dir().join(format!("apex-gateway-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("services.yaml");
    std::fs::write(
      &path,
      "services:\n  - instance_id: i-1\n    service_name: billing\n    host: 127.0.0.1\n    port: 9000\n",
    )
    .unwrap();

    let discovery = StaticFileDiscovery::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(discovery.get_instances("billing").await.len(), 1);

    std::fs::write(
      &path,
      "services:\n  - instance_id: i-2\n    service_name: billing\n    host: 127.0.0.1\n    port: 9001\n",
    )
    .unwrap();
    discovery.reload(path.to_str().unwrap());

    let instances = discovery.get_instances("billing").await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "i-2");

    std::fs::remove_dir_all(&dir).ok();
  }
}
