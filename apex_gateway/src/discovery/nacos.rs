//! Nacos-backed discovery: polls the Nacos HTTP API on an interval and
//! caches the result, so a request never waits on Nacos directly and a
//! Nacos outage degrades to serving the last good snapshot (or an empty
//! list if none was ever fetched).

use super::{ServiceDiscovery, ServiceInstance};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct NacosDiscovery {
  client: reqwest::Client,
  server_addr: String,
  namespace: String,
  cache: Arc<DashMap<String, Vec<ServiceInstance>>>,
}

#[derive(Debug, Deserialize)]
struct NacosInstancesResponse {
  #[serde(default)]
  hosts: Vec<NacosHost>,
}

#[derive(Debug, Deserialize)]
struct NacosHost {
  #[serde(rename = "instanceId")]
  instance_id: Option<String>,
  ip: String,
  port: u16,
  #[serde(default = "default_weight")]
  weight: f64,
  #[serde(default = "default_healthy")]
  healthy: bool,
  #[serde(default, deserialize_with = "deserialize_metadata")]
  metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
  1.0
}

fn default_healthy() -> bool {
  true
}

/// Nacos metadata arrives as a JSON object in the common case, but §4.C2
/// requires parsing it defensively: a JSON-encoded string is decoded and
/// re-coerced, anything else that isn't an object (`null`, a bare string
/// that isn't valid JSON, a number, an array) is treated as empty rather
/// than failing the whole host record.
fn coerce_metadata(value: serde_json::Value) -> HashMap<String, String> {
  match value {
    serde_json::Value::Object(map) => {
      map.into_iter().filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string()))).collect()
    }
    serde_json::Value::String(s) => {
      serde_json::from_str::<serde_json::Value>(&s).map(coerce_metadata).unwrap_or_default()
    }
    _ => HashMap::new(),
  }
}

fn deserialize_metadata<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = serde_json::Value::deserialize(deserializer)?;
  Ok(coerce_metadata(value))
}

impl NacosDiscovery {
  pub fn new(server_addr: String, namespace: String) -> Self {
    Self {
      client: reqwest::Client::new(),
      server_addr,
      namespace,
      cache: Arc::new(DashMap::new()),
    }
  }

  /// Spawn the periodic poller for `service_name`; the first successful
  /// fetch populates the cache immediately, then every `interval` after
  /// that. Call once per service known at startup.
  pub fn spawn_poller(self: &Arc<Self>, service_name: String, interval: Duration) -> tokio::task::JoinHandle<()> {
    let this = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        this.refresh(&service_name).await;
        tokio::time::sleep(interval).await;
      }
    })
  }

  async fn refresh(&self, service_name: &str) {
    let url = format!(
      "http://{}/nacos/v1/ns/instance/list?serviceName={}&namespaceId={}",
      self.server_addr, service_name, self.namespace
    );

    match self.client.get(&url).send().await {
      Ok(response) => match response.json::<NacosInstancesResponse>().await {
        Ok(parsed) => {
          // §4.C2: the naming-service backend "filters to healthy-only" —
          // an unhealthy host never enters the cache at all.
          let instances: Vec<ServiceInstance> = parsed
            .hosts
            .into_iter()
            .filter(|host| host.healthy)
            .map(|host| {
              let instance_id = host
                .instance_id
                .unwrap_or_else(|| format!("{}:{}", host.ip, host.port));
              ServiceInstance {
                instance_id,
                service_name: service_name.to_string(),
                host: host.ip,
                port: host.port,
                weight: host.weight.round().max(1.0) as u32,
                healthy: host.healthy,
                metadata: host.metadata,
                failure_count: 0,
              }
            })
            .collect();
          debug!(service_name, count = instances.len(), "nacos poll refreshed instances");
          self.cache.insert(service_name.to_string(), instances);
        }
        Err(e) => {
          warn!(service_name, error = %e, "failed to parse nacos response, keeping cached instances");
        }
      },
      Err(e) => {
        warn!(service_name, error = %e, "nacos poll request failed, keeping cached instances");
      }
    }
  }
}

#[async_trait]
impl ServiceDiscovery for NacosDiscovery {
  async fn get_instances(&self, service_name: &str) -> Vec<ServiceInstance> {
    self
      .cache
      .get(service_name)
      .map(|entry| entry.value().clone())
      .unwrap_or_default()
  }

  /// Nacos registration happens out-of-band (services register themselves
  /// against Nacos directly); the gateway only treats this as a local
  /// cache warm so a just-registered instance is visible before the next
  /// poll tick.
  async fn register(&self, instance: ServiceInstance) {
    self.cache.entry(instance.service_name.clone()).or_default().push(instance);
  }

  async fn deregister(&self, service_name: &str, instance_id: &str) {
    if let Some(mut entry) = self.cache.get_mut(service_name) {
      entry.retain(|i| i.instance_id != instance_id);
    }
  }

  async fn record_failure(&self, service_name: &str, instance_id: &str) {
    if let Some(mut entry) = self.cache.get_mut(service_name) {
      if let Some(instance) = entry.iter_mut().find(|i| i.instance_id == instance_id) {
        instance.failure_count += 1;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn refresh_filters_out_unhealthy_hosts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/nacos/v1/ns/instance/list"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "hosts": [
          {"instanceId": "billing-1", "ip": "10.0.0.1", "port": 8080, "weight": 2.0, "healthy": true, "metadata": {}},
          {"ip": "10.0.0.2", "port": 8081, "healthy": false, "metadata": {}},
        ]
      })))
      .mount(&server)
      .await;

    let discovery = NacosDiscovery::new(server.address().to_string(), "public".to_string());
    discovery.refresh("billing").await;

    // §4.C2: the Nacos backend filters to healthy-only, so the unhealthy
    // host never enters the cache at all.
    let instances = discovery.get_instances("billing").await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "billing-1");
    assert_eq!(instances[0].weight, 2);
    assert!(instances[0].healthy);
  }

  #[tokio::test]
  async fn refresh_keeps_previous_cache_on_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/nacos/v1/ns/instance/list"))
      .respond_with(ResponseTemplate::new(500))
      .mount(&server)
      .await;

    let discovery = NacosDiscovery::new(server.address().to_string(), "public".to_string());
    discovery.cache.insert(
      "billing".to_string(),
      vec![ServiceInstance {
        instance_id: "stale-1".to_string(),
        service_name: "billing".to_string(),
        host: "10.0.0.9".to_string(),
        port: 9000,
        weight: 1,
        healthy: true,
        metadata: Default::default(),
        failure_count: 0,
      }],
    );

    discovery.refresh("billing").await;

    let instances = discovery.get_instances("billing").await;
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "stale-1");
  }

  #[tokio::test]
  async fn refresh_coerces_non_object_metadata_to_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/nacos/v1/ns/instance/list"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "hosts": [
          {"instanceId": "a-1", "ip": "10.0.0.1", "port": 8080, "healthy": true, "metadata": null},
          {"instanceId": "a-2", "ip": "10.0.0.2", "port": 8081, "healthy": true, "metadata": "not json"},
          {"instanceId": "a-3", "ip": "10.0.0.3", "port": 8082, "healthy": true, "metadata": "{\"zone\":\"us-east\"}"},
          {"instanceId": "a-4", "ip": "10.0.0.4", "port": 8083, "healthy": true, "metadata": {"zone": "us-west"}},
        ]
      })))
      .mount(&server)
      .await;

    let discovery = NacosDiscovery::new(server.address().to_string(), "public".to_string());
    discovery.refresh("accounts").await;

    let instances = discovery.get_instances("accounts").await;
    let by_id = |id: &str| instances.iter().find(|i| i.instance_id == id).unwrap();

    assert!(by_id("a-1").metadata.is_empty(), "null metadata coerces to empty");
    assert!(by_id("a-2").metadata.is_empty(), "non-JSON string metadata coerces to empty");
    assert_eq!(by_id("a-3").metadata.get("zone").unwrap(), "us-east", "JSON-encoded string metadata is decoded");
    assert_eq!(by_id("a-4").metadata.get("zone").unwrap(), "us-west", "object metadata passes through");
  }

  #[tokio::test]
  async fn record_failure_increments_the_cached_instance() {
    let discovery = NacosDiscovery::new("127.0.0.1:8848".to_string(), "public".to_string());
    discovery.cache.insert(
      "billing".to_string(),
      vec![ServiceInstance {
        instance_id: "b-1".to_string(),
        service_name: "billing".to_string(),
        host: "10.0.0.9".to_string(),
        port: 9000,
        weight: 1,
        healthy: true,
        metadata: Default::default(),
        failure_count: 0,
      }],
    );

    discovery.record_failure("billing", "b-1").await;

    let instances = discovery.get_instances("billing").await;
    assert_eq!(instances[0].failure_count, 1);
  }

  #[tokio::test]
  async fn register_and_deregister_update_cache_out_of_band() {
    let discovery = NacosDiscovery::new("127.0.0.1:8848".to_string(), "public".to_string());
    discovery
      .register(ServiceInstance {
        instance_id: "a-1".to_string(),
        service_name: "accounts".to_string(),
        host: "10.0.0.5".to_string(),
        port: 9090,
        weight: 1,
        healthy: true,
        metadata: Default::default(),
        failure_count: 0,
      })
      .await;
    assert_eq!(discovery.get_instances("accounts").await.len(), 1);

    discovery.deregister("accounts", "a-1").await;
    assert!(discovery.get_instances("accounts").await.is_empty());
  }
}
