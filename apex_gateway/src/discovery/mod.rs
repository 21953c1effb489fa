//! Service-instance registry and discovery: resolves a logical service name
//! to the instances currently believed healthy, from either a static YAML
//! file or a Nacos-backed registry.
//!
//! Discovery never raises into the request path: a backend outage, a
//! malformed record, or a parse error all degrade to an empty instance
//! list rather than propagating an error up to the caller.

mod nacos;
mod static_file;

pub use nacos::NacosDiscovery;
pub use static_file::StaticFileDiscovery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInstance {
  pub instance_id: String,
  pub service_name: String,
  pub host: String,
  pub port: u16,
  #[serde(default = "default_weight")]
  pub weight: u32,
  #[serde(default = "default_healthy")]
  pub healthy: bool,
  #[serde(default)]
  pub metadata: std::collections::HashMap<String, String>,
  /// Advisory counter bumped by the proxy on transport errors (§4.C10 step
  /// 12, §7 `BACKEND_ERROR`). Never gates selection directly — only
  /// `healthy` does; this is purely observational.
  #[serde(default)]
  pub failure_count: u32,
}

fn default_weight() -> u32 {
  1
}

fn default_healthy() -> bool {
  true
}

impl ServiceInstance {
  pub fn base_url(&self) -> String {
    format!("http://{}:{}", self.host, self.port)
  }
}

impl fmt::Display for ServiceInstance {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.service_name, self.instance_id)
  }
}

/// Discovery backend seam. Implementors must never return an `Err` from
/// `get_instances`; any internal failure is logged and mapped to an empty
/// `Vec`, so load balancing sees "no healthy instances" rather than a
/// propagating error.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
  async fn get_instances(&self, service_name: &str) -> Vec<ServiceInstance>;
  async fn register(&self, instance: ServiceInstance);
  async fn deregister(&self, service_name: &str, instance_id: &str);

  /// Bump the advisory `failure_count` on the stored copy of an instance
  /// after a transport error (§4.C10 step 12). A no-op if the instance has
  /// since dropped out of the table — there is nothing left to mark.
  async fn record_failure(&self, service_name: &str, instance_id: &str);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn base_url_formats_host_and_port() {
    let instance = ServiceInstance {
      instance_id: "i-1".to_string(),
      service_name: "billing".to_string(),
      host: "10.0.0.5".to_string(),
      port: 8080,
      weight: 1,
      healthy: true,
      metadata: Default::default(),
      failure_count: 0,
    };
    assert_eq!(instance.base_url(), "http://10.0.0.5:8080");
  }
}
