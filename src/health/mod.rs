//! Health monitor: periodic per-service liveness probes with failure
//! hysteresis (§4.4).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::registry::{HealthProbe, ServiceInstance, ServiceRegistry, ServiceStatus};
use crate::transport::{Endpoint, Protocol};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Drives status transitions for every registered instance that carries a
/// [`HealthProbe`]. Instances with none are left untouched, per §4.4.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    http_client: reqwest::Client,
    tasks: DashMap<String, JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            http_client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .expect("static reqwest client configuration is valid"),
            tasks: DashMap::new(),
        })
    }

    /// Starts probing `instance` if it carries a health probe and isn't
    /// already being watched. Idempotent.
    pub fn watch(self: &Arc<Self>, instance: &ServiceInstance) {
        let Some(probe) = instance.health_probe.clone() else {
            return;
        };
        if self.tasks.contains_key(&instance.id) {
            return;
        }

        let monitor = Arc::clone(self);
        let id = instance.id.clone();
        let endpoint = instance.endpoint.clone();
        let handle = tokio::spawn(async move {
            monitor.run_probe_loop(id, endpoint, probe).await;
        });
        self.tasks.insert(instance.id.clone(), handle);
    }

    /// Stops probing an instance, e.g. on deregistration.
    pub fn stop(&self, id: &str) {
        if let Some((_, handle)) = self.tasks.remove(id) {
            handle.abort();
        }
    }

    async fn run_probe_loop(&self, id: String, endpoint: Endpoint, probe: HealthProbe) {
        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(probe.interval);

        loop {
            ticker.tick().await;

            if self.registry.get_by_id(&id).await.is_none() {
                break;
            }

            if self.probe_once(&endpoint, &probe).await {
                if consecutive_failures > 0 {
                    consecutive_failures = 0;
                    let _ = self.registry.update_status(&id, ServiceStatus::Available).await;
                }
                continue;
            }

            consecutive_failures += 1;
            let transition = match consecutive_failures {
                0 | 1 => None,
                2 => Some(ServiceStatus::Degraded),
                _ => Some(ServiceStatus::Down),
            };
            if let Some(status) = transition {
                let _ = self.registry.update_status(&id, status).await;
            }
        }
    }

    async fn probe_once(&self, endpoint: &Endpoint, probe: &HealthProbe) -> bool {
        match endpoint.protocol {
            Protocol::Http => {
                let url = format!("{}{}", endpoint.base_url("http"), probe.path);
                match self.http_client.get(&url).send().await {
                    Ok(response) => response.status().is_success(),
                    Err(_) => false,
                }
            }
            Protocol::Ws | Protocol::Rpc => {
                tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(endpoint.authority()))
                    .await
                    .map(|r| r.is_ok())
                    .unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistrationOptions;
    use std::collections::HashMap;

    fn instance_with_probe(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: "svc".to_string(),
            endpoint: Endpoint::new(Protocol::Rpc, "127.0.0.1", 1),
            tags: vec![],
            metadata: HashMap::new(),
            version: None,
            status: ServiceStatus::Starting,
            registered_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            health_probe: Some(HealthProbe {
                path: String::new(),
                interval: Duration::from_millis(10),
            }),
        }
    }

    #[tokio::test]
    async fn watch_is_idempotent_per_instance() {
        let registry = ServiceRegistry::new();
        let instance = instance_with_probe("svc-1");
        registry.register(instance.clone(), RegistrationOptions::default()).await.unwrap();

        let monitor = HealthMonitor::new(Arc::clone(&registry));
        monitor.watch(&instance);
        monitor.watch(&instance);
        assert_eq!(monitor.tasks.len(), 1);
    }

    #[tokio::test]
    async fn consecutive_failures_drive_down_status() {
        let registry = ServiceRegistry::new();
        let instance = instance_with_probe("svc-2");
        registry.register(instance.clone(), RegistrationOptions::default()).await.unwrap();

        let monitor = HealthMonitor::new(Arc::clone(&registry));
        monitor.watch(&instance);

        tokio::time::sleep(Duration::from_millis(60)).await;
        let found = registry.get_by_id("svc-2").await.unwrap();
        assert_eq!(found.status, ServiceStatus::Down);
        monitor.stop("svc-2");
    }
}
