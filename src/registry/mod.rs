//! Service registry: the thread-safe `id -> ServiceInstance` map plus its
//! derived `name -> ServiceGroup` index (§4.3).

pub mod watch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;

use crate::error::{GatewayError, Result};
use crate::transport::Endpoint;
use watch::{WatchHub, Watcher};

/// Lifecycle status of a [`ServiceInstance`] (§3 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Starting,
    Available,
    Degraded,
    Down,
}

/// A health probe path and the condition that counts as success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbe {
    pub path: String,
    pub interval: Duration,
}

/// A registered backend (§3 Data Model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub endpoint: Endpoint,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
    pub version: Option<String>,
    pub status: ServiceStatus,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub health_probe: Option<HealthProbe>,
}

/// Supplied at registration time (§3 Data Model).
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    pub initial_status: ServiceStatus,
    /// 0 = infinite.
    pub ttl: Duration,
    pub auto_renew: bool,
    pub health_probe: Option<HealthProbe>,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            initial_status: ServiceStatus::Starting,
            ttl: Duration::ZERO,
            auto_renew: false,
            health_probe: None,
        }
    }
}

/// A query over the registry's current snapshot (§4.3 `query`).
#[derive(Debug, Clone, Default)]
pub struct ServiceQuery {
    pub name: Option<String>,
    pub status: Option<ServiceStatus>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, String>,
}

impl ServiceQuery {
    fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(name) = &self.name {
            if &instance.name != name {
                return false;
            }
        }
        if let Some(status) = self.status {
            if instance.status != status {
                return false;
            }
        }
        if !self.tags.iter().all(|t| instance.tags.contains(t)) {
            return false;
        }
        self.metadata
            .iter()
            .all(|(k, v)| instance.metadata.get(k) == Some(v))
    }
}

struct Indexes {
    by_id: HashMap<String, ServiceInstance>,
    by_name: HashMap<String, DashSet<String>>,
}

/// Thread-safe registry of service instances with TTL expiry, renewal, and
/// pattern-based watching.
pub struct ServiceRegistry {
    indexes: RwLock<Indexes>,
    watch_hub: Arc<WatchHub>,
    ttl_tasks: DashMap<String, AbortHandle>,
}

impl ServiceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            indexes: RwLock::new(Indexes { by_id: HashMap::new(), by_name: HashMap::new() }),
            watch_hub: WatchHub::new(),
            ttl_tasks: DashMap::new(),
        })
    }

    pub async fn register(
        self: &Arc<Self>,
        mut instance: ServiceInstance,
        options: RegistrationOptions,
    ) -> Result<()> {
        if instance.id.is_empty() || instance.name.is_empty() {
            return Err(GatewayError::invalid("instance id and name are required"));
        }

        let now = Utc::now();
        instance.status = options.initial_status;
        instance.registered_at = now;
        instance.updated_at = now;
        instance.health_probe = options.health_probe;

        {
            let mut idx = self.indexes.write().await;
            if idx.by_id.contains_key(&instance.id) {
                return Err(GatewayError::duplicate(format!(
                    "service id {} already registered",
                    instance.id
                )));
            }
            idx.by_name.entry(instance.name.clone()).or_default().insert(instance.id.clone());
            idx.by_id.insert(instance.id.clone(), instance.clone());
        }

        self.watch_hub.notify(&instance).await;

        if !options.ttl.is_zero() {
            self.spawn_ttl_task(instance.id.clone(), options.ttl, options.auto_renew);
        }

        Ok(())
    }

    fn spawn_ttl_task(self: &Arc<Self>, id: String, ttl: Duration, auto_renew: bool) {
        // Replace any stale task left over from a prior registration of this
        // id (deregister aborts its task, but a race with a fresh register
        // could in principle still overlap by one tick).
        if let Some((_, old)) = self.ttl_tasks.remove(&id) {
            old.abort();
        }
        let registry = Arc::clone(self);
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                if auto_renew {
                    if registry.renew(&task_id).await.is_err() {
                        break;
                    }
                } else {
                    let _ = registry.deregister(&task_id).await;
                    break;
                }
            }
            registry.ttl_tasks.remove(&task_id);
        });
        self.ttl_tasks.insert(id, handle.abort_handle());
    }

    /// Removes `id` and notifies watchers. Also cancels any TTL timer
    /// registered for `id`, so a deregistered id can be reused immediately
    /// without a stale timer later expiring or renewing the new registration.
    pub async fn deregister(&self, id: &str) -> Result<()> {
        let instance = {
            let mut idx = self.indexes.write().await;
            let instance = idx
                .by_id
                .remove(id)
                .ok_or_else(|| GatewayError::not_found(format!("service {id} not found")))?;
            if let Some(group) = idx.by_name.get(&instance.name) {
                group.remove(id);
                if group.is_empty() {
                    idx.by_name.remove(&instance.name);
                }
            }
            instance
        };

        if let Some((_, handle)) = self.ttl_tasks.remove(id) {
            handle.abort();
        }

        let mut down = instance;
        down.status = ServiceStatus::Down;
        down.updated_at = Utc::now();
        self.watch_hub.notify(&down).await;
        Ok(())
    }

    pub async fn renew(&self, id: &str) -> Result<()> {
        let mut idx = self.indexes.write().await;
        let instance = idx
            .by_id
            .get_mut(id)
            .ok_or_else(|| GatewayError::not_found(format!("service {id} not found")))?;
        instance.updated_at = Utc::now();
        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ServiceInstance> {
        self.indexes.read().await.by_id.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Vec<ServiceInstance> {
        let idx = self.indexes.read().await;
        idx.by_name
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| idx.by_id.get(id.as_str()).cloned()).collect())
            .unwrap_or_default()
    }

    pub async fn list(&self) -> Vec<ServiceInstance> {
        self.indexes.read().await.by_id.values().cloned().collect()
    }

    pub async fn query(&self, query: &ServiceQuery) -> Vec<ServiceInstance> {
        self.indexes
            .read()
            .await
            .by_id
            .values()
            .filter(|i| query.matches(i))
            .cloned()
            .collect()
    }

    pub async fn update_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        let updated = {
            let mut idx = self.indexes.write().await;
            let instance = idx
                .by_id
                .get_mut(id)
                .ok_or_else(|| GatewayError::not_found(format!("service {id} not found")))?;
            if instance.status == status {
                return Ok(());
            }
            instance.status = status;
            instance.updated_at = Utc::now();
            instance.clone()
        };
        self.watch_hub.notify(&updated).await;
        Ok(())
    }

    pub async fn update_metadata(&self, id: &str, patch: HashMap<String, String>) -> Result<()> {
        let updated = {
            let mut idx = self.indexes.write().await;
            let instance = idx
                .by_id
                .get_mut(id)
                .ok_or_else(|| GatewayError::not_found(format!("service {id} not found")))?;
            instance.metadata.extend(patch);
            instance.updated_at = Utc::now();
            instance.clone()
        };
        self.watch_hub.notify(&updated).await;
        Ok(())
    }

    /// Subscribes to `*` / exact-name / regex `pattern`. The returned
    /// [`Watcher`] first yields the current matching set, then every
    /// subsequent change.
    pub async fn watch(&self, pattern: &str) -> Result<Watcher> {
        let current = self.list().await;
        self.watch_hub.subscribe(pattern, current).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;

    fn instance(id: &str, name: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: name.to_string(),
            endpoint: Endpoint::new(Protocol::Http, "localhost", 8080),
            tags: vec![],
            metadata: HashMap::new(),
            version: None,
            status: ServiceStatus::Starting,
            registered_at: Utc::now(),
            updated_at: Utc::now(),
            health_probe: None,
        }
    }

    #[tokio::test]
    async fn register_then_get_by_id() {
        let registry = ServiceRegistry::new();
        registry
            .register(instance("svc-1", "orders"), RegistrationOptions::default())
            .await
            .unwrap();
        let found = registry.get_by_id("svc-1").await.unwrap();
        assert_eq!(found.name, "orders");
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let registry = ServiceRegistry::new();
        registry
            .register(instance("svc-1", "orders"), RegistrationOptions::default())
            .await
            .unwrap();
        let err = registry
            .register(instance("svc-1", "orders"), RegistrationOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Duplicate);
    }

    #[tokio::test]
    async fn group_removed_when_empty() {
        let registry = ServiceRegistry::new();
        registry
            .register(instance("svc-1", "orders"), RegistrationOptions::default())
            .await
            .unwrap();
        registry.deregister("svc-1").await.unwrap();
        assert!(registry.get_by_name("orders").await.is_empty());
    }

    #[tokio::test]
    async fn query_filters_by_tag() {
        let registry = ServiceRegistry::new();
        let mut tagged = instance("svc-1", "orders");
        tagged.tags = vec!["primary".into()];
        registry.register(tagged, RegistrationOptions::default()).await.unwrap();
        registry
            .register(instance("svc-2", "orders"), RegistrationOptions::default())
            .await
            .unwrap();

        let query = ServiceQuery { tags: vec!["primary".into()], ..Default::default() };
        let results = registry.query(&query).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "svc-1");
    }

    #[tokio::test]
    async fn deregister_missing_is_not_found() {
        let registry = ServiceRegistry::new();
        let err = registry.deregister("missing").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
