//! Bridge manager: owns the protocol→pool map, the bridge table, and the
//! registry handle (§4.8).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::Bridge;
use crate::config::{DiscoveryConfig, PoolConfig};
use crate::error::{GatewayError, Result};
use crate::pool::ConnectionPool;
use crate::registry::{ServiceRegistry, ServiceStatus};
use crate::transport::factory::AdapterFactory;
use crate::transport::{Endpoint, Protocol};

fn pool_key(endpoint: &Endpoint) -> String {
    format!("{}-{}", endpoint.protocol, endpoint.authority())
}

fn bridge_id_for(endpoint: &Endpoint, service_id: &str) -> String {
    format!("{}-{service_id}", endpoint.protocol)
}

/// Coordinates pools and bridges for every registered service. A single
/// lock protects the bridge table; pool and bridge operations run outside
/// that lock.
pub struct BridgeManager {
    registry: Arc<ServiceRegistry>,
    factory: Arc<AdapterFactory>,
    pool_config_by_protocol: HashMap<Protocol, PoolConfig>,
    pools: DashMap<String, Arc<ConnectionPool>>,
    bridges: Mutex<HashMap<String, Arc<Bridge>>>,
    max_concurrent_handlers: usize,
    discovery: DiscoveryConfig,
    auto_bridge_protocols: Vec<String>,
    started: AtomicBool,
    discovery_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl BridgeManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        factory: Arc<AdapterFactory>,
        pool_config_by_protocol: HashMap<Protocol, PoolConfig>,
        max_concurrent_handlers: usize,
        discovery: DiscoveryConfig,
        auto_bridge_protocols: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            factory,
            pool_config_by_protocol,
            pools: DashMap::new(),
            bridges: Mutex::new(HashMap::new()),
            max_concurrent_handlers,
            discovery,
            auto_bridge_protocols,
            started: AtomicBool::new(false),
            discovery_handle: StdMutex::new(None),
        })
    }

    /// Marks the manager started and, if `discovery.enabled`, launches the
    /// reconciliation loop described in SPEC_FULL §10.6. Pools themselves
    /// are created lazily, one per distinct endpoint, the first time a
    /// bridge needs them — a
    /// generalization of "one pool per configured protocol" for deployments
    /// with more than one endpoint behind the same protocol (see DESIGN.md).
    pub fn start(self: &Arc<Self>) {
        self.started.store(true, Ordering::SeqCst);
        if self.discovery.enabled {
            self.spawn_discovery_task();
        }
    }

    fn spawn_discovery_task(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = self.discovery.refresh_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                manager.reconcile().await;
            }
        });
        *self.discovery_handle.lock().unwrap() = Some(handle);
    }

    /// Tears down bridges for services that disappeared from the registry or
    /// went `down`, and proactively bridges newly `available` services whose
    /// protocol is in `bridge.protocols` (§10.6).
    async fn reconcile(self: &Arc<Self>) {
        let bridged_services: Vec<(String, String)> = self
            .bridges
            .lock()
            .await
            .iter()
            .map(|(bridge_id, bridge)| (bridge_id.clone(), bridge.service_id.clone()))
            .collect();

        let services = self.registry.list().await;
        let by_id: HashMap<&str, &crate::registry::ServiceInstance> =
            services.iter().map(|s| (s.id.as_str(), s)).collect();

        for (bridge_id, service_id) in &bridged_services {
            let stale = match by_id.get(service_id.as_str()) {
                None => true,
                Some(instance) => instance.status == ServiceStatus::Down,
            };
            if stale {
                if let Err(err) = self.destroy_bridge(bridge_id, Duration::from_secs(5)).await {
                    tracing::warn!(bridge_id = %bridge_id, error = %err, "discovery reconcile: failed to tear down stale bridge");
                }
            }
        }

        for instance in &services {
            if instance.status != ServiceStatus::Available {
                continue;
            }
            if !self.auto_bridge_protocols.iter().any(|p| p == &instance.endpoint.protocol.to_string()) {
                continue;
            }
            let bridge_id = bridge_id_for(&instance.endpoint, &instance.id);
            if self.bridges.lock().await.contains_key(&bridge_id) {
                continue;
            }
            if let Err(err) = self.create_bridge(&instance.id, Duration::from_secs(5)).await {
                tracing::warn!(service_id = %instance.id, error = %err, "discovery reconcile: failed to auto-bridge service");
            }
        }
    }

    fn get_or_create_pool(&self, endpoint: &Endpoint) -> Arc<ConnectionPool> {
        let key = pool_key(endpoint);
        Arc::clone(self.pools.entry(key).or_insert_with(|| {
            let config =
                self.pool_config_by_protocol.get(&endpoint.protocol).cloned().unwrap_or_default();
            let pool =
                Arc::new(ConnectionPool::new(endpoint.clone(), Arc::clone(&self.factory), config));
            pool.clone().spawn_idle_reaper();
            pool
        }))
    }

    /// Looks up the service, acquires an adapter from its protocol's pool,
    /// and starts a bridge for it under the deterministic id
    /// `"{protocol}-{serviceId}"`. Calling again for the same service
    /// returns the existing bridge id without creating a second bridge.
    pub async fn create_bridge(&self, service_id: &str, deadline: Duration) -> Result<String> {
        let instance = self
            .registry
            .get_by_id(service_id)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("service {service_id} not found")))?;

        let bridge_id = bridge_id_for(&instance.endpoint, service_id);
        if self.bridges.lock().await.contains_key(&bridge_id) {
            return Ok(bridge_id);
        }

        let pool = self.get_or_create_pool(&instance.endpoint);
        let adapter = pool.acquire(deadline).await?;

        let bridge = Bridge::new(service_id, Arc::clone(&adapter), self.max_concurrent_handlers);
        if let Err(err) = bridge.start().await {
            pool.release(adapter).await;
            return Err(err);
        }

        let mut bridges = self.bridges.lock().await;
        if bridges.contains_key(&bridge_id) {
            drop(bridges);
            bridge.stop(deadline).await.ok();
            pool.release(adapter).await;
            return Ok(bridge_id);
        }
        bridges.insert(bridge_id.clone(), bridge);
        Ok(bridge_id)
    }

    /// Stops and removes a bridge, returning its adapter's slot to the pool.
    pub async fn destroy_bridge(&self, bridge_id: &str, deadline: Duration) -> Result<()> {
        let bridge = self
            .bridges
            .lock()
            .await
            .remove(bridge_id)
            .ok_or_else(|| GatewayError::not_found(format!("bridge {bridge_id} not found")))?;

        let adapter = bridge.adapter();
        let endpoint = adapter.endpoint().clone();
        bridge.stop(deadline).await?;

        if let Some(pool) = self.pools.get(&pool_key(&endpoint)) {
            pool.release(adapter).await;
        }
        Ok(())
    }

    pub async fn get_bridge(&self, bridge_id: &str) -> Option<Arc<Bridge>> {
        self.bridges.lock().await.get(bridge_id).cloned()
    }

    pub async fn list_bridges(&self) -> Vec<String> {
        self.bridges.lock().await.keys().cloned().collect()
    }

    /// Stops every bridge concurrently, waits for completion, then closes
    /// every pool. Ordering matters: bridges release their adapter slots
    /// before the pools they came from are torn down.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if let Some(handle) = self.discovery_handle.lock().unwrap().take() {
            handle.abort();
        }

        let drained: Vec<_> = self.bridges.lock().await.drain().collect();

        let stops = drained.iter().map(|(_, bridge)| {
            let bridge = Arc::clone(bridge);
            async move { bridge.stop(deadline).await }
        });
        futures::future::join_all(stops).await;

        for (_, bridge) in &drained {
            let adapter = bridge.adapter();
            let endpoint = adapter.endpoint().clone();
            if let Some(pool) = self.pools.get(&pool_key(&endpoint)) {
                pool.release(adapter).await;
            }
        }

        let pool_closes = self.pools.iter().map(|entry| {
            let pool = Arc::clone(entry.value());
            async move { pool.close().await }
        });
        futures::future::join_all(pool_closes).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistrationOptions, ServiceInstance, ServiceStatus};
    use crate::transport::factory::AdapterFactory;
    use std::collections::HashMap as StdHashMap;

    async fn start_echo_listener() -> u16 {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                });
            }
        });
        port
    }

    async fn registered_manager() -> (Arc<ServiceRegistry>, Arc<BridgeManager>) {
        let registry = ServiceRegistry::new();
        let port = start_echo_listener().await;
        let instance = ServiceInstance {
            id: "svc-1".to_string(),
            name: "orders".to_string(),
            endpoint: Endpoint::new(Protocol::Rpc, "127.0.0.1", port),
            tags: vec![],
            metadata: StdHashMap::new(),
            version: None,
            status: ServiceStatus::Starting,
            registered_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            health_probe: None,
        };
        registry.register(instance, RegistrationOptions::default()).await.unwrap();

        let factory = Arc::new(AdapterFactory::with_defaults());
        let manager = BridgeManager::new(
            Arc::clone(&registry),
            factory,
            HashMap::new(),
            4,
            crate::config::DiscoveryConfig::default(),
            vec![],
        );
        manager.start();
        (registry, manager)
    }

    #[tokio::test]
    async fn create_bridge_for_unknown_service_is_not_found() {
        let (_registry, manager) = registered_manager().await;
        let err = manager.create_bridge("missing", Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn create_bridge_is_idempotent() {
        let (_registry, manager) = registered_manager().await;
        let first = manager.create_bridge("svc-1", Duration::from_secs(2)).await.unwrap();
        let second = manager.create_bridge("svc-1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(manager.list_bridges().await.len(), 1);
    }

    #[tokio::test]
    async fn destroy_bridge_removes_it() {
        let (_registry, manager) = registered_manager().await;
        let id = manager.create_bridge("svc-1", Duration::from_secs(2)).await.unwrap();
        manager.destroy_bridge(&id, Duration::from_secs(1)).await.unwrap();
        assert!(manager.get_bridge(&id).await.is_none());
    }
}
