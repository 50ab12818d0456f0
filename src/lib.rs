//! Protocol-bridging gateway core: the in-process façade over the registry,
//! pools, bridges, health monitor, rate limiter, and metrics collector
//! (§6 External Interfaces — "an in-process façade whose operations are
//! exactly those named in §4.3, §4.7, §4.8, plus metrics registration").

pub mod bridge;
pub mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod metrics;
pub mod pool;
pub mod ratelimit;
pub mod registry;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use config::GatewayConfig;
use error::Result;
use health::HealthMonitor;
use metrics::MetricsCollector;
use ratelimit::ShardedRateLimiter;
use registry::watch::Watcher;
use registry::{
    RegistrationOptions, ServiceInstance, ServiceQuery, ServiceRegistry, ServiceStatus,
};
use transport::Protocol;
use transport::factory::AdapterFactory;

use bridge::Bridge;
use bridge::manager::BridgeManager;

/// Owns every subsystem for the lifetime of the process. Construct with
/// [`Gateway::new`], call [`Gateway::start`] once, and [`Gateway::stop`] on
/// shutdown.
pub struct Gateway {
    pub registry: Arc<ServiceRegistry>,
    pub health_monitor: Arc<HealthMonitor>,
    pub rate_limiter: Arc<ShardedRateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub bridges: Arc<BridgeManager>,
}

impl Gateway {
    pub fn new(config: &GatewayConfig) -> Self {
        let registry = ServiceRegistry::new();
        let factory = Arc::new(AdapterFactory::with_defaults());
        let health_monitor = HealthMonitor::new(Arc::clone(&registry));
        let rate_limiter =
            ShardedRateLimiter::new(config.rate_limit.shard_count, config.rate_limit.default_limit);
        let metrics = MetricsCollector::new(config.metrics.adaptive.clone());

        let mut pool_config_by_protocol = HashMap::new();
        for protocol in [Protocol::Http, Protocol::Ws, Protocol::Rpc] {
            pool_config_by_protocol.insert(protocol, config.pool_config(&protocol.to_string()));
        }
        let bridges = BridgeManager::new(
            Arc::clone(&registry),
            factory,
            pool_config_by_protocol,
            config.bridge.max_concurrent_handlers,
            config.bridge.discovery.clone(),
            config.bridge.protocols.clone(),
        );

        Self { registry, health_monitor, rate_limiter, metrics, bridges }
    }

    /// Starts background tasks: the bridge manager, rate-limiter eviction,
    /// and the metrics safety tick. Does not block.
    pub fn start(&self, config: &GatewayConfig) {
        self.bridges.start();
        if config.rate_limit.enabled {
            Arc::clone(&self.rate_limiter)
                .spawn_eviction_task(Duration::from_secs(300), Duration::from_secs(1800));
        }
        if config.metrics.enabled {
            Arc::clone(&self.metrics).spawn_safety_tick(config.metrics.interval);
        }
    }

    /// Stops every bridge and pool, within `deadline`.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        self.rate_limiter.stop();
        self.bridges.stop(deadline).await
    }

    /// Registers a service instance and, if it carries a health probe,
    /// starts monitoring it.
    pub async fn register_service(
        &self,
        instance: ServiceInstance,
        options: RegistrationOptions,
    ) -> Result<()> {
        self.health_monitor.watch(&instance);
        self.registry.register(instance, options).await
    }

    pub async fn deregister_service(&self, id: &str) -> Result<()> {
        self.health_monitor.stop(id);
        self.registry.deregister(id).await
    }

    pub async fn update_status(&self, id: &str, status: ServiceStatus) -> Result<()> {
        self.registry.update_status(id, status).await
    }

    pub async fn query_services(&self, query: &ServiceQuery) -> Vec<ServiceInstance> {
        self.registry.query(query).await
    }

    pub async fn watch_services(&self, pattern: &str) -> Result<Watcher> {
        self.registry.watch(pattern).await
    }

    pub async fn create_bridge(&self, service_id: &str, deadline: Duration) -> Result<String> {
        self.bridges.create_bridge(service_id, deadline).await
    }

    pub async fn destroy_bridge(&self, bridge_id: &str, deadline: Duration) -> Result<()> {
        self.bridges.destroy_bridge(bridge_id, deadline).await
    }

    pub async fn get_bridge(&self, bridge_id: &str) -> Option<Arc<Bridge>> {
        self.bridges.get_bridge(bridge_id).await
    }

    pub async fn list_bridges(&self) -> Vec<String> {
        self.bridges.list_bridges().await
    }

    /// Checks whether `client_key` (e.g. an IP literal) is within its rate
    /// limit. Never fails; a stopped limiter denies every call.
    pub fn allow_request(&self, client_key: &str) -> bool {
        self.rate_limiter.allow(client_key)
    }
}
