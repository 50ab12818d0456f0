//! Pattern-based watch delivery for the service registry (§4.3 `watch`).
//!
//! Delivery is best-effort: a watcher with a full buffer misses that event
//! rather than stalling registry writers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::mpsc;

use super::ServiceInstance;
use crate::error::{ErrorKind, GatewayError, Result};

const WATCHER_BUFFER: usize = 64;

enum Pattern {
    All,
    Exact(String),
    Regex(Regex),
}

impl Pattern {
    fn compile(pattern: &str) -> Result<Self> {
        if pattern == "*" {
            return Ok(Pattern::All);
        }
        if pattern.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            return Ok(Pattern::Exact(pattern.to_string()));
        }
        Regex::new(pattern).map(Pattern::Regex).map_err(|e| {
            GatewayError::with_source(ErrorKind::Invalid, "invalid watch pattern", e)
        })
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::All => true,
            Pattern::Exact(exact) => exact == name,
            Pattern::Regex(re) => re.is_match(name),
        }
    }
}

struct Subscription {
    pattern: Pattern,
    tx: mpsc::Sender<ServiceInstance>,
}

/// Registry of live watch subscriptions. Owned by the registry, shared into
/// each [`Watcher`] so it can deregister itself on drop.
pub struct WatchHub {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { subscriptions: RwLock::new(HashMap::new()), next_id: AtomicU64::new(0) })
    }

    /// Compiles `pattern`, seeds the new watcher with the instances in
    /// `current` that already match, then registers it for future events.
    pub async fn subscribe(
        self: &Arc<Self>,
        pattern: &str,
        current: Vec<ServiceInstance>,
    ) -> Result<Watcher> {
        let compiled = Pattern::compile(pattern)?;
        let (tx, rx) = mpsc::channel(WATCHER_BUFFER);

        for instance in current.into_iter().filter(|i| compiled.matches(&i.name)) {
            let _ = tx.try_send(instance);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().insert(id, Subscription { pattern: compiled, tx });

        Ok(Watcher { id, rx, hub: Arc::clone(self) })
    }

    /// Fans `instance` out to every subscription whose pattern matches its
    /// name. Non-blocking: a full watcher buffer silently drops this event.
    pub async fn notify(&self, instance: &ServiceInstance) {
        let senders: Vec<_> = {
            let subs = self.subscriptions.read();
            subs.values()
                .filter(|s| s.pattern.matches(&instance.name))
                .map(|s| s.tx.clone())
                .collect()
        };
        for tx in senders {
            let _ = tx.try_send(instance.clone());
        }
    }
}

/// A live subscription to registry changes. Drop deregisters it from the
/// hub automatically.
pub struct Watcher {
    id: u64,
    rx: mpsc::Receiver<ServiceInstance>,
    hub: Arc<WatchHub>,
}

impl Watcher {
    pub async fn next(&mut self) -> Option<ServiceInstance> {
        self.rx.recv().await
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.hub.subscriptions.write().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceStatus;
    use crate::transport::{Endpoint, Protocol};
    use std::collections::HashMap as StdHashMap;

    fn instance(name: &str) -> ServiceInstance {
        ServiceInstance {
            id: format!("{name}-id"),
            name: name.to_string(),
            endpoint: Endpoint::new(Protocol::Http, "localhost", 80),
            tags: vec![],
            metadata: StdHashMap::new(),
            version: None,
            status: ServiceStatus::Available,
            registered_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            health_probe: None,
        }
    }

    #[tokio::test]
    async fn exact_pattern_only_matches_its_name() {
        let hub = WatchHub::new();
        let mut watcher = hub.subscribe("orders", vec![]).await.unwrap();
        hub.notify(&instance("orders")).await;
        hub.notify(&instance("payments")).await;
        let received = watcher.next().await.unwrap();
        assert_eq!(received.name, "orders");
    }

    #[tokio::test]
    async fn wildcard_matches_everything() {
        let hub = WatchHub::new();
        let mut watcher = hub.subscribe("*", vec![]).await.unwrap();
        hub.notify(&instance("payments")).await;
        assert_eq!(watcher.next().await.unwrap().name, "payments");
    }

    #[tokio::test]
    async fn regex_pattern_matches_by_prefix() {
        let hub = WatchHub::new();
        let mut watcher = hub.subscribe("^order-.*", vec![]).await.unwrap();
        hub.notify(&instance("order-42")).await;
        hub.notify(&instance("payments")).await;
        assert_eq!(watcher.next().await.unwrap().name, "order-42");
    }

    #[tokio::test]
    async fn drop_deregisters_watcher() {
        let hub = WatchHub::new();
        {
            let _watcher = hub.subscribe("*", vec![]).await.unwrap();
            assert_eq!(hub.subscriptions.read().len(), 1);
        }
        assert_eq!(hub.subscriptions.read().len(), 0);
    }
}
