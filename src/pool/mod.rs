//! Connection pool: one pool per (protocol, configured endpoint) (§4.2).
//!
//! The available set is a plain deque under the pool's mutex rather than a
//! channel, per the resolved Open Question in SPEC_FULL.md §9 — idle
//! reaping is then a simple O(n) scan with no rebalancing step.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;

use crate::config::PoolConfig;
use crate::error::{GatewayError, Result};
use crate::transport::factory::AdapterFactory;
use crate::transport::{Adapter, AdapterState, Endpoint};

fn adapter_id(adapter: &Arc<dyn Adapter>) -> usize {
    Arc::as_ptr(adapter) as *const () as usize
}

struct PoolState {
    available: VecDeque<Arc<dyn Adapter>>,
    in_use: HashSet<usize>,
    total: usize,
    closed: bool,
}

/// A bounded pool of adapters for one endpoint. `acquire`/`release` are the
/// only entry points; adapters are never shared outside a single checkout.
pub struct ConnectionPool {
    endpoint: Endpoint,
    factory: Arc<AdapterFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    notify: Notify,
}

impl ConnectionPool {
    pub fn new(endpoint: Endpoint, factory: Arc<AdapterFactory>, config: PoolConfig) -> Self {
        Self {
            endpoint,
            factory,
            config,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                in_use: HashSet::new(),
                total: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Checks out a connected adapter, constructing one if the pool has
    /// headroom, or blocking for a returned one otherwise. Fails `Exhausted`
    /// once `min(acquireTimeout, deadline)` elapses.
    pub async fn acquire(&self, deadline: Duration) -> Result<Arc<dyn Adapter>> {
        let deadline_instant = Instant::now() + deadline;

        loop {
            enum Action {
                Use(Arc<dyn Adapter>),
                Construct,
                Wait,
                Closed,
            }

            let action = {
                let mut state = self.state.lock().await;
                if state.closed {
                    Action::Closed
                } else if let Some(adapter) = state.available.pop_front() {
                    Action::Use(adapter)
                } else if state.total < self.config.max_connections {
                    state.total += 1;
                    Action::Construct
                } else {
                    Action::Wait
                }
            };

            match action {
                Action::Closed => return Err(GatewayError::illegal_state("pool is closed")),

                Action::Use(adapter) => {
                    if self.config.validate_on_borrow && !adapter.validate().await {
                        adapter.close().await;
                        let mut state = self.state.lock().await;
                        state.total = state.total.saturating_sub(1);
                        continue;
                    }
                    self.state.lock().await.in_use.insert(adapter_id(&adapter));
                    return Ok(adapter);
                }

                Action::Construct => {
                    let adapter = self.factory.create(self.endpoint.clone())?;
                    let remaining = deadline_instant.saturating_duration_since(Instant::now());
                    match adapter.connect(remaining).await {
                        Ok(()) => {
                            self.state.lock().await.in_use.insert(adapter_id(&adapter));
                            return Ok(adapter);
                        }
                        Err(err) => {
                            let mut state = self.state.lock().await;
                            state.total = state.total.saturating_sub(1);
                            drop(state);
                            self.notify.notify_one();
                            return Err(err);
                        }
                    }
                }

                Action::Wait => {
                    let remaining = deadline_instant.saturating_duration_since(Instant::now());
                    let budget = remaining.min(self.config.acquire_timeout);
                    if budget.is_zero() {
                        return Err(GatewayError::exhausted("pool exhausted"));
                    }
                    if timeout(budget, self.notify.notified()).await.is_err() {
                        return Err(GatewayError::exhausted("pool exhausted"));
                    }
                }
            }
        }
    }

    /// Returns a checked-out adapter to the pool. Healthy adapters go back
    /// into `available`; unhealthy ones are closed and their slot freed.
    /// Returning an adapter this pool never handed out is a no-op logged at
    /// `warn`.
    pub async fn release(&self, adapter: Arc<dyn Adapter>) {
        let id = adapter_id(&adapter);
        let (closed, healthy) = {
            let mut state = self.state.lock().await;
            if !state.in_use.remove(&id) {
                tracing::warn!("returned adapter not tracked by this pool");
                return;
            }
            let healthy = !state.closed && adapter.state() == AdapterState::Connected;
            if healthy {
                state.available.push_back(adapter.clone());
            } else {
                state.total = state.total.saturating_sub(1);
            }
            (state.closed, healthy)
        };

        if closed || !healthy {
            adapter.close().await;
        }
        self.notify.notify_one();
    }

    /// Closes the pool: every available adapter closes now, every in-use
    /// adapter closes on its next `release`.
    pub async fn close(&self) {
        let to_close = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            state.available.drain(..).collect::<Vec<_>>()
        };
        for adapter in to_close {
            adapter.close().await;
        }
        self.notify.notify_waiters();
    }

    async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Closes any available adapter idle longer than `maxIdleTime`. Never
    /// touches in-use adapters.
    async fn reap_idle(&self) {
        let to_close = {
            let mut state = self.state.lock().await;
            if state.closed {
                return;
            }
            let max_idle = self.config.max_idle_time;
            let candidates: VecDeque<_> = state.available.drain(..).collect();
            let mut to_close = Vec::new();
            for adapter in candidates {
                if adapter.last_activity().elapsed() > max_idle {
                    to_close.push(adapter);
                } else {
                    state.available.push_back(adapter);
                }
            }
            state.total = state.total.saturating_sub(to_close.len());
            to_close
        };
        for adapter in to_close {
            adapter.close().await;
        }
    }

    /// Spawns the idle-reaping background task, ticking every
    /// `maxIdleTime / 2` until the pool closes.
    pub fn spawn_idle_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = (self.config.max_idle_time / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if self.is_closed().await {
                    break;
                }
                self.reap_idle().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubAdapter {
        endpoint: Endpoint,
        state: std::sync::Mutex<AdapterState>,
        last_activity: std::sync::Mutex<Instant>,
        healthy: AtomicBool,
    }

    impl StubAdapter {
        fn new(endpoint: Endpoint) -> Self {
            Self {
                endpoint,
                state: std::sync::Mutex::new(AdapterState::New),
                last_activity: std::sync::Mutex::new(Instant::now()),
                healthy: AtomicBool::new(true),
            }
        }
    }

    #[async_trait::async_trait]
    impl Adapter for StubAdapter {
        async fn connect(&self, _deadline: Duration) -> Result<()> {
            *self.state.lock().unwrap() = AdapterState::Connected;
            Ok(())
        }
        async fn send(&self, _frame: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn receive(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn close(&self) {
            *self.state.lock().unwrap() = AdapterState::Closed;
        }
        fn state(&self) -> AdapterState {
            *self.state.lock().unwrap()
        }
        fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }
        fn last_activity(&self) -> Instant {
            *self.last_activity.lock().unwrap()
        }
        async fn validate(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn stub_factory() -> Arc<AdapterFactory> {
        let mut factory = AdapterFactory::new();
        factory.register(Protocol::Rpc, |endpoint: Endpoint| {
            Arc::new(StubAdapter::new(endpoint)) as Arc<dyn Adapter>
        });
        Arc::new(factory)
    }

    fn test_pool(max_connections: usize) -> ConnectionPool {
        ConnectionPool::new(
            Endpoint::new(Protocol::Rpc, "127.0.0.1", 9000),
            stub_factory(),
            PoolConfig { max_connections, ..Default::default() },
        )
    }

    #[tokio::test]
    async fn acquire_constructs_up_to_max_connections() {
        let pool = test_pool(2);
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_ne!(adapter_id(&a), adapter_id(&b));
    }

    #[tokio::test]
    async fn acquire_beyond_max_connections_times_out() {
        let pool = test_pool(1);
        let _a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Exhausted);
    }

    #[tokio::test]
    async fn released_adapter_is_reused() {
        let pool = test_pool(1);
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        let id = adapter_id(&a);
        pool.release(a).await;
        let b = pool.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(adapter_id(&b), id);
    }

    #[tokio::test]
    async fn close_drains_available_adapters() {
        let pool = test_pool(1);
        let a = pool.acquire(Duration::from_millis(50)).await.unwrap();
        pool.release(a.clone()).await;
        pool.close().await;
        assert_eq!(a.state(), AdapterState::Closed);
        let err = pool.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IllegalState);
    }
}
