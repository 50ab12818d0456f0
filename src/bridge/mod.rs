//! Bridge: a per-service message conduit over one adapter (§4.7).

pub mod manager;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, GatewayError, Result};
use crate::message::Message;
use crate::transport::{Adapter, AdapterState};

/// A message handler. Rust's type system makes a "nil handler" unrepresentable,
/// so the only validation left to do at registration time is none — the
/// contract's `Invalid`-on-nil case is enforced at compile time instead.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| GatewayError::with_source(ErrorKind::Invalid, "failed to encode message", e))?;
    Ok(buf)
}

fn decode_message(bytes: &[u8]) -> Result<Message> {
    ciborium::from_reader(bytes)
        .map_err(|e| GatewayError::with_source(ErrorKind::Invalid, "failed to decode message", e))
}

/// One open conduit to a service: an adapter plus a handler table keyed by
/// message type.
pub struct Bridge {
    pub service_id: String,
    adapter: Arc<dyn Adapter>,
    handlers: DashMap<String, Handler>,
    running: AtomicBool,
    concurrency_limit: Arc<Semaphore>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(
        service_id: impl Into<String>,
        adapter: Arc<dyn Adapter>,
        max_concurrent_handlers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_id: service_id.into(),
            adapter,
            handlers: DashMap::new(),
            running: AtomicBool::new(false),
            concurrency_limit: Arc::new(Semaphore::new(max_concurrent_handlers.max(1))),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn register_handler(&self, message_type: impl Into<String>, handler: Handler) {
        self.handlers.insert(message_type.into(), handler);
    }

    /// Launches the receive loop over an adapter the caller already
    /// connected (the pool connects adapters before handing them out).
    /// Fails `IllegalState` if already running or if the adapter isn't
    /// connected.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::illegal_state("bridge already running"));
        }
        if self.adapter.state() != AdapterState::Connected {
            self.running.store(false, Ordering::SeqCst);
            return Err(GatewayError::illegal_state("adapter is not connected"));
        }

        let bridge = Arc::clone(self);
        let handle = tokio::spawn(async move { bridge.receive_loop().await });
        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Idempotent: stopping an already-stopped bridge is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if tokio::time::timeout(deadline, self.adapter.close()).await.is_err() {
            tracing::warn!(service_id = %self.service_id, ?deadline, "adapter close timed out");
        }
        if let Some(handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                tracing::warn!(service_id = %self.service_id, ?deadline, "receive loop join timed out, task may be leaked");
            }
        }
        Ok(())
    }

    pub async fn send(&self, message: Message) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(GatewayError::illegal_state("bridge is not running"));
        }
        let bytes = encode_message(&message)?;
        self.adapter.send(bytes).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn adapter(&self) -> Arc<dyn Adapter> {
        Arc::clone(&self.adapter)
    }

    async fn receive_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            let frame = match self.adapter.receive().await {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::debug!(error = %err, service_id = %self.service_id, "bridge receive loop exiting");
                    break;
                }
            };

            match decode_message(&frame) {
                Ok(message) => self.dispatch(message),
                Err(err) => {
                    tracing::warn!(error = %err, service_id = %self.service_id, "dropping malformed frame");
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        let Some(handler) = self.handlers.get(&message.message_type).map(|h| Arc::clone(&h))
        else {
            tracing::warn!(message_type = %message.message_type, "no handler registered for message type");
            return;
        };

        let limiter = Arc::clone(&self.concurrency_limit);
        let service_id = self.service_id.clone();
        tokio::spawn(async move {
            let Ok(_permit) = limiter.acquire_owned().await else {
                return;
            };
            if let Err(err) = handler(message).await {
                tracing::warn!(error = %err, service_id = %service_id, "bridge handler failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Endpoint, Protocol};
    use std::sync::Mutex as StdMutex;
    use std::time::Instant;
    use tokio::sync::mpsc;

    struct LoopbackAdapter {
        endpoint: Endpoint,
        state: StdMutex<AdapterState>,
        outbound: Mutex<mpsc::Sender<Vec<u8>>>,
        inbound: Mutex<mpsc::Receiver<Vec<u8>>>,
    }

    impl LoopbackAdapter {
        fn new() -> Arc<Self> {
            let (tx, rx) = mpsc::channel(8);
            Arc::new(Self {
                endpoint: Endpoint::new(Protocol::Rpc, "localhost", 1),
                state: StdMutex::new(AdapterState::Connected),
                outbound: Mutex::new(tx),
                inbound: Mutex::new(rx),
            })
        }
    }

    #[async_trait::async_trait]
    impl Adapter for LoopbackAdapter {
        async fn connect(&self, _deadline: Duration) -> Result<()> {
            Ok(())
        }
        async fn send(&self, frame: Vec<u8>) -> Result<()> {
            self.outbound.lock().await.send(frame).await.map_err(|_| {
                GatewayError::illegal_state("loopback closed")
            })
        }
        async fn receive(&self) -> Result<Vec<u8>> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| GatewayError::illegal_state("loopback closed"))
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
            Instant::now()
        }
    }

    #[tokio::test]
    async fn unknown_message_type_is_dropped_not_fatal() {
        let adapter = LoopbackAdapter::new();
        let bridge = Bridge::new("svc-1", adapter.clone(), 4);
        bridge.start().await.unwrap();

        let msg = Message::new("unhandled", "a", "b", serde_json::json!({}));
        adapter.send(encode_message(&msg).unwrap()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bridge.is_running());
        bridge.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn handler_is_invoked_for_registered_type() {
        let adapter = LoopbackAdapter::new();
        let bridge = Bridge::new("svc-1", adapter.clone(), 4);

        let (tx, mut rx) = mpsc::channel::<Message>(1);
        bridge.register_handler(
            "ping",
            Arc::new(move |message: Message| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(message).await;
                    Ok(())
                })
            }),
        );

        bridge.start().await.unwrap();
        let msg = Message::new("ping", "a", "b", serde_json::json!({"n": 1}));
        adapter.send(encode_message(&msg).unwrap()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        assert_eq!(received.message_type, "ping");
        bridge.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn send_before_start_is_illegal_state() {
        let adapter = LoopbackAdapter::new();
        let bridge = Bridge::new("svc-1", adapter, 4);
        let msg = Message::new("ping", "a", "b", serde_json::json!({}));
        let err = bridge.send(msg).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let adapter = LoopbackAdapter::new();
        let bridge = Bridge::new("svc-1", adapter, 4);
        bridge.start().await.unwrap();
        bridge.stop(Duration::from_secs(1)).await.unwrap();
        bridge.stop(Duration::from_secs(1)).await.unwrap();
    }
}
