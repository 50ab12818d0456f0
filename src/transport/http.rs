//! HTTP transport adapter: one request/response pair per frame, keepalive
//! with at most one in-flight request (§4.1).

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use super::{Adapter, AdapterState, Endpoint, Frame, already_connected_err, closed_err};
use crate::error::{ErrorKind, GatewayError, Result};

/// A one-shot-or-keepalive HTTP adapter. `send` posts the frame as the
/// request body to the endpoint; the response body is delivered to the next
/// `receive()` call.
pub struct HttpAdapter {
    endpoint: Endpoint,
    client: reqwest::Client,
    state: StdMutex<AdapterState>,
    last_activity: StdMutex<Instant>,
    /// Dropped by `close()` so a `receive()` parked on `inbound_rx.recv()`
    /// sees the channel close and returns instead of waiting forever.
    inbound_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    inbound_rx: Mutex<mpsc::Receiver<Frame>>,
    /// Serializes sends: an HTTP adapter allows at most one in-flight request.
    in_flight: Mutex<()>,
}

impl HttpAdapter {
    pub fn new(endpoint: Endpoint, client: reqwest::Client) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        Self {
            endpoint,
            client,
            state: StdMutex::new(AdapterState::New),
            last_activity: StdMutex::new(Instant::now()),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
            in_flight: Mutex::new(()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn connect(&self, _deadline: Duration) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != AdapterState::New {
            return Err(already_connected_err());
        }
        // HTTP/1.1 keepalive has no handshake step of its own beyond TCP+TLS,
        // which reqwest negotiates lazily on first request.
        *state = AdapterState::Connected;
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != AdapterState::Connected {
            return Err(closed_err());
        }
        let _gate = self.in_flight.lock().await;

        let url = self.endpoint.base_url("http");
        let response = self
            .client
            .post(&url)
            .body(frame)
            .send()
            .await
            .map_err(|e| {
                GatewayError::with_source(ErrorKind::Transport, "http send failed", e)
            })?;

        let body = response.bytes().await.map_err(|e| {
            GatewayError::with_source(ErrorKind::Transport, "http body read failed", e)
        })?;

        self.touch();
        let tx = self.inbound_tx.lock().await.clone();
        match tx {
            Some(tx) => tx.send(body.to_vec()).await.map_err(|_| closed_err()),
            None => Err(closed_err()),
        }
    }

    async fn receive(&self) -> Result<Frame> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(frame) => {
                self.touch();
                Ok(frame)
            }
            None => Err(closed_err()),
        }
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == AdapterState::Closed {
                return;
            }
            *state = AdapterState::Closed;
        }
        // Dropping the sender makes a `receive()` parked on `inbound_rx.recv()`
        // observe the channel close and return immediately.
        self.inbound_tx.lock().await.take();
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
        if self.state() != AdapterState::Connected {
            return false;
        }
        let url = self.endpoint.base_url("http");
        self.client
            .head(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;

    #[tokio::test]
    async fn connect_twice_is_illegal_state() {
        let adapter = HttpAdapter::new(
            Endpoint::new(Protocol::Http, "127.0.0.1", 1),
            reqwest::Client::new(),
        );
        adapter.connect(Duration::from_secs(1)).await.unwrap();
        let err = adapter.connect(Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let adapter = HttpAdapter::new(
            Endpoint::new(Protocol::Http, "127.0.0.1", 1),
            reqwest::Client::new(),
        );
        let err = adapter.send(vec![1]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let adapter = HttpAdapter::new(
            Endpoint::new(Protocol::Http, "127.0.0.1", 1),
            reqwest::Client::new(),
        );
        adapter.close().await;
        adapter.close().await;
        assert_eq!(adapter.state(), AdapterState::Closed);
    }
}
