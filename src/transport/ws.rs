//! WebSocket transport adapter (§4.1): message-framed, full-duplex, built on
//! `tokio-tungstenite`.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};

use super::{Adapter, AdapterState, Endpoint, Frame, already_connected_err, closed_err};
use crate::error::{ErrorKind, GatewayError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One open WebSocket connection. Each `send` writes one binary message;
/// each `receive` yields the next binary message, skipping control frames.
pub struct WsAdapter {
    endpoint: Endpoint,
    state: StdMutex<AdapterState>,
    socket: Mutex<Option<Socket>>,
    last_activity: StdMutex<Instant>,
    /// Wakes a `receive()` parked in `socket.next()` so `close()` doesn't
    /// have to wait for that read to return on its own before it can take
    /// the socket out of its mutex.
    close_notify: Notify,
}

impl WsAdapter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: StdMutex::new(AdapterState::New),
            socket: Mutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
            close_notify: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }
}

#[async_trait]
impl Adapter for WsAdapter {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        {
            let state = *self.state.lock().unwrap();
            if state != AdapterState::New {
                return Err(already_connected_err());
            }
        }

        let url = self.endpoint.base_url("ws");
        let (socket, _response) = tokio::time::timeout(deadline, connect_async(&url))
            .await
            .map_err(|_| GatewayError::new(ErrorKind::Transport, "ws connect timed out"))?
            .map_err(|e| {
                GatewayError::with_source(ErrorKind::Transport, "ws handshake failed", e)
            })?;

        *self.socket.lock().await = Some(socket);
        *self.state.lock().unwrap() = AdapterState::Connected;
        self.touch();
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != AdapterState::Connected {
            return Err(closed_err());
        }
        let mut guard = self.socket.lock().await;
        let Some(socket) = guard.as_mut() else {
            return Err(closed_err());
        };
        socket
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(|e| GatewayError::with_source(ErrorKind::Transport, "ws send failed", e))?;
        self.touch();
        Ok(())
    }

    async fn receive(&self) -> Result<Frame> {
        loop {
            if self.state() != AdapterState::Connected {
                return Err(closed_err());
            }
            let mut guard = self.socket.lock().await;
            let Some(socket) = guard.as_mut() else {
                return Err(closed_err());
            };

            let next = tokio::select! {
                biased;
                _ = self.close_notify.notified() => {
                    drop(guard);
                    return Err(closed_err());
                }
                next = socket.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Binary(bytes))) => {
                    self.touch();
                    return Ok(bytes.to_vec());
                }
                Some(Ok(WsMessage::Text(text))) => {
                    self.touch();
                    return Ok(text.as_bytes().to_vec());
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    drop(guard);
                    self.close().await;
                    return Err(closed_err());
                }
                Some(Ok(_)) => continue, // ping/pong/frame, handled by tungstenite itself
                Some(Err(e)) => {
                    drop(guard);
                    self.close().await;
                    return Err(GatewayError::with_source(
                        ErrorKind::Transport,
                        "ws receive failed",
                        e,
                    ));
                }
            }
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
        // Unblocks a `receive()` parked in `socket.next()` before we try to
        // take the socket, so this doesn't wait on that read to return.
        self.close_notify.notify_one();

        if let Some(mut socket) = self.socket.lock().await.take() {
            let _ = socket.close(None).await;
        }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;

    #[tokio::test]
    async fn new_adapter_starts_unconnected() {
        let adapter = WsAdapter::new(Endpoint::new(Protocol::Ws, "127.0.0.1", 9999));
        assert_eq!(adapter.state(), AdapterState::New);
    }

    #[tokio::test]
    async fn send_before_connect_is_closed_err() {
        let adapter = WsAdapter::new(Endpoint::new(Protocol::Ws, "127.0.0.1", 9999));
        let err = adapter.send(vec![1, 2, 3]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let adapter = WsAdapter::new(Endpoint::new(Protocol::Ws, "127.0.0.1", 9999));
        adapter.close().await;
        adapter.close().await;
        assert_eq!(adapter.state(), AdapterState::Closed);
    }
}
