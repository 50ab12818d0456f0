//! RPC transport adapter: one stream message per frame over a length-delimited,
//! optionally Zstd-compressed CBOR codec (§4.1, §10.5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

use super::{Adapter, AdapterState, Endpoint, Frame, already_connected_err, closed_err};
use crate::error::{ErrorKind, GatewayError, Result};

/// One open RPC stream. Frames are raw bytes; callers are expected to carry
/// CBOR-encoded [`crate::message::Message`] values, matching the RPC framing
/// in §4.1.
pub struct RpcAdapter {
    endpoint: Endpoint,
    state: StdMutex<AdapterState>,
    stream: Mutex<Option<TcpStream>>,
    last_activity: StdMutex<Instant>,
    read_buf: Mutex<BytesMut>,
    /// guards interleaved concurrent sends onto the same stream.
    send_gate: Mutex<()>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Wakes a `receive()` parked in `stream.read()` so `close()` doesn't
    /// have to wait for that read to return on its own before it can take
    /// the stream out of its mutex.
    close_notify: Notify,
}

impl RpcAdapter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            state: StdMutex::new(AdapterState::New),
            stream: Mutex::new(None),
            last_activity: StdMutex::new(Instant::now()),
            read_buf: Mutex::new(BytesMut::with_capacity(4096)),
            send_gate: Mutex::new(()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            close_notify: Notify::new(),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Adapter for RpcAdapter {
    async fn connect(&self, deadline: Duration) -> Result<()> {
        {
            let state = *self.state.lock().unwrap();
            if state != AdapterState::New {
                return Err(already_connected_err());
            }
        }

        let stream = tokio::time::timeout(
            deadline,
            TcpStream::connect(self.endpoint.authority()),
        )
        .await
        .map_err(|_| {
            GatewayError::new(ErrorKind::Transport, "connect timed out")
        })?
        .map_err(|e| {
            GatewayError::with_source(ErrorKind::Transport, "connection refused", e)
        })?;

        *self.stream.lock().await = Some(stream);
        *self.state.lock().unwrap() = AdapterState::Connected;
        self.touch();
        Ok(())
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if self.state() != AdapterState::Connected {
            return Err(closed_err());
        }
        let _gate = self.send_gate.lock().await;

        let mut guard = self.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return Err(closed_err());
        };

        let total_len = 1u32 + frame.len() as u32;
        let mut header = Vec::with_capacity(5);
        header.extend_from_slice(&total_len.to_be_bytes());
        header.push(0u8); // flags: caller is responsible for their own compression
        stream.write_all(&header).await.map_err(|e| {
            GatewayError::with_source(ErrorKind::Transport, "send failed", e)
        })?;
        stream.write_all(&frame).await.map_err(|e| {
            GatewayError::with_source(ErrorKind::Transport, "send failed", e)
        })?;

        self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        self.touch();
        Ok(())
    }

    async fn receive(&self) -> Result<Frame> {
        loop {
            if self.state() != AdapterState::Connected {
                return Err(closed_err());
            }

            let mut buf = self.read_buf.lock().await;
            if let Some(frame) = try_decode_frame(&mut buf)? {
                self.bytes_received
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
                self.touch();
                return Ok(frame);
            }
            drop(buf);

            let mut guard = self.stream.lock().await;
            let Some(stream) = guard.as_mut() else {
                return Err(closed_err());
            };

            let mut chunk = [0u8; 4096];
            let n = tokio::select! {
                biased;
                _ = self.close_notify.notified() => {
                    drop(guard);
                    return Err(closed_err());
                }
                result = stream.read(&mut chunk) => result.map_err(|e| {
                    GatewayError::with_source(ErrorKind::Transport, "receive failed", e)
                })?,
            };
            drop(guard);

            if n == 0 {
                self.close().await;
                return Err(closed_err());
            }

            self.read_buf.lock().await.extend_from_slice(&chunk[..n]);
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
        // Unblocks a `receive()` parked in `stream.read()` before we try to
        // take the stream, so this doesn't wait on that read to return.
        self.close_notify.notify_one();

        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
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

/// Length-delimited frame parser, mirroring the wire format in
/// [`crate::codec`] but operating on raw `Frame` bytes rather than a typed
/// `Encoder`/`Decoder`, since the RPC adapter doesn't know the payload type.
fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    const LEN_PREFIX: usize = 4;
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let total_len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    if total_len < 1 {
        return Err(GatewayError::invalid("rpc frame too short"));
    }
    let frame_size = LEN_PREFIX + total_len;
    if buf.len() < frame_size {
        return Ok(None);
    }
    let mut frame = buf.split_to(frame_size);
    frame.advance(LEN_PREFIX + 1); // drop length prefix + flags byte
    Ok(Some(frame.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Protocol;

    #[test]
    fn decode_needs_more_data() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0, 0]);
        assert!(try_decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_full_frame() {
        let mut buf = BytesMut::new();
        let payload = b"hello";
        let total_len = 1 + payload.len() as u32;
        buf.extend_from_slice(&total_len.to_be_bytes());
        buf.push(0u8);
        buf.extend_from_slice(payload);
        let frame = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, payload);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn new_adapter_starts_unconnected() {
        let adapter = RpcAdapter::new(Endpoint::new(Protocol::Rpc, "127.0.0.1", 9999));
        assert_eq!(adapter.state(), AdapterState::New);
    }

    #[tokio::test]
    async fn send_before_connect_is_closed_err() {
        let adapter = RpcAdapter::new(Endpoint::new(Protocol::Rpc, "127.0.0.1", 9999));
        let err = adapter.send(vec![1, 2, 3]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalState);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let adapter = RpcAdapter::new(Endpoint::new(Protocol::Rpc, "127.0.0.1", 9999));
        adapter.close().await;
        adapter.close().await;
        assert_eq!(adapter.state(), AdapterState::Closed);
    }
}
