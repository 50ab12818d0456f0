//! Uniform byte-frame transport regardless of wire protocol (§4.1).
//!
//! An [`Adapter`] exposes `connect`/`send`/`receive`/`close` over one
//! protocol. Pools and bridges only ever see bytes in and bytes out; framing
//! (HTTP request/response pairing, WebSocket message boundaries, the RPC
//! length-delimited codec) is entirely the adapter's concern.

pub mod factory;
pub mod http;
pub mod rpc;
pub mod ws;

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{GatewayError, Result};

/// One protocol-agnostic frame of bytes moving across an adapter.
pub type Frame = Vec<u8>;

/// Lifecycle state of an [`Adapter`]. Transitions only forward: `new ->
/// connected -> closed`; `closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum AdapterState {
    New,
    Connected,
    Closed,
}

/// The protocol tag an adapter/endpoint is addressed by (§3 Endpoint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Http,
    Ws,
    Rpc,
}

/// Where an adapter connects to: a (protocol, host, port, optional path)
/// tuple (§3 Endpoint).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: Option<String>,
}

impl Endpoint {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self { protocol, host: host.into(), port, path: None }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// `host:port` pair used as the dial target for TCP-based adapters.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds a base URL for HTTP-family adapters.
    pub fn base_url(&self, scheme: &str) -> String {
        match &self.path {
            Some(path) => format!("{scheme}://{}:{}{}", self.host, self.port, path),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// A uniform transport handle: connect once, then exchange frames until
/// closed (§4.1).
///
/// Implementors must make `close` idempotent and `connect` fail with
/// [`crate::error::ErrorKind::IllegalState`] if called twice.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Establishes the underlying transport. Idempotent-unsafe by contract:
    /// calling on an already-connected adapter is `IllegalState`.
    async fn connect(&self, deadline: Duration) -> Result<()>;

    /// Enqueues one frame. Either the full frame reaches the wire or the
    /// call fails; no partial sends.
    async fn send(&self, frame: Frame) -> Result<()>;

    /// Blocks until the next frame arrives or the adapter closes.
    async fn receive(&self) -> Result<Frame>;

    /// Releases transport resources and unblocks a pending receive.
    /// Idempotent.
    async fn close(&self);

    /// Current lifecycle state.
    fn state(&self) -> AdapterState;

    /// The endpoint this adapter is bound to.
    fn endpoint(&self) -> &Endpoint;

    /// Timestamp of the last send/receive activity, used by the pool's idle
    /// reaper (§4.2).
    fn last_activity(&self) -> Instant;

    /// A cheap liveness check used by the pool's `validateOnBorrow` (§4.2).
    /// Default implementation treats "connected" as healthy.
    async fn validate(&self) -> bool {
        self.state() == AdapterState::Connected
    }
}

pub(crate) fn already_connected_err() -> GatewayError {
    GatewayError::illegal_state("adapter is already connected")
}

pub(crate) fn closed_err() -> GatewayError {
    GatewayError::illegal_state("adapter is closed")
}
