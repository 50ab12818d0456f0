//! Explicit adapter-factory registry (§9 Design Notes: "Global mutable
//! state" — constructed once at startup and threaded to callers instead of
//! a process-wide static).

use std::collections::HashMap;
use std::sync::Arc;

use super::{Adapter, Endpoint, Protocol};
use crate::error::{GatewayError, Result};

/// Builds a fresh, unconnected [`Adapter`] for one endpoint.
pub trait AdapterBuilder: Send + Sync {
    fn build(&self, endpoint: Endpoint) -> Arc<dyn Adapter>;
}

impl<F> AdapterBuilder for F
where
    F: Fn(Endpoint) -> Arc<dyn Adapter> + Send + Sync,
{
    fn build(&self, endpoint: Endpoint) -> Arc<dyn Adapter> {
        self(endpoint)
    }
}

/// Maps [`Protocol`] to the builder that constructs adapters for it. Built
/// once at process startup and passed down to the pool/bridge manager.
pub struct AdapterFactory {
    builders: HashMap<Protocol, Box<dyn AdapterBuilder>>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self { builders: HashMap::new() }
    }

    pub fn register(&mut self, protocol: Protocol, builder: impl AdapterBuilder + 'static) {
        self.builders.insert(protocol, Box::new(builder));
    }

    pub fn create(&self, endpoint: Endpoint) -> Result<Arc<dyn Adapter>> {
        let builder = self.builders.get(&endpoint.protocol).ok_or_else(|| {
            GatewayError::not_found(format!(
                "no adapter builder registered for protocol {}",
                endpoint.protocol
            ))
        })?;
        Ok(builder.build(endpoint))
    }

    /// The default factory wired to the three built-in protocols, sharing one
    /// `reqwest::Client` across HTTP adapters.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("static reqwest client configuration is valid");

        factory.register(Protocol::Http, move |endpoint: Endpoint| {
            Arc::new(super::http::HttpAdapter::new(endpoint, http_client.clone()))
                as Arc<dyn Adapter>
        });
        factory.register(Protocol::Ws, |endpoint: Endpoint| {
            Arc::new(super::ws::WsAdapter::new(endpoint)) as Arc<dyn Adapter>
        });
        factory.register(Protocol::Rpc, |endpoint: Endpoint| {
            Arc::new(super::rpc::RpcAdapter::new(endpoint)) as Arc<dyn Adapter>
        });
        factory
    }
}

impl Default for AdapterFactory {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_is_not_found() {
        let factory = AdapterFactory::new();
        let err = factory
            .create(Endpoint::new(Protocol::Http, "localhost", 80))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn default_factory_covers_all_protocols() {
        let factory = AdapterFactory::with_defaults();
        for protocol in [Protocol::Http, Protocol::Ws, Protocol::Rpc] {
            assert!(
                factory
                    .create(Endpoint::new(protocol, "localhost", 80))
                    .is_ok()
            );
        }
    }
}
