//! The proxy node: wires the backing store, the timestamp-ordering manager,
//! and the session registry together and applies the error taxonomy at the
//! request boundary.

use crate::config::ProxyConfig;
use crate::metrics::ProxyMetrics;
use crate::net::ResponseSink;
use crate::session::SessionRegistry;
use crate::store::MemoryBackingStore;
use crate::tso::TsoTransactionManager;
use std::sync::Arc;
use tracing::error;
use veil_shared::{BackingStore, ClientRequest, VeilError, VeilResult};

/// Builder for configuring and creating a proxy node
pub struct ProxyBuilder {
    config: ProxyConfig,
    responses: Option<Arc<dyn ResponseSink>>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self {
            config: ProxyConfig::default(),
            responses: None,
        }
    }

    pub fn with_config(mut self, config: ProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_bind_address<S: Into<String>>(mut self, address: S) -> Self {
        self.config.bind_address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_response_sink(mut self, responses: Arc<dyn ResponseSink>) -> Self {
        self.responses = Some(responses);
        self
    }

    pub fn build(self) -> VeilResult<Proxy> {
        let responses = self
            .responses
            .ok_or_else(|| VeilError::configuration("a response sink is required"))?;
        Proxy::new(self.config, responses)
    }
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running proxy node
pub struct Proxy {
    config: ProxyConfig,
    registry: Arc<SessionRegistry>,
    manager: Arc<TsoTransactionManager>,
    store: Arc<dyn BackingStore>,
    metrics: Arc<ProxyMetrics>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, responses: Arc<dyn ResponseSink>) -> VeilResult<Self> {
        config.validate()?;

        let metrics = Arc::new(ProxyMetrics::new(format!(
            "{}:{}",
            config.bind_address, config.port
        )));
        let store: Arc<dyn BackingStore> = match config.simulated_store_latency() {
            Some(latency) => Arc::new(MemoryBackingStore::with_simulated_latency(latency)),
            None => Arc::new(MemoryBackingStore::new()),
        };
        let registry = Arc::new(SessionRegistry::new(responses, metrics.clone()));
        let manager = Arc::new(TsoTransactionManager::new(store.clone(), registry.clone()));
        registry.set_transaction_manager(manager.clone());

        Ok(Self {
            config,
            registry,
            manager,
            store,
            metrics,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<TsoTransactionManager> {
        &self.manager
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    /// Route one inbound request.
    ///
    /// Unknown-client requests are logged and dropped (the client times out);
    /// duplicate registration is surfaced to the caller, which must treat it
    /// as fatal.
    pub async fn handle_request(&self, request: ClientRequest) -> VeilResult<()> {
        match self.registry.handle_request(request).await {
            Err(VeilError::UnknownClient { client_id }) => {
                error!("dropping request for unknown client {}", client_id);
                Ok(())
            }
            other => other,
        }
    }
}
