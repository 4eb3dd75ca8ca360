//! Routing of client requests and transaction-manager callbacks to the
//! session that owns them, keyed by client id.

use crate::metrics::ProxyMetrics;
use crate::net::ResponseSink;
use crate::session::handler::{SessionEvent, SessionHandle, SessionHandler};
use async_trait::async_trait;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::lookup_host;
use tracing::{error, info};
use veil_shared::{
    ClientId, ClientRequest, ClientResponse, Operation, Transaction, TransactionEvents,
    TransactionManager, VeilError, VeilResult,
};

/// Manages all client sessions and multiplexes every inbound message
/// (client requests and backend callbacks alike) onto the owning session's
/// event channel.
pub struct SessionRegistry {
    sessions: DashMap<ClientId, SessionHandle>,
    /// Wired once at startup; the manager and the registry reference each
    /// other, so the manager arrives after construction.
    manager: OnceLock<Arc<dyn TransactionManager>>,
    responses: Arc<dyn ResponseSink>,
    metrics: Arc<ProxyMetrics>,
}

impl SessionRegistry {
    pub fn new(responses: Arc<dyn ResponseSink>, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            sessions: DashMap::new(),
            manager: OnceLock::new(),
            responses,
            metrics,
        }
    }

    pub fn set_transaction_manager(&self, manager: Arc<dyn TransactionManager>) {
        if self.manager.set(manager).is_err() {
            error!("transaction manager wired twice; keeping the first");
        }
    }

    fn manager(&self) -> VeilResult<Arc<dyn TransactionManager>> {
        self.manager
            .get()
            .cloned()
            .ok_or_else(|| VeilError::internal("no transaction manager wired"))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Entry point for inbound client messages
    pub async fn handle_request(&self, request: ClientRequest) -> VeilResult<()> {
        if request.register.is_some() {
            self.register(request).await
        } else {
            self.dispatch_request(request)
        }
    }

    async fn register(&self, request: ClientRequest) -> VeilResult<()> {
        let client_id = request.client_id;
        let registration = request
            .register
            .ok_or_else(|| VeilError::protocol("register dispatch without registration"))?;

        let addr = resolve(&registration.host, registration.port).await?;
        let handle = SessionHandler::spawn(
            client_id,
            addr,
            self.manager()?,
            self.responses.clone(),
            self.metrics.clone(),
        );

        if self.sessions.insert(client_id, handle).is_some() {
            error!("cannot register the same client twice: {}", client_id);
            return Err(VeilError::DuplicateClient { client_id });
        }

        info!(
            "registered client {} ({} clients total)",
            client_id,
            self.sessions.len()
        );
        self.metrics.record_client_registered();

        // The registration ack is the one reply that bypasses the session.
        self.responses
            .send(addr, ClientResponse::register_ack())
            .await
    }

    fn dispatch_request(&self, request: ClientRequest) -> VeilResult<()> {
        let client_id = request.client_id;
        match self.sessions.get(&client_id) {
            Some(handle) => handle.deliver(SessionEvent::Request(request)),
            None => {
                error!("client {} is not registered; dropping request", client_id);
                Err(VeilError::UnknownClient { client_id })
            }
        }
    }

    fn deliver_event(&self, client_id: ClientId, event: SessionEvent) {
        match self.sessions.get(&client_id) {
            Some(handle) => {
                if let Err(e) = handle.deliver(event) {
                    error!("failed to deliver callback for client {}: {}", client_id, e);
                }
            }
            None => error!("client {} is not registered; dropping callback", client_id),
        }
    }
}

#[async_trait]
impl TransactionEvents for SessionRegistry {
    async fn on_transaction_started(&self, txn: Arc<Transaction>, success: bool) {
        self.deliver_event(
            txn.client_id(),
            SessionEvent::TransactionStarted { txn, success },
        );
    }

    async fn on_operation_executed(&self, op: Arc<Operation>) {
        self.deliver_event(op.client_id(), SessionEvent::OperationExecuted { op });
    }

    async fn on_transaction_committed(&self, txn: Arc<Transaction>) {
        self.deliver_event(txn.client_id(), SessionEvent::TransactionCommitted { txn });
    }

    async fn on_transaction_aborted(&self, txn: Arc<Transaction>) {
        self.deliver_event(txn.client_id(), SessionEvent::TransactionAborted { txn });
    }

    async fn on_rollback(&self, txn: Arc<Transaction>) {
        self.deliver_event(txn.client_id(), SessionEvent::RolledBack { txn });
    }
}

async fn resolve(host: &str, port: u16) -> VeilResult<SocketAddr> {
    lookup_host((host, port))
        .await
        .map_err(|e| VeilError::configuration(format!("cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| VeilError::configuration(format!("no address for {host}:{port}")))
}
