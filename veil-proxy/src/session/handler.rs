//! Per-client transactional session protocol.
//!
//! Each registered client gets one [`SessionHandler`], an actor that owns the
//! session state exclusively and consumes a single stream of
//! [`SessionEvent`]s: the client's own requests interleaved with the
//! transaction manager's callbacks, which may originate on any task and in
//! any order. A synchronous transition function decides the next state plus a
//! list of [`Effect`]s; effects are performed only after the transition, so a
//! manager continuation that runs inline can never observe a half-applied
//! state.

use crate::metrics::ProxyMetrics;
use crate::net::ResponseSink;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use veil_shared::{
    ClientId, ClientRequest, ClientResponse, Operation, Transaction, TransactionManager,
    VeilError, VeilResult,
};

/// Protocol state of one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No request in flight; ready to accept one
    Idle,
    /// A batch of operations has been dispatched and not all have completed
    Ops,
    /// The backend forced an abort while no client request was outstanding;
    /// the abort is in flight and the reply waits for the next request
    Aborting,
    /// A commit or abort is pending; at most one terminal reply is owed
    Finishing,
}

/// Inputs to the session state machine: one variant per client request plus
/// one per transaction-manager callback
#[derive(Debug)]
pub enum SessionEvent {
    Request(ClientRequest),
    TransactionStarted { txn: Arc<Transaction>, success: bool },
    OperationExecuted { op: Arc<Operation> },
    TransactionCommitted { txn: Arc<Transaction> },
    TransactionAborted { txn: Arc<Transaction> },
    RolledBack { txn: Arc<Transaction> },
}

/// Asynchronous work decided by a transition, performed after the state
/// change
#[derive(Debug)]
pub enum Effect {
    StartTransaction(Arc<Transaction>),
    ExecuteOperations(Vec<Arc<Operation>>),
    Commit(Arc<Transaction>),
    Abort(Arc<Transaction>),
    Reply(ClientResponse),
}

/// Handle for delivering events into a session's channel
#[derive(Debug, Clone)]
pub struct SessionHandle {
    client_id: ClientId,
    client_addr: SocketAddr,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn deliver(&self, event: SessionEvent) -> VeilResult<()> {
        self.events.send(event).map_err(|_| {
            VeilError::internal(format!("session task for client {} is gone", self.client_id))
        })
    }
}

/// The per-client session state machine
pub struct SessionHandler {
    client_id: ClientId,
    client_addr: SocketAddr,
    state: SessionState,
    /// Request currently being processed; `None` means no reply is owed
    ongoing_request: Option<ClientRequest>,
    /// Transaction currently associated with this session
    txn: Option<Arc<Transaction>>,
    /// Operations of the current batch still executing
    pending_operations: usize,
    /// An operation of the current transaction failed
    op_failed: bool,
    /// The abort in flight was requested by the client
    user_abort: bool,
    /// The transaction aborted (or is doomed) while no reply channel was
    /// open; the notification is held for the next opportunity to reply
    buffered_abort: bool,
    started_at: Option<Instant>,
    manager: Arc<dyn TransactionManager>,
    responses: Arc<dyn ResponseSink>,
    metrics: Arc<ProxyMetrics>,
}

impl SessionHandler {
    pub fn new(
        client_id: ClientId,
        client_addr: SocketAddr,
        manager: Arc<dyn TransactionManager>,
        responses: Arc<dyn ResponseSink>,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            client_id,
            client_addr,
            state: SessionState::Idle,
            ongoing_request: None,
            txn: None,
            pending_operations: 0,
            op_failed: false,
            user_abort: false,
            buffered_abort: false,
            started_at: None,
            manager,
            responses,
            metrics,
        }
    }

    /// Spawn the session actor and return its handle
    pub fn spawn(
        client_id: ClientId,
        client_addr: SocketAddr,
        manager: Arc<dyn TransactionManager>,
        responses: Arc<dyn ResponseSink>,
        metrics: Arc<ProxyMetrics>,
    ) -> SessionHandle {
        let (events, rx) = mpsc::unbounded_channel();
        let handler = Self::new(client_id, client_addr, manager, responses, metrics);
        tokio::spawn(handler.run(rx));
        SessionHandle {
            client_id,
            client_addr,
            events,
        }
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!(
            "new client session: {} at {}",
            self.client_id, self.client_addr
        );
        while let Some(event) = events.recv().await {
            match self.apply(event) {
                Ok(effects) => {
                    for effect in effects {
                        self.perform(effect).await;
                    }
                }
                Err(e) => {
                    // A violated session invariant, not a transient fault.
                    error!("fatal protocol error on client {}: {}", self.client_id, e);
                    panic!("session {} invariant violated: {}", self.client_id, e);
                }
            }
        }
        debug!("session {} shut down", self.client_id);
    }

    /// The transition function: `(state, event) -> (state, effects)`.
    ///
    /// Errors indicate protocol misuse or broken invariants and are fatal to
    /// the session.
    pub fn apply(&mut self, event: SessionEvent) -> VeilResult<Vec<Effect>> {
        match event {
            SessionEvent::Request(req) => self.on_request(req),
            SessionEvent::TransactionStarted { txn, success } => {
                self.on_transaction_started(txn, success)
            }
            SessionEvent::OperationExecuted { op } => self.on_operation_executed(op),
            SessionEvent::TransactionCommitted { txn } => self.on_transaction_committed(txn),
            SessionEvent::TransactionAborted { txn } => self.on_transaction_aborted(txn),
            SessionEvent::RolledBack { txn } => self.on_rollback(txn),
        }
    }

    async fn perform(&self, effect: Effect) {
        match effect {
            Effect::StartTransaction(txn) => {
                self.manager.start_transaction(self.client_id, txn).await;
            }
            Effect::ExecuteOperations(ops) => {
                self.metrics.record_operations_dispatched(ops.len());
                for op in ops {
                    self.manager.execute_operation(op).await;
                }
            }
            Effect::Commit(txn) => self.manager.commit_transaction(txn).await,
            Effect::Abort(txn) => self.manager.abort_transaction(txn).await,
            Effect::Reply(response) => {
                if let Err(e) = self.responses.send(self.client_addr, response).await {
                    warn!("failed to deliver reply to client {}: {}", self.client_id, e);
                }
            }
        }
    }

    fn current_txn(&self) -> VeilResult<Arc<Transaction>> {
        self.txn.clone().ok_or_else(|| {
            VeilError::protocol(format!("client {}: no transaction in flight", self.client_id))
        })
    }

    fn is_current(&self, txn: &Arc<Transaction>) -> bool {
        self.txn
            .as_ref()
            .map(|current| Arc::ptr_eq(current, txn))
            .unwrap_or(false)
    }

    /// Client request entry point. Buffered aborts take priority over
    /// whatever the request asked for.
    fn on_request(&mut self, req: ClientRequest) -> VeilResult<Vec<Effect>> {
        self.ongoing_request = Some(req.clone());

        if self.buffered_abort || self.state == SessionState::Aborting {
            // The transaction is already doomed; this request exists only to
            // carry the abort notification back.
            self.state = SessionState::Finishing;
            if self.buffered_abort {
                let txn = self.current_txn()?;
                return self.on_transaction_aborted(txn);
            }
            return Ok(Vec::new());
        }

        if req.to_start {
            self.on_start_request()
        } else if req.to_abort {
            self.on_abort_request()
        } else {
            self.on_operations_request(req)
        }
    }

    fn on_start_request(&mut self) -> VeilResult<Vec<Effect>> {
        if self.txn.is_some() {
            return Err(VeilError::protocol(format!(
                "client {}: start requested while a transaction is active",
                self.client_id
            )));
        }
        let txn = Arc::new(Transaction::new(self.client_id));
        self.txn = Some(txn.clone());
        self.started_at = Some(Instant::now());
        self.state = SessionState::Ops;
        self.metrics.record_transaction_started();
        Ok(vec![Effect::StartTransaction(txn)])
    }

    /// Dispatch the request's statements. Statements in one batch have no
    /// control-flow dependencies and execute in parallel; the pending
    /// counter is the only barrier.
    fn on_operations_request(&mut self, req: ClientRequest) -> VeilResult<Vec<Effect>> {
        let txn = self.current_txn()?;
        self.state = SessionState::Ops;

        if !req.statements.is_empty() {
            self.pending_operations = req.statements.len();
            let ops = req
                .statements
                .iter()
                .cloned()
                .map(|statement| txn.add_operation(statement))
                .collect();
            Ok(vec![Effect::ExecuteOperations(ops)])
        } else if req.to_commit {
            self.on_commit_request()
        } else {
            // Nothing to execute; hand control straight back.
            self.ongoing_request = None;
            self.state = SessionState::Idle;
            Ok(vec![Effect::Reply(ClientResponse::success(Vec::new()))])
        }
    }

    fn on_commit_request(&mut self) -> VeilResult<Vec<Effect>> {
        let txn = self.current_txn()?;
        self.state = SessionState::Finishing;
        if self.buffered_abort {
            // A forced abort arrived first; it wins over the commit.
            Ok(vec![Effect::Abort(txn)])
        } else {
            Ok(vec![Effect::Commit(txn)])
        }
    }

    fn on_abort_request(&mut self) -> VeilResult<Vec<Effect>> {
        let txn = self.current_txn()?;
        self.state = SessionState::Finishing;
        self.user_abort = true;
        Ok(vec![Effect::Abort(txn)])
    }

    /// Start callback. Failures are retried transparently with the same
    /// transaction object; the client never observes them.
    fn on_transaction_started(
        &mut self,
        txn: Arc<Transaction>,
        success: bool,
    ) -> VeilResult<Vec<Effect>> {
        if !self.is_current(&txn) || txn.is_aborted() {
            return Ok(Vec::new());
        }
        if !success {
            debug!(
                "client {}: transaction start rejected, retrying",
                self.client_id
            );
            return Ok(vec![Effect::StartTransaction(txn)]);
        }
        let req = self.ongoing_request.clone().ok_or_else(|| {
            VeilError::internal(format!(
                "client {}: transaction started with no request in flight",
                self.client_id
            ))
        })?;
        if !req.statements.is_empty() {
            self.on_operations_request(req)
        } else if self.buffered_abort {
            // A rollback landed while the start was in flight and there is
            // no batch whose completion could act on it; abort here, with
            // the start request carrying the eventual reply.
            self.state = SessionState::Finishing;
            Ok(vec![Effect::Abort(txn)])
        } else {
            self.ongoing_request = None;
            self.state = SessionState::Idle;
            Ok(vec![Effect::Reply(ClientResponse::success(Vec::new()))])
        }
    }

    fn on_operation_executed(&mut self, op: Arc<Operation>) -> VeilResult<Vec<Effect>> {
        let Some(txn) = op.transaction() else {
            // The owning transaction is already gone; the result is discarded.
            debug!(
                "client {}: operation completed after its transaction was dropped",
                self.client_id
            );
            return Ok(Vec::new());
        };
        if txn.is_aborted() || !self.is_current(&txn) {
            return Ok(Vec::new());
        }
        if self.pending_operations == 0 {
            return Err(VeilError::internal(format!(
                "client {}: operation counter underflow on {}",
                self.client_id, op
            )));
        }
        self.pending_operations -= 1;
        if self.pending_operations == 0 {
            self.on_batch_complete(txn)
        } else {
            Ok(Vec::new())
        }
    }

    /// All operations of the current batch have completed.
    fn on_batch_complete(&mut self, txn: Arc<Transaction>) -> VeilResult<Vec<Effect>> {
        let req = self.ongoing_request.clone().ok_or_else(|| {
            VeilError::internal(format!(
                "client {}: batch completed with no request in flight",
                self.client_id
            ))
        })?;
        self.op_failed = txn.has_failed_operation();
        self.state = SessionState::Finishing;

        if !self.op_failed && !self.buffered_abort {
            if req.to_commit {
                self.on_commit_request()
            } else {
                // Return the batch's read results and idle until the next
                // request; the transaction stays open.
                self.ongoing_request = None;
                self.state = SessionState::Idle;
                let first = txn.operation_count() - req.statements.len();
                Ok(vec![Effect::Reply(ClientResponse::success(
                    txn.batch_read_values(first),
                ))])
            }
        } else {
            Ok(vec![Effect::Abort(txn)])
        }
    }

    fn on_transaction_committed(&mut self, txn: Arc<Transaction>) -> VeilResult<Vec<Effect>> {
        if !self.is_current(&txn) {
            warn!(
                "client {}: commit callback for a stale transaction, ignoring",
                self.client_id
            );
            return Ok(Vec::new());
        }
        let req = self.ongoing_request.clone().ok_or_else(|| {
            VeilError::internal(format!(
                "client {}: commit completed with no request in flight",
                self.client_id
            ))
        })?;
        let first = txn.operation_count() - req.statements.len();
        let values = txn.batch_read_values(first);
        self.reset()?;
        self.metrics.record_transaction_committed();
        Ok(vec![Effect::Reply(ClientResponse::success(values))])
    }

    /// Completed-abort callback. A reply goes out only if a client request
    /// is genuinely outstanding; otherwise the notification is buffered and
    /// surfaces on the client's next request.
    fn on_transaction_aborted(&mut self, txn: Arc<Transaction>) -> VeilResult<Vec<Effect>> {
        if !self.is_current(&txn) {
            return Ok(Vec::new());
        }
        let should_reply = matches!(self.state, SessionState::Ops | SessionState::Finishing);
        debug!(
            "client {}: transaction {} aborted (reply={})",
            self.client_id,
            txn.timestamp(),
            should_reply
        );
        if should_reply {
            let user_abort = self.user_abort;
            self.reset()?;
            self.metrics.record_transaction_aborted(user_abort);
            Ok(vec![Effect::Reply(ClientResponse::operation(
                !user_abort,
                Vec::new(),
            ))])
        } else {
            self.buffered_abort = true;
            Ok(Vec::new())
        }
    }

    /// Forced-rollback notification: the transaction is doomed regardless of
    /// what the client asked for.
    fn on_rollback(&mut self, txn: Arc<Transaction>) -> VeilResult<Vec<Effect>> {
        if !self.is_current(&txn) {
            return Ok(Vec::new());
        }
        self.metrics.record_forced_rollback();
        match self.state {
            SessionState::Ops => {
                // Let the in-flight operations drain before acting, so no
                // reply races backend work that is still executing.
                debug!(
                    "client {}: buffering forced rollback of transaction {}",
                    self.client_id,
                    txn.timestamp()
                );
                self.buffered_abort = true;
                Ok(Vec::new())
            }
            SessionState::Idle => {
                // No request is outstanding to carry a reply; abort now and
                // deliver the notification later.
                self.state = SessionState::Aborting;
                Ok(vec![Effect::Abort(txn)])
            }
            SessionState::Finishing => {
                // A commit or abort is already pending; the explicit abort
                // supersedes an in-flight commit attempt.
                Ok(vec![Effect::Abort(txn)])
            }
            SessionState::Aborting => Ok(Vec::new()),
        }
    }

    /// Reinitialize after a terminal reply; the session survives for the
    /// client's next transaction.
    fn reset(&mut self) -> VeilResult<()> {
        let txn = self.current_txn()?;
        if !txn.is_terminal() {
            return Err(VeilError::internal(format!(
                "client {}: session reset with a live transaction",
                self.client_id
            )));
        }
        if let Some(started_at) = self.started_at.take() {
            self.metrics.record_transaction_duration(started_at.elapsed());
        }
        self.ongoing_request = None;
        self.state = SessionState::Idle;
        self.txn = None;
        self.pending_operations = 0;
        self.op_failed = false;
        self.user_abort = false;
        self.buffered_abort = false;
        Ok(())
    }
}
