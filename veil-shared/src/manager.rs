use crate::messages::ClientId;
use crate::transaction::{Operation, Transaction};
use async_trait::async_trait;
use std::sync::Arc;

/// Abstracts the details of transaction execution away from the session
/// layer. All methods are asynchronous and non-blocking and may be invoked
/// from any task; every call eventually produces exactly one of the
/// [`TransactionEvents`] callbacks.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Begin `txn`. Must eventually result in `on_transaction_started`.
    async fn start_transaction(&self, client_id: ClientId, txn: Arc<Transaction>);

    /// Execute a single operation. Must eventually result in
    /// `on_operation_executed` whether or not the operation succeeds; the
    /// outcome (including the read value, if any) is recorded on the
    /// operation itself.
    async fn execute_operation(&self, op: Arc<Operation>);

    /// Attempt to commit. Leads to either `on_transaction_committed` or, if
    /// the commit is rejected, `on_transaction_aborted`.
    async fn commit_transaction(&self, txn: Arc<Transaction>);

    /// Abort. Cannot fail; leads to `on_transaction_aborted` once all state
    /// associated with the transaction has been cleaned up.
    async fn abort_transaction(&self, txn: Arc<Transaction>);
}

/// Callbacks the transaction manager delivers back into the session layer.
///
/// Callbacks may arrive on any task, in any order relative to each other and
/// to new client requests, and at most once per logical event.
#[async_trait]
pub trait TransactionEvents: Send + Sync {
    /// The transaction either started under a timestamp (`success`) or was
    /// rejected and may be retried (`!success`).
    async fn on_transaction_started(&self, txn: Arc<Transaction>, success: bool);

    /// One dispatched operation finished executing.
    async fn on_operation_executed(&self, op: Arc<Operation>);

    /// The transaction committed; read values are final.
    async fn on_transaction_committed(&self, txn: Arc<Transaction>);

    /// The transaction aborted and its state has been cleaned up.
    async fn on_transaction_aborted(&self, txn: Arc<Transaction>);

    /// Forced-abort notification: the manager decided this transaction must
    /// roll back (e.g. a cascading abort), independent of any client action.
    /// Distinct from `on_transaction_aborted`, which reports a completed
    /// abort.
    async fn on_rollback(&self, txn: Arc<Transaction>);
}
