use crate::messages::{ClientId, Statement, StatementKind, StorageKey};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use veil_util::TimeUtils;

/// Lifecycle state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Created but not yet acknowledged by the transaction manager
    NotStarted,
    /// Running under a manager-assigned timestamp
    Started,
    /// Terminal: durably (or logically) committed
    Committed,
    /// Terminal: rolled back; its effects are discarded
    Aborted,
}

/// Result of executing a single operation, recorded exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    pub success: bool,
    pub read_value: Option<Vec<u8>>,
}

impl OpOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            read_value: None,
        }
    }

    pub fn read(value: Option<Vec<u8>>) -> Self {
        Self {
            success: true,
            read_value: value,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            read_value: None,
        }
    }
}

/// One read/write/delete within a transaction.
///
/// The session layer creates operations when the client submits them; the
/// transaction manager fills in the outcome during execution. The outcome is
/// write-once and is never touched after the owning transaction reaches a
/// terminal state.
#[derive(Debug)]
pub struct Operation {
    client_id: ClientId,
    op_id: usize,
    statement: Statement,
    txn: Weak<Transaction>,
    outcome: OnceLock<OpOutcome>,
}

impl Operation {
    fn new(txn: &Arc<Transaction>, statement: Statement, op_id: usize) -> Self {
        Self {
            client_id: txn.client_id(),
            op_id,
            statement,
            txn: Arc::downgrade(txn),
            outcome: OnceLock::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn op_id(&self) -> usize {
        self.op_id
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub fn kind(&self) -> StatementKind {
        self.statement.kind
    }

    pub fn key(&self) -> StorageKey {
        self.statement.key
    }

    pub fn write_value(&self) -> Option<&[u8]> {
        self.statement.value.as_deref()
    }

    pub fn is_read(&self) -> bool {
        self.statement.is_read()
    }

    /// The owning transaction, if it is still alive
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.txn.upgrade()
    }

    /// Record the execution outcome. Returns false if one was already set.
    pub fn complete(&self, outcome: OpOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    pub fn has_executed(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// An operation counts as successful until it is marked otherwise
    pub fn succeeded(&self) -> bool {
        self.outcome.get().map(|o| o.success).unwrap_or(true)
    }

    pub fn read_value(&self) -> Option<Vec<u8>> {
        self.outcome.get().and_then(|o| o.read_value.clone())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "op {}/{} {} key={} ok={}",
            self.client_id,
            self.op_id,
            self.statement.kind,
            self.statement.key,
            self.succeeded()
        )
    }
}

#[derive(Debug)]
struct TxInner {
    timestamp: u64,
    state: TxState,
    operations: Vec<Arc<Operation>>,
}

/// A client transaction: an ordered sequence of operations plus lifecycle
/// state.
///
/// Owned by the session layer for the client-visible lifecycle; the
/// transaction manager reads operations during execution and transitions the
/// terminal state asynchronously, so the mutable pieces sit behind a mutex
/// held only for short bookkeeping sections.
#[derive(Debug)]
pub struct Transaction {
    client_id: ClientId,
    created_at: i64,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            created_at: TimeUtils::timestamp_millis(),
            inner: Mutex::new(TxInner {
                timestamp: 0,
                state: TxState::NotStarted,
                operations: Vec::new(),
            }),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Called by the transaction manager once a logical timestamp is assigned
    pub fn assign_timestamp(&self, timestamp: u64) {
        let mut inner = self.inner.lock();
        inner.timestamp = timestamp;
        inner.state = TxState::Started;
    }

    pub fn timestamp(&self) -> u64 {
        self.inner.lock().timestamp
    }

    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TxState) {
        self.inner.lock().state = state;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), TxState::Committed | TxState::Aborted)
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TxState::Aborted
    }

    /// Append a statement as the next operation of this transaction
    pub fn add_operation(self: &Arc<Self>, statement: Statement) -> Arc<Operation> {
        let mut inner = self.inner.lock();
        let op = Arc::new(Operation::new(self, statement, inner.operations.len()));
        inner.operations.push(op.clone());
        op
    }

    pub fn operation_count(&self) -> usize {
        self.inner.lock().operations.len()
    }

    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.inner.lock().operations.clone()
    }

    /// True if any operation has been marked as failed
    pub fn has_failed_operation(&self) -> bool {
        self.inner.lock().operations.iter().any(|op| !op.succeeded())
    }

    /// Read values of the READ/READ_FOR_UPDATE operations at index `from` and
    /// beyond, in submission order; a missing key yields an empty value.
    pub fn batch_read_values(&self, from: usize) -> Vec<Vec<u8>> {
        let inner = self.inner.lock();
        inner
            .operations
            .get(from..)
            .unwrap_or(&[])
            .iter()
            .filter(|op| op.is_read())
            .map(|op| op.read_value().unwrap_or_default())
            .collect()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn {}@{}", self.client_id, self.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_lifecycle() {
        let txn = Arc::new(Transaction::new(7));
        assert_eq!(txn.client_id(), 7);
        assert_eq!(txn.state(), TxState::NotStarted);
        assert_eq!(txn.timestamp(), 0);
        assert!(!txn.is_terminal());

        txn.assign_timestamp(42);
        assert_eq!(txn.state(), TxState::Started);
        assert_eq!(txn.timestamp(), 42);

        txn.set_state(TxState::Committed);
        assert!(txn.is_terminal());
        assert!(!txn.is_aborted());
    }

    #[test]
    fn test_operation_outcome_is_write_once() {
        let txn = Arc::new(Transaction::new(1));
        let op = txn.add_operation(Statement::read(5));

        assert!(!op.has_executed());
        assert!(op.succeeded(), "unexecuted operations count as successful");

        assert!(op.complete(OpOutcome::read(Some(b"v".to_vec()))));
        assert!(!op.complete(OpOutcome::failed()), "outcome must not change");

        assert!(op.has_executed());
        assert!(op.succeeded());
        assert_eq!(op.read_value(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_failed_operation_scan() {
        let txn = Arc::new(Transaction::new(1));
        let a = txn.add_operation(Statement::write(1, vec![1]));
        let b = txn.add_operation(Statement::read(2));
        assert!(!txn.has_failed_operation());

        a.complete(OpOutcome::ok());
        b.complete(OpOutcome::failed());
        assert!(txn.has_failed_operation());
    }

    #[test]
    fn test_batch_read_values_filters_and_orders() {
        let txn = Arc::new(Transaction::new(1));
        // First batch: one read that should not appear in the second batch's reply.
        let old = txn.add_operation(Statement::read(1));
        old.complete(OpOutcome::read(Some(b"old".to_vec())));

        let r1 = txn.add_operation(Statement::read(2));
        let w = txn.add_operation(Statement::write(3, b"x".to_vec()));
        let r2 = txn.add_operation(Statement::read_for_update(4));
        r1.complete(OpOutcome::read(Some(b"first".to_vec())));
        w.complete(OpOutcome::ok());
        r2.complete(OpOutcome::read(None));

        let values = txn.batch_read_values(1);
        assert_eq!(values, vec![b"first".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_operation_backpointer() {
        let txn = Arc::new(Transaction::new(9));
        let op = txn.add_operation(Statement::read(1));
        let owner = op.transaction().unwrap();
        assert_eq!(owner.client_id(), 9);

        drop(owner);
        drop(txn);
        assert!(op.transaction().is_none());
    }
}
