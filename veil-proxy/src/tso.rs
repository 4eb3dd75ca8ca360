//! Timestamp-ordering transaction manager.
//!
//! A deliberately small TSO scheduler: transactions get monotonically
//! increasing timestamps at start, writes are buffered until commit, and
//! reads/writes that arrive out of timestamp order fail their operation
//! (which makes the owning session abort the transaction). Reading another
//! transaction's uncommitted write records a read-from dependency; if the
//! writer later aborts, every dependent reader is forced to roll back, which
//! is what produces the session protocol's forced-abort notifications.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use veil_shared::{
    BackingStore, ClientId, OpOutcome, Operation, StatementKind, StorageKey, Transaction,
    TransactionEvents, TransactionManager, TxState, WriteRecord,
};
use async_trait::async_trait;

#[derive(Default)]
struct TsoTables {
    /// Timestamp of the last committed write per key
    committed_writes: HashMap<StorageKey, u64>,
    /// Highest timestamp that has read each key
    reads: HashMap<StorageKey, u64>,
    /// Pending writes of active transactions, keyed by timestamp;
    /// `None` buffers a delete
    write_buffers: HashMap<u64, HashMap<StorageKey, Option<Vec<u8>>>>,
    /// Active transactions by timestamp
    active: HashMap<u64, Arc<Transaction>>,
    /// Readers that observed each active writer's uncommitted data
    dependents: HashMap<u64, HashSet<u64>>,
}

/// Multiversion-free TSO manager executing against a [`BackingStore`]
pub struct TsoTransactionManager {
    store: Arc<dyn BackingStore>,
    events: Arc<dyn TransactionEvents>,
    next_timestamp: AtomicU64,
    tables: Mutex<TsoTables>,
}

impl TsoTransactionManager {
    pub fn new(store: Arc<dyn BackingStore>, events: Arc<dyn TransactionEvents>) -> Self {
        Self {
            store,
            events,
            next_timestamp: AtomicU64::new(1),
            tables: Mutex::new(TsoTables::default()),
        }
    }

    /// Timestamp the next transaction to start would receive
    pub fn current_timestamp(&self) -> u64 {
        self.next_timestamp.load(Ordering::SeqCst)
    }

    async fn run_operation(&self, op: &Arc<Operation>) -> OpOutcome {
        let Some(txn) = op.transaction() else {
            return OpOutcome::failed();
        };
        if txn.is_terminal() {
            // The transaction is already done; this straggler's result is
            // discarded by the session anyway.
            return OpOutcome::failed();
        }
        let ts = txn.timestamp();
        let key = op.key();

        match op.kind() {
            StatementKind::Read | StatementKind::ReadForUpdate => {
                let mut tables = self.tables.lock().await;
                if tables.committed_writes.get(&key).copied().unwrap_or(0) > ts {
                    // A younger transaction already committed a write here;
                    // this read arrived too late in timestamp order.
                    return OpOutcome::failed();
                }
                let read_mark = tables.reads.entry(key).or_insert(0);
                *read_mark = (*read_mark).max(ts);

                // Read-your-writes from this transaction's own buffer.
                if let Some(value) = tables
                    .write_buffers
                    .get(&ts)
                    .and_then(|buffer| buffer.get(&key))
                {
                    return OpOutcome::read(value.clone());
                }

                // Otherwise the youngest older uncommitted writer, recording
                // the read-from dependency that drives cascading aborts.
                let writer = tables
                    .write_buffers
                    .iter()
                    .filter(|(writer_ts, buffer)| **writer_ts < ts && buffer.contains_key(&key))
                    .max_by_key(|(writer_ts, _)| **writer_ts)
                    .map(|(writer_ts, buffer)| (*writer_ts, buffer[&key].clone()));
                if let Some((writer_ts, value)) = writer {
                    tables.dependents.entry(writer_ts).or_default().insert(ts);
                    return OpOutcome::read(value);
                }

                match self.store.read(key).await {
                    Ok(value) => OpOutcome::read(value),
                    Err(e) => {
                        warn!("storage read of key {} failed: {}", key, e);
                        OpOutcome::failed()
                    }
                }
            }
            StatementKind::Write | StatementKind::Delete => {
                let mut tables = self.tables.lock().await;
                if tables.committed_writes.get(&key).copied().unwrap_or(0) > ts
                    || tables.reads.get(&key).copied().unwrap_or(0) > ts
                {
                    // A younger transaction already read or overwrote this
                    // key; accepting the write would break timestamp order.
                    return OpOutcome::failed();
                }
                let Some(buffer) = tables.write_buffers.get_mut(&ts) else {
                    return OpOutcome::failed();
                };
                let value = match op.kind() {
                    StatementKind::Delete => None,
                    _ => Some(op.write_value().unwrap_or_default().to_vec()),
                };
                buffer.insert(key, value);
                OpOutcome::ok()
            }
        }
    }

    /// Readers of `ts` that are still active, resolved for cascading aborts
    fn drain_dependents(tables: &mut TsoTables, ts: u64) -> Vec<Arc<Transaction>> {
        tables
            .dependents
            .remove(&ts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|reader_ts| tables.active.get(&reader_ts).cloned())
            .collect()
    }
}

#[async_trait]
impl TransactionManager for TsoTransactionManager {
    async fn start_transaction(&self, client_id: ClientId, txn: Arc<Transaction>) {
        let ts = self.next_timestamp.fetch_add(1, Ordering::SeqCst);
        txn.assign_timestamp(ts);
        {
            let mut tables = self.tables.lock().await;
            tables.active.insert(ts, txn.clone());
            tables.write_buffers.insert(ts, HashMap::new());
        }
        debug!("client {}: transaction started at timestamp {}", client_id, ts);
        self.events.on_transaction_started(txn, true).await;
    }

    async fn execute_operation(&self, op: Arc<Operation>) {
        let outcome = self.run_operation(&op).await;
        if !op.complete(outcome) {
            error!("operation executed twice: {}", op);
        }
        self.events.on_operation_executed(op).await;
    }

    async fn commit_transaction(&self, txn: Arc<Transaction>) {
        if txn.is_terminal() {
            // A forced abort won the race against this commit request.
            debug!("commit requested for terminal {}; ignoring", txn);
            return;
        }
        let ts = txn.timestamp();
        let buffer = {
            let mut tables = self.tables.lock().await;
            tables.active.remove(&ts);
            tables.write_buffers.remove(&ts).unwrap_or_default()
        };

        let keys: Vec<StorageKey> = buffer.keys().copied().collect();
        let writes = buffer
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => WriteRecord::put(key, value),
                None => WriteRecord::delete(key),
            })
            .collect();

        if let Err(e) = self.store.write_batch(writes).await {
            error!("flushing {} failed, aborting: {}", txn, e);
            let readers = {
                let mut tables = self.tables.lock().await;
                Self::drain_dependents(&mut tables, ts)
            };
            txn.set_state(TxState::Aborted);
            for reader in readers {
                self.events.on_rollback(reader).await;
            }
            self.events.on_transaction_aborted(txn).await;
            return;
        }

        {
            let mut tables = self.tables.lock().await;
            for key in keys {
                let write_mark = tables.committed_writes.entry(key).or_insert(0);
                *write_mark = (*write_mark).max(ts);
            }
            // Readers of this data are safe now that it is committed.
            tables.dependents.remove(&ts);
        }
        txn.set_state(TxState::Committed);
        debug!("{} committed", txn);
        self.events.on_transaction_committed(txn).await;
    }

    async fn abort_transaction(&self, txn: Arc<Transaction>) {
        if txn.is_terminal() {
            // Abort is idempotent on terminal transactions; this also covers
            // the rollback-during-commit race, where whichever terminal
            // transition runs second must give way.
            debug!("abort requested for terminal {}; ignoring", txn);
            return;
        }
        let ts = txn.timestamp();
        let readers = {
            let mut tables = self.tables.lock().await;
            tables.active.remove(&ts);
            tables.write_buffers.remove(&ts);
            Self::drain_dependents(&mut tables, ts)
        };
        txn.set_state(TxState::Aborted);
        debug!("{} aborted, cascading to {} reader(s)", txn, readers.len());
        for reader in readers {
            self.events.on_rollback(reader).await;
        }
        self.events.on_transaction_aborted(txn).await;
    }
}
