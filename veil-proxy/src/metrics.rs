use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::info;

/// Proxy metrics collector.
///
/// Injected into the session layer rather than accessed as process-global
/// state; the `metrics` facade handles recorder wiring.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    prefix: String,
}

impl ProxyMetrics {
    pub fn new<S: Into<String>>(scope: S) -> Self {
        let prefix = format!("veil.proxy.{}", scope.into());
        info!("proxy metrics initialized with prefix: {}", prefix);
        Self { prefix }
    }

    pub fn record_client_registered(&self) {
        counter!(format!("{}.clients.registered.total", self.prefix)).increment(1);
    }

    pub fn record_transaction_started(&self) {
        counter!(format!("{}.transactions.started.total", self.prefix)).increment(1);
        gauge!(format!("{}.transactions.active", self.prefix)).increment(1.0);
    }

    pub fn record_transaction_committed(&self) {
        counter!(format!("{}.transactions.committed.total", self.prefix)).increment(1);
        gauge!(format!("{}.transactions.active", self.prefix)).decrement(1.0);
    }

    pub fn record_transaction_aborted(&self, user_abort: bool) {
        counter!(format!("{}.transactions.aborted.total", self.prefix)).increment(1);
        if user_abort {
            counter!(format!("{}.transactions.aborted.user", self.prefix)).increment(1);
        } else {
            counter!(format!("{}.transactions.aborted.forced", self.prefix)).increment(1);
        }
        gauge!(format!("{}.transactions.active", self.prefix)).decrement(1.0);
    }

    pub fn record_forced_rollback(&self) {
        counter!(format!("{}.rollbacks.forced.total", self.prefix)).increment(1);
    }

    pub fn record_operations_dispatched(&self, count: usize) {
        counter!(format!("{}.operations.dispatched.total", self.prefix)).increment(count as u64);
    }

    pub fn record_transaction_duration(&self, duration: Duration) {
        histogram!(format!("{}.transactions.duration.seconds", self.prefix))
            .record(duration.as_secs_f64());
    }
}
