pub mod config;
pub mod metrics;
pub mod net;
pub mod proxy;
pub mod session;
pub mod store;
pub mod tso;

pub use config::ProxyConfig;
pub use metrics::ProxyMetrics;
pub use net::{ResponseSink, TcpResponseSink};
pub use proxy::{Proxy, ProxyBuilder};
pub use session::{SessionRegistry, SessionState};
pub use store::MemoryBackingStore;
pub use tso::TsoTransactionManager;
