use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use veil_shared::{VeilError, VeilResult};

/// Configuration for the proxy node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Address the request listener binds to
    pub bind_address: String,
    /// Port the request listener binds to
    pub port: u16,
    /// Sizing hint for the expected number of registered clients
    pub expected_clients: usize,
    /// Upper bound on simulated backing-store latency in milliseconds;
    /// 0 disables the jitter
    pub simulated_store_latency_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9090,
            expected_clients: 2000,
            simulated_store_latency_ms: 0,
        }
    }
}

impl ProxyConfig {
    /// Load a JSON configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> VeilResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VeilError::configuration(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VeilResult<()> {
        if self.bind_address.is_empty() {
            return Err(VeilError::configuration("bind_address must not be empty"));
        }
        if self.port == 0 {
            return Err(VeilError::configuration("port must be non-zero"));
        }
        if self.expected_clients == 0 {
            return Err(VeilError::configuration("expected_clients must be non-zero"));
        }
        Ok(())
    }

    pub fn simulated_store_latency(&self) -> Option<Duration> {
        if self.simulated_store_latency_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.simulated_store_latency_ms))
        }
    }
}
