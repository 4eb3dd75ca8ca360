//! Map-backed backing store, with optional simulated access latency so the
//! proxy can be exercised against storage that behaves like a remote,
//! batch-padded store instead of an instant map.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::sleep;
use veil_shared::{BackingStore, StorageKey, VeilResult, WriteRecord};
use veil_util::RngUtils;

/// In-memory [`BackingStore`]
#[derive(Default)]
pub struct MemoryBackingStore {
    map: DashMap<StorageKey, Vec<u8>>,
    /// Upper bound on the uniformly jittered delay added per storage round
    simulated_latency: Option<Duration>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_simulated_latency(latency: Duration) -> Self {
        Self {
            map: DashMap::new(),
            simulated_latency: Some(latency),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    async fn pause(&self) {
        if let Some(max) = self.simulated_latency {
            let jitter = RngUtils::random_int(0, max.as_millis() as i32);
            sleep(Duration::from_millis(jitter as u64)).await;
        }
    }

    fn apply(&self, write: WriteRecord) {
        match write.value {
            Some(value) => {
                self.map.insert(write.key, value);
            }
            None => {
                self.map.remove(&write.key);
            }
        }
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn read(&self, key: StorageKey) -> VeilResult<Option<Vec<u8>>> {
        self.pause().await;
        Ok(self.map.get(&key).map(|entry| entry.value().clone()))
    }

    async fn read_batch(&self, keys: &[StorageKey]) -> VeilResult<Vec<Option<Vec<u8>>>> {
        self.pause().await;
        Ok(keys
            .iter()
            .map(|key| self.map.get(key).map(|entry| entry.value().clone()))
            .collect())
    }

    async fn write(&self, write: WriteRecord) -> VeilResult<()> {
        self.pause().await;
        self.apply(write);
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<WriteRecord>) -> VeilResult<()> {
        self.pause().await;
        for write in writes {
            self.apply(write);
        }
        Ok(())
    }
}
